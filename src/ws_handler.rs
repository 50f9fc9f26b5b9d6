//! `/ws`: topic subscriptions for dashboard clients.
//!
//! Each socket gets a hub registration and a writer task that drains the
//! client's outbound queue. Inbound frames are limited to subscribe and
//! unsubscribe requests; anything else is ignored.

use crate::broadcast_hub::{BroadcastHub, ClientId, ServerMessage};
use crate::rest_server::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

const MAX_TOPIC_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
}

pub fn valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LEN
        && topic
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Applies one inbound text frame and returns the acknowledgement to send,
/// if any.
pub async fn handle_client_text(hub: &BroadcastHub, client_id: ClientId, text: &str) -> Option<ServerMessage> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(%client_id, "Ignoring unrecognised client frame: {}", e);
            return None;
        }
    };

    match message {
        ClientMessage::Subscribe { topic } if valid_topic(&topic) => {
            hub.subscribe(client_id, &topic).await;
            debug!(%client_id, topic, "Subscribed");
            Some(ServerMessage::Subscribed { topic })
        }
        ClientMessage::Unsubscribe { topic } if valid_topic(&topic) => {
            hub.unsubscribe(client_id, &topic).await;
            debug!(%client_id, topic, "Unsubscribed");
            Some(ServerMessage::Unsubscribed { topic })
        }
        other => {
            debug!(%client_id, ?other, "Ignoring request for an invalid topic");
            None
        }
    }
}

pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<BroadcastHub>) {
    let (mut sink, mut stream) = socket.split();
    let (client_id, mut outbound) = hub.register_client().await;
    info!(%client_id, "Real-time client connected");

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink.send(Message::Text(frame.to_string().into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    hub.send_to(
        client_id,
        &ServerMessage::ConnectionEstablished {
            client_id,
            message: "Connected to RouterFlux real-time updates".to_string(),
        },
    )
    .await;

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                if let Some(reply) = handle_client_text(&hub, client_id, text.as_str()).await {
                    hub.send_to(client_id, &reply).await;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Dropping the registration closes the outbound queue, which ends the writer.
    hub.remove_client(client_id).await;
    let _ = writer.await;
    info!(%client_id, "Real-time client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast_hub::topics;

    #[test]
    fn parses_subscription_requests() {
        let message: ClientMessage = serde_json::from_str(r#"{"action":"subscribe","topic":"device_1"}"#).unwrap();
        assert_eq!(
            message,
            ClientMessage::Subscribe {
                topic: "device_1".to_string()
            }
        );
        assert!(serde_json::from_str::<ClientMessage>(r#"{"action":"publish","topic":"x"}"#).is_err());
    }

    #[test]
    fn topic_names_are_restricted() {
        assert!(valid_topic("device_alerts_12"));
        assert!(valid_topic("all_alerts"));
        assert!(!valid_topic(""));
        assert!(!valid_topic("device 1"));
        assert!(!valid_topic(&"x".repeat(MAX_TOPIC_LEN + 1)));
    }

    #[tokio::test]
    async fn subscribe_frame_registers_and_acknowledges() {
        let hub = BroadcastHub::new();
        let (client, _rx) = hub.register_client().await;

        let reply = handle_client_text(&hub, client, r#"{"action":"subscribe","topic":"firewall_3"}"#).await;

        assert_eq!(
            reply,
            Some(ServerMessage::Subscribed {
                topic: topics::firewall(3)
            })
        );
        assert_eq!(hub.subscriber_count(&topics::firewall(3)).await, 1);

        let reply = handle_client_text(&hub, client, r#"{"action":"unsubscribe","topic":"firewall_3"}"#).await;
        assert!(matches!(reply, Some(ServerMessage::Unsubscribed { .. })));
        assert_eq!(hub.subscriber_count(&topics::firewall(3)).await, 0);
    }

    #[tokio::test]
    async fn unknown_frames_are_ignored() {
        let hub = BroadcastHub::new();
        let (client, _rx) = hub.register_client().await;

        assert_eq!(handle_client_text(&hub, client, "ping").await, None);
        assert_eq!(handle_client_text(&hub, client, r#"{"type":"hello"}"#).await, None);
        assert_eq!(
            handle_client_text(&hub, client, r#"{"action":"subscribe","topic":"bad topic"}"#).await,
            None
        );
        assert_eq!(hub.subscriber_count("bad topic").await, 0);
    }
}
