//! Topic-based fan-out to real-time dashboard clients.
//!
//! Each client owns an unbounded outbound queue drained by its socket writer.
//! Delivery is best-effort and at-most-once: nothing is stored for clients that
//! are absent or not subscribed at send time.

use crate::models::{Alert, FirewallRule, InterfaceStats, SystemResources, TrafficSample, WirelessClient, WirelessInterface};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

pub type ClientId = Uuid;

/// Serialized frame shared by every recipient of one broadcast.
pub type Frame = Arc<str>;

pub mod topics {
    pub const ALL_ALERTS: &str = "all_alerts";
    pub const DEVICES: &str = "devices";

    pub fn device(device_id: i64) -> String {
        format!("device_{}", device_id)
    }

    pub fn firewall(device_id: i64) -> String {
        format!("firewall_{}", device_id)
    }

    pub fn traffic(device_id: i64) -> String {
        format!("traffic_{}", device_id)
    }

    pub fn wireless(device_id: i64) -> String {
        format!("wireless_{}", device_id)
    }

    pub fn device_alerts(device_id: i64) -> String {
        format!("device_alerts_{}", device_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Connected,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device_id: i64,
    pub status: LinkStatus,
    pub is_connected: bool,
    pub error: Option<String>,
    pub timestamp: String,
}

/// Server → client frames, serialized as `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    #[serde(rename = "CONNECTION_ESTABLISHED")]
    ConnectionEstablished { client_id: ClientId, message: String },
    #[serde(rename = "SUBSCRIBED")]
    Subscribed { topic: String },
    #[serde(rename = "UNSUBSCRIBED")]
    Unsubscribed { topic: String },
    #[serde(rename = "DEVICE_STATUS_UPDATE")]
    DeviceStatusUpdate(DeviceStatus),
    #[serde(rename = "FIREWALL_RULE_UPDATE")]
    FirewallRuleUpdate { device_id: i64, rules: Vec<FirewallRule> },
    #[serde(rename = "METRICS_UPDATE")]
    MetricsUpdate {
        device_id: i64,
        resources: SystemResources,
        interfaces: Vec<InterfaceStats>,
    },
    #[serde(rename = "WIRELESS_UPDATE")]
    WirelessUpdate {
        device_id: i64,
        interfaces: Vec<WirelessInterface>,
        clients: Vec<WirelessClient>,
    },
    #[serde(rename = "SECURITY_ALERT")]
    SecurityAlert(Alert),
    #[serde(rename = "traffic_update")]
    TrafficUpdate { device_id: i64, samples: Vec<TrafficSample> },
}

struct ClientEntry {
    sender: mpsc::UnboundedSender<Frame>,
    topics: HashSet<String>,
}

#[derive(Default)]
pub struct BroadcastHub {
    clients: RwLock<HashMap<ClientId, ClientEntry>>,
}

impl BroadcastHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a client with no subscriptions and returns its outbound queue.
    pub async fn register_client(&self) -> (ClientId, mpsc::UnboundedReceiver<Frame>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let client_id = Uuid::new_v4();
        self.clients.write().await.insert(
            client_id,
            ClientEntry {
                sender,
                topics: HashSet::new(),
            },
        );
        debug!(%client_id, "Real-time client registered");
        (client_id, receiver)
    }

    /// Drops the client and every subscription it held.
    pub async fn remove_client(&self, client_id: ClientId) {
        if let Some(entry) = self.clients.write().await.remove(&client_id) {
            debug!(%client_id, topics = entry.topics.len(), "Real-time client removed");
        }
    }

    /// Returns `false` when the client is unknown. Subscribing twice is harmless.
    pub async fn subscribe(&self, client_id: ClientId, topic: &str) -> bool {
        match self.clients.write().await.get_mut(&client_id) {
            Some(entry) => {
                entry.topics.insert(topic.to_string());
                true
            }
            None => false,
        }
    }

    pub async fn unsubscribe(&self, client_id: ClientId, topic: &str) -> bool {
        match self.clients.write().await.get_mut(&client_id) {
            Some(entry) => {
                entry.topics.remove(topic);
                true
            }
            None => false,
        }
    }

    /// Sends one message to a single client, regardless of its subscriptions.
    pub async fn send_to(&self, client_id: ClientId, message: &ServerMessage) -> bool {
        let sender = match self.clients.read().await.get(&client_id) {
            Some(entry) if !entry.sender.is_closed() => entry.sender.clone(),
            _ => return false,
        };
        match encode(message) {
            Some(frame) => sender.send(frame).is_ok(),
            None => false,
        }
    }

    /// Delivers `message` to every open client subscribed to `topic` and returns
    /// the number of clients it reached. The recipient list is snapshotted
    /// before sending so the registry lock is never held across delivery.
    pub async fn broadcast_to_topic(&self, topic: &str, message: &ServerMessage) -> usize {
        let recipients: Vec<mpsc::UnboundedSender<Frame>> = {
            let clients = self.clients.read().await;
            clients
                .values()
                .filter(|entry| entry.topics.contains(topic) && !entry.sender.is_closed())
                .map(|entry| entry.sender.clone())
                .collect()
        };
        if recipients.is_empty() {
            return 0;
        }

        let Some(frame) = encode(message) else {
            return 0;
        };

        let delivered = recipients
            .iter()
            .filter(|sender| sender.send(frame.clone()).is_ok())
            .count();
        debug!(topic, delivered, "Broadcast delivered");
        delivered
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    #[cfg(test)]
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.clients
            .read()
            .await
            .values()
            .filter(|entry| entry.topics.contains(topic))
            .count()
    }
}

fn encode(message: &ServerMessage) -> Option<Frame> {
    match serde_json::to_string(message) {
        Ok(text) => Some(Frame::from(text)),
        Err(e) => {
            warn!("Failed to serialize real-time message: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(device_id: i64) -> ServerMessage {
        ServerMessage::DeviceStatusUpdate(DeviceStatus {
            device_id,
            status: LinkStatus::Connected,
            is_connected: true,
            error: None,
            timestamp: "2024-01-01T00:00:00Z".to_string(),
        })
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_is_a_no_op() {
        let hub = BroadcastHub::new();
        let (_client, mut rx) = hub.register_client().await;

        assert_eq!(hub.broadcast_to_topic("device_1", &status(1)).await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn only_subscribers_of_the_topic_receive() {
        let hub = BroadcastHub::new();
        let (a, mut rx_a) = hub.register_client().await;
        let (b, mut rx_b) = hub.register_client().await;
        hub.subscribe(a, &topics::device(1)).await;
        hub.subscribe(b, &topics::device(2)).await;

        assert_eq!(hub.broadcast_to_topic(&topics::device(1), &status(1)).await, 1);

        let frame = rx_a.try_recv().unwrap();
        let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(json["type"], "DEVICE_STATUS_UPDATE");
        assert_eq!(json["payload"]["deviceId"], 1);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribed_client_misses_broadcast_and_gets_no_replay() {
        let hub = BroadcastHub::new();
        let (client, mut rx) = hub.register_client().await;
        let topic = topics::device(7);

        hub.subscribe(client, &topic).await;
        hub.unsubscribe(client, &topic).await;
        assert_eq!(hub.broadcast_to_topic(&topic, &status(7)).await, 0);

        hub.subscribe(client, &topic).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let hub = BroadcastHub::new();
        let (client, mut rx) = hub.register_client().await;
        hub.subscribe(client, topics::ALL_ALERTS).await;
        hub.subscribe(client, topics::ALL_ALERTS).await;

        assert_eq!(hub.subscriber_count(topics::ALL_ALERTS).await, 1);
        assert_eq!(hub.broadcast_to_topic(topics::ALL_ALERTS, &status(1)).await, 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_transports_are_skipped() {
        let hub = BroadcastHub::new();
        let (open, mut rx_open) = hub.register_client().await;
        let (closed, rx_closed) = hub.register_client().await;
        hub.subscribe(open, "devices").await;
        hub.subscribe(closed, "devices").await;
        drop(rx_closed);

        assert_eq!(hub.broadcast_to_topic("devices", &status(3)).await, 1);
        assert!(rx_open.try_recv().is_ok());
    }

    #[tokio::test]
    async fn removing_a_client_drops_its_subscriptions() {
        let hub = BroadcastHub::new();
        let (client, _rx) = hub.register_client().await;
        hub.subscribe(client, "devices").await;

        hub.remove_client(client).await;

        assert_eq!(hub.client_count().await, 0);
        assert_eq!(hub.subscriber_count("devices").await, 0);
        assert!(!hub.subscribe(client, "devices").await);
    }

    #[test]
    fn traffic_update_keeps_its_lowercase_type() {
        let message = ServerMessage::TrafficUpdate {
            device_id: 4,
            samples: Vec::new(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "traffic_update");
        assert_eq!(json["payload"]["deviceId"], 4);
    }
}
