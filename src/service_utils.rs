use crate::broadcast_hub::{topics, BroadcastHub, DeviceStatus, LinkStatus, ServerMessage};
use crate::collectors::Collectors;
use crate::connection_manager::{ConnectionEvent, ConnectionEventKind};
use crate::db::DatabaseService;
use crate::models::now_timestamp;
use crate::scheduler::Scheduler;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Reflects one connection event in the registry and on the real-time channel.
pub async fn apply_connection_event(
    db: &DatabaseService,
    hub: &BroadcastHub,
    collectors: &Collectors,
    event: ConnectionEvent,
) {
    let device_id = event.device_id;
    let (status, is_connected, error) = match event.kind {
        ConnectionEventKind::RulesUpdate { rules } => {
            if let Err(e) = collectors.store_firewall_rules(device_id, rules).await {
                error!(device_id, "Failed to store emitted firewall rules: {}", e);
            }
            return;
        }
        ConnectionEventKind::Connected => (LinkStatus::Connected, true, None),
        ConnectionEventKind::Disconnected => (LinkStatus::Disconnected, false, None),
        ConnectionEventKind::Error { message } => (LinkStatus::Error, false, Some(message)),
    };

    if let Err(e) = db.set_connection_state(device_id, is_connected) {
        error!(device_id, "Failed to record connection state: {}", e);
    }

    let message = ServerMessage::DeviceStatusUpdate(DeviceStatus {
        device_id,
        status,
        is_connected,
        error,
        timestamp: now_timestamp(),
    });
    hub.broadcast_to_topic(&topics::device(device_id), &message).await;
    hub.broadcast_to_topic(topics::DEVICES, &message).await;
}

/// Drains connection events until every sender is gone.
pub fn start_event_pump(
    db: Arc<DatabaseService>,
    hub: Arc<BroadcastHub>,
    collectors: Arc<Collectors>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!(device_id = event.device_id, "Connection event received");
            apply_connection_event(&db, &hub, &collectors, event).await;
        }
        debug!("Connection event stream closed");
    })
}

/// Starts the polling cycle.
pub async fn start_scheduler(scheduler: Arc<Scheduler>) {
    if !scheduler.initialize().await {
        info!("Scheduler was already running");
    }
}

/// Waits for Ctrl-C, then stops polling and closes every device session.
pub async fn handle_shutdown(scheduler: Arc<Scheduler>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
    } else {
        info!("RouterFlux is shutting down...");
    }
    scheduler.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::test_support::rule;
    use crate::models::NewDevice;

    fn setup() -> (Arc<DatabaseService>, Arc<BroadcastHub>, Arc<Collectors>, i64) {
        let db = Arc::new(DatabaseService::in_memory().unwrap());
        let hub = BroadcastHub::new();
        let collectors = Arc::new(Collectors::new(db.clone(), hub.clone(), None, false));
        let device = db
            .create_device(&NewDevice {
                name: "gw".to_string(),
                address: "10.0.0.1".to_string(),
                username: "admin".to_string(),
                password: String::new(),
                port: 8728,
                has_wireless: false,
                has_capsman: false,
            })
            .unwrap();
        (db, hub, collectors, device.id)
    }

    #[tokio::test]
    async fn error_events_mark_the_device_disconnected_and_broadcast() {
        let (db, hub, collectors, id) = setup();
        let (client, mut rx) = hub.register_client().await;
        hub.subscribe(client, topics::DEVICES).await;

        apply_connection_event(&db, &hub, &collectors, ConnectionEvent {
            device_id: id,
            kind: ConnectionEventKind::Connected,
        })
        .await;
        assert!(db.get_device(id).unwrap().unwrap().is_connected);

        apply_connection_event(&db, &hub, &collectors, ConnectionEvent {
            device_id: id,
            kind: ConnectionEventKind::Error {
                message: "timeout".to_string(),
            },
        })
        .await;

        assert!(!db.get_device(id).unwrap().unwrap().is_connected);
        rx.try_recv().unwrap();
        let json: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(json["type"], "DEVICE_STATUS_UPDATE");
        assert_eq!(json["payload"]["status"], "error");
        assert_eq!(json["payload"]["error"], "timeout");
    }

    #[tokio::test]
    async fn pump_stores_emitted_rules() {
        let (db, hub, collectors, id) = setup();
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = start_event_pump(db.clone(), hub, collectors, rx);

        tx.send(ConnectionEvent {
            device_id: id,
            kind: ConnectionEventKind::RulesUpdate {
                rules: vec![rule("*1"), rule("*3")],
            },
        })
        .unwrap();
        drop(tx);
        pump.await.unwrap();

        assert_eq!(db.firewall_rules(id).unwrap().len(), 2);
    }
}
