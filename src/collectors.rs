//! Per-category collection: pull from a live connection, persist, then fan out
//! to the topic that category is published on.

use crate::broadcast_hub::{topics, BroadcastHub, ServerMessage};
use crate::connection_manager::DeviceConnection;
use crate::db::{DatabaseService, SnapshotTable};
use crate::error::{PollError, StorageError};
use crate::ids_adapter::IdsAdapter;
use crate::models::{FirewallRule, TrafficSample};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// What one full poll gathered.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PollSummary {
    pub device_id: i64,
    pub interfaces: usize,
    pub firewall_rules: usize,
    pub wireless_clients: usize,
    pub access_points: usize,
    pub traffic_samples: usize,
    pub anomalies: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrafficCollection {
    pub device_id: i64,
    pub samples: usize,
    pub analyzed: usize,
    pub anomalies: usize,
}

pub struct Collectors {
    db: Arc<DatabaseService>,
    hub: Arc<BroadcastHub>,
    ids: Option<Arc<IdsAdapter>>,
    analyze_collected: bool,
}

impl Collectors {
    pub fn new(
        db: Arc<DatabaseService>,
        hub: Arc<BroadcastHub>,
        ids: Option<Arc<IdsAdapter>>,
        analyze_collected: bool,
    ) -> Self {
        Self {
            db,
            hub,
            ids,
            analyze_collected,
        }
    }

    /// System resources and interface counters, published as one `METRICS_UPDATE`.
    pub async fn collect_metrics(&self, connection: &DeviceConnection) -> Result<usize, PollError> {
        let device_id = connection.device_id();
        let resources = connection.get_system_resources().await?;
        let interfaces = connection.get_interfaces().await?;

        self.db.insert_system_metric(device_id, &resources)?;
        self.db.insert_interface_stats(device_id, &interfaces)?;

        let count = interfaces.len();
        let message = ServerMessage::MetricsUpdate {
            device_id,
            resources,
            interfaces,
        };
        self.hub.broadcast_to_topic(&topics::device(device_id), &message).await;
        Ok(count)
    }

    pub async fn sync_firewall_rules(&self, connection: &DeviceConnection) -> Result<usize, PollError> {
        let rules = connection.get_firewall_rules().await?;
        Ok(self.store_firewall_rules(connection.device_id(), rules).await?)
    }

    /// Upserts a rule set (from a poll or the connection's periodic emission)
    /// and publishes it on the device's firewall topic.
    pub async fn store_firewall_rules(&self, device_id: i64, rules: Vec<FirewallRule>) -> Result<usize, StorageError> {
        let stored = self.db.sync_firewall_rules(device_id, &rules)?;
        let message = ServerMessage::FirewallRuleUpdate { device_id, rules };
        self.hub.broadcast_to_topic(&topics::firewall(device_id), &message).await;
        Ok(stored)
    }

    /// Wireless interfaces and registered clients. Skipped for devices
    /// without a wireless capability.
    pub async fn collect_wireless(&self, connection: &DeviceConnection) -> Result<usize, PollError> {
        if !connection.device().has_wireless {
            return Ok(0);
        }
        let device_id = connection.device_id();
        let interfaces = connection.get_wireless_interfaces().await?;
        let clients = connection.get_wireless_clients().await?;

        self.db.append_snapshot(SnapshotTable::WirelessInterfaces, device_id, &interfaces)?;
        self.db.append_snapshot(SnapshotTable::WirelessClients, device_id, &clients)?;

        let count = clients.len();
        let message = ServerMessage::WirelessUpdate {
            device_id,
            interfaces,
            clients,
        };
        self.hub.broadcast_to_topic(&topics::wireless(device_id), &message).await;
        Ok(count)
    }

    pub async fn collect_capsman(&self, connection: &DeviceConnection) -> Result<usize, PollError> {
        if !connection.device().has_capsman {
            return Ok(0);
        }
        let access_points = connection.get_capsman_access_points().await?;
        self.db
            .append_snapshot(SnapshotTable::CapsmanAccessPoints, connection.device_id(), &access_points)?;
        Ok(access_points.len())
    }

    /// Stores the current flow samples, publishes them, and optionally scores
    /// each one. A scoring failure is logged and never fails the collection.
    pub async fn collect_traffic(&self, connection: &DeviceConnection) -> Result<TrafficCollection, PollError> {
        let device_id = connection.device_id();
        let samples = connection.get_traffic_samples().await?;
        self.db.insert_traffic_samples(device_id, &samples)?;

        let message = ServerMessage::TrafficUpdate {
            device_id,
            samples: samples.clone(),
        };
        self.hub.broadcast_to_topic(&topics::traffic(device_id), &message).await;

        let mut collection = TrafficCollection {
            device_id,
            samples: samples.len(),
            ..TrafficCollection::default()
        };
        if self.analyze_collected {
            self.analyze(device_id, &samples, &mut collection).await;
        }
        Ok(collection)
    }

    async fn analyze(&self, device_id: i64, samples: &[TrafficSample], collection: &mut TrafficCollection) {
        let Some(ids) = &self.ids else {
            return;
        };
        for sample in samples {
            match ids.analyze_traffic(device_id, sample).await {
                Ok(verdict) => {
                    collection.analyzed += 1;
                    if verdict.is_anomaly {
                        collection.anomalies += 1;
                    }
                }
                Err(e) => {
                    warn!(device_id, "Skipping analysis of collected traffic: {}", e);
                    break;
                }
            }
        }
    }

    /// Runs every collector in turn. The first connection or storage failure
    /// ends the poll.
    pub async fn collect_all(&self, connection: &DeviceConnection) -> Result<PollSummary, PollError> {
        let device_id = connection.device_id();
        let interfaces = self.collect_metrics(connection).await?;
        let firewall_rules = self.sync_firewall_rules(connection).await?;
        let wireless_clients = self.collect_wireless(connection).await?;
        let access_points = self.collect_capsman(connection).await?;
        let traffic = self.collect_traffic(connection).await?;

        let summary = PollSummary {
            device_id,
            interfaces,
            firewall_rules,
            wireless_clients,
            access_points,
            traffic_samples: traffic.samples,
            anomalies: traffic.anomalies,
        };
        debug!(?summary, "Device poll collected");
        Ok(summary)
    }
}
