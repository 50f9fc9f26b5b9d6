use crate::error::StorageError;
use crate::models::{
    now_timestamp, Alert, AlertSeverity, CapsmanAccessPoint, DetectionRecord, Device, DeviceUpdate,
    FirewallRule, InterfaceStats, NewAlert, NewDevice, ProtocolSummary, Recorded, SystemResources,
    TrafficSample, TrafficSource, Verdict, WirelessClient, WirelessInterface,
};
use log::{debug, error, info};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;

type Result<T> = std::result::Result<T, StorageError>;

const DEVICE_COLUMNS: &str = "id, name, address, username, password, port, is_connected, \
     last_connected, has_wireless, has_capsman, created_at";

const ALERT_COLUMNS: &str = "id, device_id, alert_type, severity, message, source_ip, \
     destination_ip, destination_port, probability, sample_key, acknowledged, created_at";

/// Collections stored as one JSON document per entry. Every collection is
/// kept; readers return the entries of the most recent one.
#[derive(Debug, Clone, Copy)]
pub enum SnapshotTable {
    WirelessInterfaces,
    WirelessClients,
    CapsmanAccessPoints,
}

impl SnapshotTable {
    fn name(&self) -> &'static str {
        match self {
            SnapshotTable::WirelessInterfaces => "wireless_interfaces",
            SnapshotTable::WirelessClients => "wireless_clients",
            SnapshotTable::CapsmanAccessPoints => "capsman_aps",
        }
    }
}

pub struct DatabaseService {
    pool: Pool<SqliteConnectionManager>,
}

impl DatabaseService {
    /// Creates a new `DatabaseService` backed by a pool of connections to `db_path`.
    pub fn new(db_path: &str, pool_size: u32) -> Result<Self> {
        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder().max_size(pool_size).build(manager)?;
        Ok(Self { pool })
    }

    /// A private in-memory database. The pool holds a single connection so
    /// every caller sees the same data.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder().max_size(1).build(manager)?;
        let service = Self { pool };
        service.initialize_db()?;
        Ok(service)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Initializes the database schema.
    pub fn initialize_db(&self) -> Result<()> {
        let conn = self.conn()?;

        info!("Initializing database schema...");

        match conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS devices (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            address TEXT NOT NULL,
            username TEXT NOT NULL,
            password TEXT NOT NULL DEFAULT '',
            port INTEGER NOT NULL DEFAULT 8728,
            is_connected BOOLEAN NOT NULL DEFAULT 0,
            last_connected TEXT,
            has_wireless BOOLEAN NOT NULL DEFAULT 0,
            has_capsman BOOLEAN NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS system_metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id INTEGER NOT NULL,
            cpu_load REAL NOT NULL,
            free_memory INTEGER NOT NULL,
            total_memory INTEGER NOT NULL,
            uptime_secs INTEGER NOT NULL,
            temperature REAL,
            board_name TEXT NOT NULL,
            version TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY (device_id) REFERENCES devices(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS interface_stats (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            interface_type TEXT NOT NULL,
            running BOOLEAN NOT NULL,
            rx_bytes INTEGER NOT NULL,
            tx_bytes INTEGER NOT NULL,
            rx_packets INTEGER NOT NULL,
            tx_packets INTEGER NOT NULL,
            rx_errors INTEGER NOT NULL,
            tx_errors INTEGER NOT NULL,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY (device_id) REFERENCES devices(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS snapshot_collections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            entries INTEGER NOT NULL,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY (device_id) REFERENCES devices(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS wireless_interfaces (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id INTEGER NOT NULL,
            collection_id INTEGER NOT NULL,
            data TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY (device_id) REFERENCES devices(id) ON DELETE CASCADE,
            FOREIGN KEY (collection_id) REFERENCES snapshot_collections(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS wireless_clients (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id INTEGER NOT NULL,
            collection_id INTEGER NOT NULL,
            data TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY (device_id) REFERENCES devices(id) ON DELETE CASCADE,
            FOREIGN KEY (collection_id) REFERENCES snapshot_collections(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS capsman_aps (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id INTEGER NOT NULL,
            collection_id INTEGER NOT NULL,
            data TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY (device_id) REFERENCES devices(id) ON DELETE CASCADE,
            FOREIGN KEY (collection_id) REFERENCES snapshot_collections(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS firewall_rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id INTEGER NOT NULL,
            rule_id TEXT NOT NULL,
            chain TEXT NOT NULL,
            action TEXT NOT NULL,
            protocol TEXT,
            src_address TEXT,
            dst_address TEXT,
            dst_port TEXT,
            comment TEXT,
            disabled BOOLEAN NOT NULL DEFAULT 0,
            bytes INTEGER NOT NULL DEFAULT 0,
            packets INTEGER NOT NULL DEFAULT 0,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY (device_id) REFERENCES devices(id) ON DELETE CASCADE,
            UNIQUE (device_id, rule_id)
        );

        CREATE TABLE IF NOT EXISTS traffic_samples (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id INTEGER NOT NULL,
            source_ip TEXT NOT NULL,
            destination_ip TEXT NOT NULL,
            destination_port INTEGER NOT NULL,
            protocol TEXT NOT NULL,
            packet_count INTEGER NOT NULL,
            byte_count INTEGER NOT NULL,
            packets TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY (device_id) REFERENCES devices(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS traffic_features (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id INTEGER NOT NULL,
            sample_key TEXT NOT NULL,
            features TEXT NOT NULL,
            is_anomaly BOOLEAN NOT NULL,
            probability REAL NOT NULL,
            recorded_at TEXT NOT NULL,
            FOREIGN KEY (device_id) REFERENCES devices(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS alerts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id INTEGER NOT NULL,
            alert_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            message TEXT NOT NULL,
            source_ip TEXT NOT NULL,
            destination_ip TEXT NOT NULL,
            destination_port INTEGER NOT NULL,
            probability REAL NOT NULL,
            sample_key TEXT NOT NULL UNIQUE,
            acknowledged BOOLEAN NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY (device_id) REFERENCES devices(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS detection_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            alert_id INTEGER NOT NULL,
            device_id INTEGER NOT NULL,
            traffic_feature_id INTEGER NOT NULL,
            model TEXT NOT NULL,
            probability REAL NOT NULL,
            detected_at TEXT NOT NULL,
            FOREIGN KEY (alert_id) REFERENCES alerts(id) ON DELETE CASCADE,
            FOREIGN KEY (device_id) REFERENCES devices(id) ON DELETE CASCADE,
            FOREIGN KEY (traffic_feature_id) REFERENCES traffic_features(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_system_metrics_device ON system_metrics(device_id, recorded_at);
        CREATE INDEX IF NOT EXISTS idx_traffic_samples_device ON traffic_samples(device_id, recorded_at);
        CREATE INDEX IF NOT EXISTS idx_snapshot_collections_device ON snapshot_collections(device_id, kind, id);
        CREATE INDEX IF NOT EXISTS idx_alerts_device ON alerts(device_id, created_at);
        "#,
        ) {
            Ok(_) => {
                info!("Database schema initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize database schema: {:?}", e);
                Err(e.into())
            }
        }
    }

    // Devices

    pub fn list_devices(&self) -> Result<Vec<Device>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM devices ORDER BY id", DEVICE_COLUMNS))?;
        let rows = stmt.query_map([], device_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_device(&self, id: i64) -> Result<Option<Device>> {
        let conn = self.conn()?;
        let device = conn
            .query_row(
                &format!("SELECT {} FROM devices WHERE id = ?1", DEVICE_COLUMNS),
                params![id],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    pub fn create_device(&self, device: &NewDevice) -> Result<Device> {
        let conn = self.conn()?;
        let created_at = now_timestamp();
        conn.execute(
            "INSERT INTO devices (name, address, username, password, port, has_wireless, has_capsman, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                device.name,
                device.address,
                device.username,
                device.password,
                device.port,
                device.has_wireless,
                device.has_capsman,
                created_at
            ],
        )?;
        let id = conn.last_insert_rowid();
        info!("Registered device {} ({}) at {}:{}", id, device.name, device.address, device.port);

        Ok(Device {
            id,
            name: device.name.clone(),
            address: device.address.clone(),
            username: device.username.clone(),
            password: device.password.clone(),
            port: device.port,
            is_connected: false,
            last_connected: None,
            has_wireless: device.has_wireless,
            has_capsman: device.has_capsman,
            created_at,
        })
    }

    /// Applies the present fields of `update`. Returns `None` when the device does not exist.
    pub fn update_device(&self, id: i64, update: &DeviceUpdate) -> Result<Option<Device>> {
        let Some(mut device) = self.get_device(id)? else {
            return Ok(None);
        };

        if let Some(name) = &update.name {
            device.name = name.clone();
        }
        if let Some(address) = &update.address {
            device.address = address.clone();
        }
        if let Some(username) = &update.username {
            device.username = username.clone();
        }
        if let Some(password) = &update.password {
            device.password = password.clone();
        }
        if let Some(port) = update.port {
            device.port = port;
        }
        if let Some(has_wireless) = update.has_wireless {
            device.has_wireless = has_wireless;
        }
        if let Some(has_capsman) = update.has_capsman {
            device.has_capsman = has_capsman;
        }

        let conn = self.conn()?;
        conn.execute(
            "UPDATE devices SET name = ?1, address = ?2, username = ?3, password = ?4, port = ?5,
                 has_wireless = ?6, has_capsman = ?7
             WHERE id = ?8",
            params![
                device.name,
                device.address,
                device.username,
                device.password,
                device.port,
                device.has_wireless,
                device.has_capsman,
                id
            ],
        )?;
        Ok(Some(device))
    }

    /// Deletes a device and, through cascading foreign keys, everything collected for it.
    pub fn delete_device(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM devices WHERE id = ?1", params![id])?;
        if removed > 0 {
            info!("Deleted device {} and its collected data", id);
        }
        Ok(removed > 0)
    }

    /// Records a connection state transition. `last_connected` only moves forward on connect.
    pub fn set_connection_state(&self, id: i64, connected: bool) -> Result<()> {
        let conn = self.conn()?;
        if connected {
            conn.execute(
                "UPDATE devices SET is_connected = 1, last_connected = ?1 WHERE id = ?2",
                params![now_timestamp(), id],
            )?;
        } else {
            conn.execute("UPDATE devices SET is_connected = 0 WHERE id = ?1", params![id])?;
        }
        Ok(())
    }

    // Metrics

    pub fn insert_system_metric(
        &self,
        device_id: i64,
        resources: &SystemResources,
    ) -> Result<Recorded<SystemResources>> {
        let conn = self.conn()?;
        let recorded_at = now_timestamp();
        conn.execute(
            "INSERT INTO system_metrics (device_id, cpu_load, free_memory, total_memory, uptime_secs,
                 temperature, board_name, version, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                device_id,
                resources.cpu_load,
                resources.free_memory,
                resources.total_memory,
                resources.uptime_secs,
                resources.temperature,
                resources.board_name,
                resources.version,
                recorded_at
            ],
        )?;
        Ok(Recorded {
            id: conn.last_insert_rowid(),
            device_id,
            recorded_at,
            data: resources.clone(),
        })
    }

    /// Retrieves the last `limit` metric samples for a device, newest first.
    pub fn latest_system_metrics(&self, device_id: i64, limit: usize) -> Result<Vec<Recorded<SystemResources>>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, device_id, recorded_at, cpu_load, free_memory, total_memory, uptime_secs,
                 temperature, board_name, version
             FROM system_metrics
             WHERE device_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![device_id, limit], |row| {
            Ok(Recorded {
                id: row.get(0)?,
                device_id: row.get(1)?,
                recorded_at: row.get(2)?,
                data: SystemResources {
                    cpu_load: row.get(3)?,
                    free_memory: row.get(4)?,
                    total_memory: row.get(5)?,
                    uptime_secs: row.get(6)?,
                    temperature: row.get(7)?,
                    board_name: row.get(8)?,
                    version: row.get(9)?,
                },
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn insert_interface_stats(&self, device_id: i64, stats: &[InterfaceStats]) -> Result<()> {
        let mut conn = self.conn()?;
        let recorded_at = now_timestamp();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO interface_stats (device_id, name, interface_type, running, rx_bytes, tx_bytes,
                     rx_packets, tx_packets, rx_errors, tx_errors, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for iface in stats {
                stmt.execute(params![
                    device_id,
                    iface.name,
                    iface.interface_type,
                    iface.running,
                    iface.rx_bytes,
                    iface.tx_bytes,
                    iface.rx_packets,
                    iface.tx_packets,
                    iface.rx_errors,
                    iface.tx_errors,
                    recorded_at
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Interface counters from the most recent collection.
    pub fn latest_interface_stats(&self, device_id: i64) -> Result<Vec<Recorded<InterfaceStats>>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, device_id, recorded_at, name, interface_type, running, rx_bytes, tx_bytes,
                 rx_packets, tx_packets, rx_errors, tx_errors
             FROM interface_stats
             WHERE device_id = ?1
               AND recorded_at = (SELECT MAX(recorded_at) FROM interface_stats WHERE device_id = ?1)
             ORDER BY name",
        )?;
        let rows = stmt.query_map(params![device_id], |row| {
            Ok(Recorded {
                id: row.get(0)?,
                device_id: row.get(1)?,
                recorded_at: row.get(2)?,
                data: InterfaceStats {
                    name: row.get(3)?,
                    interface_type: row.get(4)?,
                    running: row.get(5)?,
                    rx_bytes: row.get(6)?,
                    tx_bytes: row.get(7)?,
                    rx_packets: row.get(8)?,
                    tx_packets: row.get(9)?,
                    rx_errors: row.get(10)?,
                    tx_errors: row.get(11)?,
                },
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // Snapshots (wireless, clients, CAPsMAN)

    /// Appends one collection of `table` entries for a device. An empty
    /// collection is still recorded, so it supersedes the previous one.
    pub fn append_snapshot<T: Serialize>(&self, table: SnapshotTable, device_id: i64, entries: &[T]) -> Result<i64> {
        let mut conn = self.conn()?;
        let recorded_at = now_timestamp();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO snapshot_collections (device_id, kind, entries, recorded_at) VALUES (?1, ?2, ?3, ?4)",
            params![device_id, table.name(), entries.len() as i64, recorded_at],
        )?;
        let collection_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (device_id, collection_id, data, recorded_at) VALUES (?1, ?2, ?3, ?4)",
                table.name()
            ))?;
            for entry in entries {
                stmt.execute(params![device_id, collection_id, serde_json::to_string(entry)?, recorded_at])?;
            }
        }
        tx.commit()?;
        debug!("Stored {} {} entries for device {}", entries.len(), table.name(), device_id);
        Ok(collection_id)
    }

    /// Entries of the device's most recent collection of `table`.
    pub fn snapshot<T: DeserializeOwned>(&self, table: SnapshotTable, device_id: i64) -> Result<Vec<Recorded<T>>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, device_id, recorded_at, data FROM {table}
             WHERE device_id = ?1
               AND collection_id = (
                   SELECT MAX(id) FROM snapshot_collections WHERE device_id = ?1 AND kind = ?2
               )
             ORDER BY id",
            table = table.name()
        ))?;
        let rows = stmt.query_map(params![device_id, table.name()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (id, device_id, recorded_at, data) = row?;
            results.push(Recorded {
                id,
                device_id,
                recorded_at,
                data: serde_json::from_str(&data)?,
            });
        }
        Ok(results)
    }

    /// Number of collections of `table` kept for the device.
    #[cfg(test)]
    pub fn snapshot_history_len(&self, table: SnapshotTable, device_id: i64) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM snapshot_collections WHERE device_id = ?1 AND kind = ?2",
            params![device_id, table.name()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn wireless_interfaces(&self, device_id: i64) -> Result<Vec<Recorded<WirelessInterface>>> {
        self.snapshot(SnapshotTable::WirelessInterfaces, device_id)
    }

    pub fn wireless_clients(&self, device_id: i64) -> Result<Vec<Recorded<WirelessClient>>> {
        self.snapshot(SnapshotTable::WirelessClients, device_id)
    }

    pub fn capsman_access_points(&self, device_id: i64) -> Result<Vec<Recorded<CapsmanAccessPoint>>> {
        self.snapshot(SnapshotTable::CapsmanAccessPoints, device_id)
    }

    // Firewall

    /// Mirrors the router's rule set: rules are upserted by their router-assigned
    /// id and rules the router no longer reports are removed.
    pub fn sync_firewall_rules(&self, device_id: i64, rules: &[FirewallRule]) -> Result<usize> {
        let mut conn = self.conn()?;
        let recorded_at = now_timestamp();
        let tx = conn.transaction()?;
        {
            let mut upsert = tx.prepare(
                r#"
                INSERT INTO firewall_rules (device_id, rule_id, chain, action, protocol, src_address,
                    dst_address, dst_port, comment, disabled, bytes, packets, recorded_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(device_id, rule_id) DO UPDATE SET
                    chain = excluded.chain,
                    action = excluded.action,
                    protocol = excluded.protocol,
                    src_address = excluded.src_address,
                    dst_address = excluded.dst_address,
                    dst_port = excluded.dst_port,
                    comment = excluded.comment,
                    disabled = excluded.disabled,
                    bytes = excluded.bytes,
                    packets = excluded.packets,
                    recorded_at = excluded.recorded_at
                "#,
            )?;
            for rule in rules {
                upsert.execute(params![
                    device_id,
                    rule.rule_id,
                    rule.chain,
                    rule.action,
                    rule.protocol,
                    rule.src_address,
                    rule.dst_address,
                    rule.dst_port,
                    rule.comment,
                    rule.disabled,
                    rule.bytes,
                    rule.packets,
                    recorded_at
                ])?;
            }
        }
        let stored_ids = {
            let mut stmt = tx.prepare("SELECT rule_id FROM firewall_rules WHERE device_id = ?1")?;
            let ids = stmt.query_map(params![device_id], |row| row.get::<_, String>(0))?;
            ids.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let mut stale = 0;
        for rule_id in stored_ids {
            if !rules.iter().any(|rule| rule.rule_id == rule_id) {
                stale += tx.execute(
                    "DELETE FROM firewall_rules WHERE device_id = ?1 AND rule_id = ?2",
                    params![device_id, rule_id],
                )?;
            }
        }
        tx.commit()?;

        if stale > 0 {
            debug!("Removed {} firewall rules no longer present on device {}", stale, device_id);
        }
        Ok(rules.len())
    }

    pub fn firewall_rules(&self, device_id: i64) -> Result<Vec<Recorded<FirewallRule>>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, device_id, recorded_at, rule_id, chain, action, protocol, src_address,
                 dst_address, dst_port, comment, disabled, bytes, packets
             FROM firewall_rules
             WHERE device_id = ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![device_id], |row| {
            Ok(Recorded {
                id: row.get(0)?,
                device_id: row.get(1)?,
                recorded_at: row.get(2)?,
                data: FirewallRule {
                    rule_id: row.get(3)?,
                    chain: row.get(4)?,
                    action: row.get(5)?,
                    protocol: row.get(6)?,
                    src_address: row.get(7)?,
                    dst_address: row.get(8)?,
                    dst_port: row.get(9)?,
                    comment: row.get(10)?,
                    disabled: row.get(11)?,
                    bytes: row.get(12)?,
                    packets: row.get(13)?,
                },
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // Traffic

    pub fn insert_traffic_samples(&self, device_id: i64, samples: &[TrafficSample]) -> Result<Vec<Recorded<TrafficSample>>> {
        let mut conn = self.conn()?;
        let recorded_at = now_timestamp();
        let tx = conn.transaction()?;
        let mut stored = Vec::with_capacity(samples.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO traffic_samples (device_id, source_ip, destination_ip, destination_port,
                     protocol, packet_count, byte_count, packets, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for sample in samples {
                stmt.execute(params![
                    device_id,
                    sample.source_ip,
                    sample.destination_ip,
                    sample.destination_port,
                    sample.protocol,
                    sample.packets.len(),
                    sample.total_bytes(),
                    serde_json::to_string(&sample.packets)?,
                    recorded_at
                ])?;
                stored.push(Recorded {
                    id: tx.last_insert_rowid(),
                    device_id,
                    recorded_at: recorded_at.clone(),
                    data: sample.clone(),
                });
            }
        }
        tx.commit()?;
        Ok(stored)
    }

    pub fn recent_traffic(&self, device_id: i64, limit: usize) -> Result<Vec<Recorded<TrafficSample>>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, device_id, recorded_at, source_ip, destination_ip, destination_port, protocol, packets
             FROM traffic_samples
             WHERE device_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![device_id, limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u16>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (id, device_id, recorded_at, source_ip, destination_ip, destination_port, protocol, packets) = row?;
            results.push(Recorded {
                id,
                device_id,
                recorded_at,
                data: TrafficSample {
                    source_ip,
                    destination_ip,
                    destination_port,
                    protocol,
                    packets: serde_json::from_str(&packets)?,
                },
            });
        }
        Ok(results)
    }

    pub fn protocol_summary(&self, device_id: i64) -> Result<Vec<ProtocolSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT protocol, COUNT(*), SUM(packet_count), SUM(byte_count)
             FROM traffic_samples
             WHERE device_id = ?1
             GROUP BY protocol
             ORDER BY SUM(byte_count) DESC",
        )?;
        let rows = stmt.query_map(params![device_id], |row| {
            Ok(ProtocolSummary {
                protocol: row.get(0)?,
                samples: row.get(1)?,
                packets: row.get(2)?,
                bytes: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn top_sources(&self, device_id: i64, limit: usize) -> Result<Vec<TrafficSource>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT source_ip, COUNT(*), SUM(packet_count), SUM(byte_count)
             FROM traffic_samples
             WHERE device_id = ?1
             GROUP BY source_ip
             ORDER BY SUM(byte_count) DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![device_id, limit], |row| {
            Ok(TrafficSource {
                source_ip: row.get(0)?,
                samples: row.get(1)?,
                packets: row.get(2)?,
                bytes: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // IDS

    pub fn insert_traffic_feature(
        &self,
        device_id: i64,
        sample_key: &str,
        features: &serde_json::Value,
        verdict: &Verdict,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO traffic_features (device_id, sample_key, features, is_anomaly, probability, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                device_id,
                sample_key,
                serde_json::to_string(features)?,
                verdict.is_anomaly,
                verdict.probability,
                verdict.timestamp
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Stores an alert and its detection-history row atomically. Returns `None`
    /// when an alert for the same sample already exists.
    pub fn record_alert(&self, alert: &NewAlert, traffic_feature_id: i64, model: &str) -> Result<Option<Alert>> {
        let mut conn = self.conn()?;
        let created_at = now_timestamp();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO alerts (device_id, alert_type, severity, message, source_ip,
                 destination_ip, destination_port, probability, sample_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                alert.device_id,
                alert.alert_type,
                alert.severity.as_str(),
                alert.message,
                alert.source_ip,
                alert.destination_ip,
                alert.destination_port,
                alert.probability,
                alert.sample_key,
                created_at
            ],
        )?;
        if inserted == 0 {
            debug!("Alert for sample {} already recorded", alert.sample_key);
            return Ok(None);
        }

        let alert_id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO detection_history (alert_id, device_id, traffic_feature_id, model, probability, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![alert_id, alert.device_id, traffic_feature_id, model, alert.probability, created_at],
        )?;
        tx.commit()?;

        Ok(Some(Alert {
            id: alert_id,
            device_id: alert.device_id,
            alert_type: alert.alert_type.clone(),
            severity: alert.severity,
            message: alert.message.clone(),
            source_ip: alert.source_ip.clone(),
            destination_ip: alert.destination_ip.clone(),
            destination_port: alert.destination_port,
            probability: alert.probability,
            sample_key: alert.sample_key.clone(),
            acknowledged: false,
            created_at,
        }))
    }

    pub fn list_alerts(&self, device_id: Option<i64>, limit: usize) -> Result<Vec<Alert>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM alerts
             WHERE ?1 IS NULL OR device_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
            ALERT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![device_id, limit], alert_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn detection_history(&self, alert_id: i64) -> Result<Vec<DetectionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, alert_id, device_id, traffic_feature_id, model, probability, detected_at
             FROM detection_history
             WHERE alert_id = ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![alert_id], |row| {
            Ok(DetectionRecord {
                id: row.get(0)?,
                alert_id: row.get(1)?,
                device_id: row.get(2)?,
                traffic_feature_id: row.get(3)?,
                model: row.get(4)?,
                probability: row.get(5)?,
                detected_at: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        username: row.get(3)?,
        password: row.get(4)?,
        port: row.get(5)?,
        is_connected: row.get(6)?,
        last_connected: row.get(7)?,
        has_wireless: row.get(8)?,
        has_capsman: row.get(9)?,
        created_at: row.get(10)?,
    })
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<Alert> {
    let severity: String = row.get(3)?;
    Ok(Alert {
        id: row.get(0)?,
        device_id: row.get(1)?,
        alert_type: row.get(2)?,
        severity: AlertSeverity::parse(&severity),
        message: row.get(4)?,
        source_ip: row.get(5)?,
        destination_ip: row.get(6)?,
        destination_port: row.get(7)?,
        probability: row.get(8)?,
        sample_key: row.get(9)?,
        acknowledged: row.get(10)?,
        created_at: row.get(11)?,
    })
}
