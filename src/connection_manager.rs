use crate::error::ConnectionError;
use crate::models::{
    CapsmanAccessPoint, Device, FirewallRule, InterfaceStats, SystemResources, TrafficSample, WirelessClient,
    WirelessInterface,
};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// The management API a router exposes. Every call is made on behalf of a
/// logged-in session for `device`.
#[async_trait]
pub trait RouterApi: Send + Sync {
    async fn login(&self, device: &Device) -> Result<(), ConnectionError>;
    async fn logout(&self, device: &Device);
    async fn system_resources(&self, device: &Device) -> Result<SystemResources, ConnectionError>;
    async fn interfaces(&self, device: &Device) -> Result<Vec<InterfaceStats>, ConnectionError>;
    async fn firewall_rules(&self, device: &Device) -> Result<Vec<FirewallRule>, ConnectionError>;
    async fn wireless_interfaces(&self, device: &Device) -> Result<Vec<WirelessInterface>, ConnectionError>;
    async fn wireless_clients(&self, device: &Device) -> Result<Vec<WirelessClient>, ConnectionError>;
    async fn capsman_access_points(&self, device: &Device) -> Result<Vec<CapsmanAccessPoint>, ConnectionError>;
    async fn traffic_samples(&self, device: &Device) -> Result<Vec<TrafficSample>, ConnectionError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEventKind {
    Connected,
    Disconnected,
    Error { message: String },
    RulesUpdate { rules: Vec<FirewallRule> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEvent {
    pub device_id: i64,
    pub kind: ConnectionEventKind,
}

/// One logical session to a device.
pub struct DeviceConnection {
    device: Device,
    api: Arc<dyn RouterApi>,
    state: Mutex<ConnectionState>,
    last_error: Mutex<Option<String>>,
    // Serializes connect/disconnect so a device never has two sessions.
    lifecycle: Mutex<()>,
    emitter: Mutex<Option<JoinHandle<()>>>,
    emission_interval: Duration,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl DeviceConnection {
    pub fn new(
        device: Device,
        api: Arc<dyn RouterApi>,
        emission_interval: Duration,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            device,
            api,
            state: Mutex::new(ConnectionState::Disconnected),
            last_error: Mutex::new(None),
            lifecycle: Mutex::new(()),
            emitter: Mutex::new(None),
            emission_interval,
            events,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn device_id(&self) -> i64 {
        self.device.id
    }

    pub async fn state(&self) -> ConnectionState {
        self.state.lock().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.lock().await == ConnectionState::Connected
    }

    /// Error that ended the most recent session, cleared by the next
    /// successful connect.
    pub async fn last_error(&self) -> Option<String> {
        self.last_error.lock().await.clone()
    }

    /// Opens the session and starts the periodic rule emission. Returns
    /// immediately when already connected.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected().await {
            return Ok(());
        }

        debug!("Connecting to device {} at {}:{}...", self.device.id, self.device.address, self.device.port);
        self.set_state(ConnectionState::Connecting).await;

        match self.api.login(&self.device).await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected).await;
                *self.last_error.lock().await = None;
                info!("Connected to device {} ({}).", self.device.id, self.device.name);
                self.emit(ConnectionEventKind::Connected);
                self.start_emitter().await;
                Ok(())
            }
            Err(e) => {
                self.fail(e.to_string(), true).await;
                Err(e)
            }
        }
    }

    /// Stops emission and closes the session. No-op when not connected.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state().await == ConnectionState::Disconnected {
            return;
        }

        self.stop_emitter(true).await;
        self.api.logout(&self.device).await;
        self.set_state(ConnectionState::Disconnected).await;
        info!("Disconnected from device {}.", self.device.id);
        self.emit(ConnectionEventKind::Disconnected);
    }

    pub async fn get_firewall_rules(&self) -> Result<Vec<FirewallRule>, ConnectionError> {
        self.ensure_connected().await?;
        let result = self.api.firewall_rules(&self.device).await;
        self.checked(result).await
    }

    pub async fn get_system_resources(&self) -> Result<SystemResources, ConnectionError> {
        self.ensure_connected().await?;
        let result = self.api.system_resources(&self.device).await;
        self.checked(result).await
    }

    pub async fn get_interfaces(&self) -> Result<Vec<InterfaceStats>, ConnectionError> {
        self.ensure_connected().await?;
        let result = self.api.interfaces(&self.device).await;
        self.checked(result).await
    }

    pub async fn get_wireless_interfaces(&self) -> Result<Vec<WirelessInterface>, ConnectionError> {
        self.ensure_connected().await?;
        let result = self.api.wireless_interfaces(&self.device).await;
        self.checked(result).await
    }

    pub async fn get_wireless_clients(&self) -> Result<Vec<WirelessClient>, ConnectionError> {
        self.ensure_connected().await?;
        let result = self.api.wireless_clients(&self.device).await;
        self.checked(result).await
    }

    pub async fn get_capsman_access_points(&self) -> Result<Vec<CapsmanAccessPoint>, ConnectionError> {
        self.ensure_connected().await?;
        let result = self.api.capsman_access_points(&self.device).await;
        self.checked(result).await
    }

    pub async fn get_traffic_samples(&self) -> Result<Vec<TrafficSample>, ConnectionError> {
        self.ensure_connected().await?;
        let result = self.api.traffic_samples(&self.device).await;
        self.checked(result).await
    }

    async fn ensure_connected(&self) -> Result<(), ConnectionError> {
        if self.is_connected().await {
            Ok(())
        } else {
            Err(ConnectionError::NotConnected(self.device.id))
        }
    }

    /// A router failure on a live session tears the session down.
    async fn checked<T>(&self, result: Result<T, ConnectionError>) -> Result<T, ConnectionError> {
        if let Err(e) = &result {
            self.fail(e.to_string(), true).await;
        }
        result
    }

    /// `Connected | Connecting → Error → Disconnected`.
    async fn fail(&self, message: String, abort_emitter: bool) {
        warn!("Device {} connection error: {}", self.device.id, message);
        self.set_state(ConnectionState::Error).await;
        *self.last_error.lock().await = Some(message.clone());
        self.emit(ConnectionEventKind::Error { message });
        self.stop_emitter(abort_emitter).await;
        self.set_state(ConnectionState::Disconnected).await;
    }

    async fn set_state(&self, next: ConnectionState) {
        *self.state.lock().await = next;
    }

    fn emit(&self, kind: ConnectionEventKind) {
        let event = ConnectionEvent {
            device_id: self.device.id,
            kind,
        };
        if self.events.send(event).is_err() {
            debug!("Connection event for device {} dropped: no listener.", self.device.id);
        }
    }

    async fn start_emitter(self: &Arc<Self>) {
        let connection: Weak<Self> = Arc::downgrade(self);
        let period = self.emission_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // first tick completes immediately

            loop {
                ticker.tick().await;
                let Some(connection) = connection.upgrade() else {
                    break;
                };
                if !connection.is_connected().await {
                    break;
                }
                match connection.api.firewall_rules(&connection.device).await {
                    Ok(rules) => connection.emit(ConnectionEventKind::RulesUpdate { rules }),
                    Err(e) => {
                        // Running inside the emitter: detach instead of aborting ourselves.
                        connection.fail(e.to_string(), false).await;
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.emitter.lock().await.replace(handle) {
            previous.abort();
        }
    }

    async fn stop_emitter(&self, abort: bool) {
        if let Some(handle) = self.emitter.lock().await.take() {
            if abort {
                handle.abort();
            }
        }
    }
}

impl fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("device_id", &self.device.id)
            .field("address", &self.device.address)
            .field("port", &self.device.port)
            .finish()
    }
}

impl Drop for DeviceConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.emitter.get_mut().take() {
            handle.abort();
        }
    }
}

/// Hands out at most one [`DeviceConnection`] per device id.
pub struct ConnectionManager {
    api: Arc<dyn RouterApi>,
    handles: Mutex<HashMap<i64, Arc<DeviceConnection>>>,
    emission_interval: Duration,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(
        api: Arc<dyn RouterApi>,
        emission_interval: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            api,
            handles: Mutex::new(HashMap::new()),
            emission_interval,
            events,
        });
        (manager, receiver)
    }

    /// Returns the device's handle, creating it if needed. A handle created for
    /// stale connection settings is torn down and replaced.
    pub async fn handle_for(&self, device: &Device) -> Arc<DeviceConnection> {
        let (fresh, replaced) = {
            let mut handles = self.handles.lock().await;
            if let Some(existing) = handles.get(&device.id) {
                if same_endpoint(existing.device(), device) {
                    return existing.clone();
                }
            }
            let fresh = DeviceConnection::new(
                device.clone(),
                self.api.clone(),
                self.emission_interval,
                self.events.clone(),
            );
            let replaced = handles.insert(device.id, fresh.clone());
            (fresh, replaced)
        };

        if let Some(stale) = replaced {
            info!("Connection settings for device {} changed; replacing session.", device.id);
            stale.disconnect().await;
        }
        fresh
    }

    /// Connects the device's handle, reusing a live session when there is one.
    pub async fn connect(&self, device: &Device) -> Result<Arc<DeviceConnection>, ConnectionError> {
        let handle = self.handle_for(device).await;
        handle.connect().await?;
        Ok(handle)
    }

    pub async fn get(&self, device_id: i64) -> Option<Arc<DeviceConnection>> {
        self.handles.lock().await.get(&device_id).cloned()
    }

    /// Disconnects and forgets the device's handle.
    pub async fn remove(&self, device_id: i64) {
        let removed = self.handles.lock().await.remove(&device_id);
        if let Some(handle) = removed {
            handle.disconnect().await;
        }
    }

    pub async fn disconnect_all(&self) {
        let handles: Vec<_> = self.handles.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.disconnect().await;
        }
    }

    pub async fn handle_count(&self) -> usize {
        self.handles.lock().await.len()
    }
}

fn same_endpoint(a: &Device, b: &Device) -> bool {
    a.address == b.address && a.port == b.port && a.username == b.username && a.password == b.password
}
