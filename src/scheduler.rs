use crate::collectors::{Collectors, PollSummary};
use crate::connection_manager::ConnectionManager;
use crate::db::DatabaseService;
use crate::error::{PollError, StorageError, ValidationError};
use crate::models::Device;
use crate::poll_tracker::{DevicePollStatus, PollOutcome, PollTracker};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub polling_interval: Duration,
    pub min_polling_interval: Duration,
    pub max_concurrent_devices: usize,
    pub tick: Duration,
    pub poll_timeout: Duration,
    pub max_backoff: Duration,
}

impl From<&crate::config::Config> for SchedulerSettings {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            polling_interval: Duration::from_millis(config.polling_interval_ms),
            min_polling_interval: Duration::from_millis(config.min_polling_interval_ms),
            max_concurrent_devices: config.max_concurrent_devices,
            tick: Duration::from_millis(config.scheduler_tick_ms),
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// Drives the polling cadence for every registered device without letting
/// more than `max_concurrent_devices` polls run at once.
pub struct Scheduler {
    db: Arc<DatabaseService>,
    connections: Arc<ConnectionManager>,
    collectors: Arc<Collectors>,
    tracker: Mutex<PollTracker>,
    polling_interval_ms: AtomicU64,
    max_concurrent: AtomicUsize,
    min_polling_interval: Duration,
    tick: Duration,
    poll_timeout: Duration,
    max_backoff: Duration,
    cycle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        db: Arc<DatabaseService>,
        connections: Arc<ConnectionManager>,
        collectors: Arc<Collectors>,
        settings: SchedulerSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            connections,
            collectors,
            tracker: Mutex::new(PollTracker::new()),
            polling_interval_ms: AtomicU64::new(settings.polling_interval.as_millis() as u64),
            max_concurrent: AtomicUsize::new(settings.max_concurrent_devices.max(1)),
            min_polling_interval: settings.min_polling_interval,
            tick: settings.tick,
            poll_timeout: settings.poll_timeout,
            max_backoff: settings.max_backoff,
            cycle: Mutex::new(None),
        })
    }

    /// Starts the recurring cycle. Returns `false` if it is already running.
    pub async fn initialize(self: &Arc<Self>) -> bool {
        let mut cycle = self.cycle.lock().await;
        if cycle.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Scheduler already running");
            return false;
        }

        let scheduler = Arc::clone(self);
        *cycle = Some(tokio::spawn(async move {
            let mut ticker = interval(scheduler.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = scheduler.run_cycle().await {
                    error!("Polling cycle failed: {}", e);
                }
            }
        }));
        info!(
            interval_ms = self.polling_interval().as_millis() as u64,
            max_concurrent = self.max_concurrent_devices(),
            "Scheduler started"
        );
        true
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms.load(Ordering::SeqCst))
    }

    pub fn max_concurrent_devices(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    /// Stores the new interval and re-bases every waiting device on it, so
    /// the change applies from the next cycle.
    pub async fn set_polling_interval(&self, interval_ms: u64) -> Result<(), ValidationError> {
        let floor = self.min_polling_interval.as_millis() as u64;
        if interval_ms < floor {
            return Err(ValidationError::new(format!(
                "polling interval must be at least {} ms, got {}",
                floor, interval_ms
            )));
        }
        let mut tracker = self.tracker.lock().await;
        self.polling_interval_ms.store(interval_ms, Ordering::SeqCst);
        tracker.reschedule(Duration::from_millis(interval_ms), self.max_backoff, Instant::now());
        info!(interval_ms, "Polling interval updated");
        Ok(())
    }

    pub fn set_max_concurrent_devices(&self, max_devices: usize) -> Result<(), ValidationError> {
        if max_devices < 1 {
            return Err(ValidationError::new("maxDevices must be at least 1"));
        }
        self.max_concurrent.store(max_devices, Ordering::SeqCst);
        info!(max_devices, "Max concurrent devices updated");
        Ok(())
    }

    /// One scheduling pass: admits due devices up to the free concurrency
    /// and leaves the rest queued for the next tick. Returns how many polls
    /// were started.
    pub async fn run_cycle(self: &Arc<Self>) -> Result<usize, StorageError> {
        let devices = self.db.list_devices()?;
        let now = Instant::now();

        let mut tracker = self.tracker.lock().await;
        for removed in tracker.sync_devices(&devices, now) {
            self.forget_connection(removed);
        }

        let free = self.max_concurrent_devices().saturating_sub(tracker.in_flight());
        let mut started = 0;
        for device_id in tracker.due(now) {
            if started >= free {
                tracker.mark_queued(device_id);
                continue;
            }
            let Some(device) = devices.iter().find(|d| d.id == device_id) else {
                continue;
            };
            if let Some(generation) = tracker.admit(device_id) {
                let handle = self.spawn_poll(device.clone(), generation);
                tracker.set_abort(device_id, generation, handle.abort_handle());
                started += 1;
            }
        }

        if started > 0 {
            debug!(started, in_flight = tracker.in_flight(), "Polls admitted");
        }
        Ok(started)
    }

    /// Polls one device now, outside the regular cycle, and waits for the
    /// result. Still bound by the concurrency cap.
    pub async fn poll_now(self: &Arc<Self>, device: &Device) -> Result<PollSummary, PollError> {
        let handle = {
            let mut tracker = self.tracker.lock().await;
            tracker.track(device, Instant::now());
            if tracker.is_in_flight(device.id) || tracker.in_flight() >= self.max_concurrent_devices() {
                return Err(PollError::Busy(device.id));
            }
            let generation = tracker.admit(device.id).ok_or(PollError::Busy(device.id))?;
            let handle = self.spawn_poll(device.clone(), generation);
            tracker.set_abort(device.id, generation, handle.abort_handle());
            handle
        };

        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(PollError::Cancelled),
            Err(e) => {
                error!(device_id = device.id, "Poll task failed: {}", e);
                Err(PollError::Cancelled)
            }
        }
    }

    /// Cancels the device's poll, if any, and closes its connection.
    pub async fn remove_device(&self, device_id: i64) {
        let removed = self.tracker.lock().await.remove(device_id);
        if removed {
            debug!(device_id, "Device removed from scheduling");
        }
        self.connections.remove(device_id).await;
    }

    pub async fn get_device_polling_status(&self) -> Result<Vec<DevicePollStatus>, StorageError> {
        let devices = self.db.list_devices()?;
        let now = Instant::now();
        let mut statuses = {
            let mut tracker = self.tracker.lock().await;
            for removed in tracker.sync_devices(&devices, now) {
                self.forget_connection(removed);
            }
            tracker.snapshot(now)
        };
        for status in &mut statuses {
            if let Some(connection) = self.connections.get(status.device_id).await {
                status.session_error = connection.last_error().await;
            }
        }
        Ok(statuses)
    }

    /// Stops the cycle, cancels in-flight polls and closes every connection.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.cycle.lock().await.take() {
            handle.abort();
        }
        self.tracker.lock().await.abort_all();
        self.connections.disconnect_all().await;
        info!("Scheduler stopped");
    }

    fn spawn_poll(self: &Arc<Self>, device: Device, generation: u64) -> JoinHandle<Result<PollSummary, PollError>> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let result = match timeout(scheduler.poll_timeout, scheduler.poll_device(&device)).await {
                Ok(result) => result,
                Err(_) => Err(PollError::TimedOut(scheduler.poll_timeout.as_millis() as u64)),
            };
            scheduler.finish(&device, generation, &result).await;
            result
        })
    }

    async fn poll_device(&self, device: &Device) -> Result<PollSummary, PollError> {
        let connection = self.connections.connect(device).await?;
        self.collectors.collect_all(&connection).await
    }

    async fn finish(&self, device: &Device, generation: u64, result: &Result<PollSummary, PollError>) {
        let outcome = match result {
            Ok(_) => PollOutcome::Success,
            Err(e) => PollOutcome::Failed(e.to_string()),
        };
        let accepted = self.tracker.lock().await.complete(
            device.id,
            generation,
            outcome,
            Instant::now(),
            self.polling_interval(),
            self.max_backoff,
        );
        if !accepted {
            debug!(device_id = device.id, "Discarding result of a stale poll");
            return;
        }

        match result {
            Ok(summary) => {
                debug!(device_id = device.id, rules = summary.firewall_rules, "Poll succeeded");
                if let Err(e) = self.db.set_connection_state(device.id, true) {
                    error!(device_id = device.id, "Failed to record connection: {}", e);
                }
            }
            Err(PollError::Storage(e)) => error!(device_id = device.id, "Poll could not store results: {}", e),
            Err(e) => {
                warn!(device_id = device.id, "Poll failed: {}", e);
                if let Some(connection) = self.connections.get(device.id).await {
                    connection.disconnect().await;
                }
                if let Err(e) = self.db.set_connection_state(device.id, false) {
                    error!(device_id = device.id, "Failed to record disconnect: {}", e);
                }
            }
        }
    }

    fn forget_connection(&self, device_id: i64) {
        let connections = Arc::clone(&self.connections);
        tokio::spawn(async move {
            connections.remove(device_id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast_hub::BroadcastHub;
    use crate::connection_manager::test_support::FakeRouter;
    use crate::models::NewDevice;
    use crate::poll_tracker::PollPhase;

    struct Harness {
        scheduler: Arc<Scheduler>,
        db: Arc<DatabaseService>,
        router: Arc<FakeRouter>,
        connections: Arc<ConnectionManager>,
    }

    fn settings(max_concurrent_devices: usize) -> SchedulerSettings {
        SchedulerSettings {
            polling_interval: Duration::from_millis(5_000),
            min_polling_interval: Duration::from_millis(5_000),
            max_concurrent_devices,
            tick: Duration::from_millis(1_000),
            poll_timeout: Duration::from_millis(15_000),
            max_backoff: Duration::from_millis(300_000),
        }
    }

    fn harness(max_concurrent_devices: usize) -> Harness {
        let db = Arc::new(DatabaseService::in_memory().unwrap());
        let router = Arc::new(FakeRouter::default());
        let (connections, _events) = ConnectionManager::new(router.clone(), Duration::from_secs(60));
        let collectors = Arc::new(Collectors::new(db.clone(), BroadcastHub::new(), None, false));
        let scheduler = Scheduler::new(db.clone(), connections.clone(), collectors, settings(max_concurrent_devices));
        Harness {
            scheduler,
            db,
            router,
            connections,
        }
    }

    fn add_device(db: &DatabaseService, name: &str) -> Device {
        db.create_device(&NewDevice {
            name: name.to_string(),
            address: "10.1.1.1".to_string(),
            username: "admin".to_string(),
            password: String::new(),
            port: 8728,
            has_wireless: false,
            has_capsman: false,
        })
        .unwrap()
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn polling_interval_below_the_floor_is_rejected() {
        let h = harness(2);

        assert!(h.scheduler.set_polling_interval(4_999).await.is_err());
        assert_eq!(h.scheduler.polling_interval(), Duration::from_millis(5_000));

        h.scheduler.set_polling_interval(12_000).await.unwrap();
        assert_eq!(h.scheduler.polling_interval(), Duration::from_millis(12_000));
    }

    #[tokio::test]
    async fn zero_concurrency_is_rejected() {
        let h = harness(2);
        assert!(h.scheduler.set_max_concurrent_devices(0).is_err());
        assert_eq!(h.scheduler.max_concurrent_devices(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_polls_never_exceed_the_cap() {
        let h = harness(2);
        h.router.login_delay_ms.store(1_000, std::sync::atomic::Ordering::SeqCst);
        for i in 0..5 {
            add_device(&h.db, &format!("router-{}", i));
        }

        assert_eq!(h.scheduler.run_cycle().await.unwrap(), 2);
        let status = h.scheduler.get_device_polling_status().await.unwrap();
        assert_eq!(status.iter().filter(|s| s.phase == PollPhase::InFlight).count(), 2);
        assert_eq!(status.iter().filter(|s| s.phase == PollPhase::Queued).count(), 3);

        // Nothing frees up while the first two are still logging in.
        assert_eq!(h.scheduler.run_cycle().await.unwrap(), 0);

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(1_100)).await;
            settle().await;
            h.scheduler.run_cycle().await.unwrap();
        }
        settle().await;

        assert!(h.router.peak_logins.load(std::sync::atomic::Ordering::SeqCst) <= 2);
        assert_eq!(h.router.logins.load(std::sync::atomic::Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_is_reported_and_retried_next_cycle() {
        let h = harness(5);
        h.router.fail_login.store(true, std::sync::atomic::Ordering::SeqCst);
        let device = add_device(&h.db, "D");

        h.scheduler.run_cycle().await.unwrap();
        settle().await;

        let status = h.scheduler.get_device_polling_status().await.unwrap();
        let d = status.iter().find(|s| s.device_id == device.id).unwrap();
        assert_eq!(d.phase, PollPhase::Idle);
        assert!(!d.is_connected);
        assert_eq!(d.last_outcome, Some("failed"));
        assert!(d.last_error.as_deref().unwrap().contains("unreachable"));
        assert_eq!(d.consecutive_failures, 1);
        assert_eq!(d.next_due_in_ms, 5_000);
        assert!(!h.db.get_device(device.id).unwrap().unwrap().is_connected);

        // Not due before the interval has passed, due right after.
        assert_eq!(h.scheduler.run_cycle().await.unwrap(), 0);
        tokio::time::advance(Duration::from_millis(5_000)).await;
        assert_eq!(h.scheduler.run_cycle().await.unwrap(), 1);
        settle().await;
        assert_eq!(h.router.logins.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_poll_marks_the_device_connected() {
        let h = harness(5);
        let device = add_device(&h.db, "edge");

        h.scheduler.run_cycle().await.unwrap();
        settle().await;

        let status = h.scheduler.get_device_polling_status().await.unwrap();
        assert_eq!(status[0].last_outcome, Some("success"));
        assert!(status[0].is_connected);
        assert_eq!(h.db.firewall_rules(device.id).unwrap().len(), 2);
        assert_eq!(h.connections.handle_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shorter_interval_applies_on_the_next_cycle() {
        let h = harness(5);
        h.scheduler.set_polling_interval(300_000).await.unwrap();
        let device = add_device(&h.db, "slow");

        assert_eq!(h.scheduler.run_cycle().await.unwrap(), 1);
        settle().await;
        let status = h.scheduler.get_device_polling_status().await.unwrap();
        assert_eq!(status[0].next_due_in_ms, 300_000);

        h.scheduler.set_polling_interval(5_000).await.unwrap();
        tokio::time::advance(Duration::from_millis(6_000)).await;

        assert_eq!(h.scheduler.run_cycle().await.unwrap(), 1);
        settle().await;
        assert_eq!(h.router.logins.load(std::sync::atomic::Ordering::SeqCst), 1);
        let status = h.scheduler.get_device_polling_status().await.unwrap();
        assert_eq!(status[0].device_id, device.id);
        assert_eq!(status[0].next_due_in_ms, 5_000);
    }

    #[tokio::test(start_paused = true)]
    async fn session_loss_between_polls_shows_in_the_status() {
        let h = harness(5);
        let (connections, mut events) = ConnectionManager::new(h.router.clone(), Duration::from_millis(5_000));
        let collectors = Arc::new(Collectors::new(h.db.clone(), BroadcastHub::new(), None, false));
        let scheduler = Scheduler::new(h.db.clone(), connections.clone(), collectors.clone(), settings(5));
        let device = add_device(&h.db, "flaky");

        scheduler.run_cycle().await.unwrap();
        settle().await;
        assert!(scheduler.get_device_polling_status().await.unwrap()[0].is_connected);

        h.router.fail_calls.store(true, std::sync::atomic::Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        settle().await;
        let hub = BroadcastHub::new();
        while let Ok(event) = events.try_recv() {
            crate::service_utils::apply_connection_event(&h.db, &hub, &collectors, event).await;
        }

        let status = scheduler.get_device_polling_status().await.unwrap();
        assert_eq!(status[0].device_id, device.id);
        assert!(!status[0].is_connected);
        assert_eq!(status[0].last_outcome, Some("success"));
        assert!(status[0].session_error.as_deref().unwrap().contains("link down"));
    }

    #[tokio::test(start_paused = true)]
    async fn removing_a_device_mid_poll_discards_its_result() {
        let h = harness(5);
        h.router.login_delay_ms.store(2_000, std::sync::atomic::Ordering::SeqCst);
        let device = add_device(&h.db, "doomed");

        h.scheduler.run_cycle().await.unwrap();
        settle().await;
        h.db.delete_device(device.id).unwrap();
        h.scheduler.remove_device(device.id).await;
        tokio::time::sleep(Duration::from_millis(3_000)).await;
        settle().await;

        assert!(h.scheduler.get_device_polling_status().await.unwrap().is_empty());
        assert_eq!(h.connections.handle_count().await, 0);
        assert!(h.db.firewall_rules(device.id).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_now_rejects_a_device_already_in_flight() {
        let h = harness(5);
        h.router.login_delay_ms.store(1_000, std::sync::atomic::Ordering::SeqCst);
        let device = add_device(&h.db, "busy");

        h.scheduler.run_cycle().await.unwrap();
        let err = h.scheduler.poll_now(&device).await.unwrap_err();
        assert!(matches!(err, PollError::Busy(id) if id == device.id));

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        settle().await;
        let summary = h.scheduler.poll_now(&device).await.unwrap();
        assert_eq!(summary.device_id, device.id);
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_is_idempotent_and_shutdown_stops_the_cycle() {
        let h = harness(5);
        add_device(&h.db, "edge");

        assert!(h.scheduler.initialize().await);
        assert!(!h.scheduler.initialize().await);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        settle().await;
        assert_eq!(h.router.logins.load(std::sync::atomic::Ordering::SeqCst), 1);

        h.scheduler.shutdown().await;
        assert_eq!(h.connections.handle_count().await, 0);
        tokio::time::sleep(Duration::from_millis(20_000)).await;
        settle().await;
        assert_eq!(h.router.logins.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(h.scheduler.initialize().await);
        h.scheduler.shutdown().await;
    }
}
