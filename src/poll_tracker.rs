use crate::models::Device;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::task::AbortHandle;
use tokio::time::{Duration, Instant};
use tokio_retry::strategy::ExponentialBackoff;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PollPhase {
    Idle,
    Queued,
    InFlight,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Success,
    Failed(String),
}

/// Polling status of one device, as reported to operators.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DevicePollStatus {
    pub device_id: i64,
    pub name: String,
    pub phase: PollPhase,
    pub is_connected: bool,
    pub last_polled: Option<String>,
    pub last_outcome: Option<&'static str>,
    pub last_error: Option<String>,
    /// Most recent error reported by the device session, including failures
    /// between polls.
    pub session_error: Option<String>,
    pub consecutive_failures: u32,
    pub next_due: Option<String>,
    pub next_due_in_ms: u64,
}

struct DeviceSlot {
    name: String,
    phase: PollPhase,
    // Bumped on every admission; a completion carrying an older value is stale.
    generation: u64,
    abort: Option<AbortHandle>,
    is_connected: bool,
    last_polled: Option<String>,
    last_outcome: Option<PollOutcome>,
    last_completed: Option<Instant>,
    consecutive_failures: u32,
    next_due: Instant,
}

impl DeviceSlot {
    fn delay_after_completion(&self, interval: Duration, max_backoff: Duration) -> Duration {
        if self.consecutive_failures == 0 {
            interval
        } else {
            backoff_delay(interval, self.consecutive_failures, max_backoff)
        }
    }
}

/// Delay before the next poll after `failures` consecutive failures:
/// `interval · 2^(failures-1)`, capped at `cap`, never below `interval`.
pub fn backoff_delay(interval: Duration, failures: u32, cap: Duration) -> Duration {
    if failures <= 1 {
        return interval;
    }
    let base = interval.as_millis().max(1) as u64;
    let delay = ExponentialBackoff::from_millis(2)
        .factor(base)
        .max_delay(cap)
        .nth((failures - 2) as usize)
        .unwrap_or(cap);
    delay.max(interval)
}

/// Bookkeeping for the scheduler: which device is idle, queued or in flight,
/// when each is next due, and how its last poll went.
#[derive(Default)]
pub struct PollTracker {
    slots: HashMap<i64, DeviceSlot>,
    // Shared across devices so a re-registered id never reuses a generation.
    generations: u64,
}

impl PollTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aligns the tracked set with the registry. New devices are due at `now`.
    /// Returns the ids that disappeared; their in-flight polls are aborted.
    pub fn sync_devices(&mut self, devices: &[Device], now: Instant) -> Vec<i64> {
        for device in devices {
            self.track(device, now);
        }

        let removed: Vec<i64> = self
            .slots
            .keys()
            .copied()
            .filter(|id| !devices.iter().any(|d| d.id == *id))
            .collect();
        for id in &removed {
            self.remove(*id);
        }
        removed
    }

    /// Starts tracking a single device, or refreshes its display name and
    /// connection flag from the registry.
    pub fn track(&mut self, device: &Device, now: Instant) {
        self.slots
            .entry(device.id)
            .and_modify(|slot| {
                slot.name = device.name.clone();
                slot.is_connected = device.is_connected;
            })
            .or_insert_with(|| DeviceSlot {
                name: device.name.clone(),
                phase: PollPhase::Idle,
                generation: 0,
                abort: None,
                is_connected: device.is_connected,
                last_polled: None,
                last_outcome: None,
                last_completed: None,
                consecutive_failures: 0,
                next_due: now,
            });
    }

    /// Devices that are due and not in flight, earliest first.
    pub fn due(&self, now: Instant) -> Vec<i64> {
        let mut due: Vec<(Instant, i64)> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.phase != PollPhase::InFlight && slot.next_due <= now)
            .map(|(id, slot)| (slot.next_due, *id))
            .collect();
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    pub fn in_flight(&self) -> usize {
        self.slots.values().filter(|slot| slot.phase == PollPhase::InFlight).count()
    }

    pub fn is_in_flight(&self, device_id: i64) -> bool {
        self.slots
            .get(&device_id)
            .is_some_and(|slot| slot.phase == PollPhase::InFlight)
    }

    /// Marks the device in flight and returns the generation its completion
    /// must present. `None` if the device is unknown or already in flight.
    pub fn admit(&mut self, device_id: i64) -> Option<u64> {
        let slot = self.slots.get_mut(&device_id)?;
        if slot.phase == PollPhase::InFlight {
            return None;
        }
        self.generations += 1;
        slot.phase = PollPhase::InFlight;
        slot.generation = self.generations;
        slot.abort = None;
        Some(slot.generation)
    }

    pub fn mark_queued(&mut self, device_id: i64) {
        if let Some(slot) = self.slots.get_mut(&device_id) {
            if slot.phase == PollPhase::Idle {
                slot.phase = PollPhase::Queued;
            }
        }
    }

    pub fn set_abort(&mut self, device_id: i64, generation: u64, handle: AbortHandle) {
        match self.slots.get_mut(&device_id) {
            Some(slot) if slot.generation == generation && slot.phase == PollPhase::InFlight => {
                slot.abort = Some(handle);
            }
            _ => handle.abort(),
        }
    }

    /// Records a finished poll and schedules the next one. Returns `false`
    /// when the result is stale (device removed or re-admitted) and was dropped.
    pub fn complete(
        &mut self,
        device_id: i64,
        generation: u64,
        outcome: PollOutcome,
        now: Instant,
        interval: Duration,
        max_backoff: Duration,
    ) -> bool {
        let Some(slot) = self.slots.get_mut(&device_id) else {
            return false;
        };
        if slot.generation != generation || slot.phase != PollPhase::InFlight {
            return false;
        }

        slot.phase = PollPhase::Idle;
        slot.abort = None;
        slot.last_polled = Some(crate::models::now_timestamp());
        slot.last_completed = Some(now);
        match &outcome {
            PollOutcome::Success => {
                slot.consecutive_failures = 0;
                slot.is_connected = true;
            }
            PollOutcome::Failed(_) => {
                slot.consecutive_failures += 1;
                slot.is_connected = false;
            }
        }
        slot.next_due = now + slot.delay_after_completion(interval, max_backoff);
        slot.last_outcome = Some(outcome);
        true
    }

    /// Recomputes the next due time of every device that is not in flight
    /// from its last completion and the new interval. A device whose new due
    /// time has already passed becomes due at `now`.
    pub fn reschedule(&mut self, interval: Duration, max_backoff: Duration, now: Instant) {
        for slot in self.slots.values_mut() {
            if slot.phase == PollPhase::InFlight {
                continue;
            }
            if let Some(completed) = slot.last_completed {
                slot.next_due = (completed + slot.delay_after_completion(interval, max_backoff)).max(now);
            }
        }
    }

    /// Forgets the device, cancelling its poll if one is running.
    pub fn remove(&mut self, device_id: i64) -> bool {
        match self.slots.remove(&device_id) {
            Some(slot) => {
                if let Some(handle) = slot.abort {
                    handle.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Cancels every in-flight poll.
    pub fn abort_all(&mut self) {
        for slot in self.slots.values_mut() {
            if let Some(handle) = slot.abort.take() {
                handle.abort();
            }
            slot.phase = PollPhase::Idle;
        }
    }

    pub fn snapshot(&self, now: Instant) -> Vec<DevicePollStatus> {
        let wall_now = OffsetDateTime::now_utc();
        let mut statuses: Vec<DevicePollStatus> = self
            .slots
            .iter()
            .map(|(id, slot)| {
                let remaining = slot.next_due.saturating_duration_since(now);
                let (last_outcome, last_error) = match &slot.last_outcome {
                    Some(PollOutcome::Success) => (Some("success"), None),
                    Some(PollOutcome::Failed(error)) => (Some("failed"), Some(error.clone())),
                    None => (None, None),
                };
                DevicePollStatus {
                    device_id: *id,
                    name: slot.name.clone(),
                    phase: slot.phase,
                    is_connected: slot.is_connected,
                    last_polled: slot.last_polled.clone(),
                    last_outcome,
                    last_error,
                    session_error: None,
                    consecutive_failures: slot.consecutive_failures,
                    next_due: (wall_now + remaining).format(&Rfc3339).ok(),
                    next_due_in_ms: remaining.as_millis() as u64,
                }
            })
            .collect();
        statuses.sort_by_key(|status| status.device_id);
        statuses
    }
}

impl fmt::Debug for PollTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollTracker")
            .field("devices", &self.slots.len())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::test_support::device;

    const INTERVAL: Duration = Duration::from_secs(5);
    const CAP: Duration = Duration::from_secs(60);

    #[test]
    fn backoff_doubles_from_the_second_failure_and_caps() {
        assert_eq!(backoff_delay(INTERVAL, 0, CAP), INTERVAL);
        assert_eq!(backoff_delay(INTERVAL, 1, CAP), INTERVAL);
        assert_eq!(backoff_delay(INTERVAL, 2, CAP), Duration::from_secs(10));
        assert_eq!(backoff_delay(INTERVAL, 3, CAP), Duration::from_secs(20));
        assert_eq!(backoff_delay(INTERVAL, 5, CAP), CAP);
        assert_eq!(backoff_delay(INTERVAL, 40, CAP), CAP);
    }

    #[test]
    fn backoff_never_drops_below_the_interval() {
        assert_eq!(backoff_delay(INTERVAL, 4, Duration::from_secs(1)), INTERVAL);
    }

    #[tokio::test]
    async fn new_devices_are_due_immediately_in_order() {
        let now = Instant::now();
        let mut tracker = PollTracker::new();
        tracker.sync_devices(&[device(2), device(1)], now);

        let due = tracker.due(now);
        assert_eq!(due.len(), 2);
        assert!(due.contains(&1) && due.contains(&2));
    }

    #[tokio::test]
    async fn in_flight_devices_are_not_due_and_cannot_be_readmitted() {
        let now = Instant::now();
        let mut tracker = PollTracker::new();
        tracker.sync_devices(&[device(1)], now);

        assert_eq!(tracker.admit(1), Some(1));
        assert_eq!(tracker.admit(1), None);
        assert!(tracker.due(now).is_empty());
        assert_eq!(tracker.in_flight(), 1);
    }

    #[tokio::test]
    async fn failure_records_error_and_keeps_the_normal_cycle() {
        let now = Instant::now();
        let mut tracker = PollTracker::new();
        tracker.sync_devices(&[device(1)], now);
        let generation = tracker.admit(1).unwrap();

        assert!(tracker.complete(1, generation, PollOutcome::Failed("no route".into()), now, INTERVAL, CAP));

        let status = &tracker.snapshot(now)[0];
        assert_eq!(status.phase, PollPhase::Idle);
        assert!(!status.is_connected);
        assert_eq!(status.last_outcome, Some("failed"));
        assert_eq!(status.last_error.as_deref(), Some("no route"));
        assert_eq!(status.consecutive_failures, 1);
        assert_eq!(status.next_due_in_ms, 5_000);
        assert_eq!(tracker.due(now + INTERVAL), vec![1]);
    }

    #[tokio::test]
    async fn success_resets_failures() {
        let now = Instant::now();
        let mut tracker = PollTracker::new();
        tracker.sync_devices(&[device(1)], now);
        for _ in 0..3 {
            let generation = tracker.admit(1).unwrap();
            tracker.complete(1, generation, PollOutcome::Failed("down".into()), now, INTERVAL, CAP);
        }
        assert_eq!(tracker.snapshot(now)[0].next_due_in_ms, 20_000);

        let generation = tracker.admit(1).unwrap();
        tracker.complete(1, generation, PollOutcome::Success, now, INTERVAL, CAP);

        let status = &tracker.snapshot(now)[0];
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.is_connected);
        assert_eq!(status.last_error, None);
    }

    #[tokio::test]
    async fn stale_completions_are_discarded() {
        let now = Instant::now();
        let mut tracker = PollTracker::new();
        tracker.sync_devices(&[device(1)], now);
        let generation = tracker.admit(1).unwrap();

        assert!(tracker.remove(1));
        assert!(!tracker.complete(1, generation, PollOutcome::Success, now, INTERVAL, CAP));

        tracker.sync_devices(&[device(1)], now);
        let fresh = tracker.admit(1).unwrap();
        assert_ne!(fresh, generation);
        assert!(!tracker.complete(1, generation, PollOutcome::Success, now, INTERVAL, CAP));
        assert!(tracker.complete(1, fresh, PollOutcome::Success, now, INTERVAL, CAP));
    }

    #[tokio::test]
    async fn shorter_interval_rebases_idle_devices() {
        let now = Instant::now();
        let mut tracker = PollTracker::new();
        tracker.sync_devices(&[device(1), device(2)], now);
        let long = Duration::from_secs(300);
        let first = tracker.admit(1).unwrap();
        tracker.complete(1, first, PollOutcome::Success, now, long, CAP);
        let second = tracker.admit(2).unwrap();
        tracker.complete(2, second, PollOutcome::Failed("down".into()), now, long, CAP);
        assert!(tracker.due(now + Duration::from_secs(6)).is_empty());

        tracker.reschedule(INTERVAL, CAP, now + Duration::from_secs(1));

        let status = tracker.snapshot(now + Duration::from_secs(1));
        assert_eq!(status[0].next_due_in_ms, 4_000);
        assert_eq!(status[1].next_due_in_ms, 4_000);
        assert_eq!(tracker.due(now + Duration::from_secs(6)), vec![1, 2]);
    }

    #[tokio::test]
    async fn overdue_devices_become_due_now_and_in_flight_ones_are_left_alone() {
        let now = Instant::now();
        let mut tracker = PollTracker::new();
        tracker.sync_devices(&[device(1), device(2)], now);
        let long = Duration::from_secs(300);
        let first = tracker.admit(1).unwrap();
        tracker.complete(1, first, PollOutcome::Success, now, long, CAP);
        tracker.admit(2).unwrap();

        let later = now + Duration::from_secs(60);
        tracker.reschedule(INTERVAL, CAP, later);

        assert_eq!(tracker.due(later), vec![1]);
        assert_eq!(tracker.snapshot(later)[0].next_due_in_ms, 0);
        assert!(tracker.is_in_flight(2));
    }

    #[tokio::test]
    async fn registry_connection_flag_refreshes_tracked_devices() {
        let now = Instant::now();
        let mut tracker = PollTracker::new();
        tracker.sync_devices(&[device(1)], now);
        let generation = tracker.admit(1).unwrap();
        tracker.complete(1, generation, PollOutcome::Success, now, INTERVAL, CAP);
        assert!(tracker.snapshot(now)[0].is_connected);

        tracker.sync_devices(&[device(1)], now);

        let status = &tracker.snapshot(now)[0];
        assert!(!status.is_connected);
        assert_eq!(status.last_outcome, Some("success"));
    }

    #[tokio::test]
    async fn devices_missing_from_the_registry_are_dropped() {
        let now = Instant::now();
        let mut tracker = PollTracker::new();
        tracker.sync_devices(&[device(1), device(2)], now);

        let removed = tracker.sync_devices(&[device(2)], now);

        assert_eq!(removed, vec![1]);
        assert_eq!(tracker.snapshot(now).len(), 1);
    }
}
