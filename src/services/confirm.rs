//! Dispense confirmation against the infra-red drop sensors
//!
//! The slot coordinator arms a per-slot window before pulsing; this
//! monitor polls the chute sensors and resolves each window to exactly
//! one of Confirmed or TimedOut (or drops it silently on cancel).
//! Sensor reads are debounced by majority vote over several rapid
//! samples; a window is confirmed on a transition to "obstructed"
//! under the configured detection policy:
//! - any:   one obstructed sensor confirms
//! - all:   every sensor must be obstructed simultaneously
//! - first: same trigger as any, kept for config compatibility

use crate::domain::types::DispenseStatus;
use crate::infra::config::{ConfirmConfig, DetectionMode};
use crate::infra::metrics::Metrics;
use crate::io::serial_mux::SharedSerialLink;
use crate::io::ui_channel::UiSender;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Simulate mode confirms this long after arming, sensors ignored
const SIMULATE_CONFIRM_DELAY: Duration = Duration::from_millis(2000);

/// Fired on confirmation: slot, item, elapsed ms
pub type ConfirmCallback = Arc<dyn Fn(u8, &str, u64) + Send + Sync>;
/// Fired on timeout: slot, item
pub type TimeoutCallback = Arc<dyn Fn(u8, &str) + Send + Sync>;

#[derive(Debug)]
struct PendingDispense {
    item: String,
    started: Instant,
    timeout: Duration,
}

/// Tracks per-slot dispense windows against the infra-red sensors
pub struct DispenseConfirmationMonitor {
    link: Arc<SharedSerialLink>,
    config: ConfirmConfig,
    pending: parking_lot::Mutex<FxHashMap<u8, PendingDispense>>,
    /// Previous poll's policy decision, for obstruction-transition detection
    last_obstructed: parking_lot::Mutex<bool>,
    on_confirmed: parking_lot::Mutex<Option<ConfirmCallback>>,
    on_timeout: parking_lot::Mutex<Option<TimeoutCallback>>,
    ui: Option<UiSender>,
    metrics: Arc<Metrics>,
}

impl DispenseConfirmationMonitor {
    pub fn new(
        link: Arc<SharedSerialLink>,
        config: ConfirmConfig,
        metrics: Arc<Metrics>,
        ui: Option<UiSender>,
    ) -> Arc<Self> {
        if config.simulate {
            warn!("confirm_monitor_simulate_mode");
        }
        Arc::new(Self {
            link,
            config,
            pending: parking_lot::Mutex::new(FxHashMap::default()),
            last_obstructed: parking_lot::Mutex::new(false),
            on_confirmed: parking_lot::Mutex::new(None),
            on_timeout: parking_lot::Mutex::new(None),
            ui,
            metrics,
        })
    }

    pub fn set_callbacks(&self, on_confirmed: ConfirmCallback, on_timeout: TimeoutCallback) {
        *self.on_confirmed.lock() = Some(on_confirmed);
        *self.on_timeout.lock() = Some(on_timeout);
    }

    /// Arm a confirmation window for a slot. At most one window per
    /// slot: re-arming replaces the previous one.
    pub fn start(&self, slot: u8, timeout_secs: u64, item: &str) {
        let entry = PendingDispense {
            item: item.to_string(),
            started: Instant::now(),
            timeout: Duration::from_secs(timeout_secs),
        };

        let mut pending = self.pending.lock();
        if pending.insert(slot, entry).is_some() {
            warn!(slot = %slot, "confirm_window_replaced");
        }
        self.metrics.set_pending_dispenses(pending.len() as u64);
        debug!(slot = %slot, item = %item, timeout_secs = %timeout_secs, "confirm_window_armed");
    }

    /// Drop a window silently
    pub fn cancel(&self, slot: u8) {
        let mut pending = self.pending.lock();
        if pending.remove(&slot).is_some() {
            debug!(slot = %slot, "confirm_window_cancelled");
        }
        self.metrics.set_pending_dispenses(pending.len() as u64);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Poll loop; owns the fixed cadence
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            mode = %self.config.mode.as_str(),
            sensors = ?self.config.sensors,
            poll_ms = %self.config.poll_interval_ms,
            simulate = %self.config.simulate,
            "confirm_monitor_started"
        );

        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("confirm_monitor_shutdown");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }
    }

    async fn poll_once(&self) {
        if self.config.simulate {
            self.poll_simulated();
        } else {
            let readings = self.sample_sensors().await;
            self.apply_readings(&readings);
        }
        self.sweep_timeouts();

        let count = self.pending.lock().len() as u64;
        self.metrics.set_pending_dispenses(count);
    }

    /// Simulate mode: confirm anything armed long enough
    fn poll_simulated(&self) {
        let due: Vec<u8> = {
            let pending = self.pending.lock();
            pending
                .iter()
                .filter(|(_, entry)| entry.started.elapsed() >= SIMULATE_CONFIRM_DELAY)
                .map(|(slot, _)| *slot)
                .collect()
        };
        for slot in due {
            self.confirm_slot(slot);
        }
    }

    /// Majority-vote sample every configured sensor
    async fn sample_sensors(&self) -> Vec<(u8, bool)> {
        let mut readings = Vec::with_capacity(self.config.sensors.len());
        for &index in &self.config.sensors {
            let blocked = self.sample_sensor(index).await;
            if let Some(ui) = &self.ui {
                ui.send_sensor(index, blocked);
            }
            readings.push((index, blocked));
        }
        readings
    }

    /// Several rapid samples; ties resolve to clear. A sensor that has
    /// never reported counts as clear.
    async fn sample_sensor(&self, index: u8) -> bool {
        let samples = self.config.samples.max(1);
        let mut blocked_votes = 0u32;

        for i in 0..samples {
            if self.link.infrared(index).unwrap_or(false) {
                blocked_votes += 1;
            }
            if i + 1 < samples {
                tokio::time::sleep(Duration::from_millis(self.config.sample_gap_ms)).await;
            }
        }

        blocked_votes * 2 > samples
    }

    /// Apply the detection policy and resolve on transition to obstructed
    fn apply_readings(&self, readings: &[(u8, bool)]) {
        let obstructed = match self.config.mode {
            DetectionMode::Any | DetectionMode::First => {
                readings.iter().any(|(_, blocked)| *blocked)
            }
            DetectionMode::All => {
                !readings.is_empty() && readings.iter().all(|(_, blocked)| *blocked)
            }
        };

        let was_obstructed = {
            let mut last = self.last_obstructed.lock();
            std::mem::replace(&mut *last, obstructed)
        };

        if obstructed && !was_obstructed {
            // One transition, one delivery: the oldest window wins
            let oldest = {
                let pending = self.pending.lock();
                pending
                    .iter()
                    .min_by_key(|(_, entry)| entry.started)
                    .map(|(slot, _)| *slot)
            };
            if let Some(slot) = oldest {
                self.confirm_slot(slot);
            } else {
                debug!("confirm_obstruction_without_window");
            }
        }
    }

    fn confirm_slot(&self, slot: u8) {
        let Some(entry) = self.pending.lock().remove(&slot) else { return };
        let elapsed_ms = entry.started.elapsed().as_millis() as u64;

        info!(slot = %slot, item = %entry.item, elapsed_ms = %elapsed_ms, "dispense_confirmed");
        self.metrics.record_dispense_confirmed();
        if let Some(ui) = &self.ui {
            ui.send_dispense(slot, &entry.item, DispenseStatus::Confirmed.as_str(), Some(elapsed_ms));
        }

        let callback = self.on_confirmed.lock().clone();
        if let Some(callback) = callback {
            callback(slot, &entry.item, elapsed_ms);
        }
    }

    /// Fire exactly one TimedOut per expired window
    fn sweep_timeouts(&self) {
        let expired: Vec<(u8, PendingDispense)> = {
            let mut pending = self.pending.lock();
            let slots: Vec<u8> = pending
                .iter()
                .filter(|(_, entry)| entry.started.elapsed() > entry.timeout)
                .map(|(slot, _)| *slot)
                .collect();
            slots
                .into_iter()
                .filter_map(|slot| pending.remove(&slot).map(|entry| (slot, entry)))
                .collect()
        };

        for (slot, entry) in expired {
            warn!(slot = %slot, item = %entry.item, "dispense_timed_out");
            self.metrics.record_dispense_timeout(slot);
            if let Some(ui) = &self.ui {
                ui.send_dispense(slot, &entry.item, DispenseStatus::TimedOut.as_str(), None);
            }

            let callback = self.on_timeout.lock().clone();
            if let Some(callback) = callback {
                callback(slot, &entry.item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(mode: DetectionMode) -> ConfirmConfig {
        ConfirmConfig {
            sensors: vec![1, 2],
            mode,
            poll_interval_ms: 10,
            default_timeout_secs: 5,
            samples: 1,
            sample_gap_ms: 0,
            simulate: false,
        }
    }

    struct Harness {
        link: Arc<SharedSerialLink>,
        monitor: Arc<DispenseConfirmationMonitor>,
        confirmed: Arc<parking_lot::Mutex<Vec<(u8, String)>>>,
        timed_out: Arc<parking_lot::Mutex<Vec<(u8, String)>>>,
    }

    fn harness(config: ConfirmConfig) -> Harness {
        let link = SharedSerialLink::disconnected("/dev/test-ir", 115200);
        let monitor = DispenseConfirmationMonitor::new(
            link.clone(),
            config,
            Arc::new(Metrics::new()),
            None,
        );

        let confirmed = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let timed_out = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let confirm_log = confirmed.clone();
        let timeout_log = timed_out.clone();
        monitor.set_callbacks(
            Arc::new(move |slot: u8, item: &str, _elapsed: u64| {
                confirm_log.lock().push((slot, item.to_string()));
            }),
            Arc::new(move |slot: u8, item: &str| {
                timeout_log.lock().push((slot, item.to_string()));
            }),
        );

        Harness { link, monitor, confirmed, timed_out }
    }

    fn backdate(monitor: &DispenseConfirmationMonitor, slot: u8, by: Duration) {
        let mut pending = monitor.pending.lock();
        let entry = pending.get_mut(&slot).unwrap();
        entry.started -= by;
    }

    #[tokio::test]
    async fn test_any_mode_confirms_on_single_sensor() {
        let h = harness(fast_config(DetectionMode::Any));
        h.monitor.start(7, 5, "Cola");

        h.link.dispatch_line("IR2: BLOCKED");
        h.monitor.poll_once().await;

        assert_eq!(h.confirmed.lock().as_slice(), &[(7, "Cola".to_string())]);
        assert_eq!(h.monitor.pending_count(), 0);
        assert!(h.timed_out.lock().is_empty());
    }

    #[tokio::test]
    async fn test_all_mode_requires_every_sensor() {
        let h = harness(fast_config(DetectionMode::All));
        h.monitor.start(7, 5, "Cola");

        h.link.dispatch_line("IR1: BLOCKED");
        h.monitor.poll_once().await;
        assert!(h.confirmed.lock().is_empty());
        assert_eq!(h.monitor.pending_count(), 1);

        h.link.dispatch_line("IR2: BLOCKED");
        h.monitor.poll_once().await;
        assert_eq!(h.confirmed.lock().as_slice(), &[(7, "Cola".to_string())]);
    }

    #[tokio::test]
    async fn test_first_mode_matches_any_trigger() {
        let h = harness(fast_config(DetectionMode::First));
        h.monitor.start(3, 5, "Chips");

        h.link.dispatch_line("IR1: BLOCKED");
        h.monitor.poll_once().await;

        assert_eq!(h.confirmed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_persistent_obstruction_confirms_once() {
        let h = harness(fast_config(DetectionMode::Any));
        h.monitor.start(1, 5, "Cola");
        h.monitor.start(2, 5, "Water");

        h.link.dispatch_line("IR1: BLOCKED");
        h.monitor.poll_once().await;
        // Still blocked on the next poll: no transition, no second confirm
        h.monitor.poll_once().await;

        assert_eq!(h.confirmed.lock().len(), 1);
        assert_eq!(h.monitor.pending_count(), 1);

        // Clear then block again: second window resolves
        h.link.dispatch_line("IR1: CLEAR");
        h.monitor.poll_once().await;
        h.link.dispatch_line("IR1: BLOCKED");
        h.monitor.poll_once().await;
        assert_eq!(h.confirmed.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_oldest_window_confirmed_first() {
        let h = harness(fast_config(DetectionMode::Any));
        h.monitor.start(5, 5, "Water");
        h.monitor.start(9, 5, "Cola");
        backdate(&h.monitor, 9, Duration::from_secs(1));

        h.link.dispatch_line("IR1: BLOCKED");
        h.monitor.poll_once().await;

        assert_eq!(h.confirmed.lock().as_slice(), &[(9, "Cola".to_string())]);
    }

    #[tokio::test]
    async fn test_timeout_fires_exactly_once() {
        let h = harness(fast_config(DetectionMode::Any));
        h.monitor.start(4, 1, "Cola");
        backdate(&h.monitor, 4, Duration::from_secs(2));

        h.monitor.poll_once().await;
        h.monitor.poll_once().await;

        assert_eq!(h.timed_out.lock().as_slice(), &[(4, "Cola".to_string())]);
        assert!(h.confirmed.lock().is_empty());
        assert_eq!(h.monitor.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_drops_silently() {
        let h = harness(fast_config(DetectionMode::Any));
        h.monitor.start(4, 5, "Cola");
        h.monitor.cancel(4);

        h.link.dispatch_line("IR1: BLOCKED");
        h.monitor.poll_once().await;

        assert!(h.confirmed.lock().is_empty());
        assert!(h.timed_out.lock().is_empty());
    }

    #[tokio::test]
    async fn test_rearm_replaces_window() {
        let h = harness(fast_config(DetectionMode::Any));
        h.monitor.start(4, 5, "Cola");
        h.monitor.start(4, 5, "Water");
        assert_eq!(h.monitor.pending_count(), 1);

        h.link.dispatch_line("IR1: BLOCKED");
        h.monitor.poll_once().await;
        assert_eq!(h.confirmed.lock().as_slice(), &[(4, "Water".to_string())]);
    }

    #[tokio::test]
    async fn test_simulate_confirms_after_delay_without_sensors() {
        let mut config = fast_config(DetectionMode::Any);
        config.simulate = true;
        let h = harness(config);

        h.monitor.start(6, 10, "Cola");
        h.monitor.poll_once().await;
        assert!(h.confirmed.lock().is_empty());

        backdate(&h.monitor, 6, SIMULATE_CONFIRM_DELAY);
        h.monitor.poll_once().await;
        assert_eq!(h.confirmed.lock().len(), 1);
    }
}
