//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally—these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
pub const METRICS_BUCKET_BOUNDS: [u64; 10] =
    [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const BUCKET_BOUNDS: [u64; 10] = METRICS_BUCKET_BOUNDS;
pub const METRICS_NUM_BUCKETS: usize = 11;
const NUM_BUCKETS: usize = METRICS_NUM_BUCKETS;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics; the per-slot
/// timeout table is the one mutex-guarded map (cold path, timeout only).
/// The `report()` method atomically swaps counters to get a consistent
/// snapshot.
pub struct Metrics {
    /// Total coins accepted (monotonic)
    coins_accepted: AtomicU64,
    /// Sum of accepted coin values in pesos (monotonic)
    coin_value_sum: AtomicU64,
    /// Pulses rejected as noise or duplicates (monotonic)
    pulses_rejected: AtomicU64,
    /// Total bills accepted (monotonic)
    bills_accepted: AtomicU64,
    /// Sum of accepted bill values in pesos (monotonic)
    bill_value_sum: AtomicU64,
    /// Payment sessions started (monotonic)
    sessions_started: AtomicU64,
    /// Payment sessions completed (monotonic)
    sessions_completed: AtomicU64,
    /// Payment sessions cancelled (monotonic)
    sessions_cancelled: AtomicU64,
    /// Change pesos requested from the hopper (monotonic)
    change_requested: AtomicU64,
    /// Change pesos actually delivered (monotonic)
    change_dispensed: AtomicU64,
    /// Device commands sent over any link (monotonic)
    device_commands_sent: AtomicU64,
    /// Device commands since last report (reset on report)
    device_commands_since_report: AtomicU64,
    /// Device command latency histogram buckets (reset on report)
    device_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Sum of device command latencies in µs (reset on report)
    device_latency_sum_us: AtomicU64,
    /// Max device command latency in µs (reset on report)
    device_latency_max_us: AtomicU64,
    /// Device command retry attempts (monotonic)
    device_retries: AtomicU64,
    /// Device commands that exhausted retries on timeout (monotonic)
    device_timeouts: AtomicU64,
    /// Transport open/connect failures (monotonic)
    link_errors: AtomicU64,
    /// Slot pulse commands issued (monotonic)
    slot_pulses: AtomicU64,
    /// Dispenses confirmed by the infra-red sensors (monotonic)
    dispenses_confirmed: AtomicU64,
    /// Dispense confirmation timeouts (monotonic)
    dispense_timeouts: AtomicU64,
    /// GET_BALANCE polls issued (monotonic)
    balance_polls: AtomicU64,
    /// UI messages dropped due to channel full (monotonic)
    ui_messages_dropped: AtomicU64,
    /// Current pending-dispense table size (updated by monitor)
    pending_dispenses: AtomicU64,
    /// Per-slot confirmation timeouts, to pinpoint a jammed mechanism
    timeouts_by_slot: parking_lot::Mutex<FxHashMap<u8, u64>>,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            coins_accepted: AtomicU64::new(0),
            coin_value_sum: AtomicU64::new(0),
            pulses_rejected: AtomicU64::new(0),
            bills_accepted: AtomicU64::new(0),
            bill_value_sum: AtomicU64::new(0),
            sessions_started: AtomicU64::new(0),
            sessions_completed: AtomicU64::new(0),
            sessions_cancelled: AtomicU64::new(0),
            change_requested: AtomicU64::new(0),
            change_dispensed: AtomicU64::new(0),
            device_commands_sent: AtomicU64::new(0),
            device_commands_since_report: AtomicU64::new(0),
            device_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            device_latency_sum_us: AtomicU64::new(0),
            device_latency_max_us: AtomicU64::new(0),
            device_retries: AtomicU64::new(0),
            device_timeouts: AtomicU64::new(0),
            link_errors: AtomicU64::new(0),
            slot_pulses: AtomicU64::new(0),
            dispenses_confirmed: AtomicU64::new(0),
            dispense_timeouts: AtomicU64::new(0),
            balance_polls: AtomicU64::new(0),
            ui_messages_dropped: AtomicU64::new(0),
            pending_dispenses: AtomicU64::new(0),
            timeouts_by_slot: parking_lot::Mutex::new(FxHashMap::default()),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record an accepted coin (lock-free)
    #[inline]
    pub fn record_coin(&self, value: u32) {
        self.coins_accepted.fetch_add(1, Ordering::Relaxed);
        self.coin_value_sum.fetch_add(value as u64, Ordering::Relaxed);
    }

    /// Record a rejected pulse: sub-threshold width or debounced duplicate
    #[inline]
    pub fn record_pulse_rejected(&self) {
        self.pulses_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an accepted bill (lock-free)
    #[inline]
    pub fn record_bill(&self, amount: u32) {
        self.bills_accepted.fetch_add(1, Ordering::Relaxed);
        self.bill_value_sum.fetch_add(amount as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_completed(&self) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_cancelled(&self) {
        self.sessions_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a change dispense: pesos requested vs actually delivered
    #[inline]
    pub fn record_change(&self, requested: u32, delivered: u32) {
        self.change_requested.fetch_add(requested as u64, Ordering::Relaxed);
        self.change_dispensed.fetch_add(delivered as u64, Ordering::Relaxed);
    }

    /// Record a device command round-trip with its latency (lock-free)
    #[inline]
    pub fn record_device_command(&self, latency_us: u64) {
        self.device_commands_sent.fetch_add(1, Ordering::Relaxed);
        self.device_commands_since_report.fetch_add(1, Ordering::Relaxed);
        self.device_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let bucket = bucket_index(latency_us);
        self.device_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        update_atomic_max(&self.device_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_device_retry(&self) {
        self.device_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_device_timeout(&self) {
        self.device_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_link_error(&self) {
        self.link_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_slot_pulse(&self) {
        self.slot_pulses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dispense_confirmed(&self) {
        self.dispenses_confirmed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a confirmation timeout, keyed by slot so a jammed
    /// mechanism shows up under its own number.
    pub fn record_dispense_timeout(&self, slot: u8) {
        self.dispense_timeouts.fetch_add(1, Ordering::Relaxed);
        *self.timeouts_by_slot.lock().entry(slot).or_insert(0) += 1;
    }

    #[inline]
    pub fn record_balance_poll(&self) {
        self.balance_polls.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_ui_message_dropped(&self) {
        self.ui_messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Set the current pending-dispense table size (called by the monitor)
    #[inline]
    pub fn set_pending_dispenses(&self, count: u64) {
        self.pending_dispenses.store(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn coins_accepted(&self) -> u64 {
        self.coins_accepted.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn dispense_timeouts(&self) -> u64 {
        self.dispense_timeouts.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let device_count = self.device_commands_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.device_latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.device_latency_max_us.swap(0, Ordering::Relaxed);
        let dev_buckets = swap_buckets(&self.device_latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let device_cmds_per_sec = if elapsed.as_secs_f64() > 0.0 {
            device_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let avg_latency = if device_count > 0 { latency_sum / device_count } else { 0 };

        let timeouts_by_slot: Vec<(u8, u64)> = {
            let map = self.timeouts_by_slot.lock();
            let mut entries: Vec<(u8, u64)> = map.iter().map(|(k, v)| (*k, *v)).collect();
            entries.sort_by_key(|(slot, _)| *slot);
            entries
        };

        MetricsSummary {
            coins_accepted: self.coins_accepted.load(Ordering::Relaxed),
            coin_value_sum: self.coin_value_sum.load(Ordering::Relaxed),
            pulses_rejected: self.pulses_rejected.load(Ordering::Relaxed),
            bills_accepted: self.bills_accepted.load(Ordering::Relaxed),
            bill_value_sum: self.bill_value_sum.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            sessions_cancelled: self.sessions_cancelled.load(Ordering::Relaxed),
            change_requested: self.change_requested.load(Ordering::Relaxed),
            change_dispensed: self.change_dispensed.load(Ordering::Relaxed),
            device_commands_total: self.device_commands_sent.load(Ordering::Relaxed),
            device_cmds_per_sec,
            dev_lat_avg_us: avg_latency,
            dev_lat_max_us: max_latency,
            dev_lat_buckets: dev_buckets,
            dev_lat_p50_us: percentile_from_buckets(&dev_buckets, 0.50),
            dev_lat_p95_us: percentile_from_buckets(&dev_buckets, 0.95),
            dev_lat_p99_us: percentile_from_buckets(&dev_buckets, 0.99),
            device_retries: self.device_retries.load(Ordering::Relaxed),
            device_timeouts: self.device_timeouts.load(Ordering::Relaxed),
            link_errors: self.link_errors.load(Ordering::Relaxed),
            slot_pulses: self.slot_pulses.load(Ordering::Relaxed),
            dispenses_confirmed: self.dispenses_confirmed.load(Ordering::Relaxed),
            dispense_timeouts: self.dispense_timeouts.load(Ordering::Relaxed),
            timeouts_by_slot,
            balance_polls: self.balance_polls.load(Ordering::Relaxed),
            ui_messages_dropped: self.ui_messages_dropped.load(Ordering::Relaxed),
            pending_dispenses: self.pending_dispenses.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics for one report interval
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub coins_accepted: u64,
    pub coin_value_sum: u64,
    pub pulses_rejected: u64,
    pub bills_accepted: u64,
    pub bill_value_sum: u64,
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_cancelled: u64,
    pub change_requested: u64,
    pub change_dispensed: u64,
    pub device_commands_total: u64,
    pub device_cmds_per_sec: f64,
    pub dev_lat_avg_us: u64,
    pub dev_lat_max_us: u64,
    pub dev_lat_buckets: [u64; METRICS_NUM_BUCKETS],
    pub dev_lat_p50_us: u64,
    pub dev_lat_p95_us: u64,
    pub dev_lat_p99_us: u64,
    pub device_retries: u64,
    pub device_timeouts: u64,
    pub link_errors: u64,
    pub slot_pulses: u64,
    pub dispenses_confirmed: u64,
    pub dispense_timeouts: u64,
    pub timeouts_by_slot: Vec<(u8, u64)>,
    pub balance_polls: u64,
    pub ui_messages_dropped: u64,
    pub pending_dispenses: u64,
}

impl MetricsSummary {
    /// Log the summary as a structured event
    pub fn log(&self) {
        info!(
            coins = %self.coins_accepted,
            coin_pesos = %self.coin_value_sum,
            bills = %self.bills_accepted,
            bill_pesos = %self.bill_value_sum,
            sessions = %self.sessions_started,
            completed = %self.sessions_completed,
            cancelled = %self.sessions_cancelled,
            change_req = %self.change_requested,
            change_out = %self.change_dispensed,
            dev_cmds = %self.device_commands_total,
            dev_per_sec = %format!("{:.1}", self.device_cmds_per_sec),
            dev_avg_us = %self.dev_lat_avg_us,
            dev_p99_us = %self.dev_lat_p99_us,
            dev_max_us = %self.dev_lat_max_us,
            retries = %self.device_retries,
            timeouts = %self.device_timeouts,
            link_errors = %self.link_errors,
            pulses = %self.slot_pulses,
            confirmed = %self.dispenses_confirmed,
            confirm_timeouts = %self.dispense_timeouts,
            pending = %self.pending_dispenses,
            ui_dropped = %self.ui_messages_dropped,
            "metrics_report"
        );
    }
}
