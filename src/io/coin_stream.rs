//! Textual coin acceptor protocol adapter
//!
//! Consumes `[COIN]` and `BALANCE` lines from a serial link - either a
//! dedicated port or a subscription on the shared multiplexer - and keeps
//! a rebasable running total. The hardware maintains its own lifetime
//! counter; `reset_amount` moves a baseline offset instead of touching
//! it, so other consumers of the counter are unaffected.
//!
//! Outbound commands: `GET_BALANCE` (polled ~2 s to stay fresh between
//! events), `RESET_BALANCE`, `SET_COIN_VALUE <output> <value>`,
//! `SET_OUTPUT <output>`.

use crate::domain::types::{CoinAcceptor, CoinCallback, CoinEvent, Denomination};
use crate::infra::config::CoinAcceptorConfig;
use crate::infra::metrics::Metrics;
use crate::io::serial_mux::{SerialLine, SerialMuxRegistry, SharedSerialLink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct StreamInner {
    hardware_total: parking_lot::Mutex<u32>,
    baseline: parking_lot::Mutex<u32>,
    callback: parking_lot::Mutex<Option<CoinCallback>>,
    polling_paused: AtomicBool,
    metrics: Arc<Metrics>,
}

/// Coin acceptor backend over the textual protocol
pub struct CoinStreamAdapter {
    link: Arc<SharedSerialLink>,
    inner: Arc<StreamInner>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl CoinStreamAdapter {
    /// Standalone variant owning its registry-opened port
    pub fn dedicated(
        registry: &SerialMuxRegistry,
        config: &CoinAcceptorConfig,
        metrics: Arc<Metrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let link = registry.open(&config.device, config.baud);
        info!(device = %config.device, "coin_stream_dedicated");
        Self::attach(link, config, metrics, shutdown)
    }

    /// Variant riding an existing shared link
    pub fn shared(
        link: Arc<SharedSerialLink>,
        config: &CoinAcceptorConfig,
        metrics: Arc<Metrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        info!(device = %link.device(), "coin_stream_shared");
        Self::attach(link, config, metrics, shutdown)
    }

    fn attach(
        link: Arc<SharedSerialLink>,
        config: &CoinAcceptorConfig,
        metrics: Arc<Metrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let inner = Arc::new(StreamInner {
            hardware_total: parking_lot::Mutex::new(0),
            baseline: parking_lot::Mutex::new(0),
            callback: parking_lot::Mutex::new(None),
            polling_paused: AtomicBool::new(false),
            metrics,
        });

        let lines = link.subscribe_coin();
        let consume_inner = inner.clone();
        let consume_shutdown = shutdown.clone();
        let consume_task = tokio::spawn(async move {
            consume_lines(consume_inner, lines, consume_shutdown).await;
        });

        let poll_link = link.clone();
        let poll_inner = inner.clone();
        let poll_interval = Duration::from_millis(config.balance_poll_ms);
        let poll_task = tokio::spawn(async move {
            balance_poll_loop(poll_link, poll_inner, poll_interval, shutdown).await;
        });

        Arc::new(Self {
            link,
            inner,
            tasks: parking_lot::Mutex::new(vec![consume_task, poll_task]),
        })
    }

    /// Route one of the acceptor's six outputs to the shared signal
    pub fn set_output(&self, output: u8) -> bool {
        self.link.send_line(&format!("SET_OUTPUT {}", output))
    }

    /// Program the peso value reported for one output
    pub fn set_coin_value(&self, output: u8, value: u32) -> bool {
        self.link.send_line(&format!("SET_COIN_VALUE {} {}", output, value))
    }

    /// Zero the hardware lifetime counter (and our view of it)
    pub fn reset_balance(&self) -> bool {
        let sent = self.link.send_line("RESET_BALANCE");
        if sent {
            *self.inner.hardware_total.lock() = 0;
            *self.inner.baseline.lock() = 0;
        }
        sent
    }
}

async fn consume_lines(
    inner: Arc<StreamInner>,
    mut lines: mpsc::Receiver<SerialLine>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let line = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
            line = lines.recv() => match line {
                Some(line) => line,
                None => return,
            }
        };

        match line {
            SerialLine::Coin { value, total } => {
                {
                    let mut hw = inner.hardware_total.lock();
                    match total {
                        // The hardware counter is authoritative when present
                        Some(total) => *hw = total,
                        None => *hw += value,
                    }
                }
                inner.metrics.record_coin(value);

                let Some(denomination) = Denomination::from_value(value) else {
                    warn!(value = %value, "coin_stream_unknown_value");
                    continue;
                };
                let callback = inner.callback.lock().clone();
                if let Some(callback) = callback {
                    callback(CoinEvent::new(denomination));
                }
            }
            SerialLine::Balance { total } => {
                debug!(total = %total, "coin_stream_balance");
                *inner.hardware_total.lock() = total;
            }
            other => {
                debug!(line = ?other, "coin_stream_unexpected_line");
            }
        }
    }
}

/// Keep the total fresh between coin events. Paused while the hopper
/// conversation owns the link.
async fn balance_poll_loop(
    link: Arc<SharedSerialLink>,
    inner: Arc<StreamInner>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                if inner.polling_paused.load(Ordering::Relaxed) {
                    continue;
                }
                if link.send_line("GET_BALANCE") {
                    inner.metrics.record_balance_poll();
                }
            }
        }
    }
}

impl CoinAcceptor for CoinStreamAdapter {
    fn received_amount(&self) -> u32 {
        let hw = *self.inner.hardware_total.lock();
        let baseline = *self.inner.baseline.lock();
        hw.saturating_sub(baseline)
    }

    /// Rebase to zero without mutating the shared hardware counter
    fn reset_amount(&self) {
        let hw = *self.inner.hardware_total.lock();
        *self.inner.baseline.lock() = hw;
    }

    fn set_callback(&self, callback: CoinCallback) {
        *self.inner.callback.lock() = Some(callback);
    }

    fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn pause_polling(&self) {
        self.inner.polling_paused.store(true, Ordering::Relaxed);
        debug!("coin_stream_polling_paused");
    }

    fn resume_polling(&self) {
        self.inner.polling_paused.store(false, Ordering::Relaxed);
        debug!("coin_stream_polling_resumed");
    }
}
