//! Coin acceptor pulse decoding
//!
//! The acceptor signals a coin by holding its output line low; the pulse
//! width encodes the denomination. A lightweight poller samples the GPIO
//! line and emits timestamped edges; the decoder task pairs falling and
//! rising edges, validates the width and classifies it.
//!
//! Width thresholds are hardware calibration, inverted relative to the
//! naive expectation (the widest pulse is the smallest coin). Do not
//! re-derive them:
//! - >= 45 ms  -> 1 peso
//! - 30-45 ms  -> 5 pesos
//! - < 30 ms   -> 10 pesos

use crate::domain::types::{CoinAcceptor, CoinCallback, CoinEvent, Denomination};
use crate::infra::config::CoinAcceptorConfig;
use crate::infra::metrics::Metrics;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Calibrated classification thresholds (milliseconds)
const ONE_PESO_MIN_WIDTH_MS: u64 = 45;
const FIVE_PESO_MIN_WIDTH_MS: u64 = 30;

/// Edge direction on the pulse line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Rising,
    Falling,
}

/// One level transition with its capture time
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub kind: EdgeKind,
    pub at: Instant,
}

/// Classify a validated pulse width
#[inline]
pub fn classify_width(width: Duration) -> Denomination {
    let ms = width.as_millis() as u64;
    if ms >= ONE_PESO_MIN_WIDTH_MS {
        Denomination::One
    } else if ms >= FIVE_PESO_MIN_WIDTH_MS {
        Denomination::Five
    } else {
        Denomination::Ten
    }
}

/// Width validation and debounce bounds
#[derive(Debug, Clone, Copy)]
pub struct PulseDecoderConfig {
    pub min_width: Duration,
    pub max_width: Duration,
    pub debounce: Duration,
}

impl From<&CoinAcceptorConfig> for PulseDecoderConfig {
    fn from(config: &CoinAcceptorConfig) -> Self {
        Self {
            min_width: Duration::from_millis(config.min_width_ms),
            max_width: Duration::from_millis(config.max_width_ms),
            debounce: Duration::from_millis(config.debounce_ms),
        }
    }
}

struct PulseInner {
    config: PulseDecoderConfig,
    total: parking_lot::Mutex<u32>,
    last_accept: parking_lot::Mutex<Option<(Denomination, Instant)>>,
    callback: parking_lot::Mutex<Option<CoinCallback>>,
    metrics: Arc<Metrics>,
}

impl PulseInner {
    /// Validate, debounce and account one measured pulse.
    /// Returns the accepted denomination, or None when rejected.
    fn accept_width(&self, width: Duration, at: Instant) -> Option<Denomination> {
        if width < self.config.min_width {
            debug!(width_ms = %width.as_millis(), "coin_pulse_noise_rejected");
            self.metrics.record_pulse_rejected();
            return None;
        }
        if width > self.config.max_width {
            debug!(width_ms = %width.as_millis(), "coin_pulse_stuck_rejected");
            self.metrics.record_pulse_rejected();
            return None;
        }

        let denomination = classify_width(width);

        {
            let mut last = self.last_accept.lock();
            if let Some((prev_denom, prev_at)) = *last {
                if prev_denom == denomination
                    && at.saturating_duration_since(prev_at) < self.config.debounce
                {
                    debug!(denom = %denomination.as_str(), "coin_pulse_debounced");
                    self.metrics.record_pulse_rejected();
                    return None;
                }
            }
            *last = Some((denomination, at));
        }

        *self.total.lock() += denomination.value();
        self.metrics.record_coin(denomination.value());
        info!(
            denom = %denomination.as_str(),
            width_ms = %width.as_millis(),
            "coin_accepted"
        );

        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(CoinEvent::new(denomination));
        }

        Some(denomination)
    }
}

/// Decoder over an edge stream; one of the three coin-acceptor backends
pub struct CoinPulseDecoder {
    inner: Arc<PulseInner>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl CoinPulseDecoder {
    /// Spawn the decode task consuming `edge_rx`
    pub fn spawn(
        config: PulseDecoderConfig,
        edge_rx: mpsc::Receiver<Edge>,
        metrics: Arc<Metrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let inner = Arc::new(PulseInner {
            config,
            total: parking_lot::Mutex::new(0),
            last_accept: parking_lot::Mutex::new(None),
            callback: parking_lot::Mutex::new(None),
            metrics,
        });

        let task_inner = inner.clone();
        let task = tokio::spawn(async move {
            decode_loop(task_inner, edge_rx, shutdown).await;
        });

        Arc::new(Self { inner, task: parking_lot::Mutex::new(Some(task)) })
    }
}

/// Pair falling edges with their rising edge, bounded by the maximum
/// pulse width; everything else stays on the edge channel so the GPIO
/// sampler never blocks.
async fn decode_loop(
    inner: Arc<PulseInner>,
    mut edge_rx: mpsc::Receiver<Edge>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("coin_pulse_decoder_started");

    loop {
        let falling = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("coin_pulse_decoder_shutdown");
                    return;
                }
                continue;
            }
            edge = edge_rx.recv() => match edge {
                Some(edge) => edge,
                None => return,
            }
        };

        if falling.kind != EdgeKind::Falling {
            continue;
        }

        // Bounded wait for the matching rising edge. The extra margin
        // lets an exactly-max-width pulse through to width validation.
        let wait = inner.config.max_width + Duration::from_millis(10);
        let rising = match tokio::time::timeout(wait, edge_rx.recv()).await {
            Ok(Some(edge)) => edge,
            Ok(None) => return,
            Err(_) => {
                debug!("coin_pulse_rising_edge_timeout");
                inner.metrics.record_pulse_rejected();
                continue;
            }
        };

        if rising.kind != EdgeKind::Rising {
            // Two falling edges in a row: the line glitched, restart
            debug!("coin_pulse_unpaired_falling_edge");
            inner.metrics.record_pulse_rejected();
            continue;
        }

        let width = rising.at.saturating_duration_since(falling.at);
        inner.accept_width(width, rising.at);
    }
}

impl CoinAcceptor for CoinPulseDecoder {
    fn received_amount(&self) -> u32 {
        *self.inner.total.lock()
    }

    fn reset_amount(&self) {
        *self.inner.total.lock() = 0;
    }

    fn set_callback(&self, callback: CoinCallback) {
        *self.inner.callback.lock() = Some(callback);
    }

    fn shutdown(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// Sample a GPIO input at a fixed interval and emit edges on transitions.
/// The sampler itself never blocks: a full edge queue loses the edge
/// rather than stalling.
pub fn spawn_edge_poller<P>(
    mut pin: P,
    sample_interval: Duration,
    edge_tx: mpsc::Sender<Edge>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    P: embedded_hal::digital::InputPin + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sample_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_level: Option<bool> = None;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    let Ok(high) = pin.is_high() else { continue };
                    if let Some(previous) = last_level {
                        if previous != high {
                            let kind =
                                if high { EdgeKind::Rising } else { EdgeKind::Falling };
                            let _ = edge_tx.try_send(Edge { kind, at: Instant::now() });
                        }
                    }
                    last_level = Some(high);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> PulseDecoderConfig {
        PulseDecoderConfig {
            min_width: Duration::from_millis(8),
            max_width: Duration::from_millis(120),
            debounce: Duration::from_millis(100),
        }
    }

    fn test_inner() -> Arc<PulseInner> {
        Arc::new(PulseInner {
            config: test_config(),
            total: parking_lot::Mutex::new(0),
            last_accept: parking_lot::Mutex::new(None),
            callback: parking_lot::Mutex::new(None),
            metrics: Arc::new(Metrics::new()),
        })
    }

    #[test]
    fn test_classify_width_calibration_table() {
        // Inverted on purpose: widest pulse is the smallest coin
        assert_eq!(classify_width(Duration::from_millis(45)), Denomination::One);
        assert_eq!(classify_width(Duration::from_millis(80)), Denomination::One);
        assert_eq!(classify_width(Duration::from_millis(30)), Denomination::Five);
        assert_eq!(classify_width(Duration::from_millis(44)), Denomination::Five);
        assert_eq!(classify_width(Duration::from_millis(29)), Denomination::Ten);
        assert_eq!(classify_width(Duration::from_millis(10)), Denomination::Ten);
    }

    #[test]
    fn test_accept_width_validation() {
        let inner = test_inner();
        let now = Instant::now();

        // Below min: noise
        assert_eq!(inner.accept_width(Duration::from_millis(3), now), None);
        // Above max: stuck line
        assert_eq!(inner.accept_width(Duration::from_millis(300), now), None);
        assert_eq!(*inner.total.lock(), 0);

        // Valid widths accumulate
        assert_eq!(
            inner.accept_width(Duration::from_millis(50), now),
            Some(Denomination::One)
        );
        assert_eq!(*inner.total.lock(), 1);
    }

    #[test]
    fn test_debounce_collapses_identical_denomination() {
        let inner = test_inner();
        let base = Instant::now();

        assert!(inner.accept_width(Duration::from_millis(35), base).is_some());
        // Same denomination inside the window: collapsed
        assert!(inner
            .accept_width(Duration::from_millis(36), base + Duration::from_millis(40))
            .is_none());
        // Beyond the window: counted
        assert!(inner
            .accept_width(Duration::from_millis(35), base + Duration::from_millis(150))
            .is_some());
        assert_eq!(*inner.total.lock(), 10);
    }

    #[test]
    fn test_debounce_allows_different_denomination() {
        let inner = test_inner();
        let base = Instant::now();

        assert!(inner.accept_width(Duration::from_millis(35), base).is_some());
        // Different denomination inside the window still counts
        assert!(inner
            .accept_width(Duration::from_millis(60), base + Duration::from_millis(20))
            .is_some());
        assert_eq!(*inner.total.lock(), 6);
    }

    #[tokio::test]
    async fn test_decode_loop_over_edge_channel() {
        let (edge_tx, edge_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(Metrics::new());
        let decoder =
            CoinPulseDecoder::spawn(test_config(), edge_rx, metrics.clone(), shutdown_rx);

        let events: Arc<parking_lot::Mutex<Vec<Denomination>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = events.clone();
        decoder.set_callback(Arc::new(move |event: CoinEvent| {
            seen.lock().push(event.denomination);
        }));

        let base = Instant::now();
        // 35 ms pulse -> 5 pesos
        edge_tx.send(Edge { kind: EdgeKind::Falling, at: base }).await.unwrap();
        edge_tx
            .send(Edge { kind: EdgeKind::Rising, at: base + Duration::from_millis(35) })
            .await
            .unwrap();
        // 3 ms glitch -> rejected
        let glitch = base + Duration::from_millis(200);
        edge_tx.send(Edge { kind: EdgeKind::Falling, at: glitch }).await.unwrap();
        edge_tx
            .send(Edge { kind: EdgeKind::Rising, at: glitch + Duration::from_millis(3) })
            .await
            .unwrap();
        drop(edge_tx);

        // Decode task exits when the channel closes
        tokio::time::timeout(Duration::from_secs(1), async {
            while decoder.received_amount() < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("decoder did not account the pulse");

        assert_eq!(decoder.received_amount(), 5);
        assert_eq!(events.lock().as_slice(), &[Denomination::Five]);

        decoder.reset_amount();
        assert_eq!(decoder.received_amount(), 0);
        decoder.shutdown();
    }
}
