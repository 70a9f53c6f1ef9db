//! Bill acceptor line parsing
//!
//! Bill validators in the field speak several line formats over one
//! logical feed:
//! - human-readable  "BILL INSERTED: <amount>"
//! - canonical       "BILL:<amount>"
//! - pulse-count     "PULSES:<n>"  (amount = n * 10)
//! - raw hex frames, logged but not interpreted
//!
//! Identical amounts inside a short window are contact bounce and are
//! discarded. The dedicated-port variant picks framing from port-name
//! heuristics and falls back to a descriptor-keyword scan over the
//! available serial devices when the configured port will not open.

use crate::domain::types::{BillAcceptor, BillCallback, BillEvent};
use crate::infra::config::BillAcceptorConfig;
use crate::infra::metrics::Metrics;
use crate::io::serial_mux::{SerialLine, SharedSerialLink};
use bytes::BytesMut;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialPortType, SerialStream, StopBits};
use tracing::{debug, info, warn};

/// Bounded recent-event history kept for the admin surface
const RECENT_BUFFER: usize = 32;

/// One parsed bill-feed line
#[derive(Debug, Clone, PartialEq)]
pub enum BillReading {
    Amount(u32),
    /// Raw frame from validators in binary mode; passed through untouched
    RawFrame(Vec<u8>),
}

/// Parse one line of the heterogeneous bill feed
pub fn parse_bill_line(line: &str) -> Option<BillReading> {
    let line = line.trim();

    if let Some(rest) = line.strip_prefix("BILL INSERTED:") {
        return rest.trim().parse::<u32>().ok().map(BillReading::Amount);
    }
    if let Some(rest) = line.strip_prefix("BILL:") {
        return rest.trim().parse::<u32>().ok().map(BillReading::Amount);
    }
    if let Some(rest) = line.strip_prefix("PULSES:") {
        return rest.trim().parse::<u32>().ok().map(|n| BillReading::Amount(n * 10));
    }

    // Raw-hex fallback: some validators emit undocumented binary frames
    if line.len() >= 2 && line.len() % 2 == 0 {
        if let Ok(bytes) = hex::decode(line) {
            return Some(BillReading::RawFrame(bytes));
        }
    }

    None
}

/// Native UARTs on the SBC want two stop bits; USB bridges want one
fn stop_bits_for(device: &str) -> StopBits {
    if device.contains("ttyAMA") || device.contains("ttyS") {
        StopBits::Two
    } else {
        StopBits::One
    }
}

/// Open the configured port, or scan for a plausible validator bridge
/// when it will not open.
fn open_bill_port(config: &BillAcceptorConfig) -> Result<SerialStream, tokio_serial::Error> {
    let first = tokio_serial::new(&config.device, config.baud)
        .stop_bits(stop_bits_for(&config.device))
        .timeout(Duration::from_millis(100))
        .open_native_async();

    let err = match first {
        Ok(port) => {
            info!(device = %config.device, "bill_port_opened");
            return Ok(port);
        }
        Err(e) => e,
    };

    warn!(device = %config.device, error = %err, "bill_port_open_failed_scanning");

    for info in tokio_serial::available_ports().unwrap_or_default() {
        let SerialPortType::UsbPort(usb) = &info.port_type else { continue };
        let descriptor = format!(
            "{} {}",
            usb.product.as_deref().unwrap_or(""),
            usb.manufacturer.as_deref().unwrap_or("")
        )
        .to_uppercase();

        if !config.detect_keywords.iter().any(|k| descriptor.contains(&k.to_uppercase())) {
            continue;
        }

        match tokio_serial::new(&info.port_name, config.baud)
            .stop_bits(stop_bits_for(&info.port_name))
            .timeout(Duration::from_millis(100))
            .open_native_async()
        {
            Ok(port) => {
                info!(device = %info.port_name, descriptor = %descriptor, "bill_port_autodetected");
                return Ok(port);
            }
            Err(e) => {
                debug!(device = %info.port_name, error = %e, "bill_port_candidate_failed");
            }
        }
    }

    Err(err)
}

struct BillInner {
    total: parking_lot::Mutex<u32>,
    recent: parking_lot::Mutex<VecDeque<BillEvent>>,
    last_accept: parking_lot::Mutex<Option<(u32, Instant)>>,
    callback: parking_lot::Mutex<Option<BillCallback>>,
    debounce: Duration,
    metrics: Arc<Metrics>,
}

impl BillInner {
    /// Debounce and account one parsed amount
    fn accept_amount(&self, amount: u32, at: Instant) -> bool {
        {
            let mut last = self.last_accept.lock();
            if let Some((prev_amount, prev_at)) = *last {
                if prev_amount == amount && at.saturating_duration_since(prev_at) < self.debounce {
                    debug!(amount = %amount, "bill_debounced");
                    return false;
                }
            }
            *last = Some((amount, at));
        }

        *self.total.lock() += amount;
        self.metrics.record_bill(amount);

        let event = BillEvent::new(amount);
        {
            let mut recent = self.recent.lock();
            if recent.len() == RECENT_BUFFER {
                recent.pop_front();
            }
            recent.push_back(event);
        }
        info!(amount = %amount, "bill_accepted");

        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(event);
        }
        true
    }

    fn handle_line(&self, line: &str) {
        match parse_bill_line(line) {
            Some(BillReading::Amount(amount)) => {
                self.accept_amount(amount, Instant::now());
            }
            Some(BillReading::RawFrame(bytes)) => {
                debug!(len = %bytes.len(), frame = %hex::encode(&bytes), "bill_raw_frame");
            }
            None => {
                if !line.trim().is_empty() {
                    debug!(line = %line.trim(), "bill_unparsed_line");
                }
            }
        }
    }
}

/// Bill acceptor over a dedicated port or the shared multiplexer
pub struct BillLineParser {
    inner: Arc<BillInner>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl BillLineParser {
    fn new_inner(config: &BillAcceptorConfig, metrics: Arc<Metrics>) -> Arc<BillInner> {
        Arc::new(BillInner {
            total: parking_lot::Mutex::new(0),
            recent: parking_lot::Mutex::new(VecDeque::with_capacity(RECENT_BUFFER)),
            last_accept: parking_lot::Mutex::new(None),
            callback: parking_lot::Mutex::new(None),
            debounce: Duration::from_millis(config.debounce_ms),
            metrics,
        })
    }

    /// Own a validator port directly
    pub fn dedicated(
        config: &BillAcceptorConfig,
        metrics: Arc<Metrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let inner = Self::new_inner(config, metrics);

        let task_inner = inner.clone();
        let task_config = config.clone();
        let task = tokio::spawn(async move {
            read_port_loop(task_inner, task_config, shutdown).await;
        });

        Arc::new(Self { inner, tasks: parking_lot::Mutex::new(vec![task]) })
    }

    /// Ride the shared serial link's bill subscription
    pub fn shared(
        link: Arc<SharedSerialLink>,
        config: &BillAcceptorConfig,
        metrics: Arc<Metrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let inner = Self::new_inner(config, metrics);

        let lines = link.subscribe_bill();
        let task_inner = inner.clone();
        let task = tokio::spawn(async move {
            consume_shared_lines(task_inner, lines, shutdown).await;
        });

        Arc::new(Self { inner, tasks: parking_lot::Mutex::new(vec![task]) })
    }

    /// Recent accepted bills, oldest first
    pub fn recent_events(&self) -> Vec<BillEvent> {
        self.inner.recent.lock().iter().copied().collect()
    }
}

async fn read_port_loop(
    inner: Arc<BillInner>,
    config: BillAcceptorConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut port = match open_bill_port(&config) {
        Ok(port) => port,
        Err(e) => {
            // No validator reachable; the kiosk runs coin-only
            warn!(device = %config.device, error = %e, "bill_acceptor_unavailable");
            return;
        }
    };

    let mut buf = [0u8; 256];
    let mut acc = BytesMut::with_capacity(512);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("bill_reader_shutdown");
                    return;
                }
            }
            result = port.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                    Ok(n) => {
                        acc.extend_from_slice(&buf[..n]);
                        while let Some(pos) = acc.iter().position(|&b| b == b'\n') {
                            let raw = acc.split_to(pos + 1);
                            let line = String::from_utf8_lossy(&raw[..pos]).to_string();
                            inner.handle_line(&line);
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::TimedOut => {}
                    Err(e) => {
                        warn!(error = %e, "bill_read_error");
                        return;
                    }
                }
            }
        }
    }
}

async fn consume_shared_lines(
    inner: Arc<BillInner>,
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
            SerialLine::Bill { amount: Some(amount) } => {
                inner.accept_amount(amount, Instant::now());
            }
            SerialLine::Bill { amount: None } => {
                // Insertion detected but no value yet; the amount line follows
                debug!("bill_insertion_signalled");
            }
            other => {
                debug!(line = ?other, "bill_unexpected_line");
            }
        }
    }
}

impl BillAcceptor for BillLineParser {
    fn received_amount(&self) -> u32 {
        *self.inner.total.lock()
    }

    fn reset_amount(&self) {
        *self.inner.total.lock() = 0;
    }

    fn set_callback(&self, callback: BillCallback) {
        *self.inner.callback.lock() = Some(callback);
    }

    fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::config::Config;

    fn test_inner() -> Arc<BillInner> {
        BillLineParser::new_inner(Config::default().bill(), Arc::new(Metrics::new()))
    }

    #[test]
    fn test_parse_human_readable() {
        assert_eq!(parse_bill_line("BILL INSERTED: 100"), Some(BillReading::Amount(100)));
        assert_eq!(parse_bill_line("BILL INSERTED: 20\r"), Some(BillReading::Amount(20)));
        assert_eq!(parse_bill_line("BILL INSERTED: x"), None);
    }

    #[test]
    fn test_parse_canonical() {
        assert_eq!(parse_bill_line("BILL:50"), Some(BillReading::Amount(50)));
        assert_eq!(parse_bill_line("BILL: 500"), Some(BillReading::Amount(500)));
    }

    #[test]
    fn test_parse_pulse_count() {
        // Each pulse is worth ten pesos
        assert_eq!(parse_bill_line("PULSES:10"), Some(BillReading::Amount(100)));
        assert_eq!(parse_bill_line("PULSES:2"), Some(BillReading::Amount(20)));
    }

    #[test]
    fn test_parse_raw_hex_fallback() {
        assert_eq!(
            parse_bill_line("02A1FF03"),
            Some(BillReading::RawFrame(vec![0x02, 0xA1, 0xFF, 0x03]))
        );
        assert_eq!(parse_bill_line("total junk"), None);
        assert_eq!(parse_bill_line("ABC"), None); // odd length is not a frame
    }

    #[test]
    fn test_accept_amount_and_total() {
        let inner = test_inner();
        let base = Instant::now();

        assert!(inner.accept_amount(100, base));
        assert!(inner.accept_amount(50, base + Duration::from_millis(50)));
        assert_eq!(*inner.total.lock(), 150);
        assert_eq!(inner.recent.lock().len(), 2);
    }

    #[test]
    fn test_debounce_identical_amount() {
        let inner = test_inner();
        let base = Instant::now();

        assert!(inner.accept_amount(100, base));
        // Same amount inside 300 ms: bounce
        assert!(!inner.accept_amount(100, base + Duration::from_millis(120)));
        // Beyond the window both count
        assert!(inner.accept_amount(100, base + Duration::from_millis(400)));
        assert_eq!(*inner.total.lock(), 200);
    }

    #[test]
    fn test_debounce_allows_different_amount() {
        let inner = test_inner();
        let base = Instant::now();

        assert!(inner.accept_amount(100, base));
        assert!(inner.accept_amount(50, base + Duration::from_millis(50)));
        assert_eq!(*inner.total.lock(), 150);
    }

    #[test]
    fn test_recent_buffer_bounded() {
        let inner = test_inner();
        let base = Instant::now();

        for i in 0..40u32 {
            // Alternate amounts so debounce never triggers
            let amount = if i % 2 == 0 { 20 } else { 50 };
            inner.accept_amount(amount, base + Duration::from_millis(u64::from(i)));
        }
        assert_eq!(inner.recent.lock().len(), RECENT_BUFFER);
    }

    #[test]
    fn test_handle_line_routes_formats() {
        let inner = test_inner();
        inner.handle_line("BILL INSERTED: 100");
        inner.handle_line("02A1FF03"); // raw frame: logged, not counted
        inner.handle_line("noise");
        assert_eq!(*inner.total.lock(), 100);
    }

    #[test]
    fn test_stop_bits_heuristic() {
        assert_eq!(stop_bits_for("/dev/ttyAMA0"), StopBits::Two);
        assert_eq!(stop_bits_for("/dev/ttyS1"), StopBits::Two);
        assert_eq!(stop_bits_for("/dev/ttyUSB0"), StopBits::One);
        assert_eq!(stop_bits_for("/dev/ttyACM2"), StopBits::One);
    }

    #[tokio::test]
    async fn test_shared_variant_consumes_bill_lines() {
        let link = SharedSerialLink::disconnected("/dev/test-bill", 115200);
        let (_tx, shutdown_rx) = watch::channel(false);
        let parser = BillLineParser::shared(
            link.clone(),
            Config::default().bill(),
            Arc::new(Metrics::new()),
            shutdown_rx,
        );

        link.dispatch_line("BILL INSERTED: 50");
        link.dispatch_line("BILL");
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(parser.received_amount(), 50);
        assert_eq!(parser.recent_events().len(), 1);

        parser.reset_amount();
        assert_eq!(parser.received_amount(), 0);
    }
}
