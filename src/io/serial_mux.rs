//! Shared serial link multiplexer
//!
//! Several logical devices (temperature probes, infra-red sensors, the
//! coin acceptor, the bill acceptor) report over one physical serial
//! line. One read-loop task owns the port; inbound lines are classified
//! with ordered first-match-wins patterns and fanned out:
//! - temperature  "LABEL: <float>C <float>%"
//! - infra-red    "IR<n>: BLOCKED|CLEAR"
//! - coin         "[COIN] ... Value: <v> ... Total: <t>"
//! - balance      "BALANCE: <t>"
//! - bill         "BILL" / "BILL INSERTED: <amt>"
//!
//! Unmatched lines are dropped; the read loop never exits on malformed
//! input. A failed initial open marks the handle permanently
//! disconnected and callers see empty reads.

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, error, info, warn};

/// Capacity of each subscriber channel
const SUBSCRIBER_BUFFER: usize = 64;
/// Capacity of the outbound write queue
const WRITER_BUFFER: usize = 32;

/// One classified inbound line
#[derive(Debug, Clone, PartialEq)]
pub enum SerialLine {
    Temperature { label: String, celsius: f32, humidity: f32 },
    Infrared { index: u8, blocked: bool },
    Coin { value: u32, total: Option<u32> },
    Balance { total: u32 },
    Bill { amount: Option<u32> },
}

/// Ordered pattern match over one trimmed line; first match wins
pub fn classify_line(line: &str) -> Option<SerialLine> {
    if let Some(t) = parse_temperature(line) {
        return Some(t);
    }
    if let Some(ir) = parse_infrared(line) {
        return Some(ir);
    }
    if let Some(coin) = parse_coin(line) {
        return Some(coin);
    }
    if let Some(balance) = line.strip_prefix("BALANCE:") {
        if let Ok(total) = balance.trim().parse::<u32>() {
            return Some(SerialLine::Balance { total });
        }
        return None;
    }
    parse_bill(line)
}

/// "LABEL: <float>C <float>%"
fn parse_temperature(line: &str) -> Option<SerialLine> {
    let (label, rest) = line.split_once(':')?;
    let label = label.trim();
    if label.is_empty() || label.contains(' ') {
        return None;
    }

    let mut parts = rest.trim().split_whitespace();
    let celsius = parts.next()?.strip_suffix('C')?.parse::<f32>().ok()?;
    let humidity = parts.next()?.strip_suffix('%')?.parse::<f32>().ok()?;
    if parts.next().is_some() {
        return None;
    }

    Some(SerialLine::Temperature { label: label.to_string(), celsius, humidity })
}

/// "IR<n>: BLOCKED" / "IR<n>: CLEAR"
fn parse_infrared(line: &str) -> Option<SerialLine> {
    let (label, state) = line.split_once(':')?;
    let index = label.trim().strip_prefix("IR")?.parse::<u8>().ok()?;

    match state.trim() {
        "BLOCKED" => Some(SerialLine::Infrared { index, blocked: true }),
        "CLEAR" => Some(SerialLine::Infrared { index, blocked: false }),
        _ => None,
    }
}

/// "[COIN] ... Value: <v> ... Total: <t>"
fn parse_coin(line: &str) -> Option<SerialLine> {
    if !line.starts_with("[COIN]") {
        return None;
    }

    let mut value = None;
    let mut total = None;
    let mut tokens = line.split_whitespace().peekable();
    while let Some(token) = tokens.next() {
        match token {
            "Value:" => value = tokens.peek().and_then(|v| v.parse::<u32>().ok()),
            "Total:" => total = tokens.peek().and_then(|v| v.parse::<u32>().ok()),
            _ => {}
        }
    }

    value.map(|value| SerialLine::Coin { value, total })
}

/// "BILL" bare or "BILL INSERTED: <amt>"
fn parse_bill(line: &str) -> Option<SerialLine> {
    if line == "BILL" {
        return Some(SerialLine::Bill { amount: None });
    }
    let amount = line.strip_prefix("BILL INSERTED:")?.trim().parse::<u32>().ok()?;
    Some(SerialLine::Bill { amount: Some(amount) })
}

/// Handle to one physical serial line. Pull state (latest readings) and
/// push subscriptions both hang off this; exactly one task owns the
/// actual port.
pub struct SharedSerialLink {
    device: String,
    baud: u32,
    connected: AtomicBool,
    temperatures: parking_lot::Mutex<FxHashMap<String, (f32, f32)>>,
    infrared: parking_lot::Mutex<FxHashMap<u8, bool>>,
    last_balance: parking_lot::Mutex<Option<u32>>,
    coin_subs: parking_lot::Mutex<Vec<mpsc::Sender<SerialLine>>>,
    bill_subs: parking_lot::Mutex<Vec<mpsc::Sender<SerialLine>>>,
    writer_tx: mpsc::Sender<String>,
}

impl SharedSerialLink {
    fn new(device: &str, baud: u32) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_BUFFER);
        let link = Arc::new(Self {
            device: device.to_string(),
            baud,
            connected: AtomicBool::new(false),
            temperatures: parking_lot::Mutex::new(FxHashMap::default()),
            infrared: parking_lot::Mutex::new(FxHashMap::default()),
            last_balance: parking_lot::Mutex::new(None),
            coin_subs: parking_lot::Mutex::new(Vec::new()),
            bill_subs: parking_lot::Mutex::new(Vec::new()),
            writer_tx,
        });
        (link, writer_rx)
    }

    /// Handle with no backing port task. Reads stay empty, writes are
    /// dropped - the state a live handle enters when its open fails.
    pub fn disconnected(device: &str, baud: u32) -> Arc<Self> {
        let (link, _writer_rx) = Self::new(device, baud);
        link
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Latest reading for a temperature label
    pub fn latest_temperature(&self, label: &str) -> Option<(f32, f32)> {
        self.temperatures.lock().get(label).copied()
    }

    /// Latest obstruction state of one infra-red sensor
    pub fn infrared(&self, index: u8) -> Option<bool> {
        self.infrared.lock().get(&index).copied()
    }

    /// Latest balance reported by the coin acceptor
    pub fn last_balance(&self) -> Option<u32> {
        *self.last_balance.lock()
    }

    /// Subscribe to coin and balance lines
    pub fn subscribe_coin(&self) -> mpsc::Receiver<SerialLine> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.coin_subs.lock().push(tx);
        rx
    }

    /// Subscribe to bill lines
    pub fn subscribe_bill(&self) -> mpsc::Receiver<SerialLine> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.bill_subs.lock().push(tx);
        rx
    }

    /// Queue one outbound command line. Returns false when the link is
    /// down or the write queue is full.
    pub fn send_line(&self, line: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.writer_tx.try_send(line.to_string()).is_ok()
    }

    /// Classify and dispatch one inbound line
    pub(crate) fn dispatch_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        match classify_line(line) {
            Some(SerialLine::Temperature { label, celsius, humidity }) => {
                debug!(label = %label, celsius = %celsius, humidity = %humidity, "serial_mux_temperature");
                self.temperatures.lock().insert(label, (celsius, humidity));
            }
            Some(SerialLine::Infrared { index, blocked }) => {
                debug!(index = %index, blocked = %blocked, "serial_mux_infrared");
                self.infrared.lock().insert(index, blocked);
            }
            Some(coin @ SerialLine::Coin { .. }) => {
                if let SerialLine::Coin { total: Some(total), .. } = &coin {
                    *self.last_balance.lock() = Some(*total);
                }
                fan_out(&self.coin_subs, coin);
            }
            Some(balance @ SerialLine::Balance { .. }) => {
                if let SerialLine::Balance { total } = &balance {
                    *self.last_balance.lock() = Some(*total);
                }
                fan_out(&self.coin_subs, balance);
            }
            Some(bill @ SerialLine::Bill { .. }) => {
                fan_out(&self.bill_subs, bill);
            }
            None => {
                debug!(line = %line, "serial_mux_unmatched_line");
            }
        }
    }
}

/// Deliver to every live subscriber; closed subscribers are pruned,
/// full ones lose this message rather than blocking the read loop.
fn fan_out(subs: &parking_lot::Mutex<Vec<mpsc::Sender<SerialLine>>>, line: SerialLine) {
    subs.lock().retain(|tx| match tx.try_send(line.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("serial_mux_subscriber_full");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

/// Registry of shared serial links, keyed by device path and baud.
/// `open` is idempotent: there is never more than one live handle (and
/// therefore one owning read loop) per physical path.
pub struct SerialMuxRegistry {
    links: parking_lot::Mutex<FxHashMap<String, Arc<SharedSerialLink>>>,
    shutdown: watch::Receiver<bool>,
}

impl SerialMuxRegistry {
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self { links: parking_lot::Mutex::new(FxHashMap::default()), shutdown }
    }

    /// Open (or return the existing handle for) a physical serial line
    pub fn open(&self, device: &str, baud: u32) -> Arc<SharedSerialLink> {
        let key = format!("{}@{}", device, baud);
        let mut links = self.links.lock();

        if let Some(link) = links.get(&key) {
            return link.clone();
        }

        let (link, writer_rx) = SharedSerialLink::new(device, baud);
        links.insert(key, link.clone());

        let task_link = link.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            run_link(task_link, writer_rx, shutdown).await;
        });

        link
    }
}

/// Own the port: read loop plus serialized writes
async fn run_link(
    link: Arc<SharedSerialLink>,
    mut writer_rx: mpsc::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let port = match tokio_serial::new(&link.device, link.baud)
        .timeout(Duration::from_millis(100))
        .open_native_async()
    {
        Ok(p) => {
            info!(device = %link.device, baud = %link.baud, "serial_mux_port_opened");
            link.connected.store(true, Ordering::Relaxed);
            p
        }
        Err(e) => {
            // Permanently disconnected; callers tolerate empty reads
            error!(device = %link.device, error = %e, "serial_mux_port_open_failed");
            return;
        }
    };

    let (mut read_half, mut write_half) = tokio::io::split(port);

    let device = link.device.clone();
    let write_task = tokio::spawn(async move {
        while let Some(line) = writer_rx.recv().await {
            let framed = format!("{}\n", line);
            if let Err(e) = write_half.write_all(framed.as_bytes()).await {
                error!(device = %device, error = %e, "serial_mux_write_error");
                return;
            }
            debug!(device = %device, line = %line, "serial_mux_line_sent");
        }
    });

    let mut buf = [0u8; 256];
    let mut acc = BytesMut::with_capacity(1024);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(device = %link.device, "serial_mux_shutdown");
                    break;
                }
            }
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        // Treat EOF like a quiet line; serial devices report
                        // zero-length reads between frames
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                    Ok(n) => {
                        acc.extend_from_slice(&buf[..n]);
                        drain_lines(&link, &mut acc);
                    }
                    Err(e) if e.kind() == ErrorKind::TimedOut => {}
                    Err(e) => {
                        error!(device = %link.device, error = %e, "serial_mux_read_error");
                        break;
                    }
                }
            }
        }
    }

    link.connected.store(false, Ordering::Relaxed);
    write_task.abort();
}

/// Split accumulated bytes on newlines and dispatch complete lines
fn drain_lines(link: &SharedSerialLink, acc: &mut BytesMut) {
    while let Some(pos) = acc.iter().position(|&b| b == b'\n') {
        let raw = acc.split_to(pos + 1);
        let line = String::from_utf8_lossy(&raw[..pos]).to_string();
        link.dispatch_line(&line);
    }

    // Guard against a line that never terminates (noise storm)
    if acc.len() > 4096 {
        warn!(device = %link.device(), discarded = acc.len(), "serial_mux_line_overflow");
        acc.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_temperature() {
        assert_eq!(
            classify_line("CABINET: 23.5C 45.0%"),
            Some(SerialLine::Temperature {
                label: "CABINET".to_string(),
                celsius: 23.5,
                humidity: 45.0
            })
        );
        assert_eq!(classify_line("CABINET: 23.5C"), None);
        assert_eq!(classify_line("CABINET: 23.5 45.0"), None);
    }

    #[test]
    fn test_classify_infrared() {
        assert_eq!(classify_line("IR1: BLOCKED"), Some(SerialLine::Infrared { index: 1, blocked: true }));
        assert_eq!(classify_line("IR12: CLEAR"), Some(SerialLine::Infrared { index: 12, blocked: false }));
        assert_eq!(classify_line("IR1: OPEN"), None);
    }

    #[test]
    fn test_classify_coin() {
        assert_eq!(
            classify_line("[COIN] Inserted Value: 5 Total: 25"),
            Some(SerialLine::Coin { value: 5, total: Some(25) })
        );
        assert_eq!(
            classify_line("[COIN] Value: 10"),
            Some(SerialLine::Coin { value: 10, total: None })
        );
        // Value is mandatory
        assert_eq!(classify_line("[COIN] Total: 25"), None);
    }

    #[test]
    fn test_classify_balance_and_bill() {
        assert_eq!(classify_line("BALANCE: 45"), Some(SerialLine::Balance { total: 45 }));
        assert_eq!(classify_line("BILL"), Some(SerialLine::Bill { amount: None }));
        assert_eq!(
            classify_line("BILL INSERTED: 100"),
            Some(SerialLine::Bill { amount: Some(100) })
        );
    }

    #[test]
    fn test_classify_unmatched() {
        assert_eq!(classify_line("garbage ~~ line"), None);
        assert_eq!(classify_line(""), None);
        assert_eq!(classify_line("BALANCE: abc"), None);
    }

    #[test]
    fn test_dispatch_updates_pull_state() {
        let link = SharedSerialLink::disconnected("/dev/test0", 115200);

        link.dispatch_line("CABINET: 4.0C 60.0%\r");
        link.dispatch_line("IR2: BLOCKED");
        link.dispatch_line("BALANCE: 30");
        link.dispatch_line("not a real line");

        assert_eq!(link.latest_temperature("CABINET"), Some((4.0, 60.0)));
        assert_eq!(link.infrared(2), Some(true));
        assert_eq!(link.infrared(9), None);
        assert_eq!(link.last_balance(), Some(30));
    }

    #[tokio::test]
    async fn test_subscribers_receive_coin_and_bill_lines() {
        let link = SharedSerialLink::disconnected("/dev/test0", 115200);
        let mut coin_rx = link.subscribe_coin();
        let mut bill_rx = link.subscribe_bill();

        link.dispatch_line("[COIN] Value: 5 Total: 5");
        link.dispatch_line("BALANCE: 5");
        link.dispatch_line("BILL INSERTED: 50");

        assert_eq!(coin_rx.recv().await, Some(SerialLine::Coin { value: 5, total: Some(5) }));
        assert_eq!(coin_rx.recv().await, Some(SerialLine::Balance { total: 5 }));
        assert_eq!(bill_rx.recv().await, Some(SerialLine::Bill { amount: Some(50) }));
    }

    #[test]
    fn test_coin_line_refreshes_balance() {
        let link = SharedSerialLink::disconnected("/dev/test0", 115200);
        link.dispatch_line("[COIN] Value: 10 Total: 40");
        assert_eq!(link.last_balance(), Some(40));
    }

    #[test]
    fn test_disconnected_link_drops_writes() {
        let link = SharedSerialLink::disconnected("/dev/test0", 115200);
        assert!(!link.is_connected());
        assert!(!link.send_line("GET_BALANCE"));
    }

    #[tokio::test]
    async fn test_registry_open_is_idempotent() {
        let (_tx, rx) = watch::channel(false);
        let registry = SerialMuxRegistry::new(rx);

        let a = registry.open("/dev/ttyV0", 115200);
        let b = registry.open("/dev/ttyV0", 115200);
        let c = registry.open("/dev/ttyV0", 9600);

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
