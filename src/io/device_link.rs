//! Request/response client for the remote actuator boards
//!
//! Protocol:
//! - Newline-terminated ASCII, one command line in, one response line out
//! - TCP transport: one cached socket per target, reused across calls
//! - Serial transport: port opened and closed per call
//! - On error/timeout the cached socket is discarded; the next attempt
//!   reconnects
//!
//! A timeout is an *unknown outcome*: the actuator may have executed the
//! physical action even though the response was lost. Callers must not
//! assume failure.

use crate::infra::config::LinkMode;
use crate::infra::metrics::Metrics;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, warn};

/// Largest response line the boards ever produce
const MAX_RESPONSE_LEN: usize = 512;

#[derive(Debug, Error)]
pub enum DeviceError {
    /// The link could not be opened or used at all
    #[error("transport unavailable: {0}")]
    Transport(String),
    /// No parseable response within the deadline
    #[error("no response within {0} ms")]
    Timeout(u64),
    /// The device answered with an explicit rejection
    #[error("device rejected command: {0}")]
    Rejected(String),
}

/// Address of one actuator board
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceTarget {
    Tcp { host: String, port: u16 },
    Serial { device: String, baud: u32 },
}

impl DeviceTarget {
    /// Stable cache key for the socket map
    pub fn key(&self) -> String {
        match self {
            DeviceTarget::Tcp { host, port } => format!("tcp:{}:{}", host, port),
            DeviceTarget::Serial { device, baud } => format!("serial:{}:{}", device, baud),
        }
    }

    /// Build a target from the link fields every device config section carries
    pub fn from_link(mode: &LinkMode, host: &str, port: u16, device: &str, baud: u32) -> Self {
        match mode {
            LinkMode::Tcp => DeviceTarget::Tcp { host: host.to_string(), port },
            LinkMode::Serial => DeviceTarget::Serial { device: device.to_string(), baud },
        }
    }
}

impl std::fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// Client over both transports with per-target socket caching
pub struct DeviceLinkClient {
    sockets: Mutex<FxHashMap<String, TcpStream>>,
    retry_backoff: Duration,
    metrics: Arc<Metrics>,
}

impl DeviceLinkClient {
    pub fn new(retry_backoff: Duration, metrics: Arc<Metrics>) -> Self {
        Self { sockets: Mutex::new(FxHashMap::default()), retry_backoff, metrics }
    }

    /// Send one command and wait for the single response line.
    ///
    /// `retries` is the total attempt count (minimum 1). Each failed
    /// attempt is followed by a short fixed backoff; the error of the
    /// final attempt is returned.
    pub async fn send(
        &self,
        target: &DeviceTarget,
        command: &str,
        timeout: Duration,
        retries: u32,
    ) -> Result<String, DeviceError> {
        let attempts = retries.max(1);
        let mut last_err = DeviceError::Transport("no attempt made".to_string());

        for attempt in 1..=attempts {
            let start = Instant::now();
            match self.attempt(target, command, timeout).await {
                Ok(response) => {
                    let latency_us = start.elapsed().as_micros() as u64;
                    self.metrics.record_device_command(latency_us);
                    debug!(
                        target = %target,
                        command = %command,
                        response = %response,
                        latency_us = %latency_us,
                        "device_response"
                    );
                    return Ok(response);
                }
                Err(e) => {
                    warn!(
                        target = %target,
                        command = %command,
                        attempt = %attempt,
                        error = %e,
                        "device_attempt_failed"
                    );
                    last_err = e;
                    if attempt < attempts {
                        self.metrics.record_device_retry();
                        tokio::time::sleep(self.retry_backoff).await;
                    }
                }
            }
        }

        match &last_err {
            DeviceError::Timeout(_) => self.metrics.record_device_timeout(),
            _ => self.metrics.record_link_error(),
        }
        Err(last_err)
    }

    async fn attempt(
        &self,
        target: &DeviceTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<String, DeviceError> {
        match target {
            DeviceTarget::Tcp { host, port } => {
                self.tcp_attempt(target, host, *port, command, timeout).await
            }
            DeviceTarget::Serial { device, baud } => {
                serial_attempt(device, *baud, command, timeout).await
            }
        }
    }

    /// One TCP exchange. The cached socket is tried first; if it fails
    /// mid-call an ephemeral fallback connection is made within the same
    /// attempt. Timeouts always discard the socket.
    async fn tcp_attempt(
        &self,
        target: &DeviceTarget,
        host: &str,
        port: u16,
        command: &str,
        timeout: Duration,
    ) -> Result<String, DeviceError> {
        let key = target.key();
        let mut sockets = self.sockets.lock().await;

        let cached = sockets.remove(&key);
        let had_cached = cached.is_some();

        let mut stream = match cached {
            Some(stream) => stream,
            None => connect_tcp(host, port, timeout).await?,
        };

        match exchange(&mut stream, command, timeout).await {
            Ok(response) => {
                sockets.insert(key, stream);
                Ok(response)
            }
            Err(DeviceError::Transport(e)) if had_cached => {
                // Stale cached socket; one ephemeral fallback in the same call
                debug!(target = %key, error = %e, "device_cached_socket_stale");
                drop(stream);
                let mut fresh = connect_tcp(host, port, timeout).await?;
                match exchange(&mut fresh, command, timeout).await {
                    Ok(response) => {
                        sockets.insert(key, fresh);
                        Ok(response)
                    }
                    Err(e) => Err(e),
                }
            }
            // Socket stays discarded; the next attempt reconnects
            Err(e) => Err(e),
        }
    }

    /// Drop any cached connection for the target
    pub async fn disconnect(&self, target: &DeviceTarget) {
        self.sockets.lock().await.remove(&target.key());
    }
}

async fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, DeviceError> {
    let addr = format!("{}:{}", host, port);
    let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| DeviceError::Transport(format!("connect to {} timed out", addr)))?
        .map_err(|e| DeviceError::Transport(format!("connect to {}: {}", addr, e)))?;
    stream
        .set_nodelay(true)
        .map_err(|e| DeviceError::Transport(format!("set_nodelay: {}", e)))?;
    Ok(stream)
}

/// Serial transport opens and closes the port per call
async fn serial_attempt(
    device: &str,
    baud: u32,
    command: &str,
    timeout: Duration,
) -> Result<String, DeviceError> {
    let mut port = tokio_serial::new(device, baud)
        .timeout(Duration::from_millis(100))
        .open_native_async()
        .map_err(|e| DeviceError::Transport(format!("open {}: {}", device, e)))?;

    exchange(&mut port, command, timeout).await
}

/// Write the command line and read one newline-terminated response
async fn exchange<S>(stream: &mut S, command: &str, timeout: Duration) -> Result<String, DeviceError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = format!("{}\n", command);
    tokio::time::timeout(timeout, stream.write_all(line.as_bytes()))
        .await
        .map_err(|_| DeviceError::Timeout(timeout.as_millis() as u64))?
        .map_err(|e| DeviceError::Transport(format!("write: {}", e)))?;

    read_response_line(stream, timeout).await
}

async fn read_response_line<S>(stream: &mut S, timeout: Duration) -> Result<String, DeviceError>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + timeout;
    let mut acc = BytesMut::with_capacity(128);
    let mut buf = [0u8; 128];

    loop {
        if let Some(pos) = acc.iter().position(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(&acc[..pos]).trim().to_string();
            return Ok(line);
        }
        if acc.len() > MAX_RESPONSE_LEN {
            return Err(DeviceError::Transport("response line too long".to_string()));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(DeviceError::Timeout(timeout.as_millis() as u64));
        }

        match tokio::time::timeout(remaining, stream.read(&mut buf)).await {
            Ok(Ok(0)) => return Err(DeviceError::Transport("connection closed".to_string())),
            Ok(Ok(n)) => acc.extend_from_slice(&buf[..n]),
            Ok(Err(e)) => return Err(DeviceError::Transport(format!("read: {}", e))),
            Err(_) => return Err(DeviceError::Timeout(timeout.as_millis() as u64)),
        }
    }
}

/// A client bound to one target with its configured timeout and retry
/// count. The actuator command set maps 1:1 onto protocol lines.
#[derive(Clone)]
pub struct DeviceEndpoint {
    client: Arc<DeviceLinkClient>,
    target: DeviceTarget,
    timeout: Duration,
    retries: u32,
}

impl DeviceEndpoint {
    pub fn new(
        client: Arc<DeviceLinkClient>,
        target: DeviceTarget,
        timeout: Duration,
        retries: u32,
    ) -> Self {
        Self { client, target, timeout, retries }
    }

    pub fn target(&self) -> &DeviceTarget {
        &self.target
    }

    pub async fn send(&self, command: &str) -> Result<String, DeviceError> {
        self.client.send(&self.target, command, self.timeout, self.retries).await
    }

    /// Send with a custom deadline (hopper tranches scale with coin count)
    pub async fn send_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<String, DeviceError> {
        self.client.send(&self.target, command, timeout, self.retries).await
    }

    pub async fn status(&self) -> Result<String, DeviceError> {
        self.send("STATUS").await
    }

    pub async fn pulse(&self, slot: u8, duration_ms: u64) -> Result<String, DeviceError> {
        self.send(&format!("PULSE {} {}", slot, duration_ms)).await
    }

    pub async fn open_slot(&self, slot: u8) -> Result<String, DeviceError> {
        self.send(&format!("OPEN {}", slot)).await
    }

    pub async fn close_slot(&self, slot: u8) -> Result<String, DeviceError> {
        self.send(&format!("CLOSE {}", slot)).await
    }
}
