//! Typed channel feeding the (external) kiosk UI
//!
//! The screens live in another process layer; this side only ever
//! pushes. Bounded mpsc with try_send keeps hardware paths non-blocking:
//! a stalled UI loses refreshes, it never stalls a dispense.

use crate::domain::types::epoch_ms;
use crate::infra::metrics::Metrics;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Messages the UI layer consumes
#[derive(Debug, Clone)]
pub enum UiMessage {
    /// Running payment total changed
    PaymentUpdate(PaymentUpdatePayload),
    /// Change-dispense progress text
    ChangeStatus(ChangeStatusPayload),
    /// Per-slot dispense resolution
    Dispense(DispensePayload),
    /// Raw infra-red sensor reading for the status display
    Sensor(SensorPayload),
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentUpdatePayload {
    /// Pesos collected so far this session
    pub collected: u32,
    /// Session target amount
    pub required: u32,
    /// Timestamp (epoch ms)
    pub ts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeStatusPayload {
    pub text: String,
    pub ts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispensePayload {
    pub slot: u8,
    pub item: String,
    /// confirmed, timed_out, pulse_failed, pulsed
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    pub ts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorPayload {
    pub index: u8,
    pub blocked: bool,
    pub ts: u64,
}

/// Sender handle for UI messages
///
/// Clone this to share across producers. Non-blocking: if the channel
/// is full, messages are dropped and counted.
#[derive(Clone)]
pub struct UiSender {
    tx: mpsc::Sender<UiMessage>,
    metrics: Arc<Metrics>,
}

impl UiSender {
    pub fn new(tx: mpsc::Sender<UiMessage>, metrics: Arc<Metrics>) -> Self {
        Self { tx, metrics }
    }

    fn push(&self, message: UiMessage) {
        if self.tx.try_send(message).is_err() {
            self.metrics.record_ui_message_dropped();
        }
    }

    pub fn send_payment_update(&self, collected: u32, required: u32) {
        self.push(UiMessage::PaymentUpdate(PaymentUpdatePayload {
            collected,
            required,
            ts: epoch_ms(),
        }));
    }

    pub fn send_change_status(&self, text: &str) {
        self.push(UiMessage::ChangeStatus(ChangeStatusPayload {
            text: text.to_string(),
            ts: epoch_ms(),
        }));
    }

    pub fn send_dispense(&self, slot: u8, item: &str, status: &str, elapsed_ms: Option<u64>) {
        self.push(UiMessage::Dispense(DispensePayload {
            slot,
            item: item.to_string(),
            status: status.to_string(),
            elapsed_ms,
            ts: epoch_ms(),
        }));
    }

    pub fn send_sensor(&self, index: u8, blocked: bool) {
        self.push(UiMessage::Sensor(SensorPayload { index, blocked, ts: epoch_ms() }));
    }
}

/// Create a new UI channel pair
pub fn create_ui_channel(
    buffer_size: usize,
    metrics: Arc<Metrics>,
) -> (UiSender, mpsc::Receiver<UiMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (UiSender::new(tx, metrics), rx)
}
