//! Channel multiplexer board control
//!
//! Slots 49-64 have no actuator-protocol address; they hang off a local
//! 16-channel multiplexer driven by 4 binary selector lines plus one
//! shared signal line. Selecting a channel and pulsing the signal line
//! fires that slot's motor.
//!
//! The board wiring is platform-specific and injected through
//! `MuxBoardIo`; this module owns the sequencing (select, settle,
//! pulse) and the slot-to-channel mapping.

use crate::domain::types::{MUX_SLOT_MIN, SLOT_MAX};
use crate::io::device_link::DeviceError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Selector line count; 2^4 channels
pub const SELECT_LINES: usize = 4;
/// Channels addressable by the selector
pub const CHANNEL_COUNT: u8 = 16;

/// Low-level line access to the board. `read_signal` temporarily
/// reconfigures the signal line as an input for diagnostic read-back
/// and must restore it as an output before returning.
pub trait MuxBoardIo: Send {
    fn set_select(&mut self, line: usize, high: bool);
    fn set_signal(&mut self, high: bool);
    fn read_signal(&mut self) -> bool;
}

/// Board stand-in that only traces, for hosts without the wiring
pub struct LoggingMuxBoard;

impl MuxBoardIo for LoggingMuxBoard {
    fn set_select(&mut self, line: usize, high: bool) {
        debug!(line = %line, high = %high, "mux_select_line");
    }

    fn set_signal(&mut self, high: bool) {
        debug!(high = %high, "mux_signal_line");
    }

    fn read_signal(&mut self) -> bool {
        false
    }
}

/// Driver for the selector board. The io mutex doubles as the pulse
/// lock: concurrent pulses serialize instead of interleaving line
/// writes.
pub struct ChannelMuxController {
    io: tokio::sync::Mutex<Box<dyn MuxBoardIo>>,
    settle: Duration,
}

impl ChannelMuxController {
    pub fn new(io: Box<dyn MuxBoardIo>, settle: Duration) -> Self {
        Self { io: tokio::sync::Mutex::new(io), settle }
    }

    /// Multiplexer channel for a slot number, if the slot routes here
    pub fn channel_for_slot(slot: u8) -> Option<u8> {
        if (MUX_SLOT_MIN..=SLOT_MAX).contains(&slot) {
            Some((slot - MUX_SLOT_MIN) % CHANNEL_COUNT)
        } else {
            None
        }
    }

    /// Drive the 4 selector lines to the channel's binary encoding
    pub async fn select_channel(&self, channel: u8) -> Result<(), DeviceError> {
        if channel >= CHANNEL_COUNT {
            return Err(DeviceError::Rejected(format!("channel {} out of range", channel)));
        }
        let mut io = self.io.lock().await;
        drive_select(io.as_mut(), channel);
        Ok(())
    }

    /// Select the slot's channel, settle, then hold the signal line high
    /// for the duration. Blocks the caller for the full sequence.
    pub async fn pulse_channel(&self, slot: u8, duration_ms: u64) -> Result<(), DeviceError> {
        let channel = Self::channel_for_slot(slot)
            .ok_or_else(|| DeviceError::Rejected(format!("slot {} not on multiplexer", slot)))?;

        let mut io = self.io.lock().await;
        drive_select(io.as_mut(), channel);
        tokio::time::sleep(self.settle).await;

        io.set_signal(true);
        tokio::time::sleep(Duration::from_millis(duration_ms)).await;
        io.set_signal(false);

        info!(slot = %slot, channel = %channel, duration_ms = %duration_ms, "mux_slot_pulsed");
        Ok(())
    }

    /// Same sequence off the caller's path
    pub fn pulse_channel_detached(
        self: &Arc<Self>,
        slot: u8,
        duration_ms: u64,
    ) -> JoinHandle<Result<(), DeviceError>> {
        let controller = self.clone();
        tokio::spawn(async move { controller.pulse_channel(slot, duration_ms).await })
    }

    /// Diagnostic read-back of the signal line
    pub async fn read_back(&self) -> bool {
        self.io.lock().await.read_signal()
    }
}

fn drive_select(io: &mut dyn MuxBoardIo, channel: u8) {
    for line in 0..SELECT_LINES {
        io.set_select(line, (channel >> line) & 1 == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        Select(usize, bool),
        Signal(bool),
        Read,
    }

    struct FakeBoard {
        ops: Arc<parking_lot::Mutex<Vec<Op>>>,
    }

    impl MuxBoardIo for FakeBoard {
        fn set_select(&mut self, line: usize, high: bool) {
            self.ops.lock().push(Op::Select(line, high));
        }

        fn set_signal(&mut self, high: bool) {
            self.ops.lock().push(Op::Signal(high));
        }

        fn read_signal(&mut self) -> bool {
            self.ops.lock().push(Op::Read);
            true
        }
    }

    fn controller() -> (ChannelMuxController, Arc<parking_lot::Mutex<Vec<Op>>>) {
        let ops = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let board = FakeBoard { ops: ops.clone() };
        (ChannelMuxController::new(Box::new(board), Duration::from_millis(1)), ops)
    }

    #[test]
    fn test_channel_for_slot_mapping() {
        assert_eq!(ChannelMuxController::channel_for_slot(49), Some(0));
        assert_eq!(ChannelMuxController::channel_for_slot(50), Some(1));
        assert_eq!(ChannelMuxController::channel_for_slot(64), Some(15));
        assert_eq!(ChannelMuxController::channel_for_slot(48), None);
        assert_eq!(ChannelMuxController::channel_for_slot(65), None);
        assert_eq!(ChannelMuxController::channel_for_slot(1), None);
    }

    #[tokio::test]
    async fn test_slot_49_selects_channel_zero_and_pulses() {
        let (controller, ops) = controller();

        controller.pulse_channel(49, 5).await.unwrap();

        let ops = ops.lock();
        assert_eq!(
            ops.as_slice(),
            &[
                Op::Select(0, false),
                Op::Select(1, false),
                Op::Select(2, false),
                Op::Select(3, false),
                Op::Signal(true),
                Op::Signal(false),
            ]
        );
    }

    #[tokio::test]
    async fn test_slot_64_selects_channel_fifteen() {
        let (controller, ops) = controller();

        controller.pulse_channel(64, 1).await.unwrap();

        let ops = ops.lock();
        assert_eq!(&ops[..4], &[
            Op::Select(0, true),
            Op::Select(1, true),
            Op::Select(2, true),
            Op::Select(3, true),
        ]);
    }

    #[tokio::test]
    async fn test_invalid_slot_rejected() {
        let (controller, ops) = controller();

        let err = controller.pulse_channel(12, 5).await.unwrap_err();
        assert!(matches!(err, DeviceError::Rejected(_)));
        assert!(ops.lock().is_empty());
    }

    #[tokio::test]
    async fn test_select_channel_binary_encoding() {
        let (controller, ops) = controller();

        controller.select_channel(0b1010).await.unwrap();

        let ops = ops.lock();
        assert_eq!(
            ops.as_slice(),
            &[
                Op::Select(0, false),
                Op::Select(1, true),
                Op::Select(2, false),
                Op::Select(3, true),
            ]
        );
    }

    #[tokio::test]
    async fn test_select_channel_out_of_range() {
        let (controller, _) = controller();
        assert!(controller.select_channel(16).await.is_err());
    }

    #[tokio::test]
    async fn test_detached_pulse_runs_same_sequence() {
        let ops = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let board = FakeBoard { ops: ops.clone() };
        let controller =
            Arc::new(ChannelMuxController::new(Box::new(board), Duration::from_millis(1)));

        controller.pulse_channel_detached(50, 2).await.unwrap().unwrap();

        let ops = ops.lock();
        assert!(ops.contains(&Op::Select(0, true)));
        assert_eq!(ops.last(), Some(&Op::Signal(false)));
    }

    #[tokio::test]
    async fn test_read_back() {
        let (controller, ops) = controller();
        assert!(controller.read_back().await);
        assert_eq!(ops.lock().as_slice(), &[Op::Read]);
    }
}
