//! Slot dispense coordination
//!
//! Resolves an item name to its assigned slots, spreads quantity
//! round-robin across them, and routes each pulse: slots 1-48 go out
//! over the actuator protocol, slots 49-64 drive the local multiplexer
//! board. One failed unit never aborts the rest of the order.

use crate::domain::types::{SlotTable, DIRECT_SLOT_MAX};
use crate::infra::metrics::Metrics;
use crate::io::device_link::{DeviceEndpoint, DeviceError};
use crate::io::mux_board::ChannelMuxController;
use crate::io::ui_channel::UiSender;
use crate::services::confirm::DispenseConfirmationMonitor;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-unit outcome of a dispense order
#[derive(Debug, Clone, PartialEq)]
pub struct UnitDispatch {
    pub slot: u8,
    pub pulsed: bool,
}

/// Routes dispense orders to the physical slots
pub struct SlotDispenseCoordinator {
    table: Arc<SlotTable>,
    actuator: DeviceEndpoint,
    mux: Arc<ChannelMuxController>,
    monitor: Option<Arc<DispenseConfirmationMonitor>>,
    pulse_ms: u64,
    confirm_timeout_secs: u64,
    metrics: Arc<Metrics>,
    ui: Option<UiSender>,
}

impl SlotDispenseCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        table: Arc<SlotTable>,
        actuator: DeviceEndpoint,
        mux: Arc<ChannelMuxController>,
        monitor: Option<Arc<DispenseConfirmationMonitor>>,
        pulse_ms: u64,
        confirm_timeout_secs: u64,
        metrics: Arc<Metrics>,
        ui: Option<UiSender>,
    ) -> Self {
        Self { table, actuator, mux, monitor, pulse_ms, confirm_timeout_secs, metrics, ui }
    }

    /// Dispense `quantity` units of an item. Fails fast only when the
    /// item has no slot at all; per-unit failures are reported in the
    /// result and the order continues.
    pub async fn dispense_item(
        &self,
        item: &str,
        quantity: u32,
    ) -> Result<Vec<UnitDispatch>, DeviceError> {
        let slots = self.table.slots_for_item(item);
        if slots.is_empty() {
            return Err(DeviceError::Rejected(format!("no slot assigned for {}", item)));
        }

        info!(item = %item, quantity = %quantity, slots = ?slots, "dispense_order");
        let mut results = Vec::with_capacity(quantity as usize);

        for unit in 0..quantity {
            let slot = slots[unit as usize % slots.len()];
            results.push(self.dispense_unit(slot, item).await);
        }

        Ok(results)
    }

    async fn dispense_unit(&self, slot: u8, item: &str) -> UnitDispatch {
        // Arm the window before pulsing so a fast physical drop is not missed
        if let Some(monitor) = &self.monitor {
            monitor.start(slot, self.confirm_timeout_secs, item);
        }

        // Best-effort pre-check; a failure here is logged, never fatal
        if slot <= DIRECT_SLOT_MAX {
            match self.actuator.status().await {
                Ok(status) => debug!(slot = %slot, status = %status, "dispense_precheck"),
                Err(e) => warn!(slot = %slot, error = %e, "dispense_precheck_failed"),
            }
        }

        let mut outcome = self.pulse_slot(slot).await;
        if let Err(e) = &outcome {
            warn!(slot = %slot, error = %e, "dispense_pulse_retry");
            outcome = self.pulse_slot(slot).await;
        }

        match outcome {
            Ok(()) => {
                if let Some(ui) = &self.ui {
                    ui.send_dispense(slot, item, "pulsed", None);
                }
                UnitDispatch { slot, pulsed: true }
            }
            Err(e) => {
                warn!(slot = %slot, item = %item, error = %e, "dispense_pulse_failed");
                // A rejected or undeliverable command definitely did not
                // fire the motor; a timeout is an unknown outcome and the
                // armed window stays to catch a late drop.
                if !matches!(e, DeviceError::Timeout(_)) {
                    if let Some(monitor) = &self.monitor {
                        monitor.cancel(slot);
                    }
                }
                if let Some(ui) = &self.ui {
                    ui.send_dispense(slot, item, "pulse_failed", None);
                }
                UnitDispatch { slot, pulsed: false }
            }
        }
    }

    async fn pulse_slot(&self, slot: u8) -> Result<(), DeviceError> {
        self.metrics.record_slot_pulse();

        if slot <= DIRECT_SLOT_MAX {
            let response = self.actuator.pulse(slot, self.pulse_ms).await?;
            if response.contains("OK") {
                Ok(())
            } else {
                Err(DeviceError::Rejected(response))
            }
        } else {
            // Local addressing, no round-trip protocol
            self.mux.pulse_channel(slot, self.pulse_ms).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::config::{ConfirmConfig, DetectionMode};
    use crate::io::device_link::{DeviceLinkClient, DeviceTarget};
    use crate::io::mux_board::MuxBoardIo;
    use crate::io::serial_mux::SharedSerialLink;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Actuator stand-in: scripted responses for PULSE, OK for STATUS
    async fn spawn_actuator(
        pulse_responses: Vec<&'static str>,
    ) -> (u16, Arc<parking_lot::Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let commands = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = commands.clone();

        tokio::spawn(async move {
            let mut script = pulse_responses.into_iter();
            loop {
                let Ok((socket, _)) = listener.accept().await else { return };
                let (read_half, mut write_half) = socket.into_split();
                let mut lines = BufReader::new(read_half).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let response = if line.starts_with("PULSE") {
                        script.next().unwrap_or("OK")
                    } else {
                        "OK"
                    };
                    seen.lock().push(line);
                    if write_half
                        .write_all(format!("{}\n", response).as_bytes())
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        });

        (port, commands)
    }

    struct NullBoard;

    impl MuxBoardIo for NullBoard {
        fn set_select(&mut self, _line: usize, _high: bool) {}
        fn set_signal(&mut self, _high: bool) {}
        fn read_signal(&mut self) -> bool {
            false
        }
    }

    fn test_table() -> Arc<SlotTable> {
        Arc::new(SlotTable::new(vec![
            (1, "Cola".to_string()),
            (2, "Cola".to_string()),
            (7, "Chips".to_string()),
            (49, "Candy".to_string()),
        ]))
    }

    fn coordinator_for(
        port: u16,
        monitor: Option<Arc<DispenseConfirmationMonitor>>,
    ) -> SlotDispenseCoordinator {
        let metrics = Arc::new(Metrics::new());
        let client = Arc::new(DeviceLinkClient::new(Duration::from_millis(5), metrics.clone()));
        let actuator = DeviceEndpoint::new(
            client,
            DeviceTarget::Tcp { host: "127.0.0.1".to_string(), port },
            Duration::from_millis(500),
            1,
        );
        let mux =
            Arc::new(ChannelMuxController::new(Box::new(NullBoard), Duration::from_millis(1)));
        SlotDispenseCoordinator::new(test_table(), actuator, mux, monitor, 300, 8, metrics, None)
    }

    fn test_monitor() -> Arc<DispenseConfirmationMonitor> {
        let config = ConfirmConfig {
            sensors: vec![1],
            mode: DetectionMode::Any,
            poll_interval_ms: 10,
            default_timeout_secs: 5,
            samples: 1,
            sample_gap_ms: 0,
            simulate: false,
        };
        DispenseConfirmationMonitor::new(
            SharedSerialLink::disconnected("/dev/test-ir", 115200),
            config,
            Arc::new(Metrics::new()),
            None,
        )
    }

    #[tokio::test]
    async fn test_single_unit_prechecks_then_pulses() {
        let (port, commands) = spawn_actuator(vec!["OK"]).await;
        let coordinator = coordinator_for(port, None);

        let results = coordinator.dispense_item("Chips", 1).await.unwrap();

        assert_eq!(results, vec![UnitDispatch { slot: 7, pulsed: true }]);
        let commands = commands.lock();
        assert_eq!(commands.as_slice(), &["STATUS", "PULSE 7 300"]);
    }

    #[tokio::test]
    async fn test_round_robin_across_matching_slots() {
        let (port, commands) = spawn_actuator(vec!["OK", "OK", "OK"]).await;
        let coordinator = coordinator_for(port, None);

        let results = coordinator.dispense_item("Cola", 3).await.unwrap();

        let slots: Vec<u8> = results.iter().map(|r| r.slot).collect();
        assert_eq!(slots, vec![1, 2, 1]);
        let pulses: Vec<String> = commands
            .lock()
            .iter()
            .filter(|c| c.starts_with("PULSE"))
            .cloned()
            .collect();
        assert_eq!(pulses, vec!["PULSE 1 300", "PULSE 2 300", "PULSE 1 300"]);
    }

    #[tokio::test]
    async fn test_retry_once_then_continue() {
        // First unit: ERR then OK on retry. Second unit: ERR, ERR -> failed
        let (port, _) = spawn_actuator(vec!["ERR", "OK", "ERR", "ERR"]).await;
        let coordinator = coordinator_for(port, None);

        let results = coordinator.dispense_item("Cola", 2).await.unwrap();

        assert_eq!(
            results,
            vec![
                UnitDispatch { slot: 1, pulsed: true },
                UnitDispatch { slot: 2, pulsed: false },
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_item_rejected() {
        let (port, _) = spawn_actuator(vec![]).await;
        let coordinator = coordinator_for(port, None);

        let err = coordinator.dispense_item("Nothing", 1).await.unwrap_err();
        assert!(matches!(err, DeviceError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_high_slot_routes_to_multiplexer() {
        let (port, commands) = spawn_actuator(vec![]).await;
        let coordinator = coordinator_for(port, None);

        let results = coordinator.dispense_item("Candy", 1).await.unwrap();

        assert_eq!(results, vec![UnitDispatch { slot: 49, pulsed: true }]);
        // No actuator traffic for multiplexer slots, not even the pre-check
        assert!(commands.lock().is_empty());
    }

    #[tokio::test]
    async fn test_monitor_armed_before_pulse() {
        let (port, _) = spawn_actuator(vec!["OK"]).await;
        let monitor = test_monitor();
        let coordinator = coordinator_for(port, Some(monitor.clone()));

        coordinator.dispense_item("Chips", 1).await.unwrap();

        // Window stays armed awaiting sensor confirmation
        assert_eq!(monitor.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_pulse_cancels_window() {
        let (port, _) = spawn_actuator(vec!["ERR", "ERR"]).await;
        let monitor = test_monitor();
        let coordinator = coordinator_for(port, Some(monitor.clone()));

        let results = coordinator.dispense_item("Chips", 1).await.unwrap();

        assert!(!results[0].pulsed);
        // The motor definitely did not fire; no window left to time out
        assert_eq!(monitor.pending_count(), 0);
    }
}
