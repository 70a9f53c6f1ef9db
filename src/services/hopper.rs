//! Change dispensing via the coin hopper board
//!
//! Protocol (newline ASCII, same link family as the slot actuator):
//! - `DISPENSE_DENOM <denom> <count> <timeoutMs>` - one tranche
//! - `DISPENSE_AMOUNT <amount> [timeoutMs]` - board-side split
//! - `COIN_OPEN/COIN_CLOSE <denom>`, `COIN_STATUS`, `RELAY_ON/RELAY_OFF`
//!
//! Success responses contain `OK` or `DONE`. `ERR`/`TIMEOUT` responses
//! may carry a `dispensed:<n>` hint; the outcome always reports pesos
//! actually delivered, never pesos requested.

use crate::domain::types::{ChangePlan, Denomination};
use crate::infra::config::HopperConfig;
use crate::infra::metrics::Metrics;
use crate::io::device_link::{DeviceEndpoint, DeviceError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Result of one change-dispense conversation
#[derive(Debug, Clone)]
pub struct DispenseOutcome {
    pub requested: u32,
    /// Pesos confirmed out of the hopper; a lost response counts as zero
    /// for its tranche even though the coins may have dropped
    pub delivered: u32,
    pub faults: Vec<String>,
}

impl DispenseOutcome {
    pub fn is_complete(&self) -> bool {
        self.delivered == self.requested && self.faults.is_empty()
    }
}

/// Parse the `dispensed:<n>` partial-delivery hint out of an error response
fn parse_dispensed_hint(response: &str) -> u32 {
    for token in response.split_whitespace() {
        if let Some(count) = token.strip_prefix("dispensed:") {
            return count.parse().unwrap_or(0);
        }
    }
    0
}

/// Driver for the two-tube (5 and 1 peso) hopper board
pub struct CoinHopperController {
    endpoint: DeviceEndpoint,
    tranche_base_ms: u64,
    per_coin_ms: u64,
    metrics: Arc<Metrics>,
}

impl CoinHopperController {
    pub fn new(endpoint: DeviceEndpoint, config: &HopperConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            endpoint,
            tranche_base_ms: config.tranche_base_ms,
            per_coin_ms: config.per_coin_ms,
            metrics,
        }
    }

    /// Deadline for one tranche scales with how many coins must drop
    fn tranche_timeout_ms(&self, count: u32) -> u64 {
        self.tranche_base_ms + self.per_coin_ms * u64::from(count)
    }

    /// Dispense exact change: the 5-peso tranche first, then the 1-peso
    /// tranche, each as its own command. Failures never abort the
    /// remaining tranches; the outcome carries what actually dropped.
    pub async fn dispense_change(
        &self,
        amount: u32,
        progress: &(dyn Fn(&str) + Send + Sync),
    ) -> DispenseOutcome {
        let plan = ChangePlan::for_amount(amount);
        let mut outcome = DispenseOutcome { requested: amount, delivered: 0, faults: Vec::new() };

        if plan.is_empty() {
            return outcome;
        }

        info!(amount = %amount, fives = %plan.fives, ones = %plan.ones, "hopper_dispense_start");

        for (denomination, count) in
            [(Denomination::Five, plan.fives), (Denomination::One, plan.ones)]
        {
            if count == 0 {
                continue;
            }
            self.dispense_tranche(denomination, count, progress, &mut outcome).await;
        }

        self.metrics.record_change(amount, outcome.delivered);
        info!(
            requested = %outcome.requested,
            delivered = %outcome.delivered,
            faults = %outcome.faults.len(),
            "hopper_dispense_done"
        );
        outcome
    }

    async fn dispense_tranche(
        &self,
        denomination: Denomination,
        count: u32,
        progress: &(dyn Fn(&str) + Send + Sync),
        outcome: &mut DispenseOutcome,
    ) {
        let value = denomination.value();
        let timeout_ms = self.tranche_timeout_ms(count);
        progress(&format!("Dispensing {} x {} peso", count, value));

        let command = format!("DISPENSE_DENOM {} {} {}", value, count, timeout_ms);
        // Wire deadline sits above the board's own tranche deadline
        let wire_timeout = Duration::from_millis(timeout_ms + 500);

        match self.endpoint.send_with_timeout(&command, wire_timeout).await {
            Ok(response) if response.contains("OK") || response.contains("DONE") => {
                outcome.delivered += value * count;
            }
            Ok(response) => {
                // Explicit ERR/TIMEOUT; trust the partial-delivery hint
                let dropped = parse_dispensed_hint(&response);
                outcome.delivered += value * dropped;
                warn!(
                    denom = %value,
                    requested = %count,
                    dropped = %dropped,
                    response = %response,
                    "hopper_tranche_rejected"
                );
                outcome.faults.push(format!(
                    "{}-peso tranche rejected: {} of {} dispensed",
                    value, dropped, count
                ));
            }
            Err(e) => {
                // Unknown outcome: the coins may have dropped anyway
                warn!(denom = %value, requested = %count, error = %e, "hopper_tranche_no_response");
                outcome
                    .faults
                    .push(format!("{}-peso tranche unconfirmed: {}", value, e));
            }
        }
    }

    /// Board-side split of a whole amount, for diagnostics
    pub async fn dispense_amount(&self, amount: u32) -> Result<String, DeviceError> {
        let timeout_ms = self.tranche_timeout_ms(amount);
        let wire_timeout = Duration::from_millis(timeout_ms + 500);
        self.endpoint
            .send_with_timeout(&format!("DISPENSE_AMOUNT {} {}", amount, timeout_ms), wire_timeout)
            .await
    }

    pub async fn open_coin(&self, denomination: Denomination) -> Result<String, DeviceError> {
        self.endpoint.send(&format!("COIN_OPEN {}", denomination.value())).await
    }

    pub async fn close_coin(&self, denomination: Denomination) -> Result<String, DeviceError> {
        self.endpoint.send(&format!("COIN_CLOSE {}", denomination.value())).await
    }

    pub async fn coin_status(&self) -> Result<String, DeviceError> {
        self.endpoint.send("COIN_STATUS").await
    }

    pub async fn relay_on(&self) -> Result<String, DeviceError> {
        self.endpoint.send("RELAY_ON").await
    }

    /// Safety: force the hopper relays off. Best-effort, called before
    /// and after every session regardless of outcome.
    pub async fn ensure_relays_off(&self) {
        match self.endpoint.send("RELAY_OFF").await {
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "hopper_relay_off_unconfirmed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::device_link::{DeviceLinkClient, DeviceTarget};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Hopper board stand-in: records commands, answers from a script
    async fn spawn_hopper_server(
        responses: Vec<&'static str>,
    ) -> (u16, Arc<parking_lot::Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let commands = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = commands.clone();

        tokio::spawn(async move {
            let mut script = responses.into_iter();
            loop {
                let Ok((socket, _)) = listener.accept().await else { return };
                let (read_half, mut write_half) = socket.into_split();
                let mut lines = BufReader::new(read_half).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    seen.lock().push(line);
                    let response = script.next().unwrap_or("OK");
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

    fn hopper_for(port: u16) -> CoinHopperController {
        let metrics = Arc::new(Metrics::new());
        let client = Arc::new(DeviceLinkClient::new(Duration::from_millis(5), metrics.clone()));
        let endpoint = DeviceEndpoint::new(
            client,
            DeviceTarget::Tcp { host: "127.0.0.1".to_string(), port },
            Duration::from_millis(500),
            1,
        );
        let config = crate::infra::config::Config::default().hopper().clone();
        CoinHopperController::new(endpoint, &config, metrics)
    }

    fn no_progress() -> impl Fn(&str) + Send + Sync {
        |_status: &str| {}
    }

    #[tokio::test]
    async fn test_dispense_three_ones() {
        let (port, commands) = spawn_hopper_server(vec!["OK"]).await;
        let hopper = hopper_for(port);

        let outcome = hopper.dispense_change(3, &no_progress()).await;

        assert_eq!(outcome.requested, 3);
        assert_eq!(outcome.delivered, 3);
        assert!(outcome.is_complete());

        let commands = commands.lock();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].starts_with("DISPENSE_DENOM 1 3 "));
    }

    #[tokio::test]
    async fn test_fives_tranche_before_ones() {
        let (port, commands) = spawn_hopper_server(vec!["OK", "DONE"]).await;
        let hopper = hopper_for(port);

        let outcome = hopper.dispense_change(13, &no_progress()).await;

        assert_eq!(outcome.delivered, 13);
        let commands = commands.lock();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].starts_with("DISPENSE_DENOM 5 2 "));
        assert!(commands[1].starts_with("DISPENSE_DENOM 1 3 "));
    }

    #[tokio::test]
    async fn test_partial_delivery_reported_truthfully() {
        let (port, _) = spawn_hopper_server(vec!["ERR jam dispensed:1", "OK"]).await;
        let hopper = hopper_for(port);

        let outcome = hopper.dispense_change(13, &no_progress()).await;

        // 1 of 2 fives dropped, plus the full ones tranche
        assert_eq!(outcome.delivered, 5 + 3);
        assert!(!outcome.is_complete());
        assert_eq!(outcome.faults.len(), 1);
        assert!(outcome.faults[0].contains("1 of 2"));
    }

    #[tokio::test]
    async fn test_zero_change_sends_nothing() {
        let (port, commands) = spawn_hopper_server(vec![]).await;
        let hopper = hopper_for(port);

        let outcome = hopper.dispense_change(0, &no_progress()).await;

        assert_eq!(outcome.delivered, 0);
        assert!(outcome.is_complete());
        assert!(commands.lock().is_empty());
    }

    #[tokio::test]
    async fn test_progress_text_per_tranche() {
        let (port, _) = spawn_hopper_server(vec!["OK", "OK"]).await;
        let hopper = hopper_for(port);

        let seen: Arc<parking_lot::Mutex<Vec<String>>> = Arc::new(parking_lot::Mutex::new(vec![]));
        let progress_log = seen.clone();
        let progress = move |status: &str| {
            progress_log.lock().push(status.to_string());
        };

        hopper.dispense_change(7, &progress).await;

        let seen = seen.lock();
        assert_eq!(seen.as_slice(), &["Dispensing 1 x 5 peso", "Dispensing 2 x 1 peso"]);
    }

    #[tokio::test]
    async fn test_relay_and_tube_command_formats() {
        let (port, commands) = spawn_hopper_server(vec![]).await;
        let hopper = hopper_for(port);

        hopper.open_coin(Denomination::Five).await.unwrap();
        hopper.close_coin(Denomination::Five).await.unwrap();
        hopper.coin_status().await.unwrap();
        hopper.relay_on().await.unwrap();
        hopper.ensure_relays_off().await;
        hopper.dispense_amount(7).await.unwrap();

        let commands = commands.lock();
        assert_eq!(&commands[..5], &[
            "COIN_OPEN 5",
            "COIN_CLOSE 5",
            "COIN_STATUS",
            "RELAY_ON",
            "RELAY_OFF",
        ]);
        assert!(commands[5].starts_with("DISPENSE_AMOUNT 7 "));
    }

    #[test]
    fn test_parse_dispensed_hint() {
        assert_eq!(parse_dispensed_hint("ERR jam dispensed:2"), 2);
        assert_eq!(parse_dispensed_hint("TIMEOUT dispensed:0"), 0);
        assert_eq!(parse_dispensed_hint("ERR no hint"), 0);
        assert_eq!(parse_dispensed_hint("dispensed:notanum"), 0);
    }

    #[tokio::test]
    async fn test_relay_off_best_effort_never_panics() {
        // No server at all: RELAY_OFF must swallow the transport error
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let hopper = hopper_for(port);
        hopper.ensure_relays_off().await;
    }
}
