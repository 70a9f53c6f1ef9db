//! Payment session orchestration
//!
//! Idle -> Collecting -> {Completing | Cancelled} -> Idle.
//!
//! `start` resets both acceptors and installs generation-checked event
//! callbacks; crossing the required amount is the caller's decision and
//! the session keeps collecting until `stop` is called explicitly.
//! `stop` computes change, runs the hopper conversation with shared-link
//! polling paused around it, resets the acceptors and writes the
//! session record. Hardware failures come back in the status text -
//! this path never panics a kiosk with a customer in front of it.

use crate::domain::session_record::{
    SessionEvent, SessionEventType, SessionOutcome, SessionRecord,
};
use crate::domain::types::{BillAcceptor, CoinAcceptor, SessionStatus};
use crate::infra::metrics::Metrics;
use crate::io::egress::SessionEgress;
use crate::io::ui_channel::UiSender;
use crate::services::hopper::CoinHopperController;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Fired with the combined total after every accepted coin or bill
pub type AmountCallback = Arc<dyn Fn(u32) + Send + Sync>;
/// Fired with human-readable change-dispense progress
pub type StatusCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct ActiveSession {
    required: u32,
    on_update: AmountCallback,
    on_change_status: StatusCallback,
    record: SessionRecord,
}

/// State shared with the acceptor callbacks
struct SessionCore {
    status: parking_lot::Mutex<SessionStatus>,
    active: parking_lot::Mutex<Option<ActiveSession>>,
    /// Bumped on every start and stop; callbacks from a previous
    /// generation are discarded instead of racing the transition
    generation: AtomicU64,
}

/// One kiosk payment flow over the injected acceptor backends
pub struct PaymentSession {
    coins: Arc<dyn CoinAcceptor>,
    bills: Arc<dyn BillAcceptor>,
    hopper: Arc<CoinHopperController>,
    egress: Arc<SessionEgress>,
    metrics: Arc<Metrics>,
    ui: Option<UiSender>,
    core: Arc<SessionCore>,
}

impl PaymentSession {
    pub fn new(
        coins: Arc<dyn CoinAcceptor>,
        bills: Arc<dyn BillAcceptor>,
        hopper: Arc<CoinHopperController>,
        egress: Arc<SessionEgress>,
        metrics: Arc<Metrics>,
        ui: Option<UiSender>,
    ) -> Self {
        Self {
            coins,
            bills,
            hopper,
            egress,
            metrics,
            ui,
            core: Arc::new(SessionCore {
                status: parking_lot::Mutex::new(SessionStatus::Idle),
                active: parking_lot::Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.core.status.lock()
    }

    /// Begin collecting toward `required` pesos
    pub async fn start(
        &self,
        required: u32,
        on_update: AmountCallback,
        on_change_status: StatusCallback,
    ) {
        // Safety position before any cash is taken
        self.hopper.ensure_relays_off().await;

        let generation = self.core.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.coins.reset_amount();
        self.bills.reset_amount();

        {
            let mut active = self.core.active.lock();
            *active = Some(ActiveSession {
                required,
                on_update,
                on_change_status,
                record: SessionRecord::new(required),
            });
            *self.core.status.lock() = SessionStatus::Collecting;
        }

        self.install_callbacks(generation);
        self.metrics.record_session_started();
        info!(required = %required, "payment_session_started");
    }

    fn install_callbacks(&self, generation: u64) {
        let core = self.core.clone();
        let coins = self.coins.clone();
        let bills = self.bills.clone();
        let ui = self.ui.clone();
        self.coins.set_callback(Arc::new(move |event| {
            let amount = event.denomination.value();
            handle_cash_event(&core, &coins, &bills, &ui, generation, SessionEventType::Coin, amount);
        }));

        let core = self.core.clone();
        let coins = self.coins.clone();
        let bills = self.bills.clone();
        let ui = self.ui.clone();
        self.bills.set_callback(Arc::new(move |event| {
            handle_cash_event(
                &core,
                &coins,
                &bills,
                &ui,
                generation,
                SessionEventType::Bill,
                event.amount,
            );
        }));
    }

    /// End the session. With `required`, compute and dispense change;
    /// without it, cancel and report the collected total for a manual
    /// refund. Returns (total received, change dispensed, status text).
    pub async fn stop(&self, required: Option<u32>) -> (u32, u32, String) {
        // Invalidate in-flight callbacks before touching state
        self.core.generation.fetch_add(1, Ordering::SeqCst);

        let Some(mut session) = self.core.active.lock().take() else {
            warn!("payment_session_stop_without_start");
            return (0, 0, "No active session".to_string());
        };

        let coin_total = self.coins.received_amount();
        let bill_total = self.bills.received_amount();
        let total = coin_total + bill_total;
        session.record.coin_total = coin_total;
        session.record.bill_total = bill_total;

        let (change_dispensed, status_text) = match required {
            Some(required) => {
                *self.core.status.lock() = SessionStatus::Completing;
                session.record.add_event(
                    SessionEvent::new(SessionEventType::StopRequested).with_amount(required),
                );
                let result = self.complete(&mut session, total, required).await;
                self.metrics.record_session_completed();
                result
            }
            None => {
                *self.core.status.lock() = SessionStatus::Cancelled;
                let text = format!("Cancelled: refund {}", total);
                session.record.add_event(
                    SessionEvent::new(SessionEventType::Cancelled).with_amount(total),
                );
                session.record.complete(SessionOutcome::Cancelled, &text);
                self.metrics.record_session_cancelled();
                info!(collected = %total, "payment_session_cancelled");
                (0, text)
            }
        };

        // Always: safety position and fresh counters for the next customer
        self.hopper.ensure_relays_off().await;
        self.coins.reset_amount();
        self.bills.reset_amount();

        self.egress.write_record(&session.record);
        *self.core.status.lock() = SessionStatus::Idle;

        (total, change_dispensed, status_text)
    }

    /// Completion path: change computation and the hopper conversation
    async fn complete(
        &self,
        session: &mut ActiveSession,
        total: u32,
        required: u32,
    ) -> (u32, String) {
        let change = total.saturating_sub(required);
        info!(total = %total, required = %required, change = %change, "payment_session_completing");

        if change == 0 {
            session.record.complete(SessionOutcome::Completed, "");
            return (0, String::new());
        }

        session.record.change_requested = change;

        // The hopper conversation must not race the balance poll on a
        // shared physical link
        self.coins.pause_polling();

        let on_change_status = session.on_change_status.clone();
        let ui = self.ui.clone();
        let progress = move |text: &str| {
            on_change_status(text);
            if let Some(ui) = &ui {
                ui.send_change_status(text);
            }
        };
        let outcome = self.hopper.dispense_change(change, &progress).await;

        // Unconditionally, even after a failed conversation
        self.coins.resume_polling();

        session.record.change_dispensed = outcome.delivered;
        let status_text = if outcome.is_complete() {
            session.record.add_event(
                SessionEvent::new(SessionEventType::ChangeDispensed)
                    .with_amount(outcome.delivered),
            );
            format!("Change dispensed: {}", outcome.delivered)
        } else {
            let text = format!(
                "Change incomplete: dispensed {} of {} ({})",
                outcome.delivered,
                change,
                outcome.faults.join("; ")
            );
            session.record.add_event(
                SessionEvent::new(SessionEventType::ChangeFault)
                    .with_amount(outcome.delivered)
                    .with_extra(&outcome.faults.join("; ")),
            );
            warn!(
                requested = %change,
                delivered = %outcome.delivered,
                "payment_session_change_incomplete"
            );
            text
        };

        (session.on_change_status)(&status_text);
        if let Some(ui) = &self.ui {
            ui.send_change_status(&status_text);
        }

        session.record.complete(SessionOutcome::Completed, &status_text);
        (outcome.delivered, status_text)
    }
}

/// Shared tail of the coin and bill callbacks: discard stale events,
/// fold the acceptor totals, notify the caller.
fn handle_cash_event(
    core: &Arc<SessionCore>,
    coins: &Arc<dyn CoinAcceptor>,
    bills: &Arc<dyn BillAcceptor>,
    ui: &Option<UiSender>,
    generation: u64,
    event_type: SessionEventType,
    amount: u32,
) {
    if core.generation.load(Ordering::SeqCst) != generation {
        // Event from a session that already ended
        return;
    }
    if *core.status.lock() != SessionStatus::Collecting {
        return;
    }

    let coin_total = coins.received_amount();
    let bill_total = bills.received_amount();
    let combined = coin_total + bill_total;

    let mut active = core.active.lock();
    let Some(session) = active.as_mut() else { return };
    session.record.coin_total = coin_total;
    session.record.bill_total = bill_total;
    session.record.add_event(SessionEvent::new(event_type).with_amount(amount));

    info!(
        kind = %event_type.as_str(),
        amount = %amount,
        combined = %combined,
        required = %session.required,
        "payment_event"
    );

    (session.on_update)(combined);
    if let Some(ui) = ui {
        ui.send_payment_update(combined, session.required);
    }
}
