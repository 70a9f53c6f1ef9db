//! Shared types for the kiosk control plane

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Highest slot addressable through the remote actuator protocol
pub const DIRECT_SLOT_MAX: u8 = 48;
/// First slot routed through the channel multiplexer board
pub const MUX_SLOT_MIN: u8 = 49;
/// Highest addressable slot
pub const SLOT_MAX: u8 = 64;

/// Coin face values the acceptors can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Denomination {
    One,
    Five,
    Ten,
}

impl Denomination {
    /// Face value in pesos
    #[inline]
    pub fn value(&self) -> u32 {
        match self {
            Denomination::One => 1,
            Denomination::Five => 5,
            Denomination::Ten => 10,
        }
    }

    /// Map a reported value back to a denomination
    pub fn from_value(value: u32) -> Option<Self> {
        match value {
            1 => Some(Denomination::One),
            5 => Some(Denomination::Five),
            10 => Some(Denomination::Ten),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Denomination::One => "1",
            Denomination::Five => "5",
            Denomination::Ten => "10",
        }
    }
}

/// A single accepted coin
#[derive(Debug, Clone, Copy)]
pub struct CoinEvent {
    pub denomination: Denomination,
    pub at: Instant,
    pub epoch_ms: u64,
}

impl CoinEvent {
    pub fn new(denomination: Denomination) -> Self {
        Self { denomination, at: Instant::now(), epoch_ms: epoch_ms() }
    }
}

/// A single accepted bill
#[derive(Debug, Clone, Copy)]
pub struct BillEvent {
    pub amount: u32,
    pub at: Instant,
    pub epoch_ms: u64,
}

impl BillEvent {
    pub fn new(amount: u32) -> Self {
        Self { amount, at: Instant::now(), epoch_ms: epoch_ms() }
    }
}

/// Payment session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Collecting,
    Completing,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Collecting => "collecting",
            SessionStatus::Completing => "completing",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

/// Per-slot dispense request lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispenseStatus {
    Pending,
    Confirmed,
    TimedOut,
    Cancelled,
}

impl DispenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispenseStatus::Pending => "pending",
            DispenseStatus::Confirmed => "confirmed",
            DispenseStatus::TimedOut => "timed_out",
            DispenseStatus::Cancelled => "cancelled",
        }
    }
}

/// Change breakdown for the two-coin hopper (5 and 1 peso tubes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangePlan {
    pub fives: u32,
    pub ones: u32,
}

impl ChangePlan {
    /// Optimal plan: with exactly these two denominations the greedy
    /// split is always minimal.
    #[inline]
    pub fn for_amount(amount: u32) -> Self {
        Self { fives: amount / 5, ones: amount % 5 }
    }

    #[inline]
    pub fn total(&self) -> u32 {
        self.fives * 5 + self.ones
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fives == 0 && self.ones == 0
    }
}

/// Read-only slot-to-item assignment table, owned by the catalog layer
/// and injected here. Slot numbers are 1..=64.
#[derive(Debug, Clone, Default)]
pub struct SlotTable {
    assignments: Vec<(u8, String)>,
}

impl SlotTable {
    pub fn new(mut assignments: Vec<(u8, String)>) -> Self {
        assignments.retain(|(slot, _)| (1..=SLOT_MAX).contains(slot));
        assignments.sort_by_key(|(slot, _)| *slot);
        Self { assignments }
    }

    /// All slots assigned to the given item name, in slot order
    pub fn slots_for_item(&self, item: &str) -> Vec<u8> {
        self.assignments
            .iter()
            .filter(|(_, name)| name == item)
            .map(|(slot, _)| *slot)
            .collect()
    }

    pub fn item_at(&self, slot: u8) -> Option<&str> {
        self.assignments
            .iter()
            .find(|(s, _)| *s == slot)
            .map(|(_, name)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

/// Callback fired for every accepted coin
pub type CoinCallback = Arc<dyn Fn(CoinEvent) + Send + Sync>;
/// Callback fired for every accepted bill
pub type BillCallback = Arc<dyn Fn(BillEvent) + Send + Sync>;

/// Common surface over the coin-acceptor backends: direct-pulse GPIO,
/// dedicated textual protocol, or shared-reader-backed. The variant is
/// chosen at construction; the session only sees this interface.
pub trait CoinAcceptor: Send + Sync {
    /// Pesos accepted since the last reset, debounced
    fn received_amount(&self) -> u32;
    /// Rebase the running total to zero without touching hardware counters
    fn reset_amount(&self);
    fn set_callback(&self, callback: CoinCallback);
    /// Stop background tasks owned by the acceptor
    fn shutdown(&self);
    /// Suspend any background polling that would share a physical link
    /// with the hopper conversation. Default: nothing to pause.
    fn pause_polling(&self) {}
    fn resume_polling(&self) {}
}

/// Common surface over the bill-acceptor backends (dedicated port or
/// shared-reader-backed).
pub trait BillAcceptor: Send + Sync {
    fn received_amount(&self) -> u32;
    fn reset_amount(&self);
    fn set_callback(&self, callback: BillCallback);
    fn shutdown(&self);
}
