//! Services - payment and dispense business logic
//!
//! This module contains the core control-plane services:
//! - `session` - payment session state machine and change dispatch
//! - `hopper` - change planning and hopper board driving
//! - `dispatch` - item-to-slot resolution and pulse routing
//! - `confirm` - per-slot dispense confirmation windows

pub mod confirm;
pub mod dispatch;
pub mod hopper;
pub mod session;

// Re-export commonly used types
pub use confirm::DispenseConfirmationMonitor;
pub use dispatch::SlotDispenseCoordinator;
pub use hopper::{CoinHopperController, DispenseOutcome};
pub use session::PaymentSession;
