//! Domain models - core payment and dispense types
//!
//! This module contains the canonical data types used throughout the system:
//! - `CoinEvent` / `BillEvent` - accepted cash, created on decode
//! - `ChangePlan` - two-denomination change breakdown
//! - `SlotTable` - read-only slot-to-item assignments
//! - `SessionRecord` - completed payment session for egress
//! - `CoinAcceptor` / `BillAcceptor` - acceptor backend interfaces

pub mod session_record;
pub mod types;
