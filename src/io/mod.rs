//! IO modules - hardware and external interfaces
//!
//! This module contains all external IO operations:
//! - `serial_mux` - shared serial link ownership and line fan-out
//! - `device_link` - request/response client for actuator boards
//! - `coin_pulse` - GPIO pulse-width coin decoding
//! - `coin_stream` - textual coin acceptor protocol adapter
//! - `bill_line` - bill validator line parsing
//! - `mux_board` - 16-channel multiplexer board control
//! - `control` - TCP line-command listener for the UI process
//! - `ui_channel` - typed channel feeding the external UI layer
//! - `egress` - session record output to file (JSONL format)
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod bill_line;
pub mod coin_pulse;
pub mod coin_stream;
pub mod control;
pub mod device_link;
pub mod egress;
pub mod mux_board;
pub mod prometheus;
pub mod serial_mux;
pub mod ui_channel;

// Re-export commonly used types
pub use bill_line::BillLineParser;
pub use coin_pulse::CoinPulseDecoder;
pub use coin_stream::CoinStreamAdapter;
pub use control::start_control_listener;
pub use device_link::{DeviceEndpoint, DeviceError, DeviceLinkClient, DeviceTarget};
pub use egress::SessionEgress;
pub use mux_board::{ChannelMuxController, LoggingMuxBoard, MuxBoardIo};
pub use serial_mux::{SerialMuxRegistry, SharedSerialLink};
pub use ui_channel::{create_ui_channel, UiMessage, UiSender};
