//! Protocol module - Econet packets and their transport encapsulations
//!
//! Three encapsulations share one 8-byte header layout:
//! - 1 byte packet type
//! - 1 byte port
//! - 1 byte control flags
//! - 1 byte padding / retransmission counter
//! - 4 bytes sequence number (little-endian)
//!
//! AUN sends it raw over UDP, WebSocket clients wrap it in JSON, and the
//! Piconet serial bridge carries its own scout framing instead.

mod message;
mod codec;
mod aun;
mod websocket;
mod piconet;

pub use message::*;
pub use codec::*;
pub use aun::*;
pub use websocket::*;
pub use piconet::*;

/// Default UDP port for AUN traffic
pub const DEFAULT_AUN_PORT: u16 = 32768;

/// Default WebSocket listener port
pub const DEFAULT_WS_PORT: u16 = 8090;

/// Default baud rate of the Piconet serial bridge
pub const DEFAULT_PICONET_BAUD: u32 = 115_200;

/// Firmware version reported to machine peeks
pub const DEFAULT_VERSION_MAJOR: u8 = 2;
pub const DEFAULT_VERSION_MINOR: u8 = 0;
