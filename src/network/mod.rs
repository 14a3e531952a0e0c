//! Network module - Handles the bridge's three transports
//!
//! Provides:
//! - WebSocket server for browser and emulator clients
//! - Piconet serial bridge handler
//! - Connection handles and the outbound packet dispatcher
//! - The bridge loop that owns all shared state

mod bridge;
mod connection;
mod dispatcher;
mod serial;
mod server;

pub use bridge::*;
pub use connection::*;
pub use dispatcher::*;
pub use serial::*;
pub use server::*;

use std::net::SocketAddr;

/// Events fed to the bridge loop by connection tasks
#[derive(Debug)]
pub enum BridgeEvent {
    /// A WebSocket client completed its handshake
    WsConnected {
        conn: ConnectionId,
        peer: SocketAddr,
        handle: ConnectionHandle,
    },
    /// A text frame from a WebSocket client
    WsFrame { conn: ConnectionId, text: String },
    WsDisconnected { conn: ConnectionId, reason: String },
    /// A line read from the Piconet, without its terminator
    SerialLine(String),
    SerialClosed { reason: String },
}
