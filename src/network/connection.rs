//! Connection handles
//!
//! Each live WebSocket or serial connection runs in its own task. The bridge
//! loop talks to it through a handle wrapping the task's outbound channel,
//! so sending never waits on the socket.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Serial error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("Connection closed")]
    Closed,

    #[error("Send queue full")]
    QueueFull,

    #[error("Send channel closed")]
    SendChannelClosed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Identity of one live WebSocket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A handle for queueing text frames or lines to a connection task
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<String>,
    connected: Arc<AtomicBool>,
    sent: Arc<AtomicU64>,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::Sender<String>) -> Self {
        Self {
            sender,
            connected: Arc::new(AtomicBool::new(true)),
            sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue a message without waiting
    pub fn send(&self, message: String) -> ConnectionResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }

        self.sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::SendChannelClosed,
        })?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Check if the connection is still active
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.sender.is_closed()
    }

    /// Mark the connection as disconnected
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Messages queued through this handle
    pub fn messages_sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_queues_messages() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = ConnectionHandle::new(tx);

        handle.send("one".to_string()).unwrap();
        handle.send("two".to_string()).unwrap();
        assert_eq!(handle.messages_sent(), 2);
        assert_eq!(rx.try_recv().unwrap(), "one");
        assert_eq!(rx.try_recv().unwrap(), "two");
    }

    #[test]
    fn test_handle_reports_full_and_closed() {
        let (tx, rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new(tx);

        handle.send("one".to_string()).unwrap();
        assert!(matches!(
            handle.send("two".to_string()),
            Err(ConnectionError::QueueFull)
        ));

        drop(rx);
        assert!(!handle.is_connected());
        assert!(matches!(
            handle.send("three".to_string()),
            Err(ConnectionError::SendChannelClosed)
        ));

        handle.mark_disconnected();
        assert!(matches!(
            handle.send("four".to_string()),
            Err(ConnectionError::Closed)
        ));
    }

    #[test]
    fn test_connection_ids_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }
}
