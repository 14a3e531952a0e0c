//! WebSocket server
//!
//! Accepts browser connections and relays their JSON text frames to the
//! bridge loop. Each connection runs in its own task; the bridge owns all
//! state and writes back through the connection's handle.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info};

use super::connection::{ConnectionError, ConnectionHandle, ConnectionId};
use super::BridgeEvent;

/// Outbound frames queued per connection before sends are refused
const OUTBOUND_QUEUE: usize = 256;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// WebSocket listener feeding the bridge loop
pub struct WsServer {
    bind_addr: String,
    event_tx: mpsc::Sender<BridgeEvent>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    running: Arc<RwLock<bool>>,
}

impl WsServer {
    pub fn new(bind_address: &str, port: u16, event_tx: mpsc::Sender<BridgeEvent>) -> Self {
        Self {
            bind_addr: format!("{}:{}", bind_address, port),
            event_tx,
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Bind and start accepting; returns the bound address
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let listener = TcpListener::bind(&self.bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", self.bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        info!("WebSocket server listening on {}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        let event_tx = self.event_tx.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                debug!("New WebSocket connection from {}", addr);
                                let event_tx = event_tx.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_client(stream, addr, event_tx).await {
                                        error!("WebSocket handler error for {}: {}", addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("WebSocket server shutdown requested");
                        break;
                    }
                }
            }

            let mut running = running.write().await;
            *running = false;
        });

        Ok(local_addr)
    }

    /// Stop accepting new connections
    pub async fn stop(&mut self) -> ServerResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(ServerError::NotRunning);
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

/// Handle one client connection until it closes
async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    event_tx: mpsc::Sender<BridgeEvent>,
) -> Result<(), ConnectionError> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let conn = ConnectionId::new();
    let (msg_tx, mut msg_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let handle = ConnectionHandle::new(msg_tx);

    event_tx
        .send(BridgeEvent::WsConnected {
            conn,
            peer: addr,
            handle: handle.clone(),
        })
        .await
        .map_err(|_| ConnectionError::SendChannelClosed)?;

    let reason = loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let event = BridgeEvent::WsFrame { conn, text: text.to_string() };
                        if event_tx.send(event).await.is_err() {
                            break "Bridge stopped".to_string();
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break "Connection closed".to_string();
                    }
                    Some(Ok(_)) => {
                        // Ping/Pong/Binary, tungstenite answers pings itself
                    }
                    Some(Err(e)) => {
                        break format!("Error: {}", e);
                    }
                }
            }

            Some(text) = msg_rx.recv() => {
                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    break format!("Send error: {}", e);
                }
            }
        }
    };

    handle.mark_disconnected();
    let _ = event_tx
        .send(BridgeEvent::WsDisconnected { conn, reason })
        .await;
    let _ = ws_tx.close().await;

    Ok(())
}
