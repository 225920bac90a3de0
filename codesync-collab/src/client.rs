//! WebSocket client for the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, close) with the `init` handshake
//! - Typed send/receive of protocol messages
//! - Offline queue for edits made while disconnected
//!
//! Used by the integration tests and benches; editors embed it the same way.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Connection established and `init` sent
    Connected,
    /// A message from the server
    Message(ServerMessage),
    /// Connection lost
    Disconnected,
}

/// Messages sent while disconnected, replayed in order on connect.
pub struct OfflineQueue {
    queue: VecDeque<ClientMessage>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a message. Returns false when full.
    pub fn enqueue(&mut self, msg: ClientMessage) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(msg);
        true
    }

    pub fn drain(&mut self) -> Vec<ClientMessage> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// The collaboration client.
pub struct CollabClient {
    /// Collaboration token sent with `init` (None = solo mode)
    token: Option<String>,

    /// Identity token sent with `init`
    auth_token: Option<String>,

    state: Arc<RwLock<ConnectionState>>,

    offline_queue: Arc<Mutex<OfflineQueue>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    event_rx: Option<mpsc::Receiver<ClientEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<ClientEvent>,

    server_url: String,
}

impl CollabClient {
    pub fn new(server_url: impl Into<String>, token: Option<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            token,
            auth_token: None,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    pub fn with_auth_token(mut self, auth_token: impl Into<String>) -> Self {
        self.auth_token = Some(auth_token.into());
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect, send `init`, then replay the offline queue.
    ///
    /// Spawns background tasks for reading and writing the socket.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let init = ClientMessage::Init {
            token: self.token.clone(),
            auth_token: self.auth_token.clone(),
        };
        out_tx
            .send(init.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued message(s)", queued.len());
        }
        for msg in queued {
            out_tx
                .send(msg.encode()?)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        self.outgoing_tx = Some(out_tx);

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        let event_tx = self.event_tx.clone();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                        Ok(server_msg) => {
                            if event_tx.send(ClientEvent::Message(server_msg)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Send a message, or queue it while disconnected.
    pub async fn send(&self, msg: ClientMessage) -> Result<(), ProtocolError> {
        let state = *self.state.read().await;
        let tx = match (&self.outgoing_tx, state) {
            (Some(tx), ConnectionState::Connected) => tx,
            _ => {
                let mut queue = self.offline_queue.lock().await;
                if !queue.enqueue(msg) {
                    return Err(ProtocolError::ConnectionClosed);
                }
                return Ok(());
            }
        };

        tx.send(msg.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Close the socket. Messages sent afterwards are queued.
    pub async fn close(&mut self) {
        // Dropping the sender ends the writer task, which closes the socket.
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}
