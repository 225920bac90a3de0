//! WebSocket collaboration server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── SessionRegistry (token → room, TTL)
//!             ├── Connection task ───┼── RoomRouter     (file / room → outboxes)
//! Client B ──┘   (one per socket)    ├── FileSessions   (cache + op log per file)
//!                      │             └── FileStore      (read on open, write on save)
//!                      ▼
//!                 writer task ◄── bounded outbox (drop-oldest)
//! ```
//!
//! Every socket gets a reader loop that drives its [`Connection`] state
//! machine and a writer task that drains its outbox, so a slow client only
//! ever delays itself.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

use crate::auth::{AnonymousAuthenticator, Authenticator};
use crate::connection::Connection;
use crate::files::FileSessions;
use crate::revision::{NoopRevisionLog, RevisionLog};
use crate::router::RoomRouter;
use crate::session::{RegistryConfig, SessionRegistry};
use crate::storage::{DiskStore, FileStore, MemoryStore};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum members per room
    pub max_members_per_room: usize,
    /// Frames buffered per connection before the oldest are dropped
    pub outbox_capacity: usize,
    /// Lifetime of a collaboration token
    pub token_ttl: Duration,
    /// How often expired, empty rooms are evicted
    pub sweep_interval: Duration,
    /// Reject operations not based on the current file revision
    pub strict_revisions: bool,
    /// Repository root directory (None = in-memory store)
    pub storage_root: Option<PathBuf>,
    /// Repository used by solo-mode connections
    pub solo_resource: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_members_per_room: 100,
            outbox_capacity: 256,
            token_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            strict_revisions: false,
            storage_root: None,
            solo_resource: "default".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            token_ttl: self.token_ttl,
            max_members_per_room: self.max_members_per_room,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Frames lost by lagging peers
    pub dropped_frames: u64,
    pub active_rooms: usize,
    pub open_files: usize,
}

/// Lock-free counters behind [`ServerStats`].
#[derive(Debug, Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    dropped_frames: AtomicU64,
}

/// Everything a connection task needs, shared behind one `Arc`.
pub struct ServerState {
    pub config: ServerConfig,
    pub registry: Arc<SessionRegistry>,
    pub router: RoomRouter,
    pub files: FileSessions,
    pub store: Arc<dyn FileStore>,
    pub revisions: Arc<dyn RevisionLog>,
    pub auth: Arc<dyn Authenticator>,
    counters: Counters,
}

impl ServerState {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn FileStore>,
        revisions: Arc<dyn RevisionLog>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new(config.registry_config())),
            router: RoomRouter::new(config.outbox_capacity),
            files: FileSessions::new(),
            store,
            revisions,
            auth,
            config,
            counters: Counters::default(),
        }
    }

    pub(crate) fn connection_opened(&self) {
        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        self.counters.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    fn record_message(&self, bytes: usize) {
        self.counters.total_messages.fetch_add(1, Ordering::Relaxed);
        self.counters.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_dropped(&self, frames: u64) {
        self.counters.dropped_frames.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ServerStats {
        let router = self.router.stats();
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            total_messages: self.counters.total_messages.load(Ordering::Relaxed),
            total_bytes: self.counters.total_bytes.load(Ordering::Relaxed),
            dropped_frames: self.counters.dropped_frames.load(Ordering::Relaxed),
            active_rooms: self.registry.room_count(),
            open_files: router.open_files,
        }
    }
}

/// Stops a running server.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    /// Stop accepting, close every connection and the sweeper.
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }
}

/// Resolve once shutdown is requested or the sender is gone. The
/// `watch::Ref` never escapes, so `select!` loops using this stay `Send`.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// The collaboration server.
pub struct SyncServer {
    state: Arc<ServerState>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SyncServer {
    /// Create a server backed by a [`DiskStore`] when `storage_root` is set,
    /// a [`MemoryStore`] holding an empty solo repository otherwise.
    pub fn new(config: ServerConfig) -> Self {
        let store: Arc<dyn FileStore> = match &config.storage_root {
            Some(root) => Arc::new(DiskStore::new(root.clone())),
            None => {
                let memory = MemoryStore::new();
                memory.add_resource(config.solo_resource.as_str());
                Arc::new(memory)
            }
        };
        Self::with_parts(
            config,
            store,
            Arc::new(NoopRevisionLog),
            Arc::new(AnonymousAuthenticator),
        )
    }

    /// Create with explicit collaborators.
    pub fn with_parts(
        config: ServerConfig,
        store: Arc<dyn FileStore>,
        revisions: Arc<dyn RevisionLog>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: Arc::new(ServerState::new(config, store, revisions, auth)),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Create with default configuration (in-memory store).
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.state.registry
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown))
    }

    pub fn stats(&self) -> ServerStats {
        self.state.stats()
    }

    /// Bind `bind_addr` and serve until shut down.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shut down.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Collaboration server listening on {}", listener.local_addr()?);

        let mut shutdown = self.shutdown.subscribe();
        let sweeper = self
            .state
            .registry
            .spawn_sweeper(self.state.config.sweep_interval, self.shutdown.subscribe());

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::error!("Failed to accept connection: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let state = Arc::clone(&self.state);
                    let shutdown = self.shutdown.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, state, shutdown).await {
                            log::warn!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = stopped(&mut shutdown) => break,
            }
        }

        log::info!("Collaboration server shutting down");
        let _ = sweeper.await;
        Ok(())
    }
}

/// Drive one WebSocket connection until it closes or the server stops.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (mut conn, mut outbox) = Connection::new(Arc::clone(&state));
    let conn_id = conn.id();
    log::info!("WebSocket connection {conn_id} established from {addr}");

    let writer_state = Arc::clone(&state);
    let writer = tokio::spawn(async move {
        loop {
            match outbox.recv().await {
                Ok(frame) => {
                    if ws_sender.send(Message::text(frame.to_string())).await.is_err() {
                        log::debug!("Socket of {conn_id} closed; writer exiting");
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    log::warn!("Connection {conn_id} lagged, dropped {n} frame(s)");
                    writer_state.record_dropped(n);
                }
                Err(RecvError::Closed) => break,
            }
        }
        let _ = ws_sender.close().await;
    });

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        state.record_message(text.len());
                        conn.handle_text(text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        state.record_message(data.len());
                        match std::str::from_utf8(&data) {
                            Ok(text) => conn.handle_text(text).await,
                            Err(_) => conn.reply_error("Binary frames must contain UTF-8 JSON"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection {conn_id} closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    // Ping/pong are answered by tungstenite.
                    Some(Ok(_)) => {}
                }
            }
            _ = stopped(&mut shutdown) => break,
        }
    }

    // Dropping the outbox sender lets the writer flush and exit.
    conn.close().await;
    let _ = writer.await;
    Ok(())
}
