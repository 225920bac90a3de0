//! # codesync-collab: collaboration server for shared code editing
//!
//! Hosts WebSocket connections that edit files of a repository together.
//! A connection starts alone; presenting a valid collaboration token moves
//! it into that token's room, where edits, saves and presence are relayed
//! to the other members.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    WebSocket / JSON   ┌──────────────┐
//! │ CollabClient │ ◄───────────────────► │ SyncServer   │
//! └──────────────┘                       └──────┬───────┘
//!                                               │ one per socket
//!                                        ┌──────┴───────┐
//!                                        │ Connection   │ state machine
//!                                        └──┬────┬────┬─┘
//!                                           │    │    │
//!                          SessionRegistry ◄┘    │    └► FileSessions ─► FileStore
//!                          (tokens, members)     ▼       (text + edit log)
//!                                          RoomRouter
//!                                          (fan-out)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages
//! - [`session`]: collaboration tokens and room membership
//! - [`router`]: file and room indexes, per-connection outboxes
//! - [`files`]: shared file state, operation log, save rebasing
//! - [`connection`]: per-socket protocol state machine
//! - [`server`]: WebSocket accept loop
//! - [`client`]: WebSocket client with offline queue
//! - [`storage`]: repository file access

pub mod auth;
pub mod client;
pub mod connection;
pub mod error;
pub mod files;
pub mod invite;
pub mod protocol;
pub mod revision;
pub mod router;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use auth::{AnonymousAuthenticator, Authenticator, Identity, StaticAuthenticator};
pub use client::{ClientEvent, CollabClient, ConnectionState, OfflineQueue};
pub use connection::{Connection, ConnectionMode};
pub use error::{AuthError, CollabError, OperationError, TransportError};
pub use files::{FileKey, FileSession, FileSessions};
pub use invite::{invite, Invitation, InviteError, InviteNotifier, LogNotifier};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use revision::{MemoryRevisionLog, NoopRevisionLog, RevisionLog};
pub use router::{ConnectionId, RoomRouter, RouterStats, Target};
pub use server::{ServerConfig, ServerState, ServerStats, ShutdownHandle, SyncServer};
pub use session::{Member, MemberStatus, RegistryConfig, SessionRegistry};
pub use storage::{DiskStore, FileStore, MemoryStore, StorageError};

pub use codesync_core::Operation;
