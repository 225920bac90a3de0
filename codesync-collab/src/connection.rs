//! Per-connection protocol state machine.
//!
//! ```text
//!             init{}            ┌──────────┐
//!          ┌──────────────────► │   Solo   │ ──┐
//! ┌────────┴──┐  bad token      └──────────┘   │   transport
//! │ Connected │ ───────────────────┘           ├──────────────► Closed
//! └────────┬──┘  init{token}    ┌───────────────┐  close       │
//!          └──────────────────► │ Collaborative │ ─────────────┘
//!                               └───────────────┘
//! ```
//!
//! A [`Connection`] owns no socket. It consumes decoded client messages and
//! emits server messages through the [`RoomRouter`](crate::router::RoomRouter)
//! outbox registered for it, so it can be driven directly in tests.

use std::collections::HashSet;
use std::sync::Arc;

use codesync_core::Operation;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{AuthError, CollabError, OperationError};
use crate::files::FileKey;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::router::{ConnectionId, Frame, Target};
use crate::server::ServerState;
use crate::session::MemberStatus;

/// Negotiated mode of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Transport open, waiting for `init`.
    Connected,
    /// Editing alone; no room.
    Solo,
    /// Joined to the room of `token`, editing `resource_id`.
    Collaborative { token: String, resource_id: String },
    Closed,
}

impl ConnectionMode {
    fn describe(&self) -> &'static str {
        match self {
            ConnectionMode::Connected => "before init",
            ConnectionMode::Solo => "in solo mode",
            ConnectionMode::Collaborative { .. } => "in collaborative mode",
            ConnectionMode::Closed => "after close",
        }
    }
}

/// One client's session with the server.
pub struct Connection {
    /// Connection id, also used as the member id inside a room.
    id: ConnectionId,
    display_name: String,
    /// Authenticated user id, set by `init`.
    account: Option<String>,
    mode: ConnectionMode,
    open_files: HashSet<String>,
    state: Arc<ServerState>,
}

impl Connection {
    /// Register a new connection and return it with its outbox receiver.
    pub fn new(state: Arc<ServerState>) -> (Self, broadcast::Receiver<Frame>) {
        let id = Uuid::new_v4();
        let outbox = state.router.register(id);
        state.connection_opened();
        let conn = Self {
            id,
            display_name: String::new(),
            account: None,
            mode: ConnectionMode::Connected,
            open_files: HashSet::new(),
            state,
        };
        (conn, outbox)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn mode(&self) -> &ConnectionMode {
        &self.mode
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn account(&self) -> Option<&str> {
        self.account.as_deref()
    }

    pub fn open_files(&self) -> &HashSet<String> {
        &self.open_files
    }

    /// Handle one raw text frame.
    pub async fn handle_text(&mut self, text: &str) {
        match ClientMessage::decode(text) {
            Ok(msg) => self.handle(msg).await,
            Err(e) => {
                log::warn!("[{}] protocol error: {e}", self.id);
                self.reply_error(e.to_string());
            }
        }
    }

    /// Handle one decoded message. Failures are answered with an `error`
    /// frame to this connection only.
    pub async fn handle(&mut self, msg: ClientMessage) {
        let kind = msg.kind();
        log::debug!("[{}] <- {kind}", self.id);
        if let Err(e) = self.dispatch(msg).await {
            log::warn!("[{}] {} error on '{kind}': {e}", self.id, e.category());
            self.reply_error(e.user_message());
        }
    }

    async fn dispatch(&mut self, msg: ClientMessage) -> Result<(), CollabError> {
        if self.mode == ConnectionMode::Closed {
            return Err(ProtocolError::ConnectionClosed.into());
        }

        match msg {
            ClientMessage::Init { token, auth_token } => self.on_init(token, auth_token).await,
            ClientMessage::Operation { file_id, operation, revision } => {
                self.on_operation(file_id, operation, revision).await
            }
            ClientMessage::StatusUpdate { status } => {
                self.on_status_update(status);
                Ok(())
            }
            other if self.mode == ConnectionMode::Connected => Err(ProtocolError::NotAllowed {
                kind: other.kind(),
                state: self.mode.describe(),
            }
            .into()),
            ClientMessage::OpenFile { file_id } => self.on_open_file(file_id).await,
            ClientMessage::CodeUpdate { file_id, content } => {
                self.on_code_update(file_id, content).await
            }
            ClientMessage::SaveFile { file_id } => self.on_save(file_id).await,
        }
    }

    async fn on_init(
        &mut self,
        token: Option<String>,
        auth_token: Option<String>,
    ) -> Result<(), CollabError> {
        if self.mode != ConnectionMode::Connected {
            return Err(ProtocolError::NotAllowed {
                kind: "init",
                state: self.mode.describe(),
            }
            .into());
        }

        let identity = self.state.auth.identify(auth_token.as_deref(), self.id).await;
        log::debug!("[{}] identified as {} ({})", self.id, identity.display_name, identity.user_id);
        self.display_name = identity.display_name;
        self.account = Some(identity.user_id);

        let Some(token) = token.filter(|t| !t.is_empty()) else {
            self.enter_solo("No collaboration token; editing in solo mode");
            return Ok(());
        };

        if !self.state.registry.verify_token(&token) {
            log::info!("[{}] invalid or expired token, falling back to solo mode", self.id);
            self.enter_solo("Invalid or expired collaboration token; editing in solo mode");
            return Ok(());
        }
        let registry = &self.state.registry;
        let resource_id = registry
            .get_resource_id(&token)
            .ok_or(AuthError::InvalidToken)?;

        match self.state.store.resource_exists(&resource_id).await {
            Ok(true) => {}
            Ok(false) => return Err(AuthError::RepositoryUnavailable(resource_id).into()),
            Err(e) => {
                log::warn!("[{}] could not check repository {resource_id}: {e}", self.id);
                return Err(AuthError::RepositoryUnavailable(resource_id).into());
            }
        }

        if !registry.add_connection(&token, self.id, &self.display_name) {
            return Err(AuthError::JoinRejected.into());
        }
        if let Some(account) = &self.account {
            registry.set_account(&token, self.id, account);
        }
        self.state.router.join_room(self.id, &token);

        let users = registry.get_connections(&token);
        let me = users.iter().find(|m| m.id == self.id).cloned();

        self.reply(&ServerMessage::Connected {
            repository: resource_id.clone(),
            user_id: self.id,
            users: users.clone(),
        });
        for member in users.into_iter().filter(|m| m.id != self.id) {
            self.reply(&ServerMessage::UserJoined { user: member });
        }
        if let Some(me) = me {
            self.state
                .router
                .broadcast_room(&token, &ServerMessage::UserJoined { user: me }, Some(self.id))?;
        }

        log::info!(
            "[{}] {} joined room for {resource_id}",
            self.id,
            self.display_name
        );
        self.mode = ConnectionMode::Collaborative { token, resource_id };
        Ok(())
    }

    fn enter_solo(&mut self, message: &str) {
        self.mode = ConnectionMode::Solo;
        log::info!("[{}] {} entered solo mode", self.id, self.display_name);
        self.reply(&ServerMessage::solo_mode(message));
    }

    async fn on_open_file(&mut self, file_id: String) -> Result<(), CollabError> {
        let key = self.file_key(&file_id);
        let resource_id = self.resource_id().to_string();
        let already_open = self.open_files.contains(&file_id);

        // Register first so a concurrent close cannot evict the session we
        // are about to load.
        self.state.router.open_file(self.id, &key);

        let store = Arc::clone(&self.state.store);
        let (read_resource, read_path) = (resource_id.clone(), file_id);
        let loaded = self
            .state
            .files
            .open(&key, &resource_id, || async move {
                store.read(&read_resource, &read_path).await
            })
            .await;

        let (content, revision) = match loaded {
            Ok(opened) => opened,
            Err(e) => {
                if !already_open && self.state.router.close_file(self.id, &key) {
                    self.release_if_orphaned(&key).await;
                }
                return Err(e.into());
            }
        };

        self.open_files.insert(key.file_id.clone());
        self.reply(&ServerMessage::FileData {
            file_id: key.file_id.clone(),
            content,
            revision,
        });

        if let ConnectionMode::Collaborative { token, .. } = &self.mode {
            self.state.router.broadcast_room(
                token,
                &ServerMessage::FileOpened {
                    user_id: self.id,
                    file_id: key.file_id.clone(),
                },
                Some(self.id),
            )?;
            self.state.registry.touch(token, self.id);
        }
        Ok(())
    }

    async fn on_code_update(&mut self, file_id: String, content: String) -> Result<(), CollabError> {
        let key = self.require_open(&file_id)?;
        let revision = self
            .state
            .files
            .with_session(&key, |session| session.replace_content(content.clone()))
            .await
            .ok_or_else(|| OperationError::NotOpen(file_id.clone()))?;

        self.fan_out(
            &key,
            &ServerMessage::Update {
                file_id,
                content,
                revision,
            },
            Some(self.id),
        )?;
        self.touch();
        Ok(())
    }

    async fn on_operation(
        &mut self,
        file_id: String,
        operation: Operation,
        revision: u64,
    ) -> Result<(), CollabError> {
        if !matches!(self.mode, ConnectionMode::Collaborative { .. }) {
            log::warn!(
                "[{}] ignoring operation on {file_id} {}",
                self.id,
                self.mode.describe()
            );
            return Ok(());
        }

        let key = self.require_open(&file_id)?;
        let strict = self.state.config.strict_revisions;
        let applied = self
            .state
            .files
            .with_session(&key, |session| session.apply_operation(&operation, revision, strict))
            .await
            .ok_or_else(|| OperationError::NotOpen(file_id.clone()))??;

        log::trace!("[{}] applied operation on {file_id} at revision {}", self.id, applied.revision);
        self.fan_out(
            &key,
            &ServerMessage::Operation {
                file_id,
                operation: applied.operation,
                revision: applied.revision,
            },
            Some(self.id),
        )?;
        self.touch();
        Ok(())
    }

    /// Persist the cached content, then tell everyone, this connection
    /// included. The store write runs outside the file lock.
    async fn on_save(&mut self, file_id: String) -> Result<(), CollabError> {
        let key = self.require_open(&file_id)?;
        let (snapshot, resource_id) = self
            .state
            .files
            .with_session(&key, |session| {
                (session.snapshot(), session.resource_id().to_string())
            })
            .await
            .ok_or_else(|| OperationError::NotOpen(file_id.clone()))?;

        self.state
            .store
            .write(&resource_id, &file_id, &snapshot.content)
            .await?;

        self.state
            .files
            .with_session(&key, |session| session.mark_saved(&snapshot))
            .await;

        if let Err(e) = self.state.revisions.record_save(&resource_id, &file_id).await {
            log::warn!("[{}] revision log failed for {file_id}: {e}", self.id);
        }

        log::info!("[{}] saved {file_id} in {resource_id}", self.id);
        self.fan_out(&key, &ServerMessage::Saved { file_id }, None)?;
        Ok(())
    }

    fn on_status_update(&mut self, status: MemberStatus) {
        let ConnectionMode::Collaborative { token, .. } = &self.mode else {
            log::debug!("[{}] ignoring status update {}", self.id, self.mode.describe());
            return;
        };
        let Some(member) = self.state.registry.update_status(token, self.id, status) else {
            return;
        };
        if let Err(e) = self.state.router.broadcast_room(
            token,
            &ServerMessage::UserStatusChanged { user: member },
            Some(self.id),
        ) {
            log::warn!("[{}] could not broadcast status: {e}", self.id);
        }
    }

    /// Tear down: leave the room, tell the rest, drop orphaned files.
    pub async fn close(&mut self) {
        if self.mode == ConnectionMode::Closed {
            return;
        }
        let mode = std::mem::replace(&mut self.mode, ConnectionMode::Closed);
        let departure = self.state.router.unregister(self.id).unwrap_or_default();

        if let ConnectionMode::Collaborative { token, resource_id } = &mode {
            let registry = &self.state.registry;
            let left = registry.remove_connection(token, self.id);
            let remaining_users = registry.get_connections(token);
            let msg = ServerMessage::UserLeft {
                user_id: self.id,
                username: left
                    .map(|m| m.name)
                    .unwrap_or_else(|| self.display_name.clone()),
                remaining_users,
            };
            if let Err(e) = self.state.router.broadcast_room(token, &msg, None) {
                log::warn!("[{}] could not announce departure: {e}", self.id);
            }
            log::info!("[{}] {} left room for {resource_id}", self.id, self.display_name);
        }

        for key in departure.orphaned_files {
            self.release_if_orphaned(&key).await;
        }
        self.open_files.clear();
        self.state.connection_closed();
    }

    /// Evict the cached session of `key` once nobody is subscribed to it.
    async fn release_if_orphaned(&self, key: &FileKey) {
        let router = &self.state.router;
        self.state
            .files
            .release_unless(key, || !router.file_subscribers(key).is_empty())
            .await;
    }

    /// Queue an `error` frame for this connection.
    pub fn reply_error(&self, message: impl Into<String>) {
        self.reply(&ServerMessage::error(message));
    }

    fn reply(&self, msg: &ServerMessage) {
        if let Err(e) = self.state.router.send_to(self.id, msg) {
            log::warn!("[{}] could not send '{}': {e}", self.id, msg.kind());
        }
    }

    /// Broadcast to the file's viewers plus, when collaborating, the room.
    fn fan_out(
        &self,
        key: &FileKey,
        msg: &ServerMessage,
        exclude: Option<ConnectionId>,
    ) -> Result<usize, ProtocolError> {
        match &self.mode {
            ConnectionMode::Collaborative { token, .. } => self.state.router.broadcast(
                &[Target::File(key), Target::Room(token)],
                msg,
                exclude,
            ),
            _ => self.state.router.broadcast_file(key, msg, exclude),
        }
    }

    fn touch(&self) {
        if let ConnectionMode::Collaborative { token, .. } = &self.mode {
            self.state.registry.touch(token, self.id);
        }
    }

    fn require_open(&self, file_id: &str) -> Result<FileKey, OperationError> {
        if !self.open_files.contains(file_id) {
            return Err(OperationError::NotOpen(file_id.to_string()));
        }
        Ok(self.file_key(file_id))
    }

    fn file_key(&self, file_id: &str) -> FileKey {
        match &self.mode {
            ConnectionMode::Collaborative { token, .. } => FileKey::in_room(token.clone(), file_id),
            _ => FileKey::solo(file_id),
        }
    }

    fn resource_id(&self) -> &str {
        match &self.mode {
            ConnectionMode::Collaborative { resource_id, .. } => resource_id,
            _ => &self.state.config.solo_resource,
        }
    }
}
