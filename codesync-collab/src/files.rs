//! Server-side file sessions.
//!
//! A [`FileSession`] caches the content of one open file together with the
//! operations applied since it was loaded or last saved:
//!
//! ```text
//! base ──log[0]──► ... ──log[n-1]──► content        pending = log[0] ∘ ... ∘ log[n-1]
//! ```
//!
//! `content == apply(pending, base)` holds after every mutation. Sessions
//! are keyed by [`FileKey`] so that different rooms never share a cache, and
//! each sits behind its own async mutex: edits to one file serialize, edits
//! to different files never contend.

use std::future::Future;
use std::sync::Arc;

use codesync_core::Operation;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::OperationError;
use crate::storage::StorageError;

/// Identity of a cached file: the room it belongs to (none for solo
/// connections) and its path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileKey {
    pub room: Option<String>,
    pub file_id: String,
}

impl FileKey {
    pub fn solo(file_id: impl Into<String>) -> Self {
        Self {
            room: None,
            file_id: file_id.into(),
        }
    }

    pub fn in_room(token: impl Into<String>, file_id: impl Into<String>) -> Self {
        Self {
            room: Some(token.into()),
            file_id: file_id.into(),
        }
    }
}

/// Outcome of a successfully applied operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// The operation as applied, normalized to cover the whole text.
    pub operation: Operation,
    /// Server revision after the operation.
    pub revision: u64,
}

/// Content captured for a save. Written to storage outside the file lock,
/// then handed back to [`FileSession::mark_saved`].
#[derive(Debug, Clone)]
pub struct SaveSnapshot {
    pub content: String,
    pub revision: u64,
    generation: u64,
    log_len: usize,
}

/// Cached content and pending-operation log for one open file.
#[derive(Debug, Clone)]
pub struct FileSession {
    file_id: String,
    resource_id: String,
    base: String,
    content: String,
    pending: Operation,
    log: Vec<Operation>,
    revision: u64,
    saved_revision: u64,
    /// Bumped by whole-content replacement; a snapshot taken in an older
    /// generation no longer describes a prefix of the log.
    generation: u64,
}

impl FileSession {
    pub fn new(resource_id: impl Into<String>, file_id: impl Into<String>, content: String) -> Self {
        let pending = identity(&content);
        Self {
            file_id: file_id.into(),
            resource_id: resource_id.into(),
            base: content.clone(),
            content,
            pending,
            log: Vec::new(),
            revision: 0,
            saved_revision: 0,
            generation: 0,
        }
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Content as of the last load or save.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Composition of every operation since `base`.
    pub fn pending(&self) -> &Operation {
        &self.pending
    }

    /// Operations applied since `base`, oldest first.
    pub fn log(&self) -> &[Operation] {
        &self.log
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// True if something changed since the last save.
    pub fn is_dirty(&self) -> bool {
        self.revision != self.saved_revision
    }

    /// Apply a client operation.
    ///
    /// The operation is normalized against the current content, then both
    /// the new content and the new pending composition are computed before
    /// anything is committed, so a failure leaves the session untouched.
    /// With `strict` set, an operation based on any revision other than the
    /// current one is rejected.
    pub fn apply_operation(
        &mut self,
        op: &Operation,
        client_revision: u64,
        strict: bool,
    ) -> Result<Applied, OperationError> {
        if client_revision != self.revision {
            if strict {
                return Err(OperationError::StaleRevision {
                    file_id: self.file_id.clone(),
                    expected: self.revision,
                    got: client_revision,
                });
            }
            if client_revision < self.revision {
                log::warn!(
                    "Operation on {} based on revision {client_revision}, server is at {}",
                    self.file_id,
                    self.revision
                );
            }
        }

        let op = op.normalized(self.content.chars().count())?;
        let content = op.apply(&self.content)?;
        let pending = self.pending.compose(&op)?;

        self.content = content;
        self.pending = pending;
        self.log.push(op.clone());
        self.revision += 1;

        Ok(Applied {
            operation: op,
            revision: self.revision,
        })
    }

    /// Replace the whole content (`codeUpdate`). Returns the new revision.
    pub fn replace_content(&mut self, content: String) -> u64 {
        self.pending = identity(&content);
        self.base = content.clone();
        self.content = content;
        self.log.clear();
        self.revision += 1;
        self.generation += 1;
        self.revision
    }

    pub fn snapshot(&self) -> SaveSnapshot {
        SaveSnapshot {
            content: self.content.clone(),
            revision: self.revision,
            generation: self.generation,
            log_len: self.log.len(),
        }
    }

    /// Rebase on content that was just persisted.
    ///
    /// Drops exactly the operations the snapshot covered; anything applied
    /// while the write was in flight stays in the log.
    pub fn mark_saved(&mut self, snapshot: &SaveSnapshot) {
        self.saved_revision = self.saved_revision.max(snapshot.revision);

        if snapshot.generation != self.generation || snapshot.log_len > self.log.len() {
            // Content was replaced wholesale while saving; the log already
            // starts from the replacement.
            return;
        }

        let remaining = self.log.split_off(snapshot.log_len);
        let mut pending = identity(&snapshot.content);
        for op in &remaining {
            match pending.compose(op) {
                Ok(next) => pending = next,
                Err(e) => {
                    log::warn!("Could not rebase log of {} after save: {e}", self.file_id);
                    self.base = self.content.clone();
                    self.pending = identity(&self.content);
                    self.log.clear();
                    return;
                }
            }
        }

        self.base = snapshot.content.clone();
        self.pending = pending;
        self.log = remaining;
    }
}

/// Operation that retains all of `text`.
fn identity(text: &str) -> Operation {
    Operation::new().retain(text.chars().count())
}

type Slot = Arc<Mutex<Option<FileSession>>>;

/// Every cached file session, sharded by [`FileKey`].
#[derive(Debug, Default)]
pub struct FileSessions {
    slots: DashMap<FileKey, Slot>,
}

impl FileSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached content of `key`, loading it with `load` on a miss.
    ///
    /// Concurrent opens of the same key wait for the first loader instead
    /// of reading storage twice. A failed load leaves nothing cached.
    pub async fn open<F, Fut>(
        &self,
        key: &FileKey,
        resource_id: &str,
        load: F,
    ) -> Result<(String, u64), StorageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, StorageError>>,
    {
        let slot = self.slots.entry(key.clone()).or_default().clone();
        let mut guard = slot.lock().await;

        if let Some(session) = guard.as_ref() {
            return Ok((session.content().to_string(), session.revision()));
        }

        match load().await {
            Ok(content) => {
                let session = FileSession::new(resource_id, key.file_id.clone(), content);
                let opened = (session.content().to_string(), session.revision());
                *guard = Some(session);
                log::debug!("Loaded {} into cache", key.file_id);
                Ok(opened)
            }
            Err(e) => {
                drop(guard);
                self.slots.remove_if(key, |_, current| {
                    Arc::ptr_eq(current, &slot)
                        && current.try_lock().is_ok_and(|session| session.is_none())
                });
                Err(e)
            }
        }
    }

    /// Run `f` on the session under its lock. `None` if `key` is not cached.
    pub async fn with_session<R>(&self, key: &FileKey, f: impl FnOnce(&mut FileSession) -> R) -> Option<R> {
        let slot = self.slots.get(key)?.clone();
        let mut guard = slot.lock().await;
        guard.as_mut().map(f)
    }

    /// Drop a cached session. Unsaved changes are discarded with a warning.
    pub async fn release(&self, key: &FileKey) -> bool {
        self.release_unless(key, || false).await
    }

    /// Drop a cached session unless `in_use` says otherwise.
    ///
    /// `in_use` runs under the shard lock of `key`, so an `open` of the same
    /// key either sees the session removed or keeps it alive.
    pub async fn release_unless(&self, key: &FileKey, in_use: impl Fn() -> bool) -> bool {
        let Some((_, slot)) = self.slots.remove_if(key, |_, _| !in_use()) else {
            return false;
        };
        let guard = slot.lock().await;
        if let Some(session) = guard.as_ref() {
            if session.is_dirty() {
                log::warn!(
                    "Discarding unsaved changes to {} ({} pending operation(s))",
                    session.file_id(),
                    session.log().len()
                );
            } else {
                log::debug!("Released {} from cache", session.file_id());
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, key: &FileKey) -> bool {
        self.slots.contains_key(key)
    }
}
