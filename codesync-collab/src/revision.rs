//! Revision log hook, invoked after every explicit save.
//!
//! The live edit path never touches it. Failures are logged by the caller
//! and never reach clients.

use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RevisionError {
    #[error("Revision log unavailable: {0}")]
    Unavailable(String),
}

/// Version-control snapshotting of saved files.
#[async_trait]
pub trait RevisionLog: Send + Sync {
    async fn record_save(&self, resource: &str, path: &str) -> Result<(), RevisionError>;
}

/// Records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRevisionLog;

#[async_trait]
impl RevisionLog for NoopRevisionLog {
    async fn record_save(&self, _resource: &str, _path: &str) -> Result<(), RevisionError> {
        Ok(())
    }
}

/// Accumulates saved paths per repository until [`commit`](Self::commit)
/// turns them into an auto-commit message.
#[derive(Debug, Default)]
pub struct MemoryRevisionLog {
    changed: DashMap<String, Vec<String>>,
}

impl MemoryRevisionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Paths saved since the last commit, in first-save order.
    pub fn changed_files(&self, resource: &str) -> Vec<String> {
        self.changed
            .get(resource)
            .map(|files| files.clone())
            .unwrap_or_default()
    }

    /// Drain the pending changes of `resource` into a commit message.
    pub fn commit(&self, resource: &str) -> String {
        let files = self
            .changed
            .remove(resource)
            .map(|(_, files)| files)
            .unwrap_or_default();
        let message = commit_message(&files);
        log::info!("Auto-commit for {resource}: {}", message.lines().next().unwrap_or_default());
        message
    }
}

#[async_trait]
impl RevisionLog for MemoryRevisionLog {
    async fn record_save(&self, resource: &str, path: &str) -> Result<(), RevisionError> {
        let mut files = self.changed.entry(resource.to_string()).or_default();
        if !files.iter().any(|f| f == path) {
            files.push(path.to_string());
        }
        Ok(())
    }
}

/// Render an auto-commit message, grouping files by lowercase extension.
///
/// ```
/// use codesync_collab::revision::commit_message;
///
/// let msg = commit_message(&["src/lib.rs".to_string(), "Makefile".to_string()]);
/// assert!(msg.starts_with("chore: auto-commit 2 file(s)"));
/// assert!(msg.contains(".rs files changed:\n- src/lib.rs"));
/// assert!(msg.contains("no_extension files changed:\n- Makefile"));
/// ```
pub fn commit_message(files: &[String]) -> String {
    if files.is_empty() {
        return "chore: no changes detected".to_string();
    }

    let mut groups: Vec<(String, Vec<&str>)> = Vec::new();
    for file in files {
        let ext = Path::new(file)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_else(|| "no_extension".to_string());
        match groups.iter_mut().find(|(g, _)| *g == ext) {
            Some((_, members)) => members.push(file.as_str()),
            None => groups.push((ext, vec![file.as_str()])),
        }
    }

    let mut message = format!("chore: auto-commit {} file(s)\n\n", files.len());
    for (ext, members) in groups {
        message.push_str(&format!("\n{ext} files changed:"));
        for file in members {
            message.push_str(&format!("\n- {file}"));
        }
    }
    message
}
