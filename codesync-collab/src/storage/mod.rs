//! File storage behind the collaboration layer.
//!
//! ```text
//! ┌─────────────┐  openFile (read)   ┌─────────────┐
//! │ Connection  │ ─────────────────► │  FileStore  │── MemoryStore (tests, default)
//! │             │  saveFile (write)  │  (trait)    │── DiskStore   (root/<repo>/<path>)
//! └─────────────┘ ─────────────────► └─────────────┘
//! ```
//!
//! Storage is only touched on `openFile` cache misses and explicit saves,
//! never on the edit path.

pub mod disk;
pub mod memory;

pub use disk::DiskStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;

/// Storage failures. Reported to the requesting client only; the file
/// cache is left in its last known-good state.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid file path: {0}")]
    InvalidPath(String),

    #[error("Repository not found: {0}")]
    UnknownResource(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read/write-by-path access to repository files.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Full content of `path` inside repository `resource`.
    async fn read(&self, resource: &str, path: &str) -> Result<String, StorageError>;

    /// Replace the content of `path`, creating it if needed.
    async fn write(&self, resource: &str, path: &str, content: &str) -> Result<(), StorageError>;

    async fn exists(&self, resource: &str, path: &str) -> Result<bool, StorageError>;

    /// Whether the repository itself is known.
    async fn resource_exists(&self, resource: &str) -> Result<bool, StorageError>;
}

/// Validate a client-supplied relative path.
///
/// Rejects empty paths, absolute paths and any `..` component.
pub fn validate_path(path: &str) -> Result<(), StorageError> {
    let invalid = path.is_empty()
        || path.starts_with('/')
        || path.starts_with('\\')
        || path.contains('\0')
        || path.split(['/', '\\']).any(|part| part == "..")
        || std::path::Path::new(path).is_absolute();
    if invalid {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(())
}
