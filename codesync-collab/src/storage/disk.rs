//! On-disk file store: `root/<repository>/<path>`.
//!
//! All I/O goes through `tokio::fs`, which runs on the blocking pool, so a
//! slow disk never stalls the connection tasks.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{validate_path, FileStore, StorageError};

/// Directory-backed store. Each repository is a subdirectory of `root`.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resource_dir(&self, resource: &str) -> Result<PathBuf, StorageError> {
        if resource.contains(['/', '\\']) {
            return Err(StorageError::InvalidPath(resource.to_string()));
        }
        validate_path(resource)?;
        Ok(self.root.join(resource))
    }

    fn file_path(&self, resource: &str, path: &str) -> Result<PathBuf, StorageError> {
        validate_path(path)?;
        Ok(self.resource_dir(resource)?.join(path))
    }
}

#[async_trait]
impl FileStore for DiskStore {
    async fn read(&self, resource: &str, path: &str) -> Result<String, StorageError> {
        let full = self.file_path(resource, path)?;
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if self.resource_exists(resource).await? {
                    Err(StorageError::NotFound(path.to_string()))
                } else {
                    Err(StorageError::UnknownResource(resource.to_string()))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, resource: &str, path: &str, content: &str) -> Result<(), StorageError> {
        let full = self.file_path(resource, path)?;
        if !self.resource_exists(resource).await? {
            return Err(StorageError::UnknownResource(resource.to_string()));
        }
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, content).await?;
        log::debug!("Wrote {} bytes to {}", content.len(), full.display());
        Ok(())
    }

    async fn exists(&self, resource: &str, path: &str) -> Result<bool, StorageError> {
        let full = self.file_path(resource, path)?;
        Ok(tokio::fs::try_exists(&full).await? && tokio::fs::metadata(&full).await?.is_file())
    }

    async fn resource_exists(&self, resource: &str) -> Result<bool, StorageError> {
        let dir = self.resource_dir(resource)?;
        match tokio::fs::metadata(&dir).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
