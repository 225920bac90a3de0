//! In-memory file store.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{validate_path, FileStore, StorageError};

/// Repositories kept in memory: repository id → (path → content).
///
/// Used by tests and as the server default when no storage root is set.
#[derive(Debug, Default)]
pub struct MemoryStore {
    resources: DashMap<String, DashMap<String, String>>,
    /// Makes every write fail, for exercising the error path.
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an empty repository. Existing content is kept.
    pub fn add_resource(&self, resource: impl Into<String>) {
        self.resources.entry(resource.into()).or_default();
    }

    /// Builder form of [`add_resource`](Self::add_resource) + [`insert`](Self::insert).
    pub fn with_file(self, resource: &str, path: &str, content: &str) -> Self {
        self.insert(resource, path, content);
        self
    }

    /// Seed a file, creating the repository if needed.
    pub fn insert(&self, resource: &str, path: &str, content: &str) {
        self.resources
            .entry(resource.to_string())
            .or_default()
            .insert(path.to_string(), content.to_string());
    }

    /// Current stored content, bypassing the async interface.
    pub fn get(&self, resource: &str, path: &str) -> Option<String> {
        self.resources
            .get(resource)
            .and_then(|files| files.get(path).map(|c| c.clone()))
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl FileStore for MemoryStore {
    async fn read(&self, resource: &str, path: &str) -> Result<String, StorageError> {
        validate_path(path)?;
        let files = self
            .resources
            .get(resource)
            .ok_or_else(|| StorageError::UnknownResource(resource.to_string()))?;
        let content = files
            .get(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        Ok(content.clone())
    }

    async fn write(&self, resource: &str, path: &str, content: &str) -> Result<(), StorageError> {
        validate_path(path)?;
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StorageError::Io(std::io::Error::other("write refused")));
        }
        let files = self
            .resources
            .get(resource)
            .ok_or_else(|| StorageError::UnknownResource(resource.to_string()))?;
        files.insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn exists(&self, resource: &str, path: &str) -> Result<bool, StorageError> {
        validate_path(path)?;
        Ok(self
            .resources
            .get(resource)
            .is_some_and(|files| files.contains_key(path)))
    }

    async fn resource_exists(&self, resource: &str) -> Result<bool, StorageError> {
        Ok(self.resources.contains_key(resource))
    }
}
