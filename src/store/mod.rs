pub mod memory;
pub mod paths;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::Cluster;
use crate::config::Config;
use crate::object::ArtifactStore;
use crate::scm::SourceHostProvider;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("key already exists: {0}")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A key and its stored value, as returned by [`KvStore::list_directory`].
#[derive(Debug, Clone)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
}

/// Durable ordered key-value store with directory semantics.
///
/// Keys form a `/`-separated tree. A key holds at most one value; listing a
/// directory returns its direct children in order (numeric children sort
/// numerically, so build and stage indices come back dense and ascending).
/// This is the single source of truth for all pipeline state.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Create a key. Fails with [`StoreError::AlreadyExists`] if present.
    async fn create(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Atomically create the next ordered child of `dir` and return its key.
    ///
    /// Child names are dense positive integers starting at 1. Concurrent
    /// callers never observe the same name twice; this is the linearisation
    /// point for build-number allocation.
    async fn create_in_directory(&self, dir: &str, value: Vec<u8>) -> Result<String, StoreError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Replace the value of an existing key.
    async fn update(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Delete a key and everything below it. Missing subtrees are not an error.
    async fn delete_subtree(&self, prefix: &str) -> Result<(), StoreError>;

    /// List the direct children of `dir` that hold values, in order.
    async fn list_directory(&self, dir: &str) -> Result<Vec<KvEntry>, StoreError>;
}

/// Upsert convenience used by record save paths.
pub async fn put(kv: &dyn KvStore, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
    match kv.update(key, value.clone()).await {
        Ok(()) => Ok(()),
        Err(StoreError::NotFound(_)) => kv.create(key, value).await,
        Err(e) => Err(e),
    }
}

#[derive(Clone)]
pub struct AppState {
    pub kv: Arc<dyn KvStore>,
    pub artifacts: ArtifactStore,
    pub cluster: Arc<dyn Cluster>,
    pub scm: Arc<dyn SourceHostProvider>,
    pub config: Arc<Config>,
}
