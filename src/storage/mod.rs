//! Document stores owned by each service.
//!
//! Every service keeps its own collection of JSON documents keyed by a
//! unique name. Stores are only written by their owning service's entry
//! points and consumers.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::bus::HandlerError;
use crate::config::{StorageConfig, StorageType};
use crate::model::{TagRecord, TargetRecord, UserRecord};

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Document encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        HandlerError::Failed(Box::new(err))
    }
}

/// A JSON document with a unique key.
pub trait Document: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Collection (table) the documents live in.
    const COLLECTION: &'static str;

    fn key(&self) -> &str;
}

/// In-place mutation for `update`.
pub type Mutation<D> = Box<dyn FnOnce(&mut D) + Send>;

/// Key-value document store for one collection.
#[async_trait]
pub trait DocumentStore<D: Document>: Send + Sync {
    async fn find(&self, key: &str) -> Result<Option<D>>;

    /// All documents matching `filter`, in key order.
    async fn find_where(&self, filter: &(dyn for<'a> Fn(&'a D) -> bool + Send + Sync)) -> Result<Vec<D>>;

    /// Documents in key order, skipping `skip` and returning at most `limit`.
    async fn list(&self, skip: usize, limit: usize) -> Result<Vec<D>>;

    /// Insert `doc` unless its key exists. Returns whether it was inserted.
    async fn insert(&self, doc: D) -> Result<bool>;

    /// Apply `mutate` to the document under `key` and return the updated copy.
    ///
    /// Returns `None` without calling `mutate` when no document matches. The
    /// mutation must not change the key.
    async fn update(&self, key: &str, mutate: Mutation<D>) -> Result<Option<D>>;

    /// Remove and return the document under `key`.
    async fn delete(&self, key: &str) -> Result<Option<D>>;

    /// Remove every document whose key is in `keys`. Returns how many went.
    async fn delete_many(&self, keys: &[String]) -> Result<usize>;
}

/// One store per service collection.
#[derive(Clone)]
pub struct Stores {
    pub targets: Arc<dyn DocumentStore<TargetRecord>>,
    pub users: Arc<dyn DocumentStore<UserRecord>>,
    pub tags: Arc<dyn DocumentStore<TagRecord>>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            targets: Arc::new(InMemoryStore::new()),
            users: Arc::new(InMemoryStore::new()),
            tags: Arc::new(InMemoryStore::new()),
        }
    }
}

/// Initialize storage based on configuration.
pub async fn init_stores(config: &StorageConfig) -> std::result::Result<Stores, Box<dyn std::error::Error>> {
    match config.storage_type {
        StorageType::Memory => {
            info!("Storage: in-memory");
            Ok(Stores::in_memory())
        }
        StorageType::Sqlite => {
            #[cfg(feature = "sqlite")]
            {
                info!("Storage: sqlite at {}", config.path);
                if let Some(parent) = std::path::Path::new(&config.path).parent() {
                    std::fs::create_dir_all(parent)?;
                }

                let pool =
                    sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.path)).await?;
                sqlite::init(&pool).await?;

                Ok(Stores {
                    targets: Arc::new(SqliteStore::new(pool.clone())),
                    users: Arc::new(SqliteStore::new(pool.clone())),
                    tags: Arc::new(SqliteStore::new(pool)),
                })
            }

            #[cfg(not(feature = "sqlite"))]
            {
                tracing::error!("SQLite storage requested but 'sqlite' feature is not enabled");
                Err("SQLite feature not enabled".into())
            }
        }
    }
}
