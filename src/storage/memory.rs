//! In-memory document store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Document, DocumentStore, Mutation, Result, StoreError};

/// Document store backed by a sorted map. Contents are lost on drop.
pub struct InMemoryStore<D> {
    docs: RwLock<BTreeMap<String, D>>,
    unavailable: AtomicBool,
}

impl<D: Document> InMemoryStore<D> {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(BTreeMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every operation fail until reset, as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every document, in key order.
    pub async fn snapshot(&self) -> Vec<D> {
        self.docs.read().await.values().cloned().collect()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!(
                "{} collection is unavailable",
                D::COLLECTION
            )));
        }
        Ok(())
    }
}

impl<D: Document> Default for InMemoryStore<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<D: Document> DocumentStore<D> for InMemoryStore<D> {
    async fn find(&self, key: &str) -> Result<Option<D>> {
        self.check()?;
        Ok(self.docs.read().await.get(key).cloned())
    }

    async fn find_where(&self, filter: &(dyn for<'a> Fn(&'a D) -> bool + Send + Sync)) -> Result<Vec<D>> {
        self.check()?;
        Ok(self
            .docs
            .read()
            .await
            .values()
            .filter(|&doc| filter(doc))
            .cloned()
            .collect())
    }

    async fn list(&self, skip: usize, limit: usize) -> Result<Vec<D>> {
        self.check()?;
        Ok(self
            .docs
            .read()
            .await
            .values()
            .skip(skip)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert(&self, doc: D) -> Result<bool> {
        self.check()?;
        let mut docs = self.docs.write().await;
        if docs.contains_key(doc.key()) {
            return Ok(false);
        }
        docs.insert(doc.key().to_string(), doc);
        Ok(true)
    }

    async fn update(&self, key: &str, mutate: Mutation<D>) -> Result<Option<D>> {
        self.check()?;
        let mut docs = self.docs.write().await;
        Ok(docs.get_mut(key).map(|doc| {
            mutate(doc);
            doc.clone()
        }))
    }

    async fn delete(&self, key: &str) -> Result<Option<D>> {
        self.check()?;
        Ok(self.docs.write().await.remove(key))
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        self.check()?;
        let mut docs = self.docs.write().await;
        Ok(keys.iter().filter(|key| docs.remove(*key).is_some()).count())
    }
}
