//! In-memory object store for tests and ephemeral runs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::objects::{ObjectStore, validate_key};

#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    /// Keys whose writes and deletes fail, to exercise error paths.
    failing: Arc<RwLock<HashSet<String>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.objects.read().await.contains_key(key)
    }

    /// Make every later `put`/`delete` of `key` fail.
    pub async fn fail_on(&self, key: &str) {
        self.failing.write().await.insert(key.to_string());
    }

    async fn check(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        if self.failing.read().await.contains(key) {
            return Err(StorageError::Operation {
                key: key.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.check(key).await?;
        self.objects.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_key(key)?;
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.check(key).await?;
        self.objects.write().await.remove(key);
        Ok(())
    }
}
