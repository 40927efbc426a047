//! # Object Storage Seam
//!
//! Narrow get/put interface over the external object-storage service,
//! with idempotent bucket creation. The concrete S3-compatible client
//! lives outside this crate; tests and local development use
//! [`MemoryObjectStore`].

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{PlateflowError, Result};

/// Consumed object-storage operations.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the bucket if it does not exist. Returns true when it was
    /// created by this call.
    async fn ensure_bucket(&self, bucket: &str) -> Result<bool>;

    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<()>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool>;
}

/// In-memory object store keyed by (bucket, key).
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    buckets: DashMap<String, DashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<bool> {
        if self.buckets.contains_key(bucket) {
            return Ok(false);
        }
        self.buckets.insert(bucket.to_string(), DashMap::new());
        Ok(true)
    }

    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.ensure_bucket(bucket).await?;
        let objects = self.buckets.get(bucket).ok_or_else(|| {
            PlateflowError::storage("put", format!("bucket {bucket} vanished"))
        })?;
        objects.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let objects = self
            .buckets
            .get(bucket)
            .ok_or_else(|| PlateflowError::storage("get", format!("no such bucket {bucket}")))?;
        let bytes = objects
            .get(key)
            .ok_or_else(|| {
                PlateflowError::storage("get", format!("no such object {bucket}/{key}"))
            })?
            .clone();
        Ok(bytes)
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self
            .buckets
            .get(bucket)
            .map(|objects| objects.contains_key(key))
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_bucket_is_idempotent() {
        let store = MemoryObjectStore::new();
        assert!(store.ensure_bucket("images").await.unwrap());
        assert!(!store.ensure_bucket("images").await.unwrap());
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = MemoryObjectStore::new();
        store
            .put("results", "exp/nucleus.csv", b"a,b\n1,2\n".to_vec())
            .await
            .unwrap();
        let bytes = store.get("results", "exp/nucleus.csv").await.unwrap();
        assert_eq!(bytes, b"a,b\n1,2\n");
        assert!(store.exists("results", "exp/nucleus.csv").await.unwrap());
        assert!(!store.exists("results", "missing").await.unwrap());
    }

    #[tokio::test]
    async fn get_missing_object_fails() {
        let store = MemoryObjectStore::new();
        store.ensure_bucket("results").await.unwrap();
        assert!(store.get("results", "nope").await.is_err());
        assert!(store.get("missing-bucket", "nope").await.is_err());
    }
}
