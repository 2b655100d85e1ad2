//! In-process object store with bucket semantics.
//!
//! Stands in for a remote backend in tests and dry runs. Cloning a
//! [`MemoryBackend`] shares the underlying store.

use super::{Origin, PresignedUrl, RemoteConnector, SourceBackend, SourceRef, is_image_name};
use crate::credentials::Credentials;
use crate::error::{BatchError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct Store {
    buckets: BTreeSet<String>,
    objects: BTreeMap<(String, String), Bytes>,
    denied_buckets: BTreeSet<String>,
}

/// Shared in-memory bucket store.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    store: Arc<RwLock<Store>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_bucket(&self, bucket: &str) {
        self.store.write().buckets.insert(bucket.to_string());
    }

    /// Inserts an object, creating the bucket if needed.
    pub fn insert(&self, bucket: &str, key: &str, bytes: impl Into<Bytes>) {
        let mut store = self.store.write();
        store.buckets.insert(bucket.to_string());
        store.objects.insert((bucket.to_string(), key.to_string()), bytes.into());
    }

    pub fn remove(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.store.write().objects.remove(&(bucket.to_string(), key.to_string()))
    }

    #[must_use]
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.store.read().objects.get(&(bucket.to_string(), key.to_string())).cloned()
    }

    /// Keys in `bucket`, sorted.
    #[must_use]
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.store
            .read()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Makes every operation on `bucket` fail with `AccessDenied`.
    pub fn deny_access(&self, bucket: &str) {
        self.store.write().denied_buckets.insert(bucket.to_string());
    }

    fn check_access(store: &Store, bucket: &str) -> Result<()> {
        if store.denied_buckets.contains(bucket) {
            return Err(BatchError::AccessDenied(format!("access to bucket {bucket} denied")));
        }
        Ok(())
    }
}

fn remote_parts(location: &SourceRef) -> Result<(&str, &str)> {
    match location {
        SourceRef::Remote { bucket, key, .. } => Ok((bucket, key)),
        SourceRef::Local { .. } => Err(BatchError::Unsupported(format!(
            "memory backend cannot reach local path {location}"
        ))),
    }
}

#[async_trait]
impl SourceBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn list(&self, origin: &Origin) -> Result<Vec<SourceRef>> {
        let Origin::Remote(location) = origin else {
            return Err(BatchError::Unsupported(format!(
                "memory backend cannot list {}",
                origin.describe()
            )));
        };
        let store = self.store.read();
        Self::check_access(&store, &location.bucket)?;
        if !store.buckets.contains(&location.bucket) {
            return Err(BatchError::SourceUnavailable(format!(
                "bucket {} does not exist",
                location.bucket
            )));
        }
        let prefix = location.folder_prefix();
        Ok(store
            .objects
            .keys()
            .filter(|(bucket, key)| {
                bucket == &location.bucket && key.starts_with(&prefix) && is_image_name(key)
            })
            .map(|(bucket, key)| SourceRef::remote(bucket, key, &location.region))
            .collect())
    }

    async fn get(&self, location: &SourceRef) -> Result<Bytes> {
        let (bucket, key) = remote_parts(location)?;
        let store = self.store.read();
        Self::check_access(&store, bucket)?;
        store
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| BatchError::NotFound(location.uri()))
    }

    async fn put(&self, location: &SourceRef, bytes: Bytes, _content_type: &str) -> Result<()> {
        let (bucket, key) = remote_parts(location)?;
        let mut store = self.store.write();
        Self::check_access(&store, bucket)?;
        store.buckets.insert(bucket.to_string());
        store.objects.insert((bucket.to_string(), key.to_string()), bytes);
        Ok(())
    }

    async fn presign(&self, location: &SourceRef, ttl: Duration) -> Result<PresignedUrl> {
        let (bucket, key) = remote_parts(location)?;
        let store = self.store.read();
        Self::check_access(&store, bucket)?;
        if !store.objects.contains_key(&(bucket.to_string(), key.to_string())) {
            return Err(BatchError::NotFound(location.uri()));
        }
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| BatchError::InvalidConfig(format!("invalid presign TTL: {e}")))?;
        let expires_at = Utc::now() + ttl;
        Ok(PresignedUrl {
            url: format!("memory://{bucket}/{key}?expires={}", expires_at.timestamp()),
            expires_at,
        })
    }
}

/// Connector that hands out a shared [`MemoryBackend`] to callers presenting
/// the expected access key.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    backend: MemoryBackend,
    accepted_access_key: String,
}

impl MemoryConnector {
    #[must_use]
    pub fn new(backend: MemoryBackend, accepted_access_key: impl Into<String>) -> Self {
        Self { backend, accepted_access_key: accepted_access_key.into() }
    }
}

#[async_trait]
impl RemoteConnector for MemoryConnector {
    async fn connect(&self, _region: &str, credentials: Credentials) -> Result<Arc<dyn SourceBackend>> {
        if credentials.access_key_id() != self.accepted_access_key {
            return Err(BatchError::CredentialsInvalid(
                "The AWS Access Key Id you provided does not exist in our records".to_string(),
            ));
        }
        Ok(Arc::new(self.backend.clone()))
    }
}
