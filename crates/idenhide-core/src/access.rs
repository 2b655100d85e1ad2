//! Time-limited access to remote artifacts and source objects.

use crate::error::{BatchError, Result};
use crate::job::ArtifactRef;
use crate::source::{PresignedUrl, SourceProvider, SourceRef, parse_s3_uri};
use std::time::Duration;
use tracing::debug;

/// Default lifetime of a presigned URL.
pub const DEFAULT_PRESIGN_TTL: Duration = Duration::from_secs(300);

/// Longest lifetime a presigned URL may have (7 days).
pub const MAX_PRESIGN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Checks that `ttl` lies in `1s..=7d`.
pub fn validate_ttl(ttl: Duration) -> Result<Duration> {
    if ttl < Duration::from_secs(1) || ttl > MAX_PRESIGN_TTL {
        return Err(BatchError::InvalidConfig(format!(
            "presign TTL must be between 1s and {}s, got {}s",
            MAX_PRESIGN_TTL.as_secs(),
            ttl.as_secs()
        )));
    }
    Ok(ttl)
}

/// Issues presigned URLs through the connected remote backend.
#[derive(Debug, Clone)]
pub struct AccessLayer {
    provider: SourceProvider,
}

impl AccessLayer {
    pub fn new(provider: SourceProvider) -> Self {
        Self { provider }
    }

    /// Presigned read URL for a stored artifact. Local artifacts are
    /// `Unsupported`.
    pub async fn presign_artifact(&self, artifact: &ArtifactRef, ttl: Duration) -> Result<PresignedUrl> {
        let ttl = validate_ttl(ttl)?;
        debug!(location = %artifact.location, ttl_secs = ttl.as_secs(), "Presigning artifact");
        self.provider.presign(&artifact.location, ttl).await
    }

    /// Presigned view URL for any remote object, given as `s3://bucket/key`.
    pub async fn presign_source(&self, uri: &str, region: &str, ttl: Duration) -> Result<PresignedUrl> {
        let ttl = validate_ttl(ttl)?;
        let (bucket, key) = parse_s3_uri(uri)?;
        if key.is_empty() || key.ends_with('/') {
            return Err(BatchError::InvalidConfig(format!("{uri} does not name an object")));
        }
        self.provider.presign(&SourceRef::remote(bucket, key, region), ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryBackend;
    use std::sync::Arc;

    fn layer(backend: &MemoryBackend) -> AccessLayer {
        AccessLayer::new(SourceProvider::local_only().with_remote(Arc::new(backend.clone())))
    }

    #[test]
    fn test_validate_ttl() {
        assert!(validate_ttl(Duration::ZERO).is_err());
        assert!(validate_ttl(Duration::from_secs(1)).is_ok());
        assert!(validate_ttl(DEFAULT_PRESIGN_TTL).is_ok());
        assert!(validate_ttl(MAX_PRESIGN_TTL).is_ok());
        assert!(validate_ttl(MAX_PRESIGN_TTL + Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_presign_remote_artifact() {
        let backend = MemoryBackend::new();
        backend.insert("photos", "in/processed/a.jpg", "blurred");
        let artifact =
            ArtifactRef::new(SourceRef::remote("photos", "in/processed/a.jpg", "us-east-1"), b"blurred");

        let url = layer(&backend).presign_artifact(&artifact, DEFAULT_PRESIGN_TTL).await.unwrap();
        assert!(url.url.contains("in/processed/a.jpg"));
        assert!(url.expires_at > chrono::Utc::now());
    }

    #[tokio::test]
    async fn test_presign_local_artifact_unsupported() {
        let artifact = ArtifactRef::new(SourceRef::local("/tmp/a.jpg"), b"x");
        let err = layer(&MemoryBackend::new())
            .presign_artifact(&artifact, DEFAULT_PRESIGN_TTL)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_presign_source_requires_object_key() {
        let backend = MemoryBackend::new();
        backend.insert("photos", "in/a.jpg", "a");
        let access = layer(&backend);

        assert!(access.presign_source("s3://photos/in/a.jpg", "r", DEFAULT_PRESIGN_TTL).await.is_ok());
        let err = access.presign_source("s3://photos/in/", "r", DEFAULT_PRESIGN_TTL).await.unwrap_err();
        assert!(matches!(err, BatchError::InvalidConfig(_)));
        let err = access.presign_source("s3://photos/in/b.jpg", "r", DEFAULT_PRESIGN_TTL).await.unwrap_err();
        assert!(matches!(err, BatchError::NotFound(_)));
    }
}
