//! Source provider: enumerates and fetches the items of a batch.
//!
//! Items come either from the local filesystem or from an object-storage
//! prefix. Both are reached through the [`SourceBackend`] trait and addressed
//! by a [`SourceRef`], so the dispatcher never branches on origin type.

pub mod local;
pub mod memory;
pub mod s3;

pub use local::LocalBackend;
pub use memory::{MemoryBackend, MemoryConnector};
pub use s3::{S3Backend, S3Connector};

use crate::credentials::Credentials;
use crate::error::{BatchError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// File extensions treated as images when enumerating an origin.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];

/// Returns true if `name` carries one of [`IMAGE_EXTENSIONS`] (case-insensitive).
#[must_use]
pub fn is_image_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

/// Capability-typed reference to one object. Never holds bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum SourceRef {
    /// A file on the local filesystem.
    Local {
        /// File path.
        path: PathBuf,
    },
    /// An object in a bucket.
    Remote {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Bucket region.
        region: String,
    },
}

impl SourceRef {
    #[must_use]
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::Local { path: path.into() }
    }

    #[must_use]
    pub fn remote(bucket: impl Into<String>, key: impl Into<String>, region: impl Into<String>) -> Self {
        Self::Remote { bucket: bucket.into(), key: key.into(), region: region.into() }
    }

    /// Last path segment, used as the item name.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Local { path } => path
                .file_name()
                .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned()),
            Self::Remote { key, .. } => {
                key.rsplit('/').find(|s| !s.is_empty()).unwrap_or(key.as_str()).to_string()
            }
        }
    }

    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }

    /// `s3://bucket/key` for remote objects, the path otherwise.
    #[must_use]
    pub fn uri(&self) -> String {
        match self {
            Self::Local { path } => path.display().to_string(),
            Self::Remote { bucket, key, .. } => format!("s3://{bucket}/{key}"),
        }
    }
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.uri())
    }
}

/// Splits `s3://bucket/key` into `(bucket, key)`. The key may be empty.
pub fn parse_s3_uri(uri: &str) -> Result<(String, String)> {
    let rest = uri
        .strip_prefix("s3://")
        .ok_or_else(|| BatchError::InvalidConfig(format!("S3 path must start with 's3://': {uri}")))?;
    let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(BatchError::InvalidConfig(format!(
            "Invalid S3 path format, use s3://bucket-name/path: {uri}"
        )));
    }
    Ok((bucket.to_string(), key.to_string()))
}

/// A bucket prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLocation {
    pub bucket: String,
    pub prefix: String,
    pub region: String,
}

impl RemoteLocation {
    /// Parses an `s3://bucket/prefix` URI.
    pub fn parse(uri: &str, region: impl Into<String>) -> Result<Self> {
        let (bucket, prefix) = parse_s3_uri(uri)?;
        Ok(Self { bucket, prefix, region: region.into() })
    }

    /// The prefix with a trailing `/` (empty for the bucket root).
    #[must_use]
    pub fn folder_prefix(&self) -> String {
        if self.prefix.is_empty() || self.prefix.ends_with('/') {
            self.prefix.clone()
        } else {
            format!("{}/", self.prefix)
        }
    }

    /// Reference to `name` directly under this prefix.
    #[must_use]
    pub fn object(&self, name: &str) -> SourceRef {
        SourceRef::remote(&self.bucket, format!("{}{}", self.folder_prefix(), name), &self.region)
    }

    #[must_use]
    pub fn uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }
}

/// Where the items of a batch come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Origin {
    /// Every image directly inside a folder.
    LocalFolder { path: PathBuf },
    /// An explicit selection of files, kept in the given order.
    LocalFiles { paths: Vec<PathBuf> },
    /// Every image under a bucket prefix.
    Remote(RemoteLocation),
}

impl Origin {
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Item name for `location`: the key relative to the prefix for remote
    /// origins, the file name otherwise.
    #[must_use]
    pub fn item_name(&self, location: &SourceRef) -> String {
        match (self, location) {
            (Self::Remote(remote), SourceRef::Remote { key, .. }) => {
                let prefix = remote.folder_prefix();
                key.strip_prefix(prefix.as_str())
                    .filter(|relative| !relative.is_empty())
                    .map_or_else(|| location.name(), str::to_string)
            }
            _ => location.name(),
        }
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::LocalFolder { path } => path.display().to_string(),
            Self::LocalFiles { paths } => format!("{} local file(s)", paths.len()),
            Self::Remote(location) => location.uri(),
        }
    }
}

/// A time-limited read URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Storage backend boundary, implemented once per backend kind.
///
/// Backends must tolerate concurrent use from every worker of a batch.
#[async_trait]
pub trait SourceBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Checks that the backend accepts the configured credentials.
    async fn verify(&self) -> Result<()> {
        Ok(())
    }

    /// Lists the image objects of `origin` in a stable order.
    async fn list(&self, origin: &Origin) -> Result<Vec<SourceRef>>;

    /// Reads the bytes of one object.
    async fn get(&self, location: &SourceRef) -> Result<Bytes>;

    /// Writes one object.
    async fn put(&self, location: &SourceRef, bytes: Bytes, content_type: &str) -> Result<()>;

    /// Issues a time-limited read URL for one object.
    async fn presign(&self, location: &SourceRef, ttl: Duration) -> Result<PresignedUrl>;
}

/// Opens a remote backend for one submission's credentials.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Builds a backend for `region` and verifies the credentials.
    ///
    /// The credentials are consumed: they live on only inside the backend client.
    async fn connect(&self, region: &str, credentials: Credentials) -> Result<Arc<dyn SourceBackend>>;
}

/// Routes each [`SourceRef`] to the backend that owns it.
#[derive(Clone)]
pub struct SourceProvider {
    local: Arc<dyn SourceBackend>,
    remote: Option<Arc<dyn SourceBackend>>,
}

impl std::fmt::Debug for SourceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceProvider")
            .field("local", &self.local.name())
            .field("remote", &self.remote.as_ref().map(|r| r.name()))
            .finish()
    }
}

impl Default for SourceProvider {
    fn default() -> Self {
        Self::local_only()
    }
}

impl SourceProvider {
    /// Provider that can only reach the local filesystem.
    #[must_use]
    pub fn local_only() -> Self {
        Self { local: Arc::new(LocalBackend::new()), remote: None }
    }

    /// Attaches a connected remote backend.
    #[must_use]
    pub fn with_remote(mut self, remote: Arc<dyn SourceBackend>) -> Self {
        self.remote = Some(remote);
        self
    }

    fn remote(&self) -> Result<&Arc<dyn SourceBackend>> {
        self.remote
            .as_ref()
            .ok_or_else(|| BatchError::InvalidConfig("no remote backend connected".to_string()))
    }

    fn backend_for(&self, location: &SourceRef) -> Result<&Arc<dyn SourceBackend>> {
        if location.is_remote() { self.remote() } else { Ok(&self.local) }
    }

    /// Lists the items of `origin`.
    pub async fn enumerate(&self, origin: &Origin) -> Result<Vec<SourceRef>> {
        let backend = if origin.is_remote() { self.remote()? } else { &self.local };
        let refs = backend.list(origin).await?;
        debug!(origin = %origin.describe(), backend = backend.name(), count = refs.len(), "Enumerated origin");
        Ok(refs)
    }

    /// Reads the bytes behind `location`.
    pub async fn fetch_bytes(&self, location: &SourceRef) -> Result<Bytes> {
        self.backend_for(location)?.get(location).await
    }

    /// Writes `bytes` at `location`.
    pub async fn store(&self, location: &SourceRef, bytes: Bytes, content_type: &str) -> Result<()> {
        self.backend_for(location)?.put(location, bytes, content_type).await
    }

    /// Issues a time-limited read URL; only remote objects can be presigned.
    pub async fn presign(&self, location: &SourceRef, ttl: Duration) -> Result<PresignedUrl> {
        if !location.is_remote() {
            return Err(BatchError::Unsupported(format!(
                "presigned access requires a remote object, got local path {location}"
            )));
        }
        self.remote()?.presign(location, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_image_name() {
        assert!(is_image_name("a.jpg"));
        assert!(is_image_name("dir/B.PNG"));
        assert!(is_image_name("photo.WebP"));
        assert!(!is_image_name("notes.txt"));
        assert!(!is_image_name("folder/"));
        assert!(!is_image_name("jpg"));
    }

    #[test]
    fn test_parse_s3_uri() {
        let (bucket, key) = parse_s3_uri("s3://photos/input/a.jpg").unwrap();
        assert_eq!(bucket, "photos");
        assert_eq!(key, "input/a.jpg");

        let (bucket, key) = parse_s3_uri("s3://photos").unwrap();
        assert_eq!(bucket, "photos");
        assert_eq!(key, "");

        assert!(matches!(parse_s3_uri("https://photos/a.jpg"), Err(BatchError::InvalidConfig(_))));
        assert!(matches!(parse_s3_uri("s3:///a.jpg"), Err(BatchError::InvalidConfig(_))));
    }

    #[test]
    fn test_folder_prefix_normalization() {
        let location = RemoteLocation::parse("s3://photos/input", "us-east-1").unwrap();
        assert_eq!(location.folder_prefix(), "input/");
        assert_eq!(location.object("a.jpg"), SourceRef::remote("photos", "input/a.jpg", "us-east-1"));

        let root = RemoteLocation::parse("s3://photos/", "us-east-1").unwrap();
        assert_eq!(root.folder_prefix(), "");
    }

    #[test]
    fn test_item_name_is_relative_to_prefix() {
        let origin = Origin::Remote(RemoteLocation::parse("s3://photos/input", "r").unwrap());
        assert_eq!(origin.item_name(&SourceRef::remote("photos", "input/day1/a.jpg", "r")), "day1/a.jpg");

        let local = Origin::LocalFolder { path: PathBuf::from("/tmp/in") };
        assert_eq!(local.item_name(&SourceRef::local("/tmp/in/b.png")), "b.png");
    }

    #[test]
    fn test_source_ref_name() {
        assert_eq!(SourceRef::remote("b", "in/cat.jpg", "r").name(), "cat.jpg");
        assert_eq!(SourceRef::local("/tmp/x/dog.png").name(), "dog.png");
        assert_eq!(SourceRef::remote("b", "in/cat.jpg", "r").uri(), "s3://b/in/cat.jpg");
    }

    #[tokio::test]
    async fn test_presign_rejects_local_refs() {
        let provider = SourceProvider::local_only();
        let err = provider
            .presign(&SourceRef::local("/tmp/a.jpg"), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_remote_ref_without_backend() {
        let provider = SourceProvider::local_only();
        let err = provider.fetch_bytes(&SourceRef::remote("b", "k.jpg", "r")).await.unwrap_err();
        assert!(matches!(err, BatchError::InvalidConfig(_)));
    }
}
