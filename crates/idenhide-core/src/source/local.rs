//! Local filesystem backend.

use super::{Origin, PresignedUrl, SourceBackend, SourceRef, is_image_name};
use crate::error::{BatchError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Reads and writes items on the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct LocalBackend;

impl LocalBackend {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn list_folder(path: &Path) -> Result<Vec<SourceRef>> {
        let mut entries = tokio::fs::read_dir(path).await.map_err(|e| {
            BatchError::SourceUnavailable(format!("cannot list {}: {e}", path.display()))
        })?;

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BatchError::SourceUnavailable(format!("cannot list {}: {e}", path.display())))?
        {
            let file_type = entry.file_type().await?;
            if !file_type.is_file() {
                continue;
            }
            let file_path = entry.path();
            let is_image =
                file_path.file_name().and_then(|n| n.to_str()).is_some_and(is_image_name);
            if is_image {
                paths.push(file_path);
            }
        }
        paths.sort();
        Ok(paths.into_iter().map(SourceRef::local).collect())
    }
}

fn location_path(location: &SourceRef) -> Result<&Path> {
    match location {
        SourceRef::Local { path } => Ok(path),
        SourceRef::Remote { .. } => Err(BatchError::Unsupported(format!(
            "local backend cannot reach remote object {location}"
        ))),
    }
}

#[async_trait]
impl SourceBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn list(&self, origin: &Origin) -> Result<Vec<SourceRef>> {
        match origin {
            Origin::LocalFolder { path } => Self::list_folder(path).await,
            Origin::LocalFiles { paths } => Ok(paths
                .iter()
                .filter(|path| {
                    let keep = path.to_str().is_some_and(is_image_name);
                    if !keep {
                        warn!(path = %path.display(), "Skipping non-image file");
                    }
                    keep
                })
                .cloned()
                .map(SourceRef::local)
                .collect()),
            Origin::Remote(location) => Err(BatchError::Unsupported(format!(
                "local backend cannot list {}",
                location.uri()
            ))),
        }
    }

    async fn get(&self, location: &SourceRef) -> Result<Bytes> {
        let path = location_path(location)?;
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                Err(BatchError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(BatchError::FetchFailed(format!("{}: {e}", path.display()))),
        }
    }

    async fn put(&self, location: &SourceRef, bytes: Bytes, _content_type: &str) -> Result<()> {
        let path = location_path(location)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &bytes).await?;
        debug!(path = %path.display(), size = bytes.len(), "Stored local object");
        Ok(())
    }

    async fn presign(&self, location: &SourceRef, _ttl: Duration) -> Result<PresignedUrl> {
        Err(BatchError::Unsupported(format!("cannot presign local path {location}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_list_folder_filters_and_sorts() {
        let temp = TempDir::new().unwrap();
        for name in ["c.png", "a.jpg", "b.JPEG", "notes.txt"] {
            std::fs::write(temp.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(temp.path().join("nested.jpg")).unwrap();

        let backend = LocalBackend::new();
        let refs = backend
            .list(&Origin::LocalFolder { path: temp.path().to_path_buf() })
            .await
            .unwrap();

        let names: Vec<String> = refs.iter().map(SourceRef::name).collect();
        assert_eq!(names, vec!["a.jpg", "b.JPEG", "c.png"]);
    }

    #[tokio::test]
    async fn test_list_missing_folder() {
        let backend = LocalBackend::new();
        let err = backend
            .list(&Origin::LocalFolder { path: PathBuf::from("/definitely/not/here") })
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::SourceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_file_list_keeps_order() {
        let backend = LocalBackend::new();
        let paths = vec![PathBuf::from("/x/z.jpg"), PathBuf::from("/x/a.txt"), PathBuf::from("/x/b.png")];
        let refs = backend.list(&Origin::LocalFiles { paths }).await.unwrap();
        assert_eq!(refs, vec![SourceRef::local("/x/z.jpg"), SourceRef::local("/x/b.png")]);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new();
        let err = backend.get(&SourceRef::local(temp.path().join("gone.jpg"))).await.unwrap_err();
        assert!(matches!(err, BatchError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_put_creates_parent_dirs() {
        let temp = TempDir::new().unwrap();
        let target = SourceRef::local(temp.path().join("job").join("processed").join("a.jpg"));
        let backend = LocalBackend::new();

        backend.put(&target, Bytes::from_static(b"blurred"), "image/jpeg").await.unwrap();
        assert_eq!(backend.get(&target).await.unwrap(), Bytes::from_static(b"blurred"));
    }
}
