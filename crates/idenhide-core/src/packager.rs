//! Archive packaging for finished jobs.
//!
//! The archive is a gzip-compressed tar with three parts:
//! - `originals/` holds the source bytes of every succeeded item
//! - `processed/` holds the rendered artifacts
//! - `manifest.json` lists every item, failed ones included

use crate::aggregator::BatchSummary;
use crate::error::{BatchError, ErrorInfo, Result};
use crate::layout::safe_relative_name;
use crate::job::{ArtifactRef, BatchJob, ItemRecord, ItemStatus, JobId, JobStatus, sha256_hex};
use crate::source::SourceProvider;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

pub const MANIFEST_NAME: &str = "manifest.json";
pub const ORIGINALS_DIR: &str = "originals";
pub const PROCESSED_DIR: &str = "processed";

/// One item in the archive manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub index: usize,
    pub name: String,
    pub source: String,
    pub status: ItemStatus,
    pub faces: u32,
    pub plates: u32,
    pub detections: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Bytes that should be in the archive but could not be read.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gaps: Vec<String>,
}

/// `manifest.json` contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub job_id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub summary: BatchSummary,
    pub items: Vec<ManifestEntry>,
}

impl ArchiveManifest {
    pub fn failed_items(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.items.iter().filter(|entry| entry.status == ItemStatus::Failed)
    }
}

/// Builds downloadable archives from job snapshots.
#[derive(Debug, Clone)]
pub struct ArtifactPackager {
    provider: SourceProvider,
}

impl ArtifactPackager {
    pub fn new(provider: SourceProvider) -> Self {
        Self { provider }
    }

    /// Packages `job` into tar.gz bytes.
    ///
    /// Unreadable originals or artifacts become manifest gaps; only a failure
    /// to finalize the archive is an error.
    pub async fn package(&self, job: &BatchJob, summary: &BatchSummary) -> Result<Bytes> {
        let mut names = ArchiveNames::default();
        let mut files: Vec<(String, Bytes)> = Vec::new();
        let mut entries = Vec::with_capacity(job.items.len());

        for record in &job.items {
            let mut entry = manifest_entry(record);
            if record.status == ItemStatus::Succeeded {
                let name = names.claim(record);
                self.add_original(record, &name, &mut entry, &mut files).await;
                if let Some(artifact) = &record.artifact_ref {
                    self.add_artifact(artifact, &name, &mut entry, &mut files).await;
                }
            }
            if !entry.gaps.is_empty() {
                warn!(job_id = %job.id, index = record.index, gaps = ?entry.gaps, "Archive entry has gaps");
            }
            entries.push(entry);
        }

        let manifest = ArchiveManifest {
            job_id: job.id.clone(),
            status: job.status,
            created_at: job.created_at,
            generated_at: Utc::now(),
            summary: summary.clone(),
            items: entries,
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| BatchError::PackagingFailed(format!("manifest serialization: {e}")))?;
        files.push((MANIFEST_NAME.to_string(), Bytes::from(manifest_bytes)));

        let file_count = files.len();
        let archive = tokio::task::spawn_blocking(move || build_archive(&files))
            .await
            .map_err(|e| BatchError::PackagingFailed(format!("archive task failed: {e}")))?
            .map_err(|e| BatchError::PackagingFailed(e.to_string()))?;

        info!(job_id = %job.id, files = file_count, size = archive.len(), "Archive packaged");
        Ok(Bytes::from(archive))
    }

    async fn add_original(
        &self,
        record: &ItemRecord,
        name: &str,
        entry: &mut ManifestEntry,
        files: &mut Vec<(String, Bytes)>,
    ) {
        match self.provider.fetch_bytes(&record.source_ref).await {
            Ok(bytes) => {
                let path = format!("{ORIGINALS_DIR}/{name}");
                entry.original_sha256 = Some(sha256_hex(&bytes));
                entry.original_path = Some(path.clone());
                files.push((path, bytes));
            }
            Err(err) => entry.gaps.push(format!("original: {err}")),
        }
    }

    async fn add_artifact(
        &self,
        artifact: &ArtifactRef,
        name: &str,
        entry: &mut ManifestEntry,
        files: &mut Vec<(String, Bytes)>,
    ) {
        match self.provider.fetch_bytes(&artifact.location).await {
            Ok(bytes) => {
                if sha256_hex(&bytes) != artifact.sha256 {
                    entry.gaps.push(format!("processed: checksum mismatch for {}", artifact.location));
                    return;
                }
                let path = format!("{PROCESSED_DIR}/{name}");
                entry.processed_path = Some(path.clone());
                files.push((path, bytes));
            }
            Err(err) => entry.gaps.push(format!("processed: {err}")),
        }
    }
}

fn manifest_entry(record: &ItemRecord) -> ManifestEntry {
    let detection = record.detection.as_ref();
    ManifestEntry {
        index: record.index,
        name: record.name.clone(),
        source: record.source_ref.uri(),
        status: record.status,
        faces: detection.map_or(0, |d| d.face_count),
        plates: detection.map_or(0, |d| d.plate_count),
        detections: detection.map_or(0, |d| d.total()),
        artifact: record.artifact_ref.clone(),
        original_path: None,
        processed_path: None,
        original_sha256: None,
        error: record.error.clone(),
        gaps: Vec::new(),
    }
}

/// Hands out archive-safe, unique entry names.
#[derive(Debug, Default)]
struct ArchiveNames {
    used: HashSet<String>,
}

impl ArchiveNames {
    fn claim(&mut self, record: &ItemRecord) -> String {
        claim_unique(&mut self.used, safe_relative_name(&record.name, record.index), record.index)
    }
}

/// Claims `name` in `used`, suffixing it with `index` (then the next free
/// number) when it is taken.
pub(crate) fn claim_unique(used: &mut HashSet<String>, name: String, index: usize) -> String {
    if used.insert(name.clone()) {
        return name;
    }
    let mut suffix = index;
    loop {
        let candidate = with_index(&name, suffix);
        if used.insert(candidate.clone()) {
            return candidate;
        }
        suffix += 1;
    }
}

/// `a.jpg` -> `a-3.jpg`.
pub(crate) fn with_index(name: &str, index: usize) -> String {
    let path = Path::new(name);
    match (path.file_stem().and_then(|s| s.to_str()), path.extension().and_then(|e| e.to_str())) {
        (Some(stem), Some(ext)) => {
            let parent = path.parent().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
            let file = format!("{stem}-{index}.{ext}");
            if parent.is_empty() { file } else { format!("{parent}/{file}") }
        }
        _ => format!("{name}-{index}"),
    }
}

fn build_archive(files: &[(String, Bytes)]) -> std::io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut tar = tar::Builder::new(encoder);
    let mtime = Utc::now().timestamp().max(0) as u64;

    for (path, bytes) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(mtime);
        header.set_cksum();
        tar.append_data(&mut header, path, bytes.as_ref())?;
        debug!(path = %path, size = bytes.len(), "Added archive entry");
    }

    tar.into_inner()?.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ItemOutcome;
    use crate::source::SourceRef;
    use flate2::read::GzDecoder;
    use idenhide_abstraction::DetectionResult;
    use std::collections::HashMap;
    use std::io::Read;
    use tempfile::TempDir;

    fn unpack(archive: &[u8]) -> HashMap<String, Vec<u8>> {
        let mut tar = tar::Archive::new(GzDecoder::new(archive));
        let mut out = HashMap::new();
        for entry in tar.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            out.insert(path, data);
        }
        out
    }

    fn job(items: Vec<ItemRecord>) -> BatchJob {
        BatchJob {
            id: JobId::from("job-1"),
            origin: "test".to_string(),
            items,
            concurrency: 4,
            strategy: idenhide_abstraction::Strategy::Parallel,
            status: JobStatus::PartiallyFailed,
            options: idenhide_abstraction::ProcessOptions::default(),
            created_at: Utc::now(),
            finished_at: None,
            abort_cause: None,
        }
    }

    #[test]
    fn test_name_helpers() {
        assert_eq!(with_index("a.jpg", 3), "a-3.jpg");
        assert_eq!(with_index("day1/a.jpg", 3), "day1/a-3.jpg");
        assert_eq!(with_index("noext", 2), "noext-2");
    }

    #[test]
    fn test_claim_unique_skips_taken_suffixes() {
        let mut used = HashSet::new();
        assert_eq!(claim_unique(&mut used, "a-2.jpg".to_string(), 0), "a-2.jpg");
        assert_eq!(claim_unique(&mut used, "a.jpg".to_string(), 1), "a.jpg");
        assert_eq!(claim_unique(&mut used, "a.jpg".to_string(), 2), "a-3.jpg");
        assert_eq!(claim_unique(&mut used, "a.jpg".to_string(), 3), "a-4.jpg");
        assert_eq!(used.len(), 4);
    }

    #[tokio::test]
    async fn test_package_includes_succeeded_and_lists_all() {
        let temp = TempDir::new().unwrap();
        let original = temp.path().join("a.jpg");
        let processed = temp.path().join("out-a.jpg");
        std::fs::write(&original, b"original-a").unwrap();
        std::fs::write(&processed, b"blurred-a").unwrap();

        let ok = ItemRecord::new(0, "a.jpg", SourceRef::local(&original)).settled(
            ItemOutcome::Succeeded {
                detection: DetectionResult::default(),
                artifact: Some(ArtifactRef::new(SourceRef::local(&processed), b"blurred-a")),
            },
            Some(10),
        );
        let failed = ItemRecord::new(1, "b.jpg", SourceRef::local(temp.path().join("b.jpg")))
            .settled(ItemOutcome::failed(&BatchError::FetchFailed("disk".to_string())), None);

        let packager = ArtifactPackager::new(SourceProvider::local_only());
        let archive = packager.package(&job(vec![ok, failed]), &BatchSummary::default()).await.unwrap();
        let files = unpack(&archive);

        assert_eq!(files["originals/a.jpg"], b"original-a");
        assert_eq!(files["processed/a.jpg"], b"blurred-a");
        assert!(!files.contains_key("originals/b.jpg"));

        let manifest: ArchiveManifest = serde_json::from_slice(&files[MANIFEST_NAME]).unwrap();
        assert_eq!(manifest.items.len(), 2);
        let failures: Vec<_> = manifest.failed_items().map(|e| e.name.as_str()).collect();
        assert_eq!(failures, vec!["b.jpg"]);
    }

    #[tokio::test]
    async fn test_missing_bytes_become_gaps() {
        let temp = TempDir::new().unwrap();
        let gone = ItemRecord::new(0, "gone.jpg", SourceRef::local(temp.path().join("gone.jpg"))).settled(
            ItemOutcome::Succeeded { detection: DetectionResult::default(), artifact: None },
            None,
        );

        let packager = ArtifactPackager::new(SourceProvider::local_only());
        let archive = packager.package(&job(vec![gone]), &BatchSummary::default()).await.unwrap();
        let files = unpack(&archive);
        let manifest: ArchiveManifest = serde_json::from_slice(&files[MANIFEST_NAME]).unwrap();

        assert_eq!(manifest.items[0].gaps.len(), 1);
        assert!(manifest.items[0].original_path.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_names_are_disambiguated() {
        let temp = TempDir::new().unwrap();
        let first = temp.path().join("x").join("a.jpg");
        let second = temp.path().join("y").join("a.jpg");
        for (path, body) in [(&first, b"one"), (&second, b"two")] {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, body).unwrap();
        }
        let succeeded = |index, path: &std::path::Path| {
            ItemRecord::new(index, "a.jpg", SourceRef::local(path)).settled(
                ItemOutcome::Succeeded { detection: DetectionResult::default(), artifact: None },
                None,
            )
        };

        let packager = ArtifactPackager::new(SourceProvider::local_only());
        let archive = packager
            .package(&job(vec![succeeded(0, &first), succeeded(1, &second)]), &BatchSummary::default())
            .await
            .unwrap();
        let files = unpack(&archive);

        assert_eq!(files["originals/a.jpg"], b"one");
        assert_eq!(files["originals/a-1.jpg"], b"two");
    }
}
