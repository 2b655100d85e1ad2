use crate::job::JobId;
use crate::source::{RemoteLocation, SourceRef};
use std::path::PathBuf;

/// Default root for local artifacts, relative to the working directory.
pub const DEFAULT_OUTPUT_DIR: &str = ".idenhide/artifacts";

/// Folder (or key segment) holding processed artifacts.
pub const PROCESSED_DIR: &str = "processed";

/// Content type of rendered artifacts.
pub const ARTIFACT_CONTENT_TYPE: &str = "image/jpeg";

/// Where the artifacts of a job are written.
///
/// Local layout is `<root>/<job_id>/processed/<name>`; remote layout is
/// `<output prefix>/<name>` in the output bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactLayout {
    Local { root: PathBuf },
    Remote(RemoteLocation),
}

impl ArtifactLayout {
    #[must_use]
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self::Local { root: root.into() }
    }

    #[must_use]
    pub fn remote(location: RemoteLocation) -> Self {
        Self::Remote(location)
    }

    /// `<input prefix>/processed/` in the input bucket.
    #[must_use]
    pub fn default_remote_for(input: &RemoteLocation) -> Self {
        Self::Remote(RemoteLocation {
            bucket: input.bucket.clone(),
            prefix: format!("{}{PROCESSED_DIR}", input.folder_prefix()),
            region: input.region.clone(),
        })
    }

    /// Target for the artifact of item `index`. The name is reduced to a
    /// relative path first, so the target never leaves the output area.
    #[must_use]
    pub fn artifact_ref(&self, job_id: &JobId, index: usize, name: &str) -> SourceRef {
        let name = safe_relative_name(name, index);
        match self {
            Self::Local { root } => {
                SourceRef::local(root.join(job_id.as_str()).join(PROCESSED_DIR).join(name))
            }
            Self::Remote(location) => location.object(&name),
        }
    }

    /// True if `location` lies inside this layout's output area, so earlier
    /// outputs are not picked up again as inputs.
    #[must_use]
    pub fn contains(&self, location: &SourceRef) -> bool {
        match (self, location) {
            (Self::Remote(output), SourceRef::Remote { bucket, key, .. }) => {
                let prefix = output.folder_prefix();
                bucket == &output.bucket && !prefix.is_empty() && key.starts_with(&prefix)
            }
            (Self::Local { root }, SourceRef::Local { path }) => path.starts_with(root),
            _ => false,
        }
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Local { root } => root.display().to_string(),
            Self::Remote(location) => location.uri(),
        }
    }
}

impl Default for ArtifactLayout {
    fn default() -> Self {
        Self::local(DEFAULT_OUTPUT_DIR)
    }
}

/// Drops empty, `.` and `..` components. Names with nothing left become
/// `item-<index>`.
pub(crate) fn safe_relative_name(name: &str, index: usize) -> String {
    let cleaned: Vec<&str> = name
        .split(['/', '\\'])
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .collect();
    if cleaned.is_empty() { format!("item-{index}") } else { cleaned.join("/") }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_local_layout_paths() {
        let temp = TempDir::new().unwrap();
        let layout = ArtifactLayout::local(temp.path());
        let id = JobId::from("job-1");

        assert_eq!(layout.artifact_ref(&id, 0, "a.jpg"), SourceRef::local(temp.path().join("job-1/processed/a.jpg")));
        assert!(layout.contains(&layout.artifact_ref(&id, 0, "a.jpg")));
    }

    #[test]
    fn test_artifact_ref_stays_inside_root() {
        let temp = TempDir::new().unwrap();
        let layout = ArtifactLayout::local(temp.path());
        let id = JobId::from("job-1");
        let processed = temp.path().join("job-1/processed");

        assert_eq!(layout.artifact_ref(&id, 0, "/etc/x.jpg"), SourceRef::local(processed.join("etc/x.jpg")));
        assert_eq!(layout.artifact_ref(&id, 1, "../../up.jpg"), SourceRef::local(processed.join("up.jpg")));
        assert_eq!(layout.artifact_ref(&id, 2, "./.."), SourceRef::local(processed.join("item-2")));
    }

    #[test]
    fn test_safe_relative_name() {
        assert_eq!(safe_relative_name("day1//a.jpg", 0), "day1/a.jpg");
        assert_eq!(safe_relative_name("..\\..\\win.jpg", 0), "win.jpg");
        assert_eq!(safe_relative_name("", 4), "item-4");
    }

    #[test]
    fn test_default_remote_layout() {
        let input = RemoteLocation::parse("s3://photos/input", "us-east-1").unwrap();
        let layout = ArtifactLayout::default_remote_for(&input);
        let id = JobId::new();

        assert_eq!(
            layout.artifact_ref(&id, 0, "a.jpg"),
            SourceRef::remote("photos", "input/processed/a.jpg", "us-east-1")
        );
        assert!(layout.contains(&SourceRef::remote("photos", "input/processed/old.jpg", "us-east-1")));
        assert!(!layout.contains(&SourceRef::remote("photos", "input/new.jpg", "us-east-1")));
        assert_eq!(
            layout.artifact_ref(&id, 0, "/day2/b.jpg"),
            SourceRef::remote("photos", "input/processed/day2/b.jpg", "us-east-1")
        );
    }
}
