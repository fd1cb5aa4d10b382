//! On-disk layout of the job store
//!
//! ```text
//! <root>/
//!   jobs/     one `<id>.json` record per job
//!   scripts/  stored copies of submitted scripts
//!   logs/     captured stdout/stderr, one `<id>.log` per job
//! ```

use std::path::{Path, PathBuf};
use uuid::Uuid;

const RECORD_EXTENSION: &str = "json";
const PARTIAL_SUFFIX: &str = "tmp";

/// Paths used by the job store
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    /// Create a layout rooted at the given directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn records_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.root.join("scripts")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Create all directories
    pub async fn init(&self) -> std::io::Result<()> {
        for dir in [self.records_dir(), self.scripts_dir(), self.logs_dir()] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Committed record of a job
    pub fn record_path(&self, id: Uuid) -> PathBuf {
        self.records_dir()
            .join(format!("{}.{}", id, RECORD_EXTENSION))
    }

    /// Record being written, renamed over [`Self::record_path`] once complete
    pub fn partial_record_path(&self, id: Uuid) -> PathBuf {
        self.records_dir()
            .join(format!("{}.{}.{}", id, RECORD_EXTENSION, PARTIAL_SUFFIX))
    }

    /// Stored script; keeps the extension of the uploaded file name
    pub fn script_path(&self, id: Uuid, original_name: Option<&str>) -> PathBuf {
        let extension = original_name
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()));

        let file_name = match extension {
            Some(ext) => format!("{}.{}", id, ext),
            None => id.to_string(),
        };
        self.scripts_dir().join(file_name)
    }

    /// Captured output of a job
    pub fn log_path(&self, id: Uuid) -> PathBuf {
        self.logs_dir().join(format!("{}.log", id))
    }

    /// Whether a file in the records directory is a committed record
    pub fn is_record(path: &Path) -> bool {
        path.extension().map_or(false, |e| e == RECORD_EXTENSION)
    }

    /// Whether a file in the records directory is a leftover partial write
    pub fn is_partial_record(path: &Path) -> bool {
        path.extension().map_or(false, |e| e == PARTIAL_SUFFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let layout = StoreLayout::new("/var/lib/gpusched");
        let id = Uuid::nil();
        assert_eq!(
            layout.record_path(id),
            PathBuf::from(format!("/var/lib/gpusched/jobs/{}.json", id))
        );
        assert_eq!(
            layout.log_path(id),
            PathBuf::from(format!("/var/lib/gpusched/logs/{}.log", id))
        );
        assert!(StoreLayout::is_record(&layout.record_path(id)));
        assert!(StoreLayout::is_partial_record(&layout.partial_record_path(id)));
        assert!(!StoreLayout::is_record(&layout.partial_record_path(id)));
    }

    #[test]
    fn test_script_path_extension() {
        let layout = StoreLayout::new("/data");
        let id = Uuid::nil();
        assert_eq!(
            layout.script_path(id, Some("train.py")),
            PathBuf::from(format!("/data/scripts/{}.py", id))
        );
        assert_eq!(
            layout.script_path(id, Some("../../etc/passwd")),
            PathBuf::from(format!("/data/scripts/{}", id))
        );
        assert_eq!(
            layout.script_path(id, Some("run.s h")),
            PathBuf::from(format!("/data/scripts/{}", id))
        );
        assert_eq!(
            layout.script_path(id, None),
            PathBuf::from(format!("/data/scripts/{}", id))
        );
    }
}
