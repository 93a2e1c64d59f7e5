//! Bounded pool that builds many entries
//!
//! Each job builds one entry in isolation: it gets its own working
//! directory and shares nothing mutable with other jobs. A failing job is
//! logged and reported; the rest of the batch keeps going.

use crate::config::BuildConfig;
use crate::db::FileSystemDb;
use crate::entry::{EntryBuilder, EntryInput};
use crate::error::{Result, VolsegError};
use crate::types::EntryId;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

/// Produces the input of one entry, e.g. by parsing its source files
#[async_trait]
pub trait EntryLoader: Send + Sync {
    /// `work_dir` is private to this job and removed when the job ends
    async fn load(&self, entry: &EntryId, work_dir: &Path) -> Result<EntryInput>;
}

/// Directory removed when the guard goes out of scope
#[derive(Debug)]
pub struct WorkingArea {
    path: PathBuf,
}

impl WorkingArea {
    /// Create a fresh uniquely named directory under `parent`
    pub async fn create(parent: &Path, label: &str) -> Result<Self> {
        let path = parent.join(format!("{}-{}", label, Uuid::new_v4()));
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkingArea {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove working area");
            }
        }
    }
}

/// Outcome of a batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: Vec<EntryId>,
    /// Entry and the error that aborted it
    pub failed: Vec<(EntryId, String)>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct BuildPool {
    builder: EntryBuilder,
    max_workers: usize,
    working_dir: PathBuf,
}

impl BuildPool {
    pub fn new(db: Arc<FileSystemDb>, config: &BuildConfig) -> Result<Self> {
        Ok(Self {
            builder: EntryBuilder::new(db, config)?,
            max_workers: config.max_workers,
            working_dir: config.working_dir.clone().unwrap_or_else(std::env::temp_dir),
        })
    }

    pub fn builder(&self) -> &EntryBuilder {
        &self.builder
    }

    /// Build every entry with at most `max_workers` in flight.
    ///
    /// Only failing to set up the batch working area is an error; per-entry
    /// failures (including panics) end up in the report.
    pub async fn run(&self, entries: Vec<EntryId>, loader: Arc<dyn EntryLoader>) -> Result<BatchReport> {
        let batch_area = Arc::new(WorkingArea::create(&self.working_dir, "volseg-batch").await?);
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let total = entries.len();
        info!(total, workers = self.max_workers, "starting batch build");

        let mut jobs: JoinSet<(EntryId, Result<()>)> = JoinSet::new();
        for entry in entries {
            let semaphore = Arc::clone(&semaphore);
            let batch_area = Arc::clone(&batch_area);
            let loader = Arc::clone(&loader);
            let builder = self.builder.clone();
            jobs.spawn(async move {
                let job = async {
                    let _permit = semaphore
                        .acquire()
                        .await
                        .map_err(|_| VolsegError::TaskFailed("worker pool closed".to_string()))?;
                    let area = WorkingArea::create(batch_area.path(), "entry").await?;
                    let input = loader.load(&entry, area.path()).await?;
                    if input.entry_id != entry {
                        return Err(VolsegError::InvalidInput(format!(
                            "Loader returned entry {} for {}",
                            input.entry_id, entry
                        )));
                    }
                    builder.build(input).await.map(|_| ())
                };
                let result = match AssertUnwindSafe(job).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(VolsegError::TaskFailed("build panicked".to_string())),
                };
                (entry, result)
            });
        }

        let mut report = BatchReport::default();
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok((entry, Ok(()))) => report.succeeded.push(entry),
                Ok((entry, Err(e))) => {
                    warn!(%entry, error = %e, "entry build failed");
                    report.failed.push((entry, e.to_string()));
                }
                Err(e) => warn!(error = %e, "build task could not be joined"),
            }
        }
        report.succeeded.sort();
        report.failed.sort();
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "batch build finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::ScalarGrid;
    use crate::pyramid::{PyramidConfig, VolumeFrame};
    use ndarray::Array3;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Builds a small cube for every id except "broken"; records work dirs
    struct CubeLoader {
        seen_dirs: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl EntryLoader for CubeLoader {
        async fn load(&self, entry: &EntryId, work_dir: &Path) -> Result<EntryInput> {
            assert!(work_dir.is_dir());
            self.seen_dirs.lock().push(work_dir.to_path_buf());
            if entry.id == "broken" {
                return Err(VolsegError::DataShape("unreadable map header".to_string()));
            }
            Ok(EntryInput::new(entry.clone(), [0.0; 3], [1.0; 3]).with_volume(vec![VolumeFrame {
                time: 0,
                channel: 0,
                grid: ScalarGrid::from(Array3::from_elem((8, 8, 8), 1u8)),
            }]))
        }
    }

    #[tokio::test]
    async fn test_batch_continues_after_failure() {
        let db_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();
        let db = Arc::new(FileSystemDb::new(db_dir.path()));
        let config = BuildConfig::default()
            .with_pyramid(PyramidConfig::default().with_min_grid_size(8))
            .with_max_workers(2)
            .with_working_dir(work_dir.path());
        let pool = BuildPool::new(Arc::clone(&db), &config).unwrap();
        let loader = Arc::new(CubeLoader {
            seen_dirs: Mutex::new(Vec::new()),
        });

        let entries = ["a", "broken", "c"].map(|id| EntryId::new("emdb", id)).to_vec();
        let report = pool.run(entries, loader.clone()).await.unwrap();

        assert_eq!(report.succeeded, vec![EntryId::new("emdb", "a"), EntryId::new("emdb", "c")]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, EntryId::new("emdb", "broken"));
        assert!(!report.is_success());
        assert!(db.contains(&EntryId::new("emdb", "a")).await.unwrap());
        assert!(!db.contains(&EntryId::new("emdb", "broken")).await.unwrap());

        // every working area is gone, including the batch root
        assert_eq!(loader.seen_dirs.lock().len(), 3);
        assert!(loader.seen_dirs.lock().iter().all(|d| !d.exists()));
        assert_eq!(std::fs::read_dir(work_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_working_area_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let area = WorkingArea::create(dir.path(), "job").await.unwrap();
        let path = area.path().to_path_buf();
        std::fs::write(path.join("scratch.bin"), b"x").unwrap();
        drop(area);
        assert!(!path.exists());
    }
}
