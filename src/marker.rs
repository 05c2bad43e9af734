//! Completion markers and per-stage advisory locks.

use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::domain::{DatasetId, Stage};
use crate::error::IngestError;
use crate::layout::Layout;

const LOCK_POLL: Duration = Duration::from_millis(100);

/// Body of a marker file. Only the file's existence is load-bearing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerRecord {
    pub dataset: DatasetId,
    pub stage: Stage,
    pub completed_at: String,
    pub tool: String,
}

#[derive(Debug, Clone)]
pub struct Markers {
    layout: Layout,
}

impl Markers {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    pub fn exists(&self, id: &DatasetId, stage: Stage) -> bool {
        self.layout.marker(id, stage).as_std_path().is_file()
    }

    /// Records completion of `stage`.
    ///
    /// Download has no separate marker: its archive is renamed into place by
    /// the stage body, so this only confirms the archive is there.
    pub fn complete(&self, id: &DatasetId, stage: Stage) -> Result<(), IngestError> {
        let path = self.layout.marker(id, stage);
        if stage == Stage::Download {
            if !path.as_std_path().is_file() {
                return Err(IngestError::Filesystem(format!(
                    "download finished without producing {path}"
                )));
            }
            return Ok(());
        }
        let record = MarkerRecord {
            dataset: id.clone(),
            stage,
            completed_at: chrono::Utc::now().to_rfc3339(),
            tool: format!("geo-ingest/{}", env!("CARGO_PKG_VERSION")),
        };
        let content = serde_json::to_vec_pretty(&record)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        write_bytes_atomic(&path, &content)
    }

    pub fn read(&self, id: &DatasetId, stage: Stage) -> Option<MarkerRecord> {
        let path = self.layout.marker(id, stage);
        let content = fs::read(path.as_std_path()).ok()?;
        serde_json::from_slice(&content).ok()
    }

    /// Forgets completion of `stage`. The download marker is the archive, so
    /// clearing it deletes the archive.
    pub fn clear(&self, id: &DatasetId, stage: Stage) -> Result<bool, IngestError> {
        let path = self.layout.marker(id, stage);
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(IngestError::fs(format!("remove marker {path}"), err)),
        }
    }

    pub fn lock(
        &self,
        id: &DatasetId,
        stage: Stage,
        wait: Duration,
    ) -> Result<StageLock, IngestError> {
        StageLock::acquire(&self.layout.lock(id, stage), id, stage, wait)
    }
}

/// Exclusive OS lock on a stage's lock file, released on drop.
///
/// The OS drops the lock if the process dies, so a crashed run never
/// blocks the next one.
#[derive(Debug)]
pub struct StageLock {
    file: File,
}

impl StageLock {
    fn acquire(
        path: &Utf8Path,
        id: &DatasetId,
        stage: Stage,
        wait: Duration,
    ) -> Result<Self, IngestError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| IngestError::fs(format!("create lock dir {parent}"), err))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path.as_std_path())
            .map_err(|err| IngestError::fs(format!("open lock {path}"), err))?;

        let deadline = Instant::now() + wait;
        loop {
            match file.try_lock() {
                Ok(()) => return Ok(Self { file }),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(IngestError::StageLocked {
                            dataset: id.clone(),
                            stage,
                            lock: path.as_std_path().to_path_buf(),
                        });
                    }
                    thread::sleep(LOCK_POLL);
                }
                Err(TryLockError::Error(err)) => {
                    return Err(IngestError::fs(format!("lock {path}"), err));
                }
            }
        }
    }
}

impl Drop for StageLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Writes `content` next to `path` and renames it into place.
pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), IngestError> {
    let parent = path
        .parent()
        .ok_or_else(|| IngestError::Filesystem(format!("no parent directory for {path}")))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| IngestError::fs(format!("create {parent}"), err))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".geo-ingest")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| IngestError::fs(format!("temp file in {parent}"), err))?;
    temp.write_all(content)
        .and_then(|()| temp.as_file().sync_all())
        .map_err(|err| IngestError::fs(format!("write {path}"), err))?;
    temp.persist(path.as_std_path())
        .map_err(|err| IngestError::fs(format!("persist {path}"), err.error))?;
    Ok(())
}
