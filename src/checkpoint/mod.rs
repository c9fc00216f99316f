//! Checkpoint persistence.
//!
//! One JSON file per run under `.porter/checkpoints/<run_id>.json`. Writes go
//! to a sibling `.tmp` file first and are renamed into place, so a reader only
//! ever sees a complete checkpoint.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use porter_common::Checkpoint;
use tracing::debug;

use crate::errors::CheckpointError;

/// Durable storage of one checkpoint per run id.
pub trait CheckpointStore: Send + Sync {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;
    fn load(&self, run_id: &str) -> Result<Checkpoint, CheckpointError>;
    fn clear(&self, run_id: &str) -> Result<(), CheckpointError>;
}

pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }

    /// Read a checkpoint file from an arbitrary path.
    pub fn load_file(path: &Path) -> Result<Checkpoint, CheckpointError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound {
                    run_id: path
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                });
            }
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&content).map_err(|e| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Every retained checkpoint, sorted by file name. Unreadable files are
    /// returned as errors rather than skipped.
    pub fn list(&self) -> Result<Vec<(PathBuf, Result<Checkpoint, CheckpointError>)>, CheckpointError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        Ok(paths
            .into_iter()
            .map(|p| {
                let loaded = Self::load_file(&p);
                (p, loaded)
            })
            .collect())
    }

    fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError + '_ {
        move |source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    fs::create_dir_all(parent)?;

    let tmp = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.path_for(&checkpoint.run_id);
        let json = serde_json::to_vec_pretty(checkpoint).map_err(|e| CheckpointError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        if let Ok(existing) = fs::read(&path)
            && existing == json
        {
            debug!(run_id = %checkpoint.run_id, "checkpoint unchanged");
            return Ok(());
        }

        write_atomic(&path, &json).map_err(Self::io_err(&path))?;
        debug!(run_id = %checkpoint.run_id, completed = checkpoint.completed_unit_ids.len(), "checkpoint saved");
        Ok(())
    }

    fn load(&self, run_id: &str) -> Result<Checkpoint, CheckpointError> {
        Self::load_file(&self.path_for(run_id))
    }

    fn clear(&self, run_id: &str) -> Result<(), CheckpointError> {
        let path = self.path_for(run_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CheckpointError::Io { path, source }),
        }
    }
}
