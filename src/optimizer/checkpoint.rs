//! Checkpoint persistence for resumable optimization runs.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::schema::{OptimizerState, ParameterSpec, StateError};

/// File name of the checkpoint document inside the checkpoint directory.
pub const CHECKPOINT_FILE: &str = "optimizer_checkpoint.json";

/// Checkpoint persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Checkpoint {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Checkpoint does not match the selected parameters: {0}")]
    Incompatible(StateError),
}

/// Stores the optimizer state as a JSON document under a project directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Store using the default file name inside `dir`.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            path: dir.as_ref().join(CHECKPOINT_FILE),
        }
    }

    /// Store at an explicit file path.
    pub fn at_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Write the state. The document is written to a sibling temporary file
    /// and renamed into place so readers never see a partial write.
    pub async fn save(&self, state: &OptimizerState) -> Result<(), CheckpointError> {
        let io_err = |source: io::Error| CheckpointError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let json = serde_json::to_string_pretty(state).map_err(|e| io_err(e.into()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await.map_err(io_err)?;
        fs::rename(&tmp, &self.path).await.map_err(io_err)?;

        log::debug!(
            "Checkpoint saved at {} evaluations to {}",
            state.evaluations_completed,
            self.path.display()
        );
        Ok(())
    }

    /// Read the stored state.
    ///
    /// Returns `Ok(None)` when no checkpoint exists, and an error when one
    /// exists but cannot be read or parsed.
    pub async fn load(&self) -> Result<Option<OptimizerState>, CheckpointError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let state = serde_json::from_str(&content).map_err(|source| CheckpointError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(state))
    }

    /// Read the stored state and check it against the run's parameters.
    pub async fn load_for(
        &self,
        specs: &[ParameterSpec],
    ) -> Result<Option<OptimizerState>, CheckpointError> {
        let Some(state) = self.load().await? else {
            return Ok(None);
        };
        for entry in state.population.iter().chain(state.best_design.iter()) {
            entry
                .params
                .conforms_to(specs)
                .map_err(CheckpointError::Incompatible)?;
        }
        Ok(Some(state))
    }

    /// Remove the stored checkpoint, if any.
    pub async fn clear(&self) -> Result<(), CheckpointError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CheckpointError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}
