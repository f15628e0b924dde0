//! Resolves a request's `target` name to a directory on disk. Grounded on
//! `yadtreceiver.TargetResolver` (a thin `os.path.join` + existence check
//! in the original).

use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("target {target:?} does not exist under {targets_directory}")]
    NotFound {
        target: String,
        targets_directory: String,
    },
}

pub struct TargetResolver {
    targets_directory: PathBuf,
}

impl TargetResolver {
    pub fn new(targets_directory: impl Into<PathBuf>) -> Self {
        Self {
            targets_directory: targets_directory.into(),
        }
    }

    pub fn resolve(&self, target: &str) -> Result<PathBuf, TargetError> {
        let candidate = self.targets_directory.join(target);
        if candidate.is_dir() {
            Ok(candidate)
        } else {
            Err(TargetError::NotFound {
                target: target.to_string(),
                targets_directory: self.targets_directory.display().to_string(),
            })
        }
    }

    pub fn targets_directory(&self) -> &Path {
        &self.targets_directory
    }
}
