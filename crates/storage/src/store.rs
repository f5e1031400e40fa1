// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! YAML state store with atomic rewrite.
//!
//! Loads tolerate corruption by returning an empty state — the
//! allocation manager's reconciliation rebuilds from the scheduler.

use crate::state::ProjectState;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("no home directory")]
    NoHome,
}

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Store for `<tool-home>/state/<project>.yaml`.
    pub fn for_project(project_name: &str) -> Result<Self, StorageError> {
        let home = dirs::home_dir().ok_or(StorageError::NoHome)?;
        Ok(Self {
            path: home
                .join(".tccp")
                .join("state")
                .join(format!("{project_name}.yaml")),
        })
    }

    /// Store at an explicit path (tests).
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state; a missing or unreadable file is an empty state.
    pub fn load(&self) -> ProjectState {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return ProjectState::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot read state file, starting fresh");
                return ProjectState::default();
            }
        };
        match serde_yaml::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "corrupt state file, starting fresh");
                ProjectState::default()
            }
        }
    }

    /// Persist atomically: write a temp file next to the target, fsync,
    /// rename.
    pub fn save(&self, state: &ProjectState) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let yaml = serde_yaml::to_string(state)?;
        let tmp = self.path.with_extension("yaml.tmp");
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(yaml.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
