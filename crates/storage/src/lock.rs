// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide singleton lock.
//!
//! Exactly one orchestrator runs per host user; a lock file under the
//! tool home enforces it. The lock is held for the program's lifetime
//! and released by the OS on exit, however abrupt.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

pub struct SingletonLock {
    _file: File,
    path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another tccp instance is already running (lock: {0})")]
    AlreadyRunning(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("no home directory")]
    NoHome,
}

impl SingletonLock {
    /// Acquire `<tool-home>/tool.lock` exclusively.
    pub fn acquire() -> Result<Self, LockError> {
        let home = dirs::home_dir().ok_or(LockError::NoHome)?;
        Self::acquire_at(&home.join(".tccp").join("tool.lock"))
    }

    pub fn acquire_at(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.try_lock_exclusive()
            .map_err(|_| LockError::AlreadyRunning(path.to_path_buf()))?;
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
