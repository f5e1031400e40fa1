// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no job named '{0}' in tccp.yaml")]
    JobNotDefined(String),

    #[error("job '{0}' not found")]
    JobNotFound(String),

    #[error("allocation failed: {0}")]
    Allocation(String),

    #[error("allocation {slurm_id} died: {state}")]
    AllocationDied { slurm_id: String, state: String },

    #[error("lost connection while waiting for allocation {0}")]
    AllocationQueryLost(String),

    #[error("timed out waiting for allocation {0}")]
    AllocationTimeout(String),

    #[error("{0}")]
    GpuResolve(String),

    #[error("sync failed: {0}")]
    Sync(String),

    #[error("environment provisioning failed: {0}")]
    Environment(String),

    #[error("launch failed: {0}")]
    Launch(String),

    #[error("canceled during initialization")]
    Canceled,

    #[error("job '{0}' already canceled")]
    AlreadyCanceled(String),

    #[error("job '{name}' already completed (exit {exit_code})")]
    AlreadyCompleted { name: String, exit_code: i32 },

    #[error("not connected")]
    NotConnected,

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] tccp_storage::StorageError),

    #[error(transparent)]
    Ssh(#[from] tccp_ssh::SshError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
