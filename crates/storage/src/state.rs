// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The persisted per-project state.

use serde::{Deserialize, Serialize};
use tccp_core::{Allocation, Manifest, TrackedJob};

/// Everything that survives a process restart for one project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectState {
    #[serde(default)]
    pub allocations: Vec<Allocation>,
    #[serde(default)]
    pub jobs: Vec<TrackedJob>,
    /// Manifest of the last successful sync.
    #[serde(default)]
    pub last_sync_manifest: Manifest,
    /// Compute node the manifest was produced on.
    #[serde(default)]
    pub last_sync_node: String,
    /// Scratch path the manifest was synced into.
    #[serde(default)]
    pub last_sync_scratch: String,
}

impl ProjectState {
    pub fn allocation(&self, slurm_id: &str) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.slurm_id == slurm_id)
    }

    pub fn allocation_mut(&mut self, slurm_id: &str) -> Option<&mut Allocation> {
        self.allocations.iter_mut().find(|a| a.slurm_id == slurm_id)
    }

    pub fn remove_allocation(&mut self, slurm_id: &str) {
        self.allocations.retain(|a| a.slurm_id != slurm_id);
    }

    pub fn job(&self, job_id: &str) -> Option<&TrackedJob> {
        self.jobs.iter().find(|j| j.job_id == job_id)
    }

    pub fn job_mut(&mut self, job_id: &str) -> Option<&mut TrackedJob> {
        self.jobs.iter_mut().find(|j| j.job_id == job_id)
    }

    /// The most recent job with the given name (records append in
    /// submission order, so last match wins).
    pub fn latest_job_by_name(&self, job_name: &str) -> Option<&TrackedJob> {
        self.jobs.iter().rev().find(|j| j.job_name == job_name)
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
