// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cluster allocation record.
//!
//! An allocation is a long-lived `sleep infinity` batch job that reserves
//! resources; user-visible jobs attach to it one at a time.

use crate::profile::SlurmProfile;
use crate::time::parse_iso;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// SLURM job id of the reservation.
    pub slurm_id: String,
    /// Compute node, empty while PENDING.
    #[serde(default)]
    pub node: String,
    /// ISO-8601 time the scheduler promoted it to RUNNING.
    #[serde(default)]
    pub start_time: String,
    #[serde(default = "default_duration")]
    pub duration_minutes: u32,
    /// Job currently attached to this allocation; empty when idle.
    #[serde(default)]
    pub active_job_id: String,
    /// Resources the allocation was submitted with.
    #[serde(flatten)]
    pub resources: SlurmProfile,
}

fn default_duration() -> u32 {
    240
}

impl Allocation {
    pub fn is_idle(&self) -> bool {
        self.active_job_id.is_empty()
    }

    pub fn is_pending(&self) -> bool {
        self.node.is_empty()
    }

    /// Minutes left before the reservation expires, measured from
    /// `start_time`. Pending allocations (no start time) report 0.
    pub fn remaining_minutes(&self, now_epoch: i64) -> u32 {
        let Some(start) = parse_iso(&self.start_time) else {
            return 0;
        };
        let elapsed_min = ((now_epoch - start) / 60).max(0) as u32;
        self.duration_minutes.saturating_sub(elapsed_min)
    }
}

#[cfg(test)]
#[path = "alloc_tests.rs"]
mod tests;
