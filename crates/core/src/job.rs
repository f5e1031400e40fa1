// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-submission job record and derived status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One submitted job. Created at submission, mutated by its init task
/// until `init_complete`, then by the poll loop until `completed`.
///
/// A job never reopens after `completed`; resubmitting a name creates a
/// fresh record with a new id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedJob {
    pub job_id: String,
    pub job_name: String,
    /// SLURM id of the allocation hosting this job.
    #[serde(default)]
    pub alloc_slurm_id: String,
    #[serde(default)]
    pub compute_node: String,
    #[serde(default)]
    pub scratch_path: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub canceled: bool,
    #[serde(default = "default_exit_code")]
    pub exit_code: i32,
    #[serde(default)]
    pub output_file: String,
    #[serde(default)]
    pub init_complete: bool,
    #[serde(default)]
    pub init_error: String,
    #[serde(default)]
    pub output_returned: bool,
    #[serde(default)]
    pub submit_time: String,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    #[serde(default)]
    pub forwarded_ports: Vec<u16>,
}

fn default_exit_code() -> i32 {
    -1
}

/// User-facing lifecycle status, derived from the record's flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Init task still working through the pipeline.
    Initializing,
    /// Init failed or the job was canceled before launch.
    Aborted,
    /// Launched; waiting for the allocation's node.
    Pending,
    Running,
    Completed,
    Failed(i32),
    Canceled,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Initializing => write!(f, "INITIALIZING"),
            JobStatus::Aborted => write!(f, "ABORTED"),
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed(code) => write!(f, "FAILED (exit {code})"),
            JobStatus::Canceled => write!(f, "CANCELED"),
        }
    }
}

impl TrackedJob {
    pub fn new(job_id: impl Into<String>, job_name: impl Into<String>, submit_time: String) -> Self {
        Self {
            job_id: job_id.into(),
            job_name: job_name.into(),
            submit_time,
            exit_code: -1,
            ..Default::default()
        }
    }

    /// Terminal means no further state transitions will happen.
    pub fn is_terminal(&self) -> bool {
        self.completed || self.canceled || !self.init_error.is_empty()
    }

    pub fn status(&self) -> JobStatus {
        if !self.init_error.is_empty() {
            JobStatus::Aborted
        } else if self.canceled && !self.init_complete {
            JobStatus::Aborted
        } else if !self.init_complete {
            JobStatus::Initializing
        } else if self.completed && self.canceled {
            JobStatus::Canceled
        } else if self.completed {
            if self.exit_code == 0 {
                JobStatus::Completed
            } else {
                JobStatus::Failed(self.exit_code)
            }
        } else if !self.compute_node.is_empty() {
            JobStatus::Running
        } else {
            JobStatus::Pending
        }
    }
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;
