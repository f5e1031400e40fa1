// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn job() -> TrackedJob {
    TrackedJob::new(
        "2025-01-15T10-30-00-123__train",
        "train",
        "2025-01-15T10:30:00".to_string(),
    )
}

#[test]
fn fresh_job_is_initializing() {
    let j = job();
    assert_eq!(j.status(), JobStatus::Initializing);
    assert!(!j.is_terminal());
    assert_eq!(j.exit_code, -1);
}

#[test]
fn init_error_is_aborted_and_terminal() {
    let mut j = job();
    j.init_complete = true;
    j.init_error = "sync failed".into();
    assert_eq!(j.status(), JobStatus::Aborted);
    assert!(j.is_terminal());
}

#[test]
fn cancel_during_init_is_aborted() {
    let mut j = job();
    j.canceled = true;
    j.completed = true;
    j.exit_code = 130;
    assert_eq!(j.status(), JobStatus::Aborted);
}

#[test]
fn running_when_node_known() {
    let mut j = job();
    j.init_complete = true;
    j.compute_node = "cc1gpu001".into();
    assert_eq!(j.status(), JobStatus::Running);

    j.compute_node.clear();
    assert_eq!(j.status(), JobStatus::Pending);
}

#[test]
fn completion_statuses() {
    let mut j = job();
    j.init_complete = true;
    j.completed = true;
    j.exit_code = 0;
    assert_eq!(j.status(), JobStatus::Completed);

    j.exit_code = 2;
    assert_eq!(j.status(), JobStatus::Failed(2));

    j.canceled = true;
    j.exit_code = 130;
    assert_eq!(j.status(), JobStatus::Canceled);
}

#[test]
fn status_display() {
    assert_eq!(JobStatus::Failed(-1).to_string(), "FAILED (exit -1)");
    assert_eq!(JobStatus::Running.to_string(), "RUNNING");
}

#[test]
fn serde_defaults_tolerate_missing_fields() {
    let j: TrackedJob =
        serde_json::from_str(r#"{"job_id":"x__a","job_name":"a"}"#).unwrap();
    assert_eq!(j.exit_code, -1);
    assert!(!j.completed);
    assert!(j.forwarded_ports.is_empty());
}
