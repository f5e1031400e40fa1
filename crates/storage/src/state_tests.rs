// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use tccp_core::{Allocation, TrackedJob};

fn state_with_jobs(names: &[(&str, &str)]) -> ProjectState {
    let mut state = ProjectState::default();
    for (id, name) in names {
        state
            .jobs
            .push(TrackedJob::new(*id, *name, String::new()));
    }
    state
}

#[test]
fn allocation_lookup_and_removal() {
    let mut state = ProjectState::default();
    state.allocations.push(Allocation {
        slurm_id: "101".into(),
        ..Default::default()
    });

    assert!(state.allocation("101").is_some());
    state.allocation_mut("101").unwrap().node = "node01".into();
    assert_eq!(state.allocation("101").unwrap().node, "node01");

    state.remove_allocation("101");
    assert!(state.allocation("101").is_none());
}

#[test]
fn latest_job_by_name_prefers_newest_record() {
    let state = state_with_jobs(&[
        ("2025-01-15T10-00-00-000__train", "train"),
        ("2025-01-15T10-05-00-000__eval", "eval"),
        ("2025-01-15T11-00-00-000__train", "train"),
    ]);

    let latest = state.latest_job_by_name("train").unwrap();
    assert_eq!(latest.job_id, "2025-01-15T11-00-00-000__train");
    assert!(state.latest_job_by_name("missing").is_none());
}

#[test]
fn yaml_round_trip_preserves_everything() {
    let mut state = state_with_jobs(&[("x__a", "a")]);
    state.allocations.push(Allocation {
        slurm_id: "7".into(),
        node: "n1".into(),
        duration_minutes: 240,
        ..Default::default()
    });
    state.last_sync_node = "n1".into();
    state.last_sync_scratch = "/tmp/alice/proj/x__a".into();

    let yaml = serde_yaml::to_string(&state).unwrap();
    let back: ProjectState = serde_yaml::from_str(&yaml).unwrap();
    assert_eq!(back.allocations, state.allocations);
    assert_eq!(back.jobs, state.jobs);
    assert_eq!(back.last_sync_scratch, state.last_sync_scratch);
}
