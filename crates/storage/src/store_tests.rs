// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use tccp_core::TrackedJob;

#[test]
fn missing_file_loads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::at_path(dir.path().join("none.yaml"));
    let state = store.load();
    assert!(state.jobs.is_empty());
    assert!(state.allocations.is_empty());
}

#[test]
fn save_then_load_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::at_path(dir.path().join("proj.yaml"));

    let mut state = ProjectState::default();
    state
        .jobs
        .push(TrackedJob::new("x__main", "main", "2025-01-15T10:00:00".into()));
    store.save(&state).unwrap();

    let loaded = store.load();
    assert_eq!(loaded.jobs.len(), 1);
    assert_eq!(loaded.jobs[0].job_name, "main");
}

#[test]
fn corrupt_file_loads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("proj.yaml");
    std::fs::write(&path, "jobs: [not: {valid").unwrap();

    let store = StateStore::at_path(&path);
    let state = store.load();
    assert!(state.jobs.is_empty());
}

#[test]
fn save_creates_parent_dirs_and_leaves_no_tmp() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("deep/nested/proj.yaml");
    let store = StateStore::at_path(&path);
    store.save(&ProjectState::default()).unwrap();

    assert!(path.exists());
    assert!(!path.with_extension("yaml.tmp").exists());
}

#[test]
fn save_overwrites_previous_state() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::at_path(dir.path().join("p.yaml"));

    let mut state = ProjectState::default();
    state.last_sync_node = "node01".into();
    store.save(&state).unwrap();

    state.last_sync_node = "node02".into();
    store.save(&state).unwrap();

    assert_eq!(store.load().last_sync_node, "node02");
}
