// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use tccp_core::TrackedJob;

fn handle(dir: &tempfile::TempDir) -> StateHandle {
    StateHandle::load(StateStore::at_path(dir.path().join("state.yaml")))
}

#[test]
fn update_persists_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let h = handle(&dir);

    h.update(|s| {
        s.jobs
            .push(TrackedJob::new("x__main", "main", String::new()));
    });

    // A fresh store sees the mutation
    let reloaded = StateStore::at_path(dir.path().join("state.yaml")).load();
    assert_eq!(reloaded.jobs.len(), 1);
}

#[test]
fn with_reads_current_state() {
    let dir = tempfile::tempdir().unwrap();
    let h = handle(&dir);
    h.update(|s| s.last_sync_node = "node01".into());
    assert_eq!(h.with(|s| s.last_sync_node.clone()), "node01");
}

#[test]
fn reload_discards_in_memory_changes_not_persisted_elsewhere() {
    let dir = tempfile::tempdir().unwrap();
    let h = handle(&dir);
    h.update(|s| s.last_sync_node = "node01".into());

    // External writer rewrites the file
    let store = StateStore::at_path(dir.path().join("state.yaml"));
    let mut external = store.load();
    external.last_sync_node = "node02".into();
    store.save(&external).unwrap();

    h.reload();
    assert_eq!(h.with(|s| s.last_sync_node.clone()), "node02");
}
