// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn acquire_then_conflict_then_release() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tool.lock");

    let lock = SingletonLock::acquire_at(&path).unwrap();
    assert_eq!(lock.path(), path);

    // A second holder in the same process is refused
    assert!(matches!(
        SingletonLock::acquire_at(&path),
        Err(LockError::AlreadyRunning(_))
    ));

    drop(lock);
    // Released on drop: can be re-acquired
    assert!(SingletonLock::acquire_at(&path).is_ok());
}

#[test]
fn acquire_creates_parent_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("home/.tccp/tool.lock");
    assert!(SingletonLock::acquire_at(&path).is_ok());
    assert!(path.exists());
}
