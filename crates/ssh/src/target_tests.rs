// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn debug_never_leaks_password() {
    let t = SessionTarget::new("dtn.cluster.edu", "alice", "hunter2");
    let debug = format!("{t:?}");
    assert!(!debug.contains("hunter2"));
    assert!(debug.contains("dtn.cluster.edu"));
}

#[test]
fn defaults() {
    let t = SessionTarget::new("h", "u", "p");
    assert!(t.use_2fa);
    assert!(!t.auto_2fa);
    assert_eq!(t.timeout, Duration::from_secs(30));
    assert!(t.key_path.is_none());
}
