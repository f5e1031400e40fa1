// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[tokio::test]
async fn unmatched_commands_succeed_empty() {
    let fake = FakeRemote::new();
    let r = fake.run("mkdir -p /tmp/x").await;
    assert!(r.success());
    assert_eq!(r.stdout, "");
    assert_eq!(fake.calls(), vec!["mkdir -p /tmp/x".to_string()]);
}

#[tokio::test]
async fn substring_rules_fire_in_order() {
    let fake = FakeRemote::new();
    fake.on("squeue -j 101", SshResult::ok("RUNNING cc1gpu001"));
    fake.on("squeue", SshResult::ok("PENDING "));

    assert_eq!(fake.run("squeue -j 101 -h").await.stdout, "RUNNING cc1gpu001");
    assert_eq!(fake.run("squeue -j 202 -h").await.stdout, "PENDING ");
}

#[tokio::test]
async fn once_rules_are_consumed() {
    let fake = FakeRemote::new();
    fake.on_once("test -e", SshResult::ok("RUNNING"));
    fake.on("test -e", SshResult::ok("DONE"));

    assert_eq!(fake.run("test -e /tmp/s.sock").await.stdout, "RUNNING");
    assert_eq!(fake.run("test -e /tmp/s.sock").await.stdout, "DONE");
}

#[tokio::test]
async fn calls_matching_filters() {
    let fake = FakeRemote::new();
    let _ = fake.run("sbatch << 'EOF'").await;
    let _ = fake.run("squeue -j 1").await;
    assert_eq!(fake.calls_matching("sbatch").len(), 1);
}
