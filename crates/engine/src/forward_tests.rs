// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[tokio::test]
async fn closed_port_reports_not_open() {
    // Bind then drop to get a port nothing listens on
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    assert!(!PortForwarder::is_port_open(port).await);
}

#[tokio::test]
async fn listening_port_reports_open() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    assert!(PortForwarder::is_port_open(port).await);
}

#[tokio::test]
async fn ensure_hop_keys_reports_success_marker() {
    let fake = tccp_ssh::FakeRemote::new();
    fake.on("ssh-keygen", tccp_core::SshResult::ok("KEYS_OK\n"));
    let remote: Arc<dyn Remote> = Arc::new(fake.clone());

    assert!(ensure_hop_keys(&remote, None).await);
    assert_eq!(fake.calls().len(), 1);

    let failing = tccp_ssh::FakeRemote::new();
    failing.on("ssh-keygen", tccp_core::SshResult::err("read-only fs"));
    let remote: Arc<dyn Remote> = Arc::new(failing);
    assert!(!ensure_hop_keys(&remote, None).await);
}
