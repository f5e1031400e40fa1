// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local port forwarding to compute nodes.
//!
//! One listener per configured port on 127.0.0.1; each accepted
//! connection gets its own gateway-side direct-tcpip channel to
//! `<node>:<port>` and a byte bridge in both directions.

use std::sync::Arc;
use std::time::Duration;
use tccp_core::StatusCallback;
use tccp_ssh::{Connections, Remote};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A running tunnel. Dropping the handle tears the listener down; open
/// bridges finish on their own when either side closes.
pub struct TunnelHandle {
    pub port: u16,
    task: JoinHandle<()>,
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct PortForwarder {
    conns: Arc<Connections>,
    dtn: Arc<dyn Remote>,
}

impl PortForwarder {
    pub fn new(conns: Arc<Connections>, dtn: Arc<dyn Remote>) -> Self {
        Self { conns, dtn }
    }

    /// Is something already listening on localhost:port?
    pub async fn is_port_open(port: u16) -> bool {
        tokio::time::timeout(
            Duration::from_millis(250),
            TcpStream::connect(("127.0.0.1", port)),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
    }

    /// Ensure an SSH keypair exists on the gateway and is authorized,
    /// so second-hop ssh/scp to compute nodes runs unprompted.
    pub async fn ensure_keys(&self, status: Option<StatusCallback>) -> bool {
        ensure_hop_keys(&self.dtn, status).await
    }

    /// Start one tunnel per port. Ports already in use are skipped.
    pub async fn start(
        &self,
        compute_node: &str,
        ports: &[u16],
        status: Option<StatusCallback>,
    ) -> Vec<TunnelHandle> {
        let mut handles = Vec::new();

        for &port in ports {
            if Self::is_port_open(port).await {
                if let Some(cb) = &status {
                    cb(&format!("Port {port} already in use — skipping"));
                }
                continue;
            }

            let listener = match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(l) => l,
                Err(e) => {
                    if let Some(cb) = &status {
                        cb(&format!("bind() failed for port {port}: {e}"));
                    }
                    continue;
                }
            };

            let conns = Arc::clone(&self.conns);
            let node = compute_node.to_string();
            let task = tokio::spawn(async move {
                accept_loop(listener, conns, node, port).await;
            });

            if let Some(cb) = &status {
                cb(&format!("localhost:{port} → {compute_node}:{port} ready"));
            }
            handles.push(TunnelHandle { port, task });
        }

        handles
    }

    /// Tear down a set of tunnels.
    pub fn stop(handles: &mut Vec<TunnelHandle>) {
        handles.clear();
    }
}

/// Gateway-side key setup shared by the forwarder and the init
/// pipeline (sync and launch also hop to compute nodes).
pub async fn ensure_hop_keys(dtn: &Arc<dyn Remote>, status: Option<StatusCallback>) -> bool {
    let script = "if [ ! -f ~/.ssh/id_ed25519 ]; then \
                    mkdir -p ~/.ssh && chmod 700 ~/.ssh && \
                    ssh-keygen -t ed25519 -N '' -f ~/.ssh/id_ed25519 -q; \
                  fi; \
                  grep -qf ~/.ssh/id_ed25519.pub ~/.ssh/authorized_keys 2>/dev/null || \
                    cat ~/.ssh/id_ed25519.pub >> ~/.ssh/authorized_keys; \
                  chmod 600 ~/.ssh/authorized_keys; echo KEYS_OK";
    let result = dtn.run(script).await;
    let ok = result.stdout.contains("KEYS_OK");
    if !ok {
        if let Some(cb) = &status {
            cb("Warning: could not prepare SSH keys for node hops");
        }
    }
    ok
}

async fn accept_loop(listener: TcpListener, conns: Arc<Connections>, node: String, port: u16) {
    loop {
        let (mut local, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(port, error = %e, "tunnel accept failed");
                continue;
            }
        };
        debug!(port, %peer, "tunnel connection accepted");

        let mut remote = match conns.tunnel(&node, port).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(port, node = %node, error = %e, "direct-tcpip open failed");
                continue;
            }
        };

        tokio::spawn(async move {
            match tokio::io::copy_bidirectional(&mut local, &mut remote).await {
                Ok((up, down)) => debug!(port, up, down, "tunnel connection closed"),
                Err(e) => debug!(port, error = %e, "tunnel connection errored"),
            }
        });
    }
}

#[cfg(test)]
#[path = "forward_tests.rs"]
mod tests;
