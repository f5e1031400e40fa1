// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection facade: the four connection flavors over the fabric.
//!
//! - `dtn()` — programmatic runs on channel 0 (the master pane keeps
//!   the login shell's session-scoped tickets).
//! - `login()` — programmatic runs wrapped in an SSH hop to the login
//!   node, where the batch-scheduler tools live.
//! - `open_shell()` — interactive relay on a freshly opened channel.
//! - `tunnel()` — a raw direct-tcpip stream on the transport itself.

use crate::error::SshError;
use crate::mux::{ChannelId, ChannelMultiplexer, DEFAULT_RUN_TIMEOUT, MASTER_CHANNEL};
use crate::relay::{build_relay_command, RelayFeed};
use crate::transport::SessionTransport;
use async_trait::async_trait;
use base64::Engine;
use russh::client::Msg;
use russh::{Channel, ChannelStream};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tccp_core::SshResult;

/// Remote command execution seam. The engine only sees this trait, so
/// tests can script a fake.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Run a command with the default 300s bound.
    async fn run(&self, cmd: &str) -> SshResult {
        self.run_with_timeout(cmd, DEFAULT_RUN_TIMEOUT).await
    }

    async fn run_with_timeout(&self, cmd: &str, timeout: Duration) -> SshResult;

    /// Stage a local file at a remote path. Content travels through the
    /// marker channel as a base64 heredoc, so arbitrary bytes survive
    /// the PTY.
    async fn upload(&self, local: &Path, remote: &str) -> SshResult {
        let content = match tokio::fs::read(local).await {
            Ok(c) => c,
            Err(e) => return SshResult::err(format!("cannot read {}: {e}", local.display())),
        };
        let encoded = base64::engine::general_purpose::STANDARD.encode(&content);
        let mut cmd = format!("base64 -d > {remote} << 'TCCP_EOF'\n");
        // Wrapped lines keep the heredoc readable in logs
        for chunk in encoded.as_bytes().chunks(76) {
            cmd.push_str(&String::from_utf8_lossy(chunk));
            cmd.push('\n');
        }
        cmd.push_str("TCCP_EOF");
        self.run(&cmd).await
    }

    /// Fetch a remote file into a local path (parents created).
    async fn download(&self, remote: &str, local: &Path) -> SshResult {
        let result = self.run(&format!("base64 {remote}")).await;
        if result.failed() {
            return result;
        }
        let cleaned: String = result
            .stdout
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let bytes = match base64::engine::general_purpose::STANDARD.decode(cleaned) {
            Ok(b) => b,
            Err(e) => return SshResult::err(format!("bad base64 from {remote}: {e}")),
        };
        if let Some(parent) = local.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return SshResult::err(format!("mkdir {}: {e}", parent.display()));
            }
        }
        match tokio::fs::write(local, bytes).await {
            Ok(()) => SshResult::ok(format!("downloaded to {}", local.display())),
            Err(e) => SshResult::err(format!("write {}: {e}", local.display())),
        }
    }
}

/// Programmatic runs on a multiplexed channel (usually channel 0).
pub struct GatewayChannel {
    mux: Arc<ChannelMultiplexer>,
    channel: ChannelId,
}

#[async_trait]
impl Remote for GatewayChannel {
    async fn run_with_timeout(&self, cmd: &str, timeout: Duration) -> SshResult {
        self.mux.run(self.channel, cmd, timeout).await
    }
}

/// Programmatic runs on the login node: every command is wrapped in a
/// second-hop SSH invocation on the gateway.
pub struct LoginHop {
    inner: GatewayChannel,
    login_host: String,
}

#[async_trait]
impl Remote for LoginHop {
    async fn run_with_timeout(&self, cmd: &str, timeout: Duration) -> SshResult {
        // </dev/null is mandatory: without it the hop's ssh consumes the
        // DONE-marker line that follows on the pane's stdin.
        let wrapped = format!(
            "ssh -T -o StrictHostKeyChecking=no -o LogLevel=ERROR {} {} </dev/null",
            self.login_host,
            escape_single_quoted(cmd)
        );
        self.inner.run_with_timeout(&wrapped, timeout).await
    }
}

/// Wrap a command in single quotes for a second-hop shell, replacing
/// embedded quotes with the `'\''` idiom.
pub fn escape_single_quoted(cmd: &str) -> String {
    let mut escaped = String::with_capacity(cmd.len() + 8);
    escaped.push('\'');
    for c in cmd.chars() {
        if c == '\'' {
            escaped.push_str("'\\''");
        } else {
            escaped.push(c);
        }
    }
    escaped.push('\'');
    escaped
}

/// An interactive relay session on its own multiplexed channel.
pub struct ShellSession {
    mux: Arc<ChannelMultiplexer>,
    channel: ChannelId,
    feed: RelayFeed,
}

impl ShellSession {
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Forward local keystrokes to the pane.
    pub async fn send_input(&self, data: &[u8]) {
        self.mux.send_input(self.channel, data).await;
    }

    pub async fn resize(&self, cols: u16, rows: u16) {
        self.mux.resize(self.channel, cols, rows).await;
    }

    /// Register the pane-output callback. The callback receives raw
    /// bytes; run them through [`ShellSession::feed`] before display.
    pub fn set_output_callback(&self, cb: crate::mux::OutputCallback) {
        self.mux.set_output_callback(self.channel, cb);
    }

    /// Filter a chunk of pane output for display.
    pub fn feed(&mut self, data: &str) -> String {
        self.feed.feed(data)
    }

    pub fn done(&self) -> bool {
        self.feed.done()
    }

    /// Close the pane. The relayed viewer process dies with it; anything
    /// under dtach on the remote side survives independently.
    pub async fn close(self) {
        self.mux.clear_output_callback(self.channel);
        self.mux.close_channel(self.channel).await;
    }
}

/// The facade over an established transport + multiplexer.
pub struct Connections {
    transport: Arc<SessionTransport>,
    mux: Arc<ChannelMultiplexer>,
    login_host: String,
}

impl Connections {
    pub fn new(
        transport: Arc<SessionTransport>,
        mux: Arc<ChannelMultiplexer>,
        login_host: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            mux,
            login_host: login_host.into(),
        }
    }

    /// Programmatic gateway connection (channel 0).
    pub fn dtn(&self) -> Arc<dyn Remote> {
        Arc::new(GatewayChannel {
            mux: Arc::clone(&self.mux),
            channel: MASTER_CHANNEL,
        })
    }

    /// Programmatic login-node connection (auto-hop).
    pub fn login(&self) -> Arc<dyn Remote> {
        Arc::new(LoginHop {
            inner: GatewayChannel {
                mux: Arc::clone(&self.mux),
                channel: MASTER_CHANNEL,
            },
            login_host: self.login_host.clone(),
        })
    }

    /// Open an interactive relay running `command` on a fresh channel.
    pub async fn open_shell(&self, command: &str) -> Result<ShellSession, SshError> {
        let channel = self.mux.open_channel().await?;
        let session = ShellSession {
            mux: Arc::clone(&self.mux),
            channel,
            feed: RelayFeed::new(),
        };
        self.mux
            .send_input(channel, build_relay_command(command).as_bytes())
            .await;
        Ok(session)
    }

    /// Direct-TCP stream from the gateway to `host:port`. Not
    /// multiplexed; opened on the transport (no re-auth).
    pub async fn tunnel(&self, host: &str, port: u16) -> Result<ChannelStream<Msg>, SshError> {
        let channel: Channel<Msg> = self.transport.open_tunnel(host, port).await?;
        Ok(channel.into_stream())
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_active() && self.mux.is_running()
    }

    pub fn check_alive(&self) -> bool {
        self.transport.check_alive()
    }

    pub fn multiplexer(&self) -> &Arc<ChannelMultiplexer> {
        &self.mux
    }

    pub async fn disconnect(&self) {
        self.mux.stop().await;
        self.transport.close().await;
    }
}

#[cfg(test)]
#[path = "facade_tests.rs"]
mod tests;
