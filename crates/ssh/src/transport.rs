// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The single authenticated SSH transport and its primary PTY shell.
//!
//! Exactly one of these exists per run. Authentication prefers
//! keyboard-interactive (the only method that carries the 2FA menu),
//! falling back to password. After the shell channel opens, the
//! reactive prompt negotiation in [`crate::negotiate`] runs until a
//! ready prompt is seen.

use crate::error::SshError;
use crate::negotiate::{
    classify_auth_prompt, NegotiateStep, PromptKind, ShellNegotiator, NEGOTIATE_TIMEOUT,
};
use crate::target::SessionTarget;
use russh::client::{self, AuthResult, KeyboardInteractiveAuthResponse};
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg, Disconnect};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tccp_core::StatusCallback;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

/// SSH keepalive interval (the server side sees traffic every 30s).
const SSH_KEEPALIVE: Duration = Duration::from_secs(30);

/// TCP keepalive: idle 60s, probe every 15s, give up after 4 misses.
const TCP_KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const TCP_KEEPALIVE_RETRIES: u32 = 4;

struct GatewayHandler;

impl client::Handler for GatewayHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        // The gateway is addressed by a pinned hostname inside a trusted
        // network path; host-key pinning lives in the user's known_hosts.
        Ok(true)
    }
}

/// The authenticated transport plus its primary shell channel.
pub struct SessionTransport {
    handle: client::Handle<GatewayHandler>,
    /// Taken by the multiplexer when it starts.
    primary: parking_lot::Mutex<Option<Channel<client::Msg>>>,
    active: Arc<AtomicBool>,
    target_label: String,
}

impl SessionTransport {
    /// Connect, authenticate, open the PTY shell, and negotiate a ready
    /// prompt. On any failure all resources are released before
    /// returning.
    pub async fn establish(
        target: &SessionTarget,
        status: StatusCallback,
    ) -> Result<Self, SshError> {
        status(&format!("Connecting to {}...", target.host));

        let stream = Self::open_socket(target).await?;
        status("TCP connected, starting SSH handshake...");

        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(SSH_KEEPALIVE),
            keepalive_max: 3,
            ..Default::default()
        });

        let mut handle = client::connect_stream(config, stream, GatewayHandler)
            .await
            .map_err(|e| SshError::Connect {
                host: target.host.clone(),
                message: e.to_string(),
            })?;

        status("SSH handshake complete, authenticating...");
        if let Err(e) = Self::authenticate(&mut handle, target, &status).await {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "auth failed", "en")
                .await;
            return Err(e);
        }

        let channel = match Self::open_shell(&handle, target, &status).await {
            Ok(ch) => ch,
            Err(e) => {
                let _ = handle
                    .disconnect(Disconnect::ByApplication, "shell not ready", "en")
                    .await;
                return Err(e);
            }
        };

        status(&format!("Connected to {}", target.host));

        Ok(Self {
            handle,
            primary: parking_lot::Mutex::new(Some(channel)),
            active: Arc::new(AtomicBool::new(true)),
            target_label: format!("{}@{}", target.user, target.host),
        })
    }

    async fn open_socket(target: &SessionTarget) -> Result<TcpStream, SshError> {
        let addr = format!("{}:22", target.host);
        let stream = timeout(target.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| SshError::Connect {
                host: target.host.clone(),
                message: "connection timed out".into(),
            })?
            .map_err(|e| SshError::Connect {
                host: target.host.clone(),
                message: e.to_string(),
            })?;

        // TCP-level keepalive so a silent NAT/VPN drop is noticed even
        // while SSH is quiet
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(TCP_KEEPALIVE_IDLE)
            .with_interval(TCP_KEEPALIVE_INTERVAL)
            .with_retries(TCP_KEEPALIVE_RETRIES);
        let sock = socket2::SockRef::from(&stream);
        sock.set_tcp_keepalive(&keepalive)?;

        Ok(stream)
    }

    /// Keyboard-interactive first (it carries the 2FA menu), password
    /// as fallback. Do not reorder without cluster testing.
    async fn authenticate(
        handle: &mut client::Handle<GatewayHandler>,
        target: &SessionTarget,
        status: &StatusCallback,
    ) -> Result<(), SshError> {
        status("Using keyboard-interactive auth...");
        match Self::keyboard_interactive(handle, target, status).await {
            Ok(true) => {
                status("Authentication successful");
                return Ok(());
            }
            Ok(false) => status("Keyboard-interactive failed, trying password..."),
            Err(e) => {
                tracing::debug!(error = %e, "keyboard-interactive errored, trying password");
            }
        }

        status("Using password auth...");
        let result = handle
            .authenticate_password(&target.user, &target.password)
            .await?;
        if matches!(result, AuthResult::Success) {
            status("Authentication successful");
            Ok(())
        } else {
            Err(SshError::AuthFailed)
        }
    }

    async fn keyboard_interactive(
        handle: &mut client::Handle<GatewayHandler>,
        target: &SessionTarget,
        status: &StatusCallback,
    ) -> Result<bool, SshError> {
        let mut response = handle
            .authenticate_keyboard_interactive_start(&target.user, None)
            .await?;

        loop {
            match response {
                KeyboardInteractiveAuthResponse::Success => return Ok(true),
                KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
                KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                    let answers: Vec<String> = prompts
                        .iter()
                        .map(|p| match classify_auth_prompt(&p.prompt) {
                            PromptKind::TwoFactor => {
                                status("Duo push sent, check your phone...");
                                "1".to_string()
                            }
                            _ => {
                                status("Sending password...");
                                target.password.clone()
                            }
                        })
                        .collect();
                    response = handle
                        .authenticate_keyboard_interactive_respond(answers)
                        .await?;
                }
            }
        }
    }

    async fn open_shell(
        handle: &client::Handle<GatewayHandler>,
        target: &SessionTarget,
        status: &StatusCallback,
    ) -> Result<Channel<client::Msg>, SshError> {
        let mut channel = handle.channel_open_session().await?;

        let (cols, rows) = local_terminal_size();
        channel
            .request_pty(false, "xterm", cols, rows, 0, 0, &[])
            .await?;
        channel.request_shell(false).await?;

        status("Waiting for shell...");
        Self::negotiate_prompt(&mut channel, target, status).await?;
        Ok(channel)
    }

    /// Drive the prompt negotiation over the fresh shell channel.
    async fn negotiate_prompt(
        channel: &mut Channel<client::Msg>,
        target: &SessionTarget,
        status: &StatusCallback,
    ) -> Result<(), SshError> {
        let mut negotiator = ShellNegotiator::new();
        if !target.password.is_empty() {
            negotiator.set_password(&target.password);
        }
        if target.use_2fa {
            negotiator.set_two_factor_response("1");
        }

        let deadline = Instant::now() + NEGOTIATE_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SshError::ShellTimeout);
            }

            let msg = timeout(remaining, channel.wait())
                .await
                .map_err(|_| SshError::ShellTimeout)?
                .ok_or(SshError::TransportClosed)?;

            let data = match msg {
                ChannelMsg::Data { data } => data,
                ChannelMsg::ExtendedData { data, .. } => data,
                ChannelMsg::Eof | ChannelMsg::Close => return Err(SshError::TransportClosed),
                _ => continue,
            };

            match negotiator.feed(&String::from_utf8_lossy(&data)) {
                NegotiateStep::NeedMore => {}
                NegotiateStep::Done => return Ok(()),
                NegotiateStep::Respond(text) => {
                    status("Answering shell challenge...");
                    channel.data(text.as_bytes()).await?;
                }
                NegotiateStep::Fail(failure) => return Err(failure.into()),
            }
        }
    }

    /// Take ownership of the primary shell channel (the multiplexer
    /// calls this once at startup).
    pub fn take_primary(&self) -> Option<Channel<client::Msg>> {
        self.primary.lock().take()
    }

    /// Open a direct-tcpip channel from the gateway to `host:port`.
    /// Does not re-authenticate; used for port tunnels.
    pub async fn open_tunnel(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Channel<client::Msg>, SshError> {
        if !self.is_active() {
            return Err(SshError::TransportClosed);
        }
        Ok(self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await?)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.handle.is_closed()
    }

    /// Liveness probe. russh sends protocol keepalives on its own per
    /// the configured interval; this just folds in the socket state.
    pub fn check_alive(&self) -> bool {
        if !self.active.load(Ordering::SeqCst) {
            return false;
        }
        if self.handle.is_closed() {
            self.active.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub fn target_label(&self) -> &str {
        &self.target_label
    }

    /// Mark inactive first so concurrent users short-circuit, then
    /// disconnect.
    pub async fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
        drop(self.primary.lock().take());
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "normal disconnection", "en")
            .await;
    }
}

/// Local terminal size from the environment, defaulting to 120x40.
/// The PTY is resized per-pane by the multiplexer afterwards.
fn local_terminal_size() -> (u32, u32) {
    let cols = std::env::var("COLUMNS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(120);
    let rows = std::env::var("LINES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(40);
    (cols, rows)
}
