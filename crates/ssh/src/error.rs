// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for the session fabric.

use thiserror::Error;

/// Errors from transport setup, authentication, and multiplexing.
#[derive(Debug, Error)]
pub enum SshError {
    #[error("failed to connect to {host}: {message}")]
    Connect { host: String, message: String },

    #[error("authentication failed (check username/password)")]
    AuthFailed,

    #[error("password rejected (prompted twice)")]
    PasswordRejected,

    #[error("2FA failed (prompted twice)")]
    TwoFactorFailed,

    #[error("timed out waiting for shell prompt")]
    ShellTimeout,

    #[error("tmux control mode handshake failed: {0}")]
    MuxHandshake(String),

    #[error("multiplexer stopped")]
    MuxStopped,

    #[error("invalid channel id: {0}")]
    InvalidChannel(u32),

    #[error("transport closed")]
    TransportClosed,

    #[error("ssh protocol error: {0}")]
    Protocol(#[from] russh::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
