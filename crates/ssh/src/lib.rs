// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! tccp-ssh: the session fabric.
//!
//! One authenticated SSH transport to the gateway, multiplexed into many
//! logical channels by driving tmux control mode inside the primary PTY
//! shell. Opening additional session-type channels would trigger a fresh
//! 2FA challenge, so everything — programmatic runs, interactive relays,
//! the login-node hop — rides the one shell. Only direct-tcpip tunnel
//! channels are opened on the transport itself (they don't re-auth).

pub mod error;
pub mod facade;
pub mod marker;
pub mod mux;
pub mod negotiate;
pub mod relay;
pub mod target;
pub mod transport;

// Test support - only compiled for tests or when explicitly requested
#[cfg(any(test, feature = "test-support"))]
pub mod fake;
#[cfg(any(test, feature = "test-support"))]
pub use fake::FakeRemote;

pub use error::SshError;
pub use facade::{escape_single_quoted, Connections, Remote, ShellSession};
pub use marker::{build_marker_command, parse_marker_output, MarkerOutput};
pub use mux::{ChannelId, ChannelMultiplexer, OutputCallback, MASTER_CHANNEL};
pub use relay::RelayFeed;
pub use target::SessionTarget;
pub use transport::SessionTransport;
