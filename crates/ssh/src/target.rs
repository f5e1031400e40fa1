// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection target description.

use std::path::PathBuf;
use std::time::Duration;

/// Where and how to open the gateway session. Immutable once handed to
/// [`crate::SessionTransport::establish`].
#[derive(Clone)]
pub struct SessionTarget {
    pub host: String,
    pub user: String,
    pub password: String,
    pub key_path: Option<PathBuf>,
    pub timeout: Duration,
    /// Server runs a 2FA framework; answer its prompt with "1" (push).
    pub use_2fa: bool,
    /// Approve the push without waiting for interactive confirmation.
    pub auto_2fa: bool,
}

impl SessionTarget {
    pub fn new(host: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            password: password.into(),
            key_path: None,
            timeout: Duration::from_secs(30),
            use_2fa: true,
            auto_2fa: false,
        }
    }
}

impl std::fmt::Debug for SessionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the password
        f.debug_struct("SessionTarget")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("use_2fa", &self.use_2fa)
            .field("auto_2fa", &self.auto_2fa)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "target_tests.rs"]
mod tests;
