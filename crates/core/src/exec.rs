// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Remote command result and progress callback types.

use std::sync::Arc;

/// Result of one remote command execution.
///
/// Exit code −1 means the command could not be executed or timed out;
/// `stdout` then holds whatever partial output was captured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl SshResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: message.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn failed(&self) -> bool {
        self.exit_code != 0
    }

    /// Whichever stream has content, preferring stdout.
    pub fn output(&self) -> &str {
        if self.stdout.is_empty() {
            &self.stderr
        } else {
            &self.stdout
        }
    }
}

/// Progress callback for long operations.
///
/// May be invoked from init tasks, the multiplexer reader, and tunnel
/// tasks concurrently; implementations should enqueue rather than render.
pub type StatusCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// A callback that discards all messages.
pub fn null_status() -> StatusCallback {
    Arc::new(|_| {})
}

#[cfg(test)]
#[path = "exec_tests.rs"]
mod tests;
