// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reactive shell-prompt negotiation.
//!
//! After the shell channel opens, the gateway may show any mix of a
//! ready prompt, a password re-prompt, or a 2FA challenge. A set of
//! tagged patterns is scanned against a growing buffer in priority
//! order (shell patterns first); each match either finishes the
//! negotiation or produces a response to type. The buffer is cleared
//! after a response so stale text cannot re-match.

use crate::error::SshError;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

/// Overall negotiation budget — long enough for a human to approve a
/// 2FA push.
pub const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(90);

/// What a matched pattern means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    ShellReady,
    Password,
    TwoFactor,
}

struct Pattern {
    kind: PromptKind,
    regex: Regex,
}

#[allow(clippy::unwrap_used)] // patterns are literals, checked by tests
fn patterns() -> &'static [Pattern] {
    static PATTERNS: OnceLock<Vec<Pattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        // Priority order: shell-ready first so a prompt that arrives
        // together with challenge echo wins.
        vec![
            Pattern {
                kind: PromptKind::ShellReady,
                regex: Regex::new(r"\[.+@.+ .*\][$#] $").unwrap(),
            },
            Pattern {
                kind: PromptKind::ShellReady,
                regex: Regex::new(r"(?m)[$#>] $").unwrap(),
            },
            Pattern {
                kind: PromptKind::Password,
                regex: Regex::new(r"(?i)password[^\n]*: ?$").unwrap(),
            },
            Pattern {
                kind: PromptKind::TwoFactor,
                regex: Regex::new(r"(?i)(duo|passcode|factor|option)").unwrap(),
            },
        ]
    })
}

/// Scan a buffer against all patterns in priority order.
pub fn scan(buffer: &str) -> Option<PromptKind> {
    patterns()
        .iter()
        .find(|p| p.regex.is_match(buffer))
        .map(|p| p.kind)
}

/// What the negotiator wants done next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiateStep {
    /// Keep reading; no pattern matched yet.
    NeedMore,
    /// Shell is ready.
    Done,
    /// Type this response into the channel (and clear the buffer).
    Respond(String),
    /// Unrecoverable.
    Fail(NegotiateFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiateFailure {
    PasswordRejected,
    TwoFactorFailed,
}

impl From<NegotiateFailure> for SshError {
    fn from(f: NegotiateFailure) -> Self {
        match f {
            NegotiateFailure::PasswordRejected => SshError::PasswordRejected,
            NegotiateFailure::TwoFactorFailed => SshError::TwoFactorFailed,
        }
    }
}

/// The negotiation state machine. Feed it chunks of channel output;
/// it tells the caller what to do next. Pure — the transport owns the
/// actual reads, writes, and the 90s deadline.
#[derive(Debug, Default)]
pub struct ShellNegotiator {
    buffer: String,
    password: Option<String>,
    two_factor_response: Option<String>,
    password_sent: bool,
    two_factor_sent: bool,
}

impl ShellNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Password to type if the shell re-prompts for one.
    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password = Some(password.into());
    }

    /// Response to a 2FA menu ("1" selects push).
    pub fn set_two_factor_response(&mut self, response: impl Into<String>) {
        self.two_factor_response = Some(response.into());
    }

    /// Consume a chunk of channel output and decide the next step.
    pub fn feed(&mut self, data: &str) -> NegotiateStep {
        self.buffer.push_str(data);

        match scan(&self.buffer) {
            None => NegotiateStep::NeedMore,
            Some(PromptKind::ShellReady) => NegotiateStep::Done,
            Some(PromptKind::Password) => {
                if self.password_sent {
                    return NegotiateStep::Fail(NegotiateFailure::PasswordRejected);
                }
                match &self.password {
                    Some(pw) => {
                        self.password_sent = true;
                        self.buffer.clear();
                        NegotiateStep::Respond(format!("{pw}\n"))
                    }
                    None => NegotiateStep::Fail(NegotiateFailure::PasswordRejected),
                }
            }
            Some(PromptKind::TwoFactor) => {
                if self.two_factor_sent {
                    return NegotiateStep::Fail(NegotiateFailure::TwoFactorFailed);
                }
                match &self.two_factor_response {
                    Some(resp) => {
                        self.two_factor_sent = true;
                        self.buffer.clear();
                        NegotiateStep::Respond(format!("{resp}\n"))
                    }
                    None => NegotiateStep::Fail(NegotiateFailure::TwoFactorFailed),
                }
            }
        }
    }
}

/// Classify a keyboard-interactive auth prompt (transport-level, before
/// the shell exists). Password prompts get the password; 2FA menus get
/// "1" to select a push.
pub fn classify_auth_prompt(prompt: &str) -> PromptKind {
    let lower = prompt.to_lowercase();
    if lower.contains("duo")
        || lower.contains("passcode")
        || lower.contains("factor")
        || lower.contains("option")
    {
        PromptKind::TwoFactor
    } else {
        // Unknown prompts fall back to the password
        PromptKind::Password
    }
}

#[cfg(test)]
#[path = "negotiate_tests.rs"]
mod tests;
