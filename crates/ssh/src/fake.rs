// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scripted remote for tests.
//!
//! Commands are matched by substring against registered rules (first
//! match wins, in registration order); unmatched commands return a
//! successful empty result. Every command is recorded for assertions.

use crate::facade::Remote;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tccp_core::SshResult;

#[derive(Clone)]
struct Rule {
    needle: String,
    result: SshResult,
    /// When true the rule is consumed by its first match.
    once: bool,
}

/// A fake [`Remote`] with substring-scripted responses.
#[derive(Clone, Default)]
pub struct FakeRemote {
    rules: Arc<Mutex<Vec<Rule>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond to any command containing `needle` with `result`.
    pub fn on(&self, needle: impl Into<String>, result: SshResult) {
        self.rules.lock().push(Rule {
            needle: needle.into(),
            result,
            once: false,
        });
    }

    /// Like [`FakeRemote::on`] but the rule fires only once.
    pub fn on_once(&self, needle: impl Into<String>, result: SshResult) {
        self.rules.lock().push(Rule {
            needle: needle.into(),
            result,
            once: true,
        });
    }

    /// All commands run so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Commands containing the given substring.
    pub fn calls_matching(&self, needle: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.contains(needle))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Remote for FakeRemote {
    async fn run_with_timeout(&self, cmd: &str, _timeout: Duration) -> SshResult {
        self.calls.lock().push(cmd.to_string());

        let mut rules = self.rules.lock();
        if let Some(pos) = rules.iter().position(|r| cmd.contains(&r.needle)) {
            let result = rules[pos].result.clone();
            if rules[pos].once {
                rules.remove(pos);
            }
            return result;
        }
        SshResult::ok("")
    }
}

#[cfg(test)]
#[path = "fake_tests.rs"]
mod tests;
