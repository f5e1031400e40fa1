// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Feed machine for interactive shell relays.
//!
//! A relay runs one command on a fresh multiplexed channel and streams
//! the pane to the local terminal. The echoed command can wrap across
//! many pane lines, so output before the BEGIN marker is skipped
//! wholesale; the DONE marker ends the relay. Bytes that could be the
//! start of a partially-arrived DONE marker are held back until the
//! next chunk decides.

use crate::marker::{BEGIN_MARKER, DONE_MARKER};

/// Command prefix/suffix for relayed commands. Exit codes are not
/// captured here (the viewer parses them out of the stream itself).
pub const RELAY_PREFIX: &str = "echo __TCCP_BEG''IN__; ";
pub const RELAY_SUFFIX: &str = " ; echo __TCCP_DO''NE__\n";

/// Wrap a command for relay execution.
pub fn build_relay_command(cmd: &str) -> String {
    format!("{RELAY_PREFIX}{cmd}{RELAY_SUFFIX}")
}

#[derive(Debug, Default)]
pub struct RelayFeed {
    buf: String,
    skip_echo: bool,
    done: bool,
}

impl RelayFeed {
    pub fn new() -> Self {
        Self {
            buf: String::new(),
            skip_echo: true,
            done: false,
        }
    }

    pub fn done(&self) -> bool {
        self.done
    }

    /// Consume a chunk of pane output; return the bytes to display.
    pub fn feed(&mut self, data: &str) -> String {
        if data.is_empty() || self.done {
            return String::new();
        }
        self.buf.push_str(data);

        // Phase 1: discard everything up to (and including) BEGIN
        if self.skip_echo {
            let Some(bm) = self.buf.find(BEGIN_MARKER) else {
                return String::new();
            };
            let mut start = bm + BEGIN_MARKER.len();
            let bytes = self.buf.as_bytes();
            if start < bytes.len() && bytes[start] == b'\r' {
                start += 1;
            }
            if start < bytes.len() && bytes[start] == b'\n' {
                start += 1;
            }
            self.buf.drain(..start);
            self.skip_echo = false;
            if self.buf.is_empty() {
                return String::new();
            }
        }

        // Phase 2: stream until DONE
        if let Some(dm) = self.buf.find(DONE_MARKER) {
            let result = self.buf[..dm].to_string();
            self.buf.clear();
            self.done = true;
            return result;
        }

        // Hold back a possible marker prefix at the buffer tail
        let mut hold = 0;
        let max = self.buf.len().min(DONE_MARKER.len());
        for i in 1..=max {
            if DONE_MARKER.as_bytes().starts_with(&self.buf.as_bytes()[self.buf.len() - i..]) {
                hold = i;
            }
        }

        if hold >= self.buf.len() {
            return String::new();
        }
        let cut = self.buf.len() - hold;
        let result = self.buf[..cut].to_string();
        self.buf.drain(..cut);
        result
    }
}

#[cfg(test)]
#[path = "relay_tests.rs"]
mod tests;
