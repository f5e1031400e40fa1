// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Marker protocol for programmatic runs over a PTY shell.
//!
//! A pane's shell echoes what is typed, and `%output` framing cannot
//! distinguish echo from real output. Each request is therefore wrapped
//! as `echo BEGIN ; <cmd> ; echo DONE $?`, with the echo arguments built
//! by shell string concatenation (`BEG''IN`, `DO''NE`) so the echoed
//! command text never contains the literal markers.

pub const BEGIN_MARKER: &str = "__TCCP_BEGIN__";
pub const DONE_MARKER: &str = "__TCCP_DONE__";

const BEGIN_ECHO: &str = "echo __TCCP_BEG''IN__; ";
const DONE_ECHO: &str = "echo __TCCP_DO''NE__ $?";

/// Wrap a command for marker execution.
///
/// Single-line commands keep the DONE echo on the same line joined by
/// `;` — an SSH hop reading stdin would otherwise consume the marker
/// line. Multi-line commands (heredocs) put it on its own line so the
/// heredoc terminator is not mangled.
pub fn build_marker_command(cmd: &str) -> String {
    if cmd.contains('\n') {
        format!("{BEGIN_ECHO}{cmd}\n{DONE_ECHO}\n")
    } else {
        format!("{BEGIN_ECHO}{cmd}; {DONE_ECHO}\n")
    }
}

/// Parsed marker output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MarkerOutput {
    pub output: String,
    pub exit_code: i32,
    pub found: bool,
}

/// Scan accumulated pane output for the DONE marker and extract the
/// command output and exit code. Returns `found = false` until the
/// marker arrives.
pub fn parse_marker_output(raw: &str) -> MarkerOutput {
    let Some(done_pos) = raw.find(DONE_MARKER) else {
        return MarkerOutput::default();
    };

    // Exit code is the first integer after the DONE marker
    let after = &raw[done_pos + DONE_MARKER.len()..];
    let exit_code = after
        .find(|c: char| c.is_ascii_digit() || c == '-')
        .map(|start| {
            let digits: String = after[start..]
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '-')
                .collect();
            digits.parse().unwrap_or(0)
        })
        .unwrap_or(0);

    // Output is the text between BEGIN (plus trailing CR/LF) and DONE
    let mut clean = match raw.find(BEGIN_MARKER) {
        Some(begin_pos) => {
            let mut start = begin_pos + BEGIN_MARKER.len();
            let bytes = raw.as_bytes();
            if start < done_pos && bytes[start] == b'\r' {
                start += 1;
            }
            if start < done_pos && bytes[start] == b'\n' {
                start += 1;
            }
            raw[start..done_pos].to_string()
        }
        None => raw[..done_pos].to_string(),
    };

    // Strip a trailing prompt echo of the sentinel command, then trim
    clean.truncate(clean.trim_end().len());
    if let Some(last_nl) = clean.rfind('\n') {
        if clean[last_nl + 1..].contains("__TCCP_DO") {
            clean.truncate(last_nl);
        }
    } else if clean.contains("__TCCP_DO") {
        clean.clear();
    }
    clean.truncate(clean.trim_end().len());

    MarkerOutput {
        output: clean,
        exit_code,
        found: true,
    }
}

#[cfg(test)]
#[path = "marker_tests.rs"]
mod tests;
