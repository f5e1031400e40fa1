// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn single_line_keeps_done_on_same_line() {
    let cmd = build_marker_command("ls -la");
    assert_eq!(
        cmd,
        "echo __TCCP_BEG''IN__; ls -la; echo __TCCP_DO''NE__ $?\n"
    );
    // The raw command text must not contain the literal markers
    assert!(!cmd.contains(BEGIN_MARKER));
    assert!(!cmd.contains(DONE_MARKER));
}

#[test]
fn multi_line_puts_done_on_own_line() {
    let cmd = build_marker_command("cat > f << 'EOF'\nhello\nEOF");
    assert!(cmd.ends_with("\necho __TCCP_DO''NE__ $?\n"));
    assert!(cmd.contains("EOF\necho"));
}

#[test]
fn parse_waits_for_done_marker() {
    assert!(!parse_marker_output("partial output with no marker").found);
    assert!(!parse_marker_output("__TCCP_BEGIN__\nstill running\n").found);
}

#[test]
fn parse_extracts_output_and_exit_code() {
    let raw = format!("{BEGIN_MARKER}\r\nhello world\r\n{DONE_MARKER} 0\r\n");
    let parsed = parse_marker_output(&raw);
    assert!(parsed.found);
    assert_eq!(parsed.exit_code, 0);
    assert_eq!(parsed.output, "hello world");
}

#[test]
fn parse_nonzero_and_negative_exit_codes() {
    let raw = format!("{BEGIN_MARKER}\nboom\n{DONE_MARKER} 127\n");
    assert_eq!(parse_marker_output(&raw).exit_code, 127);

    let raw = format!("{BEGIN_MARKER}\n{DONE_MARKER} -1\n");
    assert_eq!(parse_marker_output(&raw).exit_code, -1);
}

#[test]
fn parse_skips_echoed_command_before_begin() {
    // The shell echoes the typed command (with the '' trick) before output
    let raw = format!(
        "echo __TCCP_BEG''IN__; hostname; echo __TCCP_DO''NE__ $?\r\n\
         {BEGIN_MARKER}\r\ncc1gpu001\r\n{DONE_MARKER} 0\r\n"
    );
    let parsed = parse_marker_output(&raw);
    assert!(parsed.found);
    assert_eq!(parsed.output, "cc1gpu001");
}

#[test]
fn parse_strips_trailing_sentinel_echo_line() {
    // A wrapped echo of the sentinel can trail the real output
    let raw = format!(
        "{BEGIN_MARKER}\nresult line\necho __TCCP_DO\n{DONE_MARKER} 0\n"
    );
    let parsed = parse_marker_output(&raw);
    assert_eq!(parsed.output, "result line");
}

#[test]
fn round_trip_single_and_multi_line() {
    // Wrapping + shell echo + DONE line parses back to
    // (output, code, true)
    for cmd in ["hostname", "printf 'a\\nb'\nwait"] {
        let typed = build_marker_command(cmd);
        let shell_echo = typed.replace('\n', "\r\n");
        let raw = format!("{shell_echo}{BEGIN_MARKER}\r\ncmd-output\r\n{DONE_MARKER} 3\r\n");
        let parsed = parse_marker_output(&raw);
        assert!(parsed.found);
        assert_eq!(parsed.exit_code, 3);
        assert_eq!(parsed.output, "cmd-output");
    }
}

#[test]
fn empty_output_parses_empty() {
    let raw = format!("{BEGIN_MARKER}\r\n{DONE_MARKER} 0\r\n");
    let parsed = parse_marker_output(&raw);
    assert!(parsed.found);
    assert_eq!(parsed.output, "");
}
