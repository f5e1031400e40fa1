// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

#[test]
fn handshake_pane_extraction() {
    let handshake = "%window-add @1\n%sessions-changed\n%session-changed $1 tccp_mux\n\
                     %output %0 \\033[?1034h[alice@dtn01 ~]$ \n";
    assert_eq!(first_output_pane(handshake), Some("%0".to_string()));
}

#[test]
fn handshake_without_output_yields_none() {
    assert_eq!(first_output_pane("%window-add @1\n"), None);
    // Partial %output line with no trailing space separator yet
    assert_eq!(first_output_pane("%output %12"), None);
}

#[test]
fn output_line_split() {
    let (pane, data) = parse_output_line("%output %3 hello world").unwrap();
    assert_eq!(pane, "%3");
    assert_eq!(data, "hello world");

    assert!(parse_output_line("%session-changed $1 x").is_none());
    assert!(parse_output_line("plain text").is_none());
}

#[parameterized(
    plain = { "hello", b"hello".to_vec() },
    newline = { "a\\012b", b"a\nb".to_vec() },
    carriage = { "\\015\\012", b"\r\n".to_vec() },
    escape_byte = { "\\033[A", b"\x1b[A".to_vec() },
    backslash_literal = { "a\\\\b", b"a\\\\b".to_vec() },
    short_escape = { "\\01", vec![1u8] },
)]
fn octal_decode(input: &str, expected: Vec<u8>) {
    assert_eq!(decode_octal_escapes(input), expected);
}

#[test]
fn octal_decode_keeps_non_octal_backslash() {
    // "\9" is not an octal escape
    assert_eq!(decode_octal_escapes("a\\9"), b"a\\9".to_vec());
}

#[parameterized(
    plain = { "ls", "\"ls\"" },
    dollar = { "echo $HOME", "\"echo \\$HOME\"" },
    quote = { "say \"hi\"", "\"say \\\"hi\\\"\"" },
    backslash = { "a\\b", "\"a\\\\b\"" },
    hash = { "# note", "\"\\# note\"" },
)]
fn send_keys_escaping(input: &str, expected: &str) {
    assert_eq!(escape_send_keys_literal(input), expected);
}

#[test]
fn plan_batches_printable_runs() {
    let cmds = plan_send_keys("%1", b"echo hi");
    assert_eq!(cmds, vec!["send-keys -t %1 -l \"echo hi\"\n".to_string()]);
}

#[test]
fn plan_translates_newlines_to_enter_and_collapses_crlf() {
    let cmds = plan_send_keys("%1", b"ls\r\n");
    assert_eq!(
        cmds,
        vec![
            "send-keys -t %1 -l \"ls\"\n".to_string(),
            "send-keys -t %1 Enter\n".to_string(),
        ]
    );

    // Bare \n and bare \r each produce exactly one Enter
    assert_eq!(plan_send_keys("%1", b"\n").len(), 1);
    assert_eq!(plan_send_keys("%1", b"\r").len(), 1);
}

#[test]
fn plan_translates_control_keys() {
    let cmds = plan_send_keys("%2", &[0x03]);
    assert_eq!(cmds, vec!["send-keys -t %2 C-c\n".to_string()]);

    let cmds = plan_send_keys("%2", &[0x7f, b'\t', 0x08]);
    assert_eq!(
        cmds,
        vec![
            "send-keys -t %2 BSpace\n".to_string(),
            "send-keys -t %2 Tab\n".to_string(),
            "send-keys -t %2 BSpace\n".to_string(),
        ]
    );
}

#[parameterized(
    up = { b"\x1b[A".to_vec(), "Up" },
    down = { b"\x1b[B".to_vec(), "Down" },
    right = { b"\x1b[C".to_vec(), "Right" },
    left = { b"\x1b[D".to_vec(), "Left" },
    home = { b"\x1b[H".to_vec(), "Home" },
    end_key = { b"\x1bOF".to_vec(), "End" },
    insert = { b"\x1b[2~".to_vec(), "IC" },
    delete = { b"\x1b[3~".to_vec(), "DC" },
    page_up = { b"\x1b[5~".to_vec(), "PageUp" },
    page_down = { b"\x1b[6~".to_vec(), "PageDown" },
)]
fn plan_translates_escape_sequences(input: Vec<u8>, key: &str) {
    let cmds = plan_send_keys("%0", &input);
    assert_eq!(cmds, vec![format!("send-keys -t %0 {key}\n")]);
}

#[test]
fn plan_mixed_input_interleaves_literals_and_keys() {
    let cmds = plan_send_keys("%0", b"cd /tmp\nls -la\n");
    assert_eq!(
        cmds,
        vec![
            "send-keys -t %0 -l \"cd /tmp\"\n".to_string(),
            "send-keys -t %0 Enter\n".to_string(),
            "send-keys -t %0 -l \"ls -la\"\n".to_string(),
            "send-keys -t %0 Enter\n".to_string(),
        ]
    );
}

#[test]
fn plan_lone_escape_sends_escape_key() {
    let cmds = plan_send_keys("%0", &[0x1b, b'x']);
    assert_eq!(cmds[0], "send-keys -t %0 Escape\n");
    // 'x' follows as a literal
    assert_eq!(cmds[1], "send-keys -t %0 -l \"x\"\n");
}
