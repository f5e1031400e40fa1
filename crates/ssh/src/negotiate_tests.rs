// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

#[parameterized(
    bracket_prompt = { "[alice@dtn01 ~]$ ", Some(PromptKind::ShellReady) },
    bare_dollar = { "login banner\n$ ", Some(PromptKind::ShellReady) },
    root_hash = { "# ", Some(PromptKind::ShellReady) },
    angle = { "> ", Some(PromptKind::ShellReady) },
    password = { "alice@dtn01's password: ", Some(PromptKind::Password) },
    duo_menu = { "Duo two-factor login for alice\n\n 1. Duo Push\n", Some(PromptKind::TwoFactor) },
    passcode = { "Passcode or option (1-3): ", Some(PromptKind::TwoFactor) },
    nothing = { "Last login: Tue Jan 14", None },
)]
fn scan_classifies(buffer: &str, expected: Option<PromptKind>) {
    assert_eq!(scan(buffer), expected);
}

#[test]
fn shell_ready_wins_over_challenge_echo() {
    // Leftover Duo text followed by a real prompt: shell patterns are
    // scanned first, so the negotiation finishes.
    let buf = "Duo push approved.\nSuccess.\n[alice@dtn01 ~]$ ";
    assert_eq!(scan(buf), Some(PromptKind::ShellReady));
}

#[test]
fn negotiator_reaches_shell_directly() {
    let mut n = ShellNegotiator::new();
    assert_eq!(n.feed("Last login: today\n"), NegotiateStep::NeedMore);
    assert_eq!(n.feed("[alice@dtn01 ~]$ "), NegotiateStep::Done);
}

#[test]
fn negotiator_answers_password_once() {
    let mut n = ShellNegotiator::new();
    n.set_password("hunter2");

    let step = n.feed("alice@dtn01's password: ");
    assert_eq!(step, NegotiateStep::Respond("hunter2\n".into()));

    // Second password prompt means rejection
    let step = n.feed("alice@dtn01's password: ");
    assert_eq!(
        step,
        NegotiateStep::Fail(NegotiateFailure::PasswordRejected)
    );
}

#[test]
fn negotiator_without_password_fails_on_prompt() {
    let mut n = ShellNegotiator::new();
    assert_eq!(
        n.feed("Password: "),
        NegotiateStep::Fail(NegotiateFailure::PasswordRejected)
    );
}

#[test]
fn negotiator_answers_two_factor_then_finishes() {
    let mut n = ShellNegotiator::new();
    n.set_two_factor_response("1");

    let step = n.feed("Duo two-factor login\n 1. Duo Push\nPasscode or option (1-3): ");
    assert_eq!(step, NegotiateStep::Respond("1\n".into()));

    // Buffer was cleared: the stale Duo text cannot re-match
    assert_eq!(n.feed("Pushed a login request.\n"), NegotiateStep::NeedMore);
    assert_eq!(n.feed("Success.\n$ "), NegotiateStep::Done);
}

#[test]
fn second_two_factor_prompt_fails() {
    let mut n = ShellNegotiator::new();
    n.set_two_factor_response("1");
    let _ = n.feed("Duo option: ");
    assert_eq!(
        n.feed("Duo option: "),
        NegotiateStep::Fail(NegotiateFailure::TwoFactorFailed)
    );
}

#[parameterized(
    password = { "Password: ", PromptKind::Password },
    duo = { "Duo two-factor login for alice", PromptKind::TwoFactor },
    passcode = { "Enter a passcode or select one of the following options:", PromptKind::TwoFactor },
    unknown = { "Enter the magic word: ", PromptKind::Password },
)]
fn classify_auth_prompts(prompt: &str, expected: PromptKind) {
    assert_eq!(classify_auth_prompt(prompt), expected);
}
