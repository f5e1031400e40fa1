// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Channel multiplexer: many logical channels over one PTY shell.
//!
//! The gateway's auth framework fires a fresh 2FA challenge for every
//! new session-type channel, so instead of opening channels we start
//! tmux in control mode (`tmux -C`) inside the already-authenticated
//! shell. Each tmux pane is one logical channel. The control protocol
//! is line oriented:
//!
//! - `%output <pane-id> <octal-escaped-bytes>` — pane output
//! - `%begin ...` / `%end ...` / `%error ...` — control command brackets
//! - other `%` notifications are ignored
//!
//! A single I/O task owns the shell channel: it routes `%output` to
//! per-channel buffers and delivers control responses. All writes are
//! funneled through the same task via an mpsc queue, which serializes
//! transport access without ever holding a lock across an await.

use crate::error::SshError;
use crate::marker::{build_marker_command, parse_marker_output};
use crate::transport::SessionTransport;
use parking_lot::Mutex;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tccp_core::SshResult;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

pub type ChannelId = u32;

/// Channel 0: the pane created by `new-session`. It inherits the login
/// shell's session-scoped tickets (e.g. Kerberos), so programmatic
/// gateway runs prefer it.
pub const MASTER_CHANNEL: ChannelId = 0;

pub type OutputCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

const MUX_SESSION_TAG: &str = "tccp_mux";

/// Empirical: slower login shells may need tuning.
const MUX_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_QUIET: Duration = Duration::from_millis(300);
const DRAIN_BUDGET: Duration = Duration::from_secs(3);

/// Default bound for a programmatic run.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(300);

struct ChannelState {
    pane_id: String,
    pending: Mutex<Vec<u8>>,
    notify: Notify,
    callback: Mutex<Option<OutputCallback>>,
    /// Serializes runs on this channel (held across the whole
    /// write-command-await-done cycle).
    cmd_lock: tokio::sync::Mutex<()>,
}

impl ChannelState {
    fn new(pane_id: String) -> Arc<Self> {
        Arc::new(Self {
            pane_id,
            pending: Mutex::new(Vec::new()),
            notify: Notify::new(),
            callback: Mutex::new(None),
            cmd_lock: tokio::sync::Mutex::new(()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ControlResponse {
    success: bool,
    output: String,
}

#[derive(Default)]
struct Registry {
    channels: HashMap<ChannelId, Arc<ChannelState>>,
    pane_to_channel: HashMap<String, ChannelId>,
    next_id: ChannelId,
}

pub struct ChannelMultiplexer {
    writer: mpsc::Sender<Vec<u8>>,
    control_rx: tokio::sync::Mutex<mpsc::Receiver<ControlResponse>>,
    /// Serializes issue-control-command-then-read-response sequences and
    /// multi-step pane typing.
    protocol_lock: tokio::sync::Mutex<()>,
    registry: Arc<Mutex<Registry>>,
    running: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelMultiplexer {
    /// Start tmux control mode on the transport's primary shell and
    /// register the initial pane as channel 0.
    pub async fn start(transport: &SessionTransport) -> Result<Arc<Self>, SshError> {
        let mut channel = transport
            .take_primary()
            .ok_or(SshError::TransportClosed)?;

        // Kill any stale session from a previous run, then drain the
        // echo and prompt so they can't pollute the handshake.
        channel
            .data(format!("tmux kill-session -t {MUX_SESSION_TAG} 2>/dev/null\n").as_bytes())
            .await?;
        drain_channel(&mut channel).await;

        // Plain -C: -CC wraps the protocol in DCS passthrough for
        // iTerm2, which corrupts a raw channel stream.
        channel
            .data(format!("tmux -C new-session -s {MUX_SESSION_TAG}\n").as_bytes())
            .await?;

        let (handshake, pane_id) = read_handshake(&mut channel).await?;

        let running = Arc::new(AtomicBool::new(true));
        let registry = Arc::new(Mutex::new(Registry::default()));
        {
            let mut reg = registry.lock();
            let state = ChannelState::new(pane_id.clone());
            reg.channels.insert(MASTER_CHANNEL, state);
            reg.pane_to_channel.insert(pane_id, MASTER_CHANNEL);
            reg.next_id = 1;
        }

        let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>(64);
        let (control_tx, control_rx) = mpsc::channel::<ControlResponse>(8);

        let reader = tokio::spawn(io_task(
            channel,
            write_rx,
            control_tx,
            Arc::clone(&registry),
            Arc::clone(&running),
            handshake,
        ));

        Ok(Arc::new(Self {
            writer: write_tx,
            control_rx: tokio::sync::Mutex::new(control_rx),
            protocol_lock: tokio::sync::Mutex::new(()),
            registry,
            running,
            reader: Mutex::new(Some(reader)),
        }))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Send `kill-server` and stop the reader.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.writer.send(b"kill-server\n".to_vec()).await;
        self.notify_all();

        let handle = self.reader.lock().take();
        if let Some(handle) = handle {
            if timeout(Duration::from_secs(2), async {
                let _ = handle.await;
            })
            .await
            .is_err()
            {
                tracing::debug!("multiplexer reader did not exit in time");
            }
        }

        let mut reg = self.registry.lock();
        reg.channels.clear();
        reg.pane_to_channel.clear();
    }

    fn notify_all(&self) {
        let reg = self.registry.lock();
        for state in reg.channels.values() {
            state.notify.notify_waiters();
        }
    }

    fn state(&self, id: ChannelId) -> Option<Arc<ChannelState>> {
        self.registry.lock().channels.get(&id).cloned()
    }

    async fn send_raw(&self, text: String) -> Result<(), SshError> {
        self.writer
            .send(text.into_bytes())
            .await
            .map_err(|_| SshError::MuxStopped)
    }

    /// Issue a tmux control command and await its %begin/%end response.
    async fn control_command(&self, cmd: &str) -> Result<ControlResponse, SshError> {
        let _protocol = self.protocol_lock.lock().await;

        let mut rx = self.control_rx.lock().await;
        // Clear stale responses from aborted callers
        while rx.try_recv().is_ok() {}

        self.send_raw(format!("{cmd}\n")).await?;

        match timeout(CONTROL_TIMEOUT, rx.recv()).await {
            Ok(Some(resp)) => Ok(resp),
            Ok(None) => Err(SshError::MuxStopped),
            Err(_) => Err(SshError::MuxHandshake(format!(
                "no response to control command: {cmd}"
            ))),
        }
    }

    /// Open a new logical channel (tmux window). Returns its id.
    pub async fn open_channel(&self) -> Result<ChannelId, SshError> {
        if !self.is_running() {
            return Err(SshError::MuxStopped);
        }

        let resp = self
            .control_command("new-window -P -F '#{pane_id}'")
            .await?;
        if !resp.success {
            return Err(SshError::MuxHandshake(format!(
                "new-window failed: {}",
                resp.output
            )));
        }

        let pane_id = resp.output.trim().to_string();
        if !pane_id.starts_with('%') {
            return Err(SshError::MuxHandshake(format!(
                "unexpected new-window response: {pane_id}"
            )));
        }

        let id = {
            let mut reg = self.registry.lock();
            let id = reg.next_id;
            reg.next_id += 1;
            reg.channels.insert(id, ChannelState::new(pane_id.clone()));
            reg.pane_to_channel.insert(pane_id, id);
            id
        };
        tracing::debug!(channel = id, "opened multiplexed channel");
        Ok(id)
    }

    /// Close a logical channel. Channel 0 cannot be closed.
    pub async fn close_channel(&self, id: ChannelId) {
        if id == MASTER_CHANNEL {
            return;
        }
        let state = {
            let mut reg = self.registry.lock();
            let Some(state) = reg.channels.remove(&id) else {
                return;
            };
            reg.pane_to_channel.remove(&state.pane_id);
            state
        };
        let _ = self
            .control_command(&format!("kill-pane -t {}", state.pane_id))
            .await;
    }

    /// Run a command on a channel and wait for its exit code.
    ///
    /// Serialized per channel. On timeout, returns exit −1 with the
    /// partial buffer as stdout.
    pub async fn run(&self, id: ChannelId, cmd: &str, run_timeout: Duration) -> SshResult {
        let Some(state) = self.state(id) else {
            return SshResult::err("Invalid channel ID");
        };

        let _cmd_guard = state.cmd_lock.lock().await;

        state.pending.lock().clear();

        let marker_cmd = build_marker_command(cmd);
        {
            let _protocol = self.protocol_lock.lock().await;
            if self
                .type_into_pane(&state.pane_id, marker_cmd.as_bytes())
                .await
                .is_err()
            {
                return SshResult::err("Multiplexer stopped");
            }
        }

        let deadline = Instant::now() + run_timeout;
        loop {
            let parsed = {
                let pending = state.pending.lock();
                parse_marker_output(&String::from_utf8_lossy(&pending))
            };
            if parsed.found {
                state.pending.lock().clear();
                return SshResult {
                    exit_code: parsed.exit_code,
                    stdout: parsed.output,
                    stderr: String::new(),
                };
            }

            if !self.is_running() {
                return SshResult::err("Multiplexer stopped");
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let partial = {
                    let mut pending = state.pending.lock();
                    let text = String::from_utf8_lossy(&pending).into_owned();
                    pending.clear();
                    text
                };
                return SshResult {
                    exit_code: -1,
                    stdout: partial,
                    stderr: format!("Command timed out after {}s", run_timeout.as_secs()),
                };
            }
            let _ = timeout(
                remaining.min(Duration::from_millis(100)),
                state.notify.notified(),
            )
            .await;
        }
    }

    /// Forward raw interactive input to a pane.
    pub async fn send_input(&self, id: ChannelId, data: &[u8]) {
        if !self.is_running() || data.is_empty() {
            return;
        }
        let Some(state) = self.state(id) else { return };
        let _protocol = self.protocol_lock.lock().await;
        let _ = self.type_into_pane(&state.pane_id, data).await;
    }

    /// Send a named tmux key (e.g. "Enter", "C-c").
    pub async fn send_special_key(&self, id: ChannelId, key: &str) {
        if !self.is_running() {
            return;
        }
        let Some(state) = self.state(id) else { return };
        let _protocol = self.protocol_lock.lock().await;
        let _ = self
            .send_raw(format!("send-keys -t {} {}\n", state.pane_id, key))
            .await;
    }

    pub fn set_output_callback(&self, id: ChannelId, cb: OutputCallback) {
        if let Some(state) = self.state(id) {
            *state.callback.lock() = Some(cb);
        }
    }

    pub fn clear_output_callback(&self, id: ChannelId) {
        if let Some(state) = self.state(id) {
            *state.callback.lock() = None;
        }
    }

    pub async fn resize(&self, id: ChannelId, cols: u16, rows: u16) {
        if !self.is_running() {
            return;
        }
        let Some(state) = self.state(id) else { return };
        let _protocol = self.protocol_lock.lock().await;
        let _ = self
            .send_raw(format!(
                "resize-pane -t {} -x {} -y {}\n",
                state.pane_id, cols, rows
            ))
            .await;
    }

    /// Emit the send-keys commands that type `data` into a pane.
    /// Caller must hold the protocol lock.
    async fn type_into_pane(&self, pane_id: &str, data: &[u8]) -> Result<(), SshError> {
        for line in plan_send_keys(pane_id, data) {
            self.send_raw(line).await?;
        }
        Ok(())
    }
}

/// Read until the channel is quiet (used after the stale-session kill).
async fn drain_channel(channel: &mut Channel<Msg>) {
    let deadline = Instant::now() + DRAIN_BUDGET;
    while Instant::now() < deadline {
        match timeout(DRAIN_QUIET, channel.wait()).await {
            Ok(Some(ChannelMsg::Data { .. } | ChannelMsg::ExtendedData { .. })) => {}
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }
}

/// Wait for the control-mode handshake: the first `%output` line names
/// the initial pane. Returns (all bytes read, pane id).
async fn read_handshake(channel: &mut Channel<Msg>) -> Result<(String, String), SshError> {
    let mut handshake = String::new();
    let deadline = Instant::now() + MUX_HANDSHAKE_TIMEOUT;

    loop {
        if let Some(pane_id) = first_output_pane(&handshake) {
            return Ok((handshake, pane_id));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            let mut cleaned: String = handshake
                .chars()
                .filter(|c| !c.is_control() || *c == '\n')
                .collect();
            cleaned.truncate(300);
            return Err(SshError::MuxHandshake(format!(
                "no %output received; got: {cleaned}"
            )));
        }

        match timeout(remaining, channel.wait()).await {
            Ok(Some(ChannelMsg::Data { data })) => {
                handshake.push_str(&String::from_utf8_lossy(&data));
            }
            Ok(Some(ChannelMsg::Eof | ChannelMsg::Close)) | Ok(None) => {
                return Err(SshError::TransportClosed);
            }
            Ok(Some(_)) => {}
            Err(_) => {
                return Err(SshError::MuxHandshake(
                    "no %output received (handshake timeout)".into(),
                ));
            }
        }
    }
}

/// Extract the pane id from the first `%output %<pane> ...` occurrence.
pub(crate) fn first_output_pane(text: &str) -> Option<String> {
    let pos = text.find("%output %")?;
    let rest = &text[pos + "%output ".len()..];
    let end = rest.find(' ')?;
    Some(rest[..end].to_string())
}

/// The I/O task: sole owner of the shell channel. Applies queued writes
/// and routes inbound control-protocol lines.
async fn io_task(
    mut channel: Channel<Msg>,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
    control_tx: mpsc::Sender<ControlResponse>,
    registry: Arc<Mutex<Registry>>,
    running: Arc<AtomicBool>,
    initial: String,
) {
    let mut line_buf = String::new();
    let mut in_cmd_response = false;
    let mut cmd_output = String::new();

    let mut process = |chunk: &str,
                       line_buf: &mut String,
                       in_cmd_response: &mut bool,
                       cmd_output: &mut String| {
        line_buf.push_str(chunk);
        loop {
            let Some(nl) = line_buf.find('\n') else { break };
            let mut line: String = line_buf.drain(..=nl).collect();
            line.truncate(line.trim_end_matches(['\n', '\r']).len());

            if let Some(rest) = line.strip_prefix("%begin") {
                let _ = rest;
                *in_cmd_response = true;
                cmd_output.clear();
                continue;
            }
            if line.starts_with("%end") && *in_cmd_response {
                *in_cmd_response = false;
                let output = cmd_output.trim_end_matches('\n').to_string();
                let _ = control_tx.try_send(ControlResponse {
                    success: true,
                    output,
                });
                cmd_output.clear();
                continue;
            }
            if line.starts_with("%error") && *in_cmd_response {
                *in_cmd_response = false;
                let _ = control_tx.try_send(ControlResponse {
                    success: false,
                    output: cmd_output.clone(),
                });
                cmd_output.clear();
                continue;
            }
            if *in_cmd_response {
                cmd_output.push_str(&line);
                cmd_output.push('\n');
                continue;
            }

            if let Some((pane_id, payload)) = parse_output_line(&line) {
                let bytes = decode_octal_escapes(payload);
                let state = {
                    let reg = registry.lock();
                    reg.pane_to_channel
                        .get(pane_id)
                        .and_then(|id| reg.channels.get(id))
                        .cloned()
                };
                if let Some(state) = state {
                    state.pending.lock().extend_from_slice(&bytes);
                    state.notify.notify_waiters();
                    let cb = state.callback.lock().clone();
                    if let Some(cb) = cb {
                        cb(&bytes);
                    }
                }
            }
            // Other % notifications (%session-changed, %layout-change,
            // ...) are ignored.
        }
    };

    process(&initial, &mut line_buf, &mut in_cmd_response, &mut cmd_output);

    loop {
        tokio::select! {
            outbound = write_rx.recv() => {
                match outbound {
                    Some(bytes) => {
                        if channel.data(&bytes[..]).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = channel.wait() => {
                match inbound {
                    Some(ChannelMsg::Data { data }) => {
                        let chunk = String::from_utf8_lossy(&data).into_owned();
                        process(&chunk, &mut line_buf, &mut in_cmd_response, &mut cmd_output);
                    }
                    Some(ChannelMsg::ExtendedData { .. }) => {}
                    Some(ChannelMsg::Eof | ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    let reg = registry.lock();
    for state in reg.channels.values() {
        state.notify.notify_waiters();
    }
    tracing::debug!("multiplexer reader stopped");
}

/// Split an `%output <pane> <data>` line.
pub(crate) fn parse_output_line(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix("%output ")?;
    let space = rest.find(' ')?;
    Some((&rest[..space], &rest[space + 1..]))
}

/// Decode tmux control-mode octal escapes (`\NNN`, 1–3 octal digits).
pub(crate) fn decode_octal_escapes(data: &str) -> Vec<u8> {
    let bytes = data.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() {
            let mut value: u32 = 0;
            let mut consumed = 0;
            while consumed < 3 && i + 1 + consumed < bytes.len() {
                let d = bytes[i + 1 + consumed];
                if !(b'0'..=b'7').contains(&d) {
                    break;
                }
                value = value * 8 + u32::from(d - b'0');
                consumed += 1;
            }
            if consumed > 0 && value <= 255 {
                out.push(value as u8);
                i += 1 + consumed;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

/// Escape printable text for `send-keys -l`. The consumer is the tmux
/// command parser, not a shell: double quotes with \" \\ \$ \# escapes.
pub(crate) fn escape_send_keys_literal(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 8);
    escaped.push('"');
    for c in text.chars() {
        if matches!(c, '"' | '\\' | '$' | '#') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('"');
    escaped
}

/// Translate a byte sequence into tmux send-keys command lines.
///
/// Raw bytes cannot be streamed into a control-mode pane: newlines would
/// corrupt the protocol. Each logical key becomes one command; printable
/// runs are batched into a single `-l` literal.
pub(crate) fn plan_send_keys(pane_id: &str, data: &[u8]) -> Vec<String> {
    let mut commands = Vec::new();
    let mut pending = String::new();

    let flush = |pending: &mut String, commands: &mut Vec<String>| {
        if !pending.is_empty() {
            commands.push(format!(
                "send-keys -t {} -l {}\n",
                pane_id,
                escape_send_keys_literal(pending)
            ));
            pending.clear();
        }
    };
    let key = |name: &str, pending: &mut String, commands: &mut Vec<String>| {
        flush(pending, commands);
        commands.push(format!("send-keys -t {pane_id} {name}\n"));
    };

    let mut i = 0;
    while i < data.len() {
        let c = data[i];

        // Escape sequences: arrows, Home/End, Insert/Delete, paging
        if c == 0x1b && i + 1 < data.len() {
            if data[i + 1] == b'[' && i + 2 < data.len() {
                let seq = data[i + 2];
                let named = match seq {
                    b'A' => Some("Up"),
                    b'B' => Some("Down"),
                    b'C' => Some("Right"),
                    b'D' => Some("Left"),
                    b'H' => Some("Home"),
                    b'F' => Some("End"),
                    _ => None,
                };
                if let Some(name) = named {
                    key(name, &mut pending, &mut commands);
                    i += 3;
                    continue;
                }
                if seq.is_ascii_digit() && i + 3 < data.len() && data[i + 3] == b'~' {
                    let named = match seq {
                        b'2' => "IC",
                        b'3' => "DC",
                        b'5' => "PageUp",
                        b'6' => "PageDown",
                        _ => {
                            key("Escape", &mut pending, &mut commands);
                            i += 1;
                            continue;
                        }
                    };
                    key(named, &mut pending, &mut commands);
                    i += 4;
                    continue;
                }
            }
            if data[i + 1] == b'O' && i + 2 < data.len() {
                let named = match data[i + 2] {
                    b'A' => Some("Up"),
                    b'B' => Some("Down"),
                    b'C' => Some("Right"),
                    b'D' => Some("Left"),
                    b'H' => Some("Home"),
                    b'F' => Some("End"),
                    _ => None,
                };
                if let Some(name) = named {
                    key(name, &mut pending, &mut commands);
                    i += 3;
                    continue;
                }
            }
            key("Escape", &mut pending, &mut commands);
            i += 1;
            continue;
        }

        // Newlines → Enter (collapse CRLF)
        if c == b'\r' || c == b'\n' {
            key("Enter", &mut pending, &mut commands);
            i += 1;
            if c == b'\r' && i < data.len() && data[i] == b'\n' {
                i += 1;
            }
            continue;
        }

        if c == 0x7f || c == 0x08 {
            key("BSpace", &mut pending, &mut commands);
            i += 1;
            continue;
        }

        if c == b'\t' {
            key("Tab", &mut pending, &mut commands);
            i += 1;
            continue;
        }

        // Ctrl+A..Z (Tab/LF/CR already handled above)
        if (0x01..=0x1a).contains(&c) {
            let name = format!("C-{}", (b'a' + c - 1) as char);
            key(&name, &mut pending, &mut commands);
            i += 1;
            continue;
        }

        pending.push(c as char);
        i += 1;
    }
    flush(&mut pending, &mut commands);
    commands
}

#[cfg(test)]
#[path = "mux_tests.rs"]
mod tests;
