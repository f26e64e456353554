//! Session application and its supervisor (component C5, spec.md §3, §4.5).

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, trace, warn};
use tokio::sync::Mutex;

use crate::channel::{mark_closed_first_time, Channel, ChannelId, ChannelTable};
use crate::config::{ExitOutcome, SessionHandler};
use crate::msg::{
    self, ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelRequest,
    ChannelRequestBody, Message, EXTENDED_DATA_STDERR,
};
use crate::window::TWindowBuffer;

/// Optional pseudo-terminal parameters requested via `pty-req`.
#[derive(Debug, Clone)]
pub struct PtySettings {
    pub term: String,
    pub width_chars: u32,
    pub height_rows: u32,
    pub width_px: u32,
    pub height_px: u32,
}

/// The three buffers and mutable request state backing a `session`
/// channel (spec.md §3 "SessionState").
pub struct SessionBuffers {
    pub stdin: TWindowBuffer,
    pub stdout: TWindowBuffer,
    pub stderr: TWindowBuffer,
    pub env: Arc<Mutex<HashMap<String, String>>>,
    pub pty: Arc<Mutex<Option<PtySettings>>>,
}

impl SessionBuffers {
    pub fn new(queue_size: u32) -> Self {
        SessionBuffers {
            stdin: TWindowBuffer::new(queue_size),
            stdout: TWindowBuffer::new(queue_size),
            stderr: TWindowBuffer::new(queue_size),
            env: Arc::new(Mutex::new(HashMap::new())),
            pty: Arc::new(Mutex::new(None)),
        }
    }
}

/// What a [`SessionHandler`] is given to read/write against.
pub struct SessionIo {
    pub stdin: TWindowBuffer,
    pub stdout: TWindowBuffer,
    pub stderr: TWindowBuffer,
    pub env: HashMap<String, String>,
    pub pty: Option<PtySettings>,
}

/// Applies a `ChannelRequest` against session state before the worker
/// starts. Returns `true` if this request starts the worker (a
/// shell/exec/subsystem command), in which case the caller should invoke
/// [`run_session_supervisor`].
pub async fn apply_pre_exec_request(buffers: &SessionBuffers, req: &ChannelRequest) -> bool {
    match &req.body {
        ChannelRequestBody::Env { name, value } => {
            buffers.env.lock().await.insert(name.clone(), value.clone());
            false
        }
        ChannelRequestBody::PtyReq {
            term,
            width_chars,
            height_rows,
            width_px,
            height_px,
            ..
        } => {
            *buffers.pty.lock().await = Some(PtySettings {
                term: term.clone(),
                width_chars: *width_chars,
                height_rows: *height_rows,
                width_px: *width_px,
                height_px: *height_px,
            });
            false
        }
        ChannelRequestBody::Shell | ChannelRequestBody::Exec { .. } | ChannelRequestBody::Subsystem { .. } => true,
        _ => false,
    }
}

/// Runs a session channel's worker and drains its output, in the priority
/// order laid out in spec.md §4.5: stdout, then stderr, then worker exit,
/// then window-adjust. (1) and (2) must fully drain before (3) emits EOF,
/// otherwise a fast-exiting handler would silently truncate output.
pub async fn run_session_supervisor(
    handler: Box<dyn SessionHandler>,
    command: crate::config::SessionCommand,
    local_id: ChannelId,
    remote_id: ChannelId,
    channels: Arc<Mutex<ChannelTable>>,
    outbox: tokio::sync::mpsc::UnboundedSender<Message>,
) {
    let buffers = {
        let table = channels.lock().await;
        match table.get(local_id) {
            Some(crate::channel::ChannelState::Running(chan)) => match &chan.app {
                crate::channel::Application::Session(b) => SessionBuffers {
                    stdin: b.stdin.clone(),
                    stdout: b.stdout.clone(),
                    stderr: b.stderr.clone(),
                    env: b.env.clone(),
                    pty: b.pty.clone(),
                },
                _ => return,
            },
            _ => return,
        }
    };

    let remote_window = {
        let table = channels.lock().await;
        match table.get(local_id) {
            Some(crate::channel::ChannelState::Running(chan)) => chan.remote_window.clone(),
            _ => return,
        }
    };
    let remote_max_packet = {
        let table = channels.lock().await;
        match table.get(local_id) {
            Some(crate::channel::ChannelState::Running(chan)) => chan.remote_max_packet,
            _ => return,
        }
    };

    let io = SessionIo {
        stdin: buffers.stdin.clone(),
        stdout: buffers.stdout.clone(),
        stderr: buffers.stderr.clone(),
        env: buffers.env.lock().await.clone(),
        pty: buffers.pty.lock().await.clone(),
    };

    let mut worker = Box::pin(handler.run(command, io));
    let stdout = buffers.stdout.clone();
    let stderr = buffers.stderr.clone();
    let stdin = buffers.stdin.clone();

    // The teacher's `runner.rs` wakes a single waker on whichever side has
    // progress; here each arm below is itself a retrying future, and
    // `biased` enforces the priority order spec.md §4.5 requires: stdout
    // and stderr must drain before a worker exit is allowed to emit EOF.
    let outcome = loop {
        tokio::select! {
            biased;

            chunk = stdout.dequeue_short(remote_max_packet as usize) => {
                send_data(&remote_window, remote_max_packet, remote_id, chunk, None, &outbox).await;
            }

            chunk = stderr.dequeue_short(remote_max_packet as usize) => {
                send_data(&remote_window, remote_max_packet, remote_id, chunk, Some(EXTENDED_DATA_STDERR), &outbox).await;
            }

            outcome = &mut worker => {
                break outcome;
            }

            increment = stdin.recommended_window_adjust() => {
                let _ = outbox.send(Message::ChannelWindowAdjust(msg::ChannelWindowAdjust {
                    recipient_channel: remote_id,
                    bytes_to_add: increment,
                }));
            }
        }
    };

    // Drain any remaining buffered output before emitting EOF, per the
    // load-bearing ordering in spec.md §4.5.
    buffers.stdout.send_eof().await;
    buffers.stderr.send_eof().await;
    drain_remaining(&buffers.stdout, &remote_window, remote_max_packet, remote_id, None, &outbox).await;
    drain_remaining(&buffers.stderr, &remote_window, remote_max_packet, remote_id, Some(EXTENDED_DATA_STDERR), &outbox).await;

    let _ = outbox.send(Message::ChannelEof(ChannelEof {
        recipient_channel: remote_id,
    }));

    let request = match outcome {
        ExitOutcome::Status(code) => ChannelRequestBody::ExitStatus { code },
        ExitOutcome::Exception(msg) => {
            warn!("session {local_id} handler exception: {msg}");
            ChannelRequestBody::ExitSignal {
                signal_name: "ILL".into(),
                core_dumped: false,
                message: String::new(),
                language: String::new(),
            }
        }
    };
    let _ = outbox.send(Message::ChannelRequest(ChannelRequest {
        recipient_channel: remote_id,
        want_reply: false,
        body: request,
    }));

    let should_send_close = {
        let table = channels.lock().await;
        match table.get(local_id) {
            Some(crate::channel::ChannelState::Running(chan)) => {
                mark_closed_first_time(&chan.closed)
            }
            _ => false,
        }
    };
    if should_send_close {
        let _ = outbox.send(Message::ChannelClose(ChannelClose {
            recipient_channel: remote_id,
        }));
    }
    debug!("session {local_id} supervisor finished");
}

async fn send_data(
    remote_window: &crate::channel::RemoteWindow,
    remote_max_packet: u32,
    remote_id: ChannelId,
    mut chunk: Vec<u8>,
    extended_code: Option<u32>,
    outbox: &tokio::sync::mpsc::UnboundedSender<Message>,
) {
    while !chunk.is_empty() {
        let take = remote_window.reserve(chunk.len(), remote_max_packet).await;
        let rest = chunk.split_off(take);
        let sent = std::mem::replace(&mut chunk, rest);
        trace!("channel {remote_id} sending {} bytes", sent.len());
        let msg = match extended_code {
            None => Message::ChannelData(ChannelData {
                recipient_channel: remote_id,
                data: sent.into(),
            }),
            Some(code) => Message::ChannelExtendedData(ChannelExtendedData {
                recipient_channel: remote_id,
                data_type_code: code,
                data: sent.into(),
            }),
        };
        let _ = outbox.send(msg);
    }
}

async fn drain_remaining(
    buf: &TWindowBuffer,
    remote_window: &crate::channel::RemoteWindow,
    remote_max_packet: u32,
    remote_id: ChannelId,
    extended_code: Option<u32>,
    outbox: &tokio::sync::mpsc::UnboundedSender<Message>,
) {
    loop {
        let chunk = buf.dequeue_short(remote_max_packet as usize).await;
        if chunk.is_empty() {
            break;
        }
        send_data(remote_window, remote_max_packet, remote_id, chunk, extended_code, outbox).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pty_req_sets_pty_settings_without_starting_worker() {
        let buffers = SessionBuffers::new(1024);
        let req = ChannelRequest {
            recipient_channel: 0,
            want_reply: false,
            body: ChannelRequestBody::PtyReq {
                term: "xterm".into(),
                width_chars: 80,
                height_rows: 24,
                width_px: 0,
                height_px: 0,
                modes: bytes::Bytes::new(),
            },
        };
        assert!(!apply_pre_exec_request(&buffers, &req).await);
        assert_eq!(buffers.pty.lock().await.as_ref().unwrap().term, "xterm");
    }

    #[tokio::test]
    async fn exec_request_starts_worker() {
        let buffers = SessionBuffers::new(1024);
        let req = ChannelRequest {
            recipient_channel: 0,
            want_reply: true,
            body: ChannelRequestBody::Exec {
                command: "echo hi".into(),
            },
        };
        assert!(apply_pre_exec_request(&buffers, &req).await);
    }
}
