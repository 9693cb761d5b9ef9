//! Single-outstanding-request protocol engine: an actor owning the serial
//! port exclusively, talking to the rest of the core only through
//! `ProtocolEngineHandle`.

pub mod commands;
pub mod port;

pub use port::{FakePort, Serial2Port, SerialPort};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ProtocolError;

const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);
const STASH_CAPACITY: usize = 100;
const INBOX_CAPACITY: usize = 64;

/// A reply delivered to whoever issued a `Query`.
#[derive(Debug)]
pub enum Response {
    Success {
        correlation_id: Uuid,
        command: String,
        payload: Vec<String>,
    },
    Failure {
        correlation_id: Uuid,
        command: String,
        reason: ProtocolError,
    },
    Timeout {
        correlation_id: Uuid,
        command: String,
        partial_payload: String,
    },
}

enum EngineRequest {
    Write {
        data: String,
    },
    Query {
        data: String,
        expected_lines: usize,
        correlation_id: Uuid,
        reply: oneshot::Sender<Response>,
    },
    Flush,
}

struct PendingCommand {
    original_cmd: String,
    normalized_cmd: String,
    expected_lines: usize,
    reply: oneshot::Sender<Response>,
    buffer: String,
    correlation_id: Uuid,
}

/// A lightweight handle cloned into every task that needs to talk to the
/// device. The actual port is owned exclusively by the spawned actor.
#[derive(Clone)]
pub struct ProtocolEngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl ProtocolEngineHandle {
    /// Fire-and-forget write. Validation failures are logged and dropped,
    /// since there is no reply channel to report them on.
    pub async fn write(&self, data: impl Into<String>) -> Result<(), ProtocolError> {
        self.tx
            .send(EngineRequest::Write { data: data.into() })
            .await
            .map_err(|_| ProtocolError::EngineStopped)
    }

    /// Sends `data` and awaits `expected_lines` CR-terminated reply lines,
    /// a validation failure, a queue-full rejection, or a 500 ms timeout.
    pub async fn query(
        &self,
        data: impl Into<String>,
        expected_lines: usize,
    ) -> Result<Response, ProtocolError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let correlation_id = Uuid::new_v4();
        self.tx
            .send(EngineRequest::Query {
                data: data.into(),
                expected_lines,
                correlation_id,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ProtocolError::EngineStopped)?;
        reply_rx.await.map_err(|_| ProtocolError::EngineStopped)
    }

    pub async fn flush(&self) -> Result<(), ProtocolError> {
        self.tx
            .send(EngineRequest::Flush)
            .await
            .map_err(|_| ProtocolError::EngineStopped)
    }
}

enum State {
    Idle,
    Waiting(PendingCommand),
}

/// Spawns the protocol engine as a background task and returns a handle to
/// it. The engine runs until every clone of the handle is dropped.
pub fn spawn(port: Arc<dyn SerialPort>) -> ProtocolEngineHandle {
    let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
    tokio::spawn(run(port, rx));
    ProtocolEngineHandle { tx }
}

async fn run(port: Arc<dyn SerialPort>, mut inbox: mpsc::Receiver<EngineRequest>) {
    let mut state = State::Idle;
    let mut stash: VecDeque<EngineRequest> = VecDeque::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let timer = async {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            maybe_req = inbox.recv() => {
                match maybe_req {
                    Some(req) => {
                        handle_request(&port, &mut state, &mut stash, &mut deadline, req).await;
                    }
                    None => {
                        debug!("protocol engine inbox closed, shutting down");
                        break;
                    }
                }
            }
            data = port.recv() => {
                match data {
                    Ok(bytes) if bytes.is_empty() => {
                        warn!("serial port closed");
                        break;
                    }
                    Ok(bytes) => {
                        handle_data(&port, &mut state, &mut stash, &mut deadline, &bytes).await;
                    }
                    Err(e) => warn!(error = %e, "serial read failed"),
                }
            }
            _ = timer, if deadline.is_some() => {
                handle_timeout(&port, &mut state, &mut stash, &mut deadline).await;
            }
        }
    }
}

async fn handle_request(
    port: &Arc<dyn SerialPort>,
    state: &mut State,
    stash: &mut VecDeque<EngineRequest>,
    deadline: &mut Option<Instant>,
    req: EngineRequest,
) {
    match state {
        State::Idle => enter_idle_with(port, state, deadline, req).await,
        State::Waiting(_) => match req {
            EngineRequest::Flush => {
                if let Err(e) = port.flush().await {
                    warn!(error = %e, "flush failed while waiting");
                }
            }
            other => {
                if stash.len() >= STASH_CAPACITY {
                    if let EngineRequest::Query { reply, data, correlation_id, .. } = other {
                        let _ = reply.send(Response::Failure {
                            correlation_id,
                            command: data,
                            reason: ProtocolError::QueueFull,
                        });
                    }
                } else {
                    stash.push_back(other);
                }
            }
        },
    }
}

/// Processes one request while logically Idle: a `Write` stays Idle, a
/// `Query` transitions to `Waiting`. Used both for requests arriving
/// directly in `Idle` and for draining the stash.
async fn enter_idle_with(
    port: &Arc<dyn SerialPort>,
    state: &mut State,
    deadline: &mut Option<Instant>,
    req: EngineRequest,
) {
    match req {
        EngineRequest::Write { data } => match commands::validate(&data) {
            Ok(normalized) => {
                if let Err(e) = port.write(normalized.as_bytes()).await {
                    warn!(error = %e, command = %data, "write failed");
                }
            }
            Err(e) => warn!(error = %e, command = %data, "dropping invalid write"),
        },
        EngineRequest::Query {
            data,
            expected_lines,
            correlation_id,
            reply,
        } => match commands::validate(&data) {
            Err(e) => {
                let _ = reply.send(Response::Failure {
                    correlation_id,
                    command: data,
                    reason: e,
                });
            }
            Ok(normalized) => {
                if let Err(e) = port.write(normalized.as_bytes()).await {
                    warn!(error = %e, command = %data, "write failed");
                    let _ = reply.send(Response::Failure {
                        correlation_id,
                        command: data,
                        reason: ProtocolError::EngineStopped,
                    });
                    return;
                }
                *deadline = Some(Instant::now() + RESPONSE_TIMEOUT);
                *state = State::Waiting(PendingCommand {
                    original_cmd: data,
                    normalized_cmd: normalized,
                    expected_lines,
                    reply,
                    buffer: String::new(),
                    correlation_id,
                });
            }
        },
        EngineRequest::Flush => {
            if let Err(e) = port.flush().await {
                warn!(error = %e, "flush failed");
            }
        }
    }
}

async fn handle_data(
    port: &Arc<dyn SerialPort>,
    state: &mut State,
    stash: &mut VecDeque<EngineRequest>,
    deadline: &mut Option<Instant>,
    bytes: &[u8],
) {
    let pending = match state {
        State::Waiting(p) => p,
        State::Idle => {
            debug!("discarding data with no pending request");
            return;
        }
    };

    let text = String::from_utf8_lossy(bytes).replace("\r\n", "\r");
    pending.buffer.push_str(&text);

    let mut fragments: Vec<&str> = pending.buffer.split('\r').collect();
    let trailing = fragments.pop().unwrap_or("");
    if fragments.len() < pending.expected_lines {
        return;
    }

    let payload: Vec<String> = fragments
        .iter()
        .take(pending.expected_lines)
        .map(|s| s.to_string())
        .collect();
    let trailing = trailing.to_string();

    let State::Waiting(pending) = std::mem::replace(state, State::Idle) else {
        unreachable!()
    };
    info!(command = %pending.normalized_cmd, "query completed");
    let _ = pending.reply.send(Response::Success {
        correlation_id: pending.correlation_id,
        command: pending.original_cmd,
        payload,
    });
    let _ = trailing;

    *deadline = None;
    drain_stash(port, state, stash, deadline).await;
}

async fn handle_timeout(
    port: &Arc<dyn SerialPort>,
    state: &mut State,
    stash: &mut VecDeque<EngineRequest>,
    deadline: &mut Option<Instant>,
) {
    let State::Waiting(pending) = std::mem::replace(state, State::Idle) else {
        return;
    };
    warn!(command = %pending.normalized_cmd, "protocol timeout");
    let _ = pending.reply.send(Response::Timeout {
        correlation_id: pending.correlation_id,
        command: pending.original_cmd,
        partial_payload: pending.buffer,
    });

    *deadline = None;
    drain_stash(port, state, stash, deadline).await;
}

/// Pops stashed requests in FIFO order, processing each as if freshly
/// arrived while Idle, until the stash is empty or one of them puts the
/// engine back into `Waiting`.
async fn drain_stash(
    port: &Arc<dyn SerialPort>,
    state: &mut State,
    stash: &mut VecDeque<EngineRequest>,
    deadline: &mut Option<Instant>,
) {
    while matches!(state, State::Idle) {
        let Some(req) = stash.pop_front() else {
            break;
        };
        enter_idle_with(port, state, deadline, req).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn write_then_query_round_trip() {
        let (fake, inbound_tx) = FakePort::new();
        let handle = spawn(fake.clone());

        handle.write("r").await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        assert_eq!(fake.written_commands().await, vec!["R\r".to_string()]);

        let query = tokio::spawn({
            let handle = handle.clone();
            async move { handle.query("qp", 1).await.unwrap() }
        });
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        inbound_tx.send(b"1\r".to_vec()).unwrap();

        match query.await.unwrap() {
            Response::Success { payload, .. } => assert_eq!(payload, vec!["1".to_string()]),
            other => panic!("expected Success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_query_fails_without_touching_port() {
        let (fake, _tx) = FakePort::new();
        let handle = spawn(fake.clone());

        let response = handle.query("xm ,100,10,10", 1).await.unwrap();
        assert!(matches!(
            response,
            Response::Failure {
                reason: ProtocolError::NonAsciiPrintable,
                ..
            }
        ));
        assert!(fake.written_commands().await.is_empty());
    }

    #[tokio::test]
    async fn unanswered_query_times_out() {
        let (fake, _tx) = FakePort::new();
        let handle = spawn(fake);

        let response = handle.query("qp", 1).await.unwrap();
        assert!(matches!(response, Response::Timeout { .. }));
    }
}
