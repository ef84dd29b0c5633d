//! Streaming speech synthesis over the duplex task socket.
//!
//! The manager consumes [`TtsCommand`]s and keeps at most one socket open,
//! owned by the session that opened it. Each connection moves through
//! `Idle → Connecting → Speaking → Draining → Closed`:
//!
//! - the first chunk of a turn opens the socket, sends `run-task` and waits
//!   (bounded) for `task-started`;
//! - every chunk is sent as `continue-task`;
//! - `EndOfTurn` sends `finish-task` and waits (bounded) for the receive
//!   loop to see `task-finished`.
//!
//! A background receive loop forwards binary frames as session-tagged PCM
//! and pushes the drain sentinel on a clean finish. Commands or connections
//! belonging to a session that is no longer live are dropped or torn down
//! before anything else happens.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CloudConfig;
use crate::error::{AssistantError, Result};
use crate::pipeline::messages::{PcmChunk, TtsCommand};
use crate::pipeline::queue::FlushQueue;
use crate::pipeline::session::SessionManager;
use crate::protocol::{self, SynthesisParams, TaskEvent, TaskSocket};

/// Bound on closing a socket we are abandoning.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Lifecycle of the synthesis connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket.
    Idle,
    /// Socket opening, waiting for `task-started`.
    Connecting,
    /// Accepting text chunks.
    Speaking,
    /// `finish-task` sent, waiting for `task-finished`.
    Draining,
    /// Socket closed; the next chunk starts over from idle.
    Closed,
}

/// How a receive loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReceiveOutcome {
    /// `task-finished` arrived and the drain sentinel was queued.
    Finished,
    /// `task-failed` or a socket error.
    Failed(String),
    /// The server closed the socket without finishing.
    Closed,
    /// The owning session was cancelled.
    Cancelled,
}

struct Connection {
    session: u64,
    task_id: String,
    write: SplitSink<TaskSocket, Message>,
    receiver: JoinHandle<ReceiveOutcome>,
    cancel: CancellationToken,
}

/// Owns the synthesis socket and feeds the speech PCM queue.
pub struct TtsSessionManager {
    url: String,
    api_key: String,
    params: SynthesisParams,
    connect_timeout: Duration,
    started_timeout: Duration,
    finish_timeout: Duration,
    sessions: Arc<SessionManager>,
    pcm: Arc<FlushQueue<PcmChunk>>,
    state: Mutex<ConnectionState>,
}

impl TtsSessionManager {
    /// Manager configured from the cloud section.
    pub fn new(
        cloud: &CloudConfig,
        sessions: Arc<SessionManager>,
        pcm: Arc<FlushQueue<PcmChunk>>,
    ) -> Self {
        Self {
            url: cloud.tts_url.clone(),
            api_key: cloud.api_key.clone(),
            params: SynthesisParams {
                model: cloud.tts_model.clone(),
                voice: cloud.tts_voice.clone(),
                sample_rate: cloud.tts_sample_rate,
                volume: cloud.tts_volume,
            },
            connect_timeout: Duration::from_millis(cloud.connect_timeout_ms),
            started_timeout: Duration::from_millis(cloud.started_timeout_ms),
            finish_timeout: Duration::from_millis(cloud.finish_timeout_ms),
            sessions,
            pcm,
            state: Mutex::new(ConnectionState::Idle),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *state != next {
            debug!(from = ?*state, to = ?next, "synthesis connection");
            *state = next;
        }
    }

    /// Consume commands until `shutdown` fires or the queue closes.
    pub async fn run(&self, commands: &FlushQueue<TtsCommand>, shutdown: CancellationToken) {
        let mut conn: Option<Connection> = None;
        loop {
            let command = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            if let Some(stale) = conn.take_if(|c| !self.sessions.is_live(c.session)) {
                debug!(session = stale.session, "tearing down superseded synthesis socket");
                self.abort(stale).await;
            }
            if !self.sessions.is_live(command.session()) {
                debug!(session = command.session(), "dropping command from stale session");
                continue;
            }

            match command {
                TtsCommand::Speak { session, text } => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    if let Some(dead) = conn.take_if(|c| c.receiver.is_finished()) {
                        debug!(session = dead.session, "receive loop ended, reopening");
                        self.abort(dead).await;
                    }
                    if conn.is_none() {
                        match self.open(session).await {
                            Ok(opened) => conn = Some(opened),
                            Err(e) => {
                                warn!(session, "synthesis start failed, dropping chunk: {e}");
                                self.set_state(ConnectionState::Idle);
                                continue;
                            }
                        }
                    }
                    if let Some(active) = conn.as_mut() {
                        let frame = protocol::continue_task(&active.task_id, &text);
                        if let Err(e) = active.write.send(Message::Text(frame)).await {
                            warn!(session, "continue-task send failed: {e}");
                            if let Some(broken) = conn.take() {
                                self.abort(broken).await;
                            }
                        } else {
                            debug!(session, chars = text.chars().count(), "chunk sent");
                        }
                    }
                }
                TtsCommand::EndOfTurn { session } => {
                    let drained = match conn.take() {
                        Some(active) => self.finish(active).await,
                        None => false,
                    };
                    if !drained {
                        self.push_drain(session).await;
                    }
                }
            }
        }
        if let Some(active) = conn.take() {
            self.abort(active).await;
        }
        self.set_state(ConnectionState::Idle);
    }

    async fn open(&self, session: u64) -> Result<Connection> {
        let current = self.sessions.current();
        if current.id != session || current.is_cancelled() {
            return Err(AssistantError::Cancelled);
        }
        let cancel = current.cancel.child_token();
        self.set_state(ConnectionState::Connecting);

        let socket = protocol::connect(&self.url, &self.api_key, self.connect_timeout).await?;
        let (mut write, read) = socket.split();
        let task_id = protocol::new_task_id();
        write
            .send(Message::Text(protocol::tts_run_task(&task_id, &self.params)))
            .await
            .map_err(|e| AssistantError::Tts(format!("run-task send failed: {e}")))?;

        let (started_tx, started_rx) = oneshot::channel();
        let receiver = tokio::spawn(receive_loop(
            read,
            session,
            cancel.clone(),
            Arc::clone(&self.pcm),
            started_tx,
        ));
        let mut conn = Connection {
            session,
            task_id,
            write,
            receiver,
            cancel,
        };

        let started = tokio::select! {
            biased;
            () = conn.cancel.cancelled() => Err(AssistantError::Cancelled),
            result = tokio::time::timeout(self.started_timeout, started_rx) => match result {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(AssistantError::Tts("socket closed before task-started".into())),
                Err(_) => Err(AssistantError::Tts(format!(
                    "task-started not received within {} ms",
                    self.started_timeout.as_millis()
                ))),
            },
        };
        if let Err(e) = started {
            conn.cancel.cancel();
            conn.receiver.abort();
            close_quietly(&mut conn.write).await;
            return Err(e);
        }

        self.set_state(ConnectionState::Speaking);
        info!(session, task = %conn.task_id, "synthesis task started");
        Ok(conn)
    }

    /// Send `finish-task` and wait for the receive loop. Returns `true` if it
    /// finished cleanly, in which case the drain sentinel is already queued.
    async fn finish(&self, mut conn: Connection) -> bool {
        self.set_state(ConnectionState::Draining);
        let frame = protocol::finish_task(&conn.task_id);
        if let Err(e) = conn.write.send(Message::Text(frame)).await {
            warn!(session = conn.session, "finish-task send failed: {e}");
            self.abort(conn).await;
            return false;
        }

        let outcome = tokio::time::timeout(self.finish_timeout, &mut conn.receiver).await;
        let clean = match outcome {
            Ok(Ok(ReceiveOutcome::Finished)) => true,
            Ok(Ok(other)) => {
                warn!(session = conn.session, outcome = ?other, "synthesis ended without finishing");
                false
            }
            Ok(Err(e)) => {
                warn!(session = conn.session, "receive loop panicked: {e}");
                false
            }
            Err(_) => {
                warn!(
                    session = conn.session,
                    "task-finished not received within {} ms",
                    self.finish_timeout.as_millis()
                );
                conn.cancel.cancel();
                conn.receiver.abort();
                false
            }
        };
        close_quietly(&mut conn.write).await;
        self.set_state(ConnectionState::Closed);
        self.set_state(ConnectionState::Idle);
        info!(session = conn.session, clean, "synthesis task closed");
        clean
    }

    async fn abort(&self, mut conn: Connection) {
        conn.cancel.cancel();
        conn.receiver.abort();
        close_quietly(&mut conn.write).await;
        self.set_state(ConnectionState::Closed);
        self.set_state(ConnectionState::Idle);
    }

    async fn push_drain(&self, session: u64) {
        if !self.sessions.is_live(session) {
            return;
        }
        if let Err(e) = self.pcm.send(PcmChunk::drain(session)).await {
            warn!(session, "failed to queue drain sentinel: {e}");
        }
    }
}

async fn close_quietly(write: &mut SplitSink<TaskSocket, Message>) {
    match tokio::time::timeout(CLOSE_GRACE, write.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("socket close failed: {e}"),
        Err(_) => debug!("socket close timed out"),
    }
}

async fn receive_loop(
    mut read: SplitStream<TaskSocket>,
    session: u64,
    cancel: CancellationToken,
    pcm: Arc<FlushQueue<PcmChunk>>,
    started: oneshot::Sender<Result<()>>,
) -> ReceiveOutcome {
    let mut started = Some(started);
    let mut bytes = 0usize;
    let outcome = loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => break ReceiveOutcome::Cancelled,
            frame = read.next() => frame,
        };
        match frame {
            Some(Ok(Message::Binary(data))) => {
                if data.is_empty() {
                    continue;
                }
                bytes += data.len();
                let sent = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break ReceiveOutcome::Cancelled,
                    sent = pcm.send(PcmChunk { session, data }) => sent,
                };
                if let Err(e) = sent {
                    break ReceiveOutcome::Failed(e.to_string());
                }
            }
            Some(Ok(Message::Text(text))) => match protocol::parse_event(&text) {
                Ok(TaskEvent::Started) => {
                    if let Some(tx) = started.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
                Ok(TaskEvent::Finished) => {
                    if cancel.is_cancelled() {
                        break ReceiveOutcome::Cancelled;
                    }
                    if let Err(e) = pcm.send(PcmChunk::drain(session)).await {
                        break ReceiveOutcome::Failed(e.to_string());
                    }
                    break ReceiveOutcome::Finished;
                }
                Ok(TaskEvent::Failed { code, message }) => {
                    let reason = format!("{code} {message}");
                    if let Some(tx) = started.take() {
                        let _ = tx.send(Err(AssistantError::Tts(format!("task failed: {reason}"))));
                    }
                    break ReceiveOutcome::Failed(reason);
                }
                Ok(_) => {}
                Err(e) => debug!(session, "skipping frame: {e}"),
            },
            Some(Ok(Message::Close(_))) | None => break ReceiveOutcome::Closed,
            Some(Ok(_)) => {}
            Some(Err(e)) => break ReceiveOutcome::Failed(e.to_string()),
        }
    };
    debug!(session, bytes, outcome = ?outcome, "synthesis receive loop ended");
    outcome
}
