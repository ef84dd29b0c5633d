//! Duplex task protocol shared by the recognition and synthesis sockets.
//!
//! ```text
//! client                          server
//!   run-task      ───────────────▶
//!                 ◀─────────────── task-started
//!   binary audio / continue-task ─▶
//!                 ◀─────────────── result-generated | binary audio
//!   finish-task   ───────────────▶
//!                 ◀─────────────── task-finished | task-failed
//! ```

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::{AssistantError, Result};

/// An open task socket.
pub type TaskSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a task socket with bearer authentication, bounded by `timeout`.
///
/// # Errors
///
/// Returns [`AssistantError::Protocol`] if the URL or key is malformed, the
/// handshake fails or the timeout elapses.
pub async fn connect(url: &str, api_key: &str, timeout: Duration) -> Result<TaskSocket> {
    let mut request = url
        .into_client_request()
        .map_err(|e| AssistantError::Protocol(format!("bad socket URL {url}: {e}")))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
        .map_err(|e| AssistantError::Protocol(format!("bad API key header: {e}")))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let (socket, _) = tokio::time::timeout(timeout, connect_async(request))
        .await
        .map_err(|_| AssistantError::Protocol(format!("connect to {url} timed out")))?
        .map_err(|e| AssistantError::Protocol(format!("connect to {url} failed: {e}")))?;
    Ok(socket)
}

/// Fresh 32-hex-digit task id.
pub fn new_task_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn envelope(task_id: &str, action: &str, payload: Value) -> String {
    json!({
        "header": {
            "task_id": task_id,
            "action": action,
            "streaming": "duplex",
        },
        "payload": payload,
    })
    .to_string()
}

/// `run-task` for streaming recognition of raw PCM.
pub fn asr_run_task(task_id: &str, model: &str, sample_rate: u32) -> String {
    envelope(
        task_id,
        "run-task",
        json!({
            "task_group": "audio",
            "task": "asr",
            "function": "recognition",
            "model": model,
            "parameters": {
                "format": "pcm",
                "sample_rate": sample_rate,
            },
            "input": {},
        }),
    )
}

/// Synthesis voice settings carried by `run-task`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisParams {
    /// Model id.
    pub model: String,
    /// Voice id.
    pub voice: String,
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Output volume, 0–100.
    pub volume: u32,
}

/// `run-task` for streaming synthesis to raw PCM.
pub fn tts_run_task(task_id: &str, params: &SynthesisParams) -> String {
    envelope(
        task_id,
        "run-task",
        json!({
            "task_group": "audio",
            "task": "tts",
            "function": "SpeechSynthesizer",
            "model": params.model,
            "parameters": {
                "text_type": "PlainText",
                "voice": params.voice,
                "format": "pcm",
                "sample_rate": params.sample_rate,
                "volume": params.volume,
                "enable_ssml": false,
            },
            "input": {},
        }),
    )
}

/// `continue-task` carrying one text chunk.
pub fn continue_task(task_id: &str, text: &str) -> String {
    envelope(task_id, "continue-task", json!({ "input": { "text": text } }))
}

/// `finish-task`: no more input follows.
pub fn finish_task(task_id: &str) -> String {
    envelope(task_id, "finish-task", json!({ "input": {} }))
}

/// A server event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    /// The task accepts input.
    Started,
    /// Recognition output.
    Result {
        /// Sentence text so far.
        text: String,
        /// Whether the sentence is final.
        sentence_end: bool,
    },
    /// The task completed.
    Finished,
    /// The task failed.
    Failed {
        /// Server error code.
        code: String,
        /// Server error message.
        message: String,
    },
    /// Any other event, by name.
    Other(String),
}

impl TaskEvent {
    /// Whether no further events follow.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed { .. })
    }
}

#[derive(Deserialize)]
struct Incoming {
    header: IncomingHeader,
    #[serde(default)]
    payload: Option<IncomingPayload>,
}

#[derive(Deserialize)]
struct IncomingHeader {
    event: String,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct IncomingPayload {
    #[serde(default)]
    output: Option<IncomingOutput>,
}

#[derive(Deserialize)]
struct IncomingOutput {
    #[serde(default)]
    sentence: Option<IncomingSentence>,
}

#[derive(Deserialize)]
struct IncomingSentence {
    #[serde(default)]
    text: String,
    #[serde(default)]
    sentence_end: bool,
}

/// Decode one text frame.
///
/// # Errors
///
/// Returns [`AssistantError::Protocol`] if the frame is not a valid event.
pub fn parse_event(frame: &str) -> Result<TaskEvent> {
    let incoming: Incoming = serde_json::from_str(frame)
        .map_err(|e| AssistantError::Protocol(format!("bad event frame: {e}")))?;
    Ok(match incoming.header.event.as_str() {
        "task-started" => TaskEvent::Started,
        "task-finished" => TaskEvent::Finished,
        "task-failed" => TaskEvent::Failed {
            code: incoming.header.error_code.unwrap_or_default(),
            message: incoming.header.error_message.unwrap_or_default(),
        },
        "result-generated" => {
            match incoming
                .payload
                .and_then(|p| p.output)
                .and_then(|o| o.sentence)
            {
                Some(sentence) => TaskEvent::Result {
                    text: sentence.text,
                    sentence_end: sentence.sentence_end,
                },
                // Synthesis also reports result-generated, without text.
                None => TaskEvent::Other("result-generated".into()),
            }
        }
        other => TaskEvent::Other(other.to_owned()),
    })
}
