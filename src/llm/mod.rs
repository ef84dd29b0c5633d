//! Streaming text generation.
//!
//! One HTTP request per chat turn. The SSE response is cut into speakable
//! chunks as it arrives and queued for synthesis, while control tags are
//! kept out of the spoken text and returned as [`Directive`]s once the
//! stream ends.

pub mod chunker;
pub mod directives;
pub mod sse;

pub use chunker::ChunkSplitter;
pub use directives::{ControlTagFilter, Directive, extract_directives, strip_emoji};
pub use sse::{SseEvent, SseLineParser};

use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::{CloudConfig, LlmConfig};
use crate::error::{AssistantError, Result};
use crate::pipeline::messages::TtsCommand;
use crate::pipeline::queue::FlushQueue;
use crate::pipeline::session::Session;

/// Result of one completed turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LlmOutcome {
    /// Raw generated text, tags included.
    pub text: String,
    /// Control directives found in the text.
    pub directives: Vec<Directive>,
}

#[derive(Debug, Deserialize)]
struct GenerationEvent {
    #[serde(default)]
    output: Option<GenerationOutput>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerationOutput {
    #[serde(default)]
    text: String,
    #[serde(default)]
    finish_reason: Option<String>,
}

/// One decoded `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Delta {
    text: String,
    finished: bool,
}

fn decode_event(event: &SseEvent) -> Result<Option<Delta>> {
    if event.is_done() {
        return Ok(Some(Delta {
            text: String::new(),
            finished: true,
        }));
    }
    let parsed: GenerationEvent = match serde_json::from_str(&event.data) {
        Ok(parsed) => parsed,
        Err(e) if event.is_error() => {
            return Err(AssistantError::Llm(format!("stream error: {} ({e})", event.data)));
        }
        Err(e) => {
            debug!("skipping unparsable event: {e}");
            return Ok(None);
        }
    };
    match parsed.output {
        Some(output) if !event.is_error() => Ok(Some(Delta {
            finished: output.finish_reason.as_deref() == Some("stop"),
            text: output.text,
        })),
        _ if event.is_error() || parsed.code.is_some() => Err(AssistantError::Llm(format!(
            "stream error: {} {}",
            parsed.code.unwrap_or_default(),
            parsed.message.unwrap_or_default()
        ))),
        _ => Ok(None),
    }
}

/// Turns raw deltas into speakable chunks.
#[derive(Debug)]
struct SpokenText {
    raw: String,
    filter: ControlTagFilter,
    splitter: ChunkSplitter,
}

impl SpokenText {
    fn new(first_threshold: usize, next_threshold: usize) -> Self {
        Self {
            raw: String::new(),
            filter: ControlTagFilter::new(),
            splitter: ChunkSplitter::new(first_threshold, next_threshold),
        }
    }

    fn feed(&mut self, delta: &str) -> Option<String> {
        self.raw.push_str(delta);
        let speakable = self.filter.push(&strip_emoji(delta));
        self.splitter.push(&speakable)
    }

    fn finish(&mut self) -> Option<String> {
        self.splitter.finish()
    }
}

/// Client for the streaming generation endpoint.
#[derive(Debug, Clone)]
pub struct LlmStreamer {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model_fast: String,
    model_search: String,
    system_prompt: String,
    first_chunk_bytes: usize,
    search_first_chunk_bytes: usize,
    next_chunk_bytes: usize,
    timeout: Duration,
}

impl LlmStreamer {
    /// Streamer configured from the cloud and generation sections.
    pub fn new(cloud: &CloudConfig, llm: &LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: cloud.llm_url.clone(),
            api_key: cloud.api_key.clone(),
            model_fast: cloud.llm_model_fast.clone(),
            model_search: cloud.llm_model_search.clone(),
            system_prompt: llm.system_prompt.clone(),
            first_chunk_bytes: llm.first_chunk_bytes,
            search_first_chunk_bytes: llm.search_first_chunk_bytes,
            next_chunk_bytes: llm.next_chunk_bytes,
            timeout: Duration::from_secs(llm.request_timeout_secs.max(1)),
        }
    }

    /// Stream a reply to `prompt`, queueing speakable chunks on `tts` under
    /// `session`.
    ///
    /// `EndOfTurn` is queued whenever the session is still live at the end,
    /// including after a failure, so the speaker is always released.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::Cancelled`] if the session is cancelled
    /// first, and [`AssistantError::Llm`] on HTTP, stream or timeout failure.
    pub async fn stream(
        &self,
        prompt: &str,
        enable_search: bool,
        session: &Session,
        tts: &FlushQueue<TtsCommand>,
    ) -> Result<LlmOutcome> {
        let result = tokio::select! {
            biased;
            () = session.cancel.cancelled() => Err(AssistantError::Cancelled),
            result = tokio::time::timeout(self.timeout, self.run(prompt, enable_search, session, tts)) => {
                result.unwrap_or_else(|_| Err(AssistantError::Llm(format!(
                    "generation timed out after {} s",
                    self.timeout.as_secs()
                ))))
            }
        };

        if !session.is_cancelled() {
            if let Err(e) = queue_command(tts, TtsCommand::EndOfTurn { session: session.id }, session).await {
                warn!(session = session.id, "failed to queue end of turn: {e}");
            }
        }

        let text = result?;
        let directives = extract_directives(&text);
        Ok(LlmOutcome { text, directives })
    }

    async fn run(
        &self,
        prompt: &str,
        enable_search: bool,
        session: &Session,
        tts: &FlushQueue<TtsCommand>,
    ) -> Result<String> {
        let started_at = Instant::now();
        let model = if enable_search {
            &self.model_search
        } else {
            &self.model_fast
        };
        let body = json!({
            "model": model,
            "input": {
                "messages": [
                    { "role": "system", "content": self.system_prompt },
                    { "role": "user", "content": prompt },
                ],
            },
            "parameters": {
                "result_format": "text",
                "incremental_output": true,
                "enable_search": enable_search,
            },
        });

        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("X-DashScope-SSE", "enable")
            .json(&body)
            .send()
            .await
            .map_err(|e| AssistantError::Llm(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AssistantError::Llm(format!("HTTP {}: {body}", status.as_u16())));
        }

        let first_threshold = if enable_search {
            self.search_first_chunk_bytes
        } else {
            self.first_chunk_bytes
        };
        let mut spoken = SpokenText::new(first_threshold, self.next_chunk_bytes);
        let mut parser = SseLineParser::new();
        let mut bytes = Box::pin(response.bytes_stream());
        let mut chunks = 0usize;
        let mut finished = false;

        while !finished {
            let Some(chunk) = bytes.next().await else { break };
            let chunk = chunk.map_err(|e| AssistantError::Llm(format!("stream read failed: {e}")))?;
            for event in parser.push(&chunk) {
                let Some(delta) = decode_event(&event)? else {
                    continue;
                };
                if let Some(text) = spoken.feed(&delta.text) {
                    if chunks == 0 {
                        info!(
                            session = session.id,
                            first_chunk_ms = started_at.elapsed().as_millis() as u64,
                            "first speakable chunk"
                        );
                    }
                    chunks += 1;
                    queue_command(tts, TtsCommand::Speak { session: session.id, text }, session).await?;
                }
                if delta.finished {
                    finished = true;
                    break;
                }
            }
        }
        if !finished {
            if let Some(event) = parser.flush() {
                if let Some(delta) = decode_event(&event)? {
                    spoken.feed(&delta.text);
                }
            }
        }
        if let Some(text) = spoken.finish() {
            chunks += 1;
            queue_command(tts, TtsCommand::Speak { session: session.id, text }, session).await?;
        }

        info!(
            session = session.id,
            model = %model,
            chunks,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "generation finished"
        );
        debug!(session = session.id, text = %spoken.raw, "generated text");
        Ok(spoken.raw)
    }
}

/// Queue a command unless the session is cancelled first.
async fn queue_command(
    tts: &FlushQueue<TtsCommand>,
    command: TtsCommand,
    session: &Session,
) -> Result<()> {
    if session.is_cancelled() {
        return Err(AssistantError::Cancelled);
    }
    tokio::select! {
        biased;
        () = session.cancel.cancelled() => Err(AssistantError::Cancelled),
        sent = tts.send(command) => sent,
    }
}
