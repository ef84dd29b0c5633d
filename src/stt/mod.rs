//! Cloud speech recognition over the duplex task socket.
//!
//! One socket per utterance: `run-task`, wait for `task-started`, stream the
//! PCM as small binary frames, `finish-task`, then collect sentences until
//! the task finishes. Every wait is bounded by the overall timeout and by the
//! caller's cancellation token.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::i16_to_pcm_bytes;
use crate::config::CloudConfig;
use crate::error::{AssistantError, Result};
use crate::protocol::{self, TaskEvent};

/// Accumulates recognition results across sentences.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Transcript {
    committed: String,
    partial: String,
}

impl Transcript {
    /// Apply one `result-generated` event.
    pub fn apply(&mut self, text: &str, sentence_end: bool) {
        if sentence_end {
            self.committed.push_str(text);
            self.partial.clear();
        } else {
            self.partial = text.to_owned();
        }
    }

    /// Full text so far, trimmed.
    pub fn text(&self) -> String {
        format!("{}{}", self.committed, self.partial).trim().to_owned()
    }
}

/// Recognition client for one endpoint.
#[derive(Debug, Clone)]
pub struct AsrClient {
    url: String,
    api_key: String,
    model: String,
    sample_rate: u32,
    chunk_bytes: usize,
    chunk_gap: Duration,
    timeout: Duration,
    connect_timeout: Duration,
    started_timeout: Duration,
}

impl AsrClient {
    /// Client configured from the cloud section.
    pub fn new(cloud: &CloudConfig) -> Self {
        Self {
            url: cloud.asr_url.clone(),
            api_key: cloud.api_key.clone(),
            model: cloud.asr_model.clone(),
            sample_rate: cloud.asr_sample_rate,
            chunk_bytes: cloud.asr_chunk_bytes.max(2),
            chunk_gap: Duration::from_millis(cloud.asr_chunk_gap_ms),
            timeout: Duration::from_millis(cloud.asr_timeout_ms),
            connect_timeout: Duration::from_millis(cloud.connect_timeout_ms),
            started_timeout: Duration::from_millis(cloud.started_timeout_ms),
        }
    }

    /// Recognize mono int16 `samples`. Returns the trimmed text, possibly
    /// empty.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::Cancelled`] if `cancel` fires first,
    /// [`AssistantError::Asr`] on timeout or task failure, and
    /// [`AssistantError::Protocol`] if the socket cannot be opened.
    pub async fn recognize(&self, samples: &[i16], cancel: &CancellationToken) -> Result<String> {
        let pcm = i16_to_pcm_bytes(samples);
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AssistantError::Cancelled),
            result = tokio::time::timeout(self.timeout, self.run(&pcm)) => match result {
                Ok(result) => result,
                Err(_) => Err(AssistantError::Asr(format!(
                    "recognition timed out after {} ms",
                    self.timeout.as_millis()
                ))),
            },
        }
    }

    async fn run(&self, pcm: &[u8]) -> Result<String> {
        let started_at = std::time::Instant::now();
        let socket = protocol::connect(&self.url, &self.api_key, self.connect_timeout).await?;
        let (mut write, mut read) = socket.split();
        let task_id = protocol::new_task_id();

        write
            .send(Message::Text(protocol::asr_run_task(&task_id, &self.model, self.sample_rate)))
            .await
            .map_err(|e| AssistantError::Asr(format!("run-task send failed: {e}")))?;

        let started = tokio::time::timeout(self.started_timeout, async {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match protocol::parse_event(&text) {
                        Ok(TaskEvent::Started) => return Ok(()),
                        Ok(TaskEvent::Failed { code, message }) => {
                            return Err(AssistantError::Asr(format!("task failed: {code} {message}")));
                        }
                        Ok(_) => {}
                        Err(e) => debug!("skipping frame: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => return Err(AssistantError::Asr(format!("socket read failed: {e}"))),
                }
            }
            Err(AssistantError::Asr("socket closed before task-started".into()))
        })
        .await
        .map_err(|_| AssistantError::Asr("task-started not received".into()))?;
        started?;

        for chunk in pcm.chunks(self.chunk_bytes) {
            write
                .send(Message::Binary(chunk.to_vec()))
                .await
                .map_err(|e| AssistantError::Asr(format!("audio send failed: {e}")))?;
            if !self.chunk_gap.is_zero() {
                tokio::time::sleep(self.chunk_gap).await;
            }
        }
        write
            .send(Message::Text(protocol::finish_task(&task_id)))
            .await
            .map_err(|e| AssistantError::Asr(format!("finish-task send failed: {e}")))?;

        let mut transcript = Transcript::default();
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => match protocol::parse_event(&text) {
                    Ok(TaskEvent::Result { text, sentence_end }) => {
                        transcript.apply(&text, sentence_end);
                    }
                    Ok(TaskEvent::Finished) => break,
                    Ok(TaskEvent::Failed { code, message }) => {
                        return Err(AssistantError::Asr(format!("task failed: {code} {message}")));
                    }
                    Ok(_) => {}
                    Err(e) => debug!("skipping frame: {e}"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("recognition socket error: {e}");
                    break;
                }
            }
        }
        if let Err(e) = write.close().await {
            debug!("socket close failed: {e}");
        }

        let text = transcript.text();
        info!(
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            bytes = pcm.len(),
            text = %text,
            "recognition finished"
        );
        Ok(text)
    }
}
