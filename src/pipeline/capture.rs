//! Capture stage: echo cancellation, VAD framing and utterance segmentation.
//!
//! ```text
//! FrameSource (N ch × 256) → EchoCanceller → mono 256
//!     → re-chunk to 320 → VAD → run-length state machine → Utterance
//! ```
//!
//! Speech runs longer than `duck_frames` duck the music immediately, before
//! `trigger_frames` commits to recording, so the user hears the music drop as
//! soon as they start talking.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::aec::{EchoCanceller, extract_channel};
use crate::audio::capture::FrameSource;
use crate::config::SegmenterConfig;
use crate::error::{AssistantError, Result};
use crate::pipeline::messages::Utterance;
use crate::vad::VoiceActivityDetector;

/// Receives duck/unduck signals from the capture stage.
pub trait DuckControl: Send + Sync {
    /// Lower background audio.
    fn duck(&self);
    /// Restore background audio.
    fn unduck(&self);
}

/// Output of the segmenter for one batch of samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentEvent {
    /// Speech started; lower the music.
    Duck,
    /// The speech burst was noise; restore the music.
    Unduck,
    /// A complete utterance.
    Utterance(Vec<i16>),
}

/// Speech/silence run-length state machine over VAD-sized frames.
#[derive(Debug)]
pub struct Segmenter {
    config: SegmenterConfig,
    max_samples: usize,
    /// Mono samples not yet forming a full VAD frame.
    pending: Vec<i16>,
    /// Pre-roll while idle, utterance while triggered.
    buffer: Vec<i16>,
    speech_run: u32,
    silence_run: u32,
    triggered: bool,
    ducked: bool,
}

impl Segmenter {
    /// Create a segmenter for audio at `sample_rate`.
    pub fn new(config: SegmenterConfig, sample_rate: u32) -> Self {
        let max_samples =
            (u64::from(sample_rate) * config.max_utterance_ms / 1_000) as usize;
        Self {
            pending: Vec::with_capacity(config.vad_frame_samples * 2),
            buffer: Vec::with_capacity(max_samples + config.vad_frame_samples),
            max_samples,
            config,
            speech_run: 0,
            silence_run: 0,
            triggered: false,
            ducked: false,
        }
    }

    /// Feed mono samples of any length. Complete VAD frames are classified
    /// with `vad`; the remainder waits for the next call.
    pub fn push(&mut self, samples: &[i16], vad: &mut dyn VoiceActivityDetector) -> Vec<SegmentEvent> {
        let mut events = Vec::new();
        self.pending.extend_from_slice(samples);

        let frame_len = self.config.vad_frame_samples;
        let mut offset = 0;
        while self.pending.len() - offset >= frame_len {
            let frame: Vec<i16> = self.pending[offset..offset + frame_len].to_vec();
            offset += frame_len;
            let active = vad.is_speech(&frame);
            self.push_frame(&frame, active, &mut events);
        }
        self.pending.drain(..offset);
        events
    }

    /// Advance the state machine by one classified VAD frame.
    pub fn push_frame(&mut self, frame: &[i16], active: bool, events: &mut Vec<SegmentEvent>) {
        if active {
            self.speech_run = self.speech_run.saturating_add(1);
            self.silence_run = 0;
        } else {
            self.silence_run = self.silence_run.saturating_add(1);
            self.speech_run = 0;
        }

        if self.speech_run > self.config.duck_frames && !self.ducked {
            self.ducked = true;
            events.push(SegmentEvent::Duck);
        }

        if self.speech_run > self.config.trigger_frames && !self.triggered {
            self.triggered = true;
            debug!(preroll = self.buffer.len(), "utterance capture started");
        }

        if self.triggered {
            self.buffer.extend_from_slice(frame);
            if self.silence_run > self.config.silence_frames || self.buffer.len() > self.max_samples {
                self.finalize(events);
            }
        } else {
            self.buffer.extend_from_slice(frame);
            if self.buffer.len() > self.config.preroll_samples {
                let excess = self.buffer.len() - self.config.preroll_samples;
                self.buffer.drain(..excess);
            }
            // A burst that ducked but never triggered is noise.
            if self.ducked && self.silence_run > self.config.silence_frames {
                self.ducked = false;
                events.push(SegmentEvent::Unduck);
            }
        }
    }

    fn finalize(&mut self, events: &mut Vec<SegmentEvent>) {
        if self.buffer.len() > self.config.min_utterance_samples {
            events.push(SegmentEvent::Utterance(std::mem::take(&mut self.buffer)));
        } else {
            debug!(samples = self.buffer.len(), "utterance below floor, discarded");
            self.buffer.clear();
            events.push(SegmentEvent::Unduck);
        }
        self.triggered = false;
        self.ducked = false;
        self.silence_run = 0;
    }

    /// Whether an utterance is being recorded.
    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    /// Samples currently held (pre-roll or utterance).
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Echo cancellation with reference-channel fallback for cycles where the
/// canceller cannot produce output.
struct FallbackCanceller {
    inner: Box<dyn EchoCanceller>,
    channels: usize,
    channel: usize,
    degraded: bool,
}

impl FallbackCanceller {
    fn process(&mut self, raw: &[i16]) -> Vec<i16> {
        match self.inner.process(raw) {
            Ok(clean) => {
                if self.degraded {
                    info!("echo canceller recovered");
                    self.degraded = false;
                }
                clean.samples
            }
            Err(e) => {
                if !self.degraded {
                    warn!(channel = self.channel, "echo canceller unavailable ({e}), passing through raw channel");
                    self.degraded = true;
                }
                extract_channel(raw, self.channels, self.channel)
            }
        }
    }
}

/// Everything the capture stage owns.
pub struct CaptureStage {
    /// Microphone frames.
    pub source: Box<dyn FrameSource>,
    /// Echo canceller.
    pub canceller: Box<dyn EchoCanceller>,
    /// Voice activity detector.
    pub vad: Box<dyn VoiceActivityDetector>,
    /// Segmentation state machine.
    pub segmenter: Segmenter,
    /// Channel count of raw frames.
    pub channels: usize,
    /// Channel substituted when the canceller fails.
    pub reference_channel: usize,
    /// Sample rate of the mono stream.
    pub sample_rate: u32,
}

/// Run the capture loop until cancelled or the source ends.
///
/// Completed utterances are handed off with `try_send` so a slow consumer
/// never stalls the microphone.
///
/// # Errors
///
/// Returns an error if the source fails or ends, since the assistant cannot
/// work without audio input.
pub async fn run_capture_stage(
    stage: CaptureStage,
    ducker: Arc<dyn DuckControl>,
    utterances: mpsc::Sender<Utterance>,
    cancel: CancellationToken,
) -> Result<()> {
    let CaptureStage {
        mut source,
        canceller,
        mut vad,
        mut segmenter,
        channels,
        reference_channel,
        sample_rate,
    } = stage;
    let mut canceller = FallbackCanceller {
        inner: canceller,
        channels,
        channel: reference_channel,
        degraded: false,
    };
    let mut raw = Vec::with_capacity(source.frame_samples());

    info!(vad = vad.name(), "capture stage started");
    loop {
        let more = tokio::select! {
            () = cancel.cancelled() => break,
            r = source.read_frame(&mut raw) => r?,
        };
        if !more {
            return Err(AssistantError::Audio("capture stream ended".into()));
        }

        let mono = canceller.process(&raw);
        for event in segmenter.push(&mono, vad.as_mut()) {
            match event {
                SegmentEvent::Duck => ducker.duck(),
                SegmentEvent::Unduck => ducker.unduck(),
                SegmentEvent::Utterance(samples) => {
                    let utterance = Utterance {
                        samples,
                        sample_rate,
                        captured_at: Instant::now(),
                    };
                    debug!(ms = utterance.duration().as_millis() as u64, "utterance captured");
                    if let Err(e) = utterances.try_send(utterance) {
                        warn!("dropping utterance: {e}");
                        ducker.unduck();
                    }
                }
            }
        }
    }
    info!("capture stage stopped");
    Ok(())
}
