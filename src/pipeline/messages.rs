//! Message types passed between pipeline stages.

use std::time::{Duration, Instant};

use tokio::sync::oneshot;

/// One segmented span of captured speech, ready for recognition.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Mono int16 samples, pre-roll included.
    pub samples: Vec<i16>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// When the utterance was finalised.
    pub captured_at: Instant,
}

impl Utterance {
    /// Audio length.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }
}

/// Input to the synthesis session manager, tagged with the producing turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtsCommand {
    /// A speakable text chunk.
    Speak {
        /// Session id of the producing turn.
        session: u64,
        /// Text to synthesize.
        text: String,
    },
    /// No more text for this turn.
    EndOfTurn {
        /// Session id of the producing turn.
        session: u64,
    },
}

impl TtsCommand {
    /// Session id of the producing turn.
    pub fn session(&self) -> u64 {
        match self {
            Self::Speak { session, .. } | Self::EndOfTurn { session } => *session,
        }
    }
}

/// Synthesized PCM tagged with the session that produced it.
///
/// An empty `data` is the drain sentinel: no more audio follows for this
/// turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmChunk {
    /// Session id of the producing turn.
    pub session: u64,
    /// Raw S16_LE mono PCM.
    pub data: Vec<u8>,
}

impl PcmChunk {
    /// The drain sentinel for `session`.
    pub fn drain(session: u64) -> Self {
        Self {
            session,
            data: Vec::new(),
        }
    }

    /// Whether this is the drain sentinel.
    pub fn is_drain(&self) -> bool {
        self.data.is_empty()
    }
}

/// Control messages for the speech playback stage.
#[derive(Debug)]
pub enum PlaybackCommand {
    /// Kill the player, discard queued audio and release the speaker. The
    /// sender is notified once the player is gone.
    Stop {
        /// Acknowledgement channel.
        done: oneshot::Sender<()>,
    },
}
