//! Error types for the assistant pipeline.

/// Top-level error type for the voice assistant.
#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    /// Audio device, capture process or frame decoding error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Echo canceller initialisation or processing error.
    #[error("AEC error: {0}")]
    Aec(String),

    /// The echo canceller has no initialised instance for this cycle.
    #[error("AEC not ready")]
    AecNotReady,

    /// Voice activity detection error.
    #[error("VAD error: {0}")]
    Vad(String),

    /// Speech recognition error.
    #[error("ASR error: {0}")]
    Asr(String),

    /// Text generation error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Malformed or unexpected message on a duplex task socket.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Speech output subprocess error.
    #[error("playback error: {0}")]
    Playback(String),

    /// Background music error.
    #[error("music error: {0}")]
    Music(String),

    /// Hardware mixer error.
    #[error("volume error: {0}")]
    Volume(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// The owning turn was cancelled before the operation completed.
    #[error("cancelled")]
    Cancelled,
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AssistantError>;
