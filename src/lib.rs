//! aibox: an embedded voice assistant for a smart speaker.
//!
//! The crate is a cascaded real-time pipeline:
//! Microphone array → AEC → VAD → cloud ASR → wake gate → intent router →
//! cloud LLM → cloud TTS → speaker, with background music mixed in.
//!
//! # Architecture
//!
//! The pipeline is built from independent stages connected by async queues:
//! - **Capture**: reads multichannel frames from `arecord`, cancels echo and
//!   segments speech with an energy VAD
//! - **Wake gate / intent router**: decide which recognized text is acted on
//!   and whether it may interrupt what is currently playing
//! - **LLM streamer**: streams a reply over SSE and cuts it into speakable
//!   chunks
//! - **TTS session manager**: one duplex websocket per turn, streaming PCM
//! - **Playback multiplexer**: a single owner of the speech player
//! - **Music manager**: paced WAV playback with a ducking envelope
//!
//! Every spoken turn runs under a session. Starting a new turn, or a stop
//! command, invalidates everything the previous turn still has in flight.

pub mod audio;
pub mod config;
pub mod error;
pub mod intent;
pub mod llm;
pub mod music;
pub mod pipeline;
pub mod protocol;
pub mod stt;
pub mod tts;
pub mod vad;
pub mod volume;
pub mod wake;

pub use config::AssistantConfig;
pub use error::{AssistantError, Result};
pub use pipeline::coordinator::{Assistant, OutputDevices};
