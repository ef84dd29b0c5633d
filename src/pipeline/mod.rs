//! Real-time pipeline: capture, turn sessions, speech output and the
//! coordinator that wires them together.

pub mod capture;
pub mod coordinator;
pub mod messages;
pub mod playback;
pub mod queue;
pub mod session;
