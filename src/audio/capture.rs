//! Microphone frame sources.
//!
//! Frames are read from an `arecord` child process as raw interleaved
//! S16_LE PCM. The trait lets the capture stage run against scripted frames
//! in tests.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info};

use crate::audio::pcm_bytes_to_i16;
use crate::config::CaptureConfig;
use crate::error::{AssistantError, Result};

/// Delivers fixed-size interleaved multi-channel frames.
#[async_trait]
pub trait FrameSource: Send {
    /// Read the next frame into `frame`, replacing its contents.
    ///
    /// Returns `Ok(false)` once the source is exhausted.
    async fn read_frame(&mut self, frame: &mut Vec<i16>) -> Result<bool>;

    /// Interleaved samples per frame.
    fn frame_samples(&self) -> usize;
}

/// Reads frames from an `arecord` subprocess.
pub struct ArecordSource {
    child: Child,
    stdout: ChildStdout,
    bytes: Vec<u8>,
}

impl ArecordSource {
    /// Build the capture command line for `config`.
    pub fn command(config: &CaptureConfig) -> Command {
        let mut cmd = Command::new(&config.program);
        cmd.arg("-D")
            .arg(&config.device)
            .arg("-c")
            .arg(config.channels.to_string())
            .arg("-r")
            .arg(config.rate.to_string())
            .args(["-f", "S16_LE", "-t", "raw"])
            .arg(format!("--period-size={}", config.period_size))
            .arg(format!("--buffer-size={}", config.buffer_size));
        cmd
    }

    /// Spawn the capture process.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be started.
    pub fn spawn(config: &CaptureConfig) -> Result<Self> {
        let mut child = Self::command(config)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AssistantError::Audio(format!("cannot start {}: {e}", config.program))
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AssistantError::Audio("capture stdout not piped".into()))?;

        info!(
            device = %config.device,
            channels = config.channels,
            rate = config.rate,
            period = config.period_size,
            "microphone opened"
        );

        Ok(Self {
            child,
            stdout,
            bytes: vec![0; config.frame_samples() * 2],
        })
    }
}

#[async_trait]
impl FrameSource for ArecordSource {
    async fn read_frame(&mut self, frame: &mut Vec<i16>) -> Result<bool> {
        match self.stdout.read_exact(&mut self.bytes).await {
            Ok(_) => {
                pcm_bytes_to_i16(&self.bytes, frame);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("capture stream ended");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn frame_samples(&self) -> usize {
        self.bytes.len() / 2
    }
}

impl Drop for ArecordSource {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

/// Replays a fixed list of frames, then reports end of stream.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    frames: std::collections::VecDeque<Vec<i16>>,
    frame_samples: usize,
}

impl ScriptedSource {
    /// Create a source yielding `frames` in order.
    pub fn new(frames: Vec<Vec<i16>>) -> Self {
        let frame_samples = frames.first().map_or(0, Vec::len);
        Self {
            frames: frames.into(),
            frame_samples,
        }
    }
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn read_frame(&mut self, frame: &mut Vec<i16>) -> Result<bool> {
        match self.frames.pop_front() {
            Some(next) => {
                *frame = next;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn frame_samples(&self) -> usize {
        self.frame_samples
    }
}
