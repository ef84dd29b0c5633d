//! PCM output sinks.
//!
//! Each sink is one `aplay` child whose stdin receives raw S16_LE PCM. Speech
//! and music use separate launchers so their processes never share a pipe.

use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

use crate::error::{AssistantError, Result};

/// One running output stream.
#[async_trait]
pub trait PcmSink: Send {
    /// Write raw PCM bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the output process has exited or the pipe broke.
    async fn write(&mut self, pcm: &[u8]) -> Result<()>;

    /// Close the input and wait for buffered audio to finish playing.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting on the process fails.
    async fn finish(&mut self) -> Result<()>;

    /// Terminate immediately, discarding buffered audio.
    async fn kill(&mut self);
}

/// Starts output streams on demand.
pub trait SinkLauncher: Send + Sync {
    /// Start a fresh output stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the output process cannot be started.
    fn launch(&self) -> Result<Box<dyn PcmSink>>;
}

/// Launches `aplay` for mono S16_LE PCM at a fixed rate.
#[derive(Debug, Clone)]
pub struct AplayLauncher {
    program: String,
    device: String,
    sample_rate: u32,
    buffer_us: u32,
    quiet: bool,
    label: &'static str,
}

impl AplayLauncher {
    /// Launcher for synthesized speech.
    pub fn speech(config: &crate::config::PlaybackConfig, sample_rate: u32) -> Self {
        Self {
            program: config.program.clone(),
            device: config.device.clone(),
            sample_rate,
            buffer_us: config.buffer_us,
            quiet: false,
            label: "speech",
        }
    }

    /// Launcher for background music.
    pub fn music(playback: &crate::config::PlaybackConfig, music: &crate::config::MusicConfig) -> Self {
        Self {
            program: playback.program.clone(),
            device: playback.device.clone(),
            sample_rate: music.sample_rate,
            buffer_us: music.buffer_us,
            quiet: true,
            label: "music",
        }
    }

    /// Build the player command line.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-D").arg(&self.device);
        if self.quiet {
            cmd.arg("-q");
        }
        cmd.args(["-t", "raw", "-r"])
            .arg(self.sample_rate.to_string())
            .args(["-f", "S16_LE", "-c", "1", "-B"])
            .arg(self.buffer_us.to_string());
        cmd
    }
}

impl SinkLauncher for AplayLauncher {
    fn launch(&self) -> Result<Box<dyn PcmSink>> {
        let mut child = self
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AssistantError::Playback(format!("cannot start {}: {e}", self.program)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AssistantError::Playback("player stdin not piped".into()))?;
        info!(sink = self.label, rate = self.sample_rate, "player process started");
        Ok(Box::new(AplaySink {
            child,
            stdin: Some(stdin),
            label: self.label,
        }))
    }
}

/// A running `aplay` child.
pub struct AplaySink {
    child: Child,
    stdin: Option<ChildStdin>,
    label: &'static str,
}

#[async_trait]
impl PcmSink for AplaySink {
    async fn write(&mut self, pcm: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| AssistantError::Playback("player input already closed".into()))?;
        stdin
            .write_all(pcm)
            .await
            .map_err(|e| AssistantError::Playback(format!("{} pipe write failed: {e}", self.label)))
    }

    async fn finish(&mut self) -> Result<()> {
        drop(self.stdin.take());
        let status = self.child.wait().await?;
        debug!(sink = self.label, %status, "player process exited");
        Ok(())
    }

    async fn kill(&mut self) {
        drop(self.stdin.take());
        if let Err(e) = self.child.kill().await {
            warn!(sink = self.label, "failed to kill player: {e}");
        }
    }
}

/// What a [`MemorySink`] observed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SinkRecord {
    /// Bytes written, in order.
    pub bytes: Vec<u8>,
    /// Whether `finish` was called.
    pub finished: bool,
    /// Whether `kill` was called.
    pub killed: bool,
}

/// Launches in-memory sinks that record what they receive. Used for tests
/// and for running without an output device.
#[derive(Debug, Clone, Default)]
pub struct MemoryLauncher {
    sinks: Arc<Mutex<Vec<Arc<Mutex<SinkRecord>>>>>,
    fail_writes: bool,
}

impl MemoryLauncher {
    /// Create a launcher whose sinks accept every write.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a launcher whose sinks fail every write.
    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    /// Snapshot of every sink launched so far, oldest first.
    pub fn records(&self) -> Vec<SinkRecord> {
        self.sinks
            .lock()
            .map(|sinks| {
                sinks
                    .iter()
                    .filter_map(|s| s.lock().ok().map(|r| r.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of sinks launched so far.
    pub fn launches(&self) -> usize {
        self.sinks.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl SinkLauncher for MemoryLauncher {
    fn launch(&self) -> Result<Box<dyn PcmSink>> {
        let record = Arc::new(Mutex::new(SinkRecord::default()));
        self.sinks
            .lock()
            .map_err(|_| AssistantError::Playback("launcher lock poisoned".into()))?
            .push(Arc::clone(&record));
        Ok(Box::new(MemorySink {
            record,
            fail_writes: self.fail_writes,
        }))
    }
}

/// In-memory sink created by [`MemoryLauncher`].
#[derive(Debug)]
pub struct MemorySink {
    record: Arc<Mutex<SinkRecord>>,
    fail_writes: bool,
}

#[async_trait]
impl PcmSink for MemorySink {
    async fn write(&mut self, pcm: &[u8]) -> Result<()> {
        if self.fail_writes {
            return Err(AssistantError::Playback("broken pipe".into()));
        }
        let mut record = self
            .record
            .lock()
            .map_err(|_| AssistantError::Playback("sink lock poisoned".into()))?;
        if record.finished || record.killed {
            return Err(AssistantError::Playback("sink closed".into()));
        }
        record.bytes.extend_from_slice(pcm);
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        if let Ok(mut record) = self.record.lock() {
            record.finished = true;
        }
        Ok(())
    }

    async fn kill(&mut self) {
        if let Ok(mut record) = self.record.lock() {
            record.killed = true;
        }
    }
}
