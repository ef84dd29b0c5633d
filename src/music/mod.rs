//! Background music: one local track at a time, duckable and interruptible.
//!
//! The play loop reads fixed-size chunks, advances the [`VolumeEnvelope`],
//! scales the samples and keeps the player's buffer a bounded distance
//! ahead of the wall clock. Only the loop that still owns the current
//! generation may clear the playing state, so a superseded loop finishing
//! late never clobbers a newer track.

pub mod catalog;
pub mod envelope;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::playback::{PcmSink, SinkLauncher};
use crate::config::MusicConfig;
use crate::error::Result;
use crate::pipeline::capture::DuckControl;

pub use catalog::{MusicCatalog, extract_title, pick_random_excluding};
pub use envelope::VolumeEnvelope;
use envelope::{pacing_delay, scale_pcm_in_place};

/// Query that asks for any track.
pub const RANDOM_QUERY: &str = "RANDOM";

struct ActiveTrack {
    generation: u64,
    path: PathBuf,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct MusicState {
    active: Option<ActiveTrack>,
    last_path: Option<PathBuf>,
    next_generation: u64,
}

/// How a play loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopEnd {
    Eof,
    Stopped,
    WriteFailed,
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    sample_rate: u32,
    chunk_bytes: usize,
    target_ahead: Duration,
    max_ahead: Duration,
    tau_down: Duration,
    tau_up: Duration,
}

/// Owns the music player.
pub struct MusicManager {
    config: MusicConfig,
    catalog: MusicCatalog,
    launcher: Arc<dyn SinkLauncher>,
    state: Arc<Mutex<MusicState>>,
    envelope: Arc<Mutex<VolumeEnvelope>>,
    /// Serializes stop/start sequences so two plays never overlap.
    control: tokio::sync::Mutex<()>,
}

impl MusicManager {
    /// Create a manager playing through `launcher`.
    pub fn new(config: MusicConfig, launcher: Arc<dyn SinkLauncher>) -> Self {
        Self {
            catalog: MusicCatalog::new(&config.dir),
            config,
            launcher,
            state: Arc::new(Mutex::new(MusicState::default())),
            envelope: Arc::new(Mutex::new(VolumeEnvelope::default())),
            control: tokio::sync::Mutex::new(()),
        }
    }

    /// The track library.
    pub fn catalog(&self) -> &MusicCatalog {
        &self.catalog
    }

    /// Whether a track is playing.
    pub fn is_playing(&self) -> bool {
        with_lock(&self.state, |s| s.active.is_some())
    }

    /// Path of the playing track.
    pub fn current_track(&self) -> Option<PathBuf> {
        with_lock(&self.state, |s| s.active.as_ref().map(|a| a.path.clone()))
    }

    /// The most recently started track, playing or not.
    pub fn last_track(&self) -> Option<PathBuf> {
        with_lock(&self.state, |s| s.last_path.clone())
    }

    /// Snapshot of the gain envelope.
    pub fn envelope(&self) -> VolumeEnvelope {
        with_lock(&self.envelope, |e| *e)
    }

    /// Lower the music, if playing.
    pub fn duck(&self) {
        if self.is_playing() {
            let (target, ceiling) = (self.config.duck_target, self.config.duck_ceiling);
            with_lock(&self.envelope, |e| e.duck(target, ceiling));
            debug!("music ducked");
        }
    }

    /// Restore the music, if playing.
    pub fn unduck(&self) {
        if self.is_playing() {
            with_lock(&self.envelope, VolumeEnvelope::unduck);
        }
    }

    /// Stop the current track and wait until its player is gone. Returns
    /// `true` if something was playing.
    pub async fn stop(&self) -> bool {
        let _guard = self.control.lock().await;
        self.stop_locked().await
    }

    async fn stop_locked(&self) -> bool {
        let Some(mut active) = with_lock(&self.state, |s| s.active.take()) else {
            return false;
        };
        info!(track = %active.path.display(), "stopping music");
        active.stop.cancel();
        if let Some(task) = active.task.take() {
            if let Err(e) = task.await {
                warn!("music task ended abnormally: {e}");
            }
        }
        true
    }

    /// Stop whatever is playing and start `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the player cannot be
    /// started.
    pub async fn play_file(&self, path: &Path) -> Result<()> {
        let _guard = self.control.lock().await;
        self.stop_locked().await;

        let (file, layout) = catalog::open_pcm(path).await?;
        if let Some(spec) = layout.spec {
            if spec.channels != 1
                || spec.bits_per_sample != 16
                || spec.sample_rate != self.config.sample_rate
            {
                warn!(
                    track = %path.display(),
                    channels = spec.channels,
                    bits = spec.bits_per_sample,
                    rate = spec.sample_rate,
                    "track format differs from player format, playing anyway"
                );
            }
        }
        let sink = self.launcher.launch()?;

        let stop = CancellationToken::new();
        let generation = with_lock(&self.state, |s| {
            s.next_generation += 1;
            s.active = Some(ActiveTrack {
                generation: s.next_generation,
                path: path.to_path_buf(),
                stop: stop.clone(),
                task: None,
            });
            s.last_path = Some(path.to_path_buf());
            s.next_generation
        });
        with_lock(&self.envelope, VolumeEnvelope::reset);
        info!(track = %path.display(), generation, "music started");

        let task = tokio::spawn(play_loop(
            file,
            sink,
            stop,
            generation,
            Arc::clone(&self.state),
            Arc::clone(&self.envelope),
            self.timing(),
        ));
        with_lock(&self.state, |s| match s.active.as_mut() {
            Some(active) if active.generation == generation => active.task = Some(task),
            // Already finished on its own.
            _ => {}
        });
        Ok(())
    }

    /// Play the track `query` names, or any track for [`RANDOM_QUERY`].
    /// Returns `false` if nothing matched.
    ///
    /// # Errors
    ///
    /// Returns an error if the matched track fails to start.
    pub async fn play_query(&self, query: &str) -> Result<bool> {
        let target = if query.trim().eq_ignore_ascii_case(RANDOM_QUERY) {
            self.catalog.random_excluding(None)
        } else {
            self.catalog.resolve(query)
        };
        match target {
            Some(path) => {
                self.play_file(&path).await?;
                Ok(true)
            }
            None => {
                info!(query, "no matching track");
                Ok(false)
            }
        }
    }

    /// Play a random track other than the last one started. Returns `false`
    /// if the library is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the picked track fails to start.
    pub async fn play_random_excluding_last(&self) -> Result<bool> {
        let last = self.current_track().or_else(|| self.last_track());
        match self.catalog.random_excluding(last.as_deref()) {
            Some(path) => {
                self.play_file(&path).await?;
                Ok(true)
            }
            None => {
                info!("music library is empty");
                Ok(false)
            }
        }
    }

    fn timing(&self) -> Timing {
        Timing {
            sample_rate: self.config.sample_rate,
            chunk_bytes: self.config.chunk_samples.max(1) * 2,
            target_ahead: Duration::from_millis(self.config.target_ahead_ms),
            max_ahead: Duration::from_millis(self.config.max_ahead_ms),
            tau_down: Duration::from_millis(self.config.duck_tau_ms),
            tau_up: Duration::from_millis(self.config.unduck_tau_ms),
        }
    }
}

impl DuckControl for MusicManager {
    fn duck(&self) {
        MusicManager::duck(self);
    }

    fn unduck(&self) {
        MusicManager::unduck(self);
    }
}

async fn play_loop(
    mut file: tokio::fs::File,
    mut sink: Box<dyn PcmSink>,
    stop: CancellationToken,
    generation: u64,
    state: Arc<Mutex<MusicState>>,
    envelope: Arc<Mutex<VolumeEnvelope>>,
    timing: Timing,
) {
    let mut buf = vec![0u8; timing.chunk_bytes];
    let mut started: Option<Instant> = None;
    let mut last_step: Option<Instant> = None;
    let mut written_samples: u64 = 0;

    let end = loop {
        let n = tokio::select! {
            () = stop.cancelled() => break LoopEnd::Stopped,
            read = read_chunk(&mut file, &mut buf) => match read {
                Ok(0) => break LoopEnd::Eof,
                Ok(n) => n,
                Err(e) => {
                    warn!("music read failed: {e}");
                    break LoopEnd::Eof;
                }
            },
        };

        let now = Instant::now();
        let start = *started.get_or_insert(now);
        let dt = last_step.map_or(Duration::ZERO, |prev| now.saturating_duration_since(prev));
        last_step = Some(now);
        let gain = with_lock(&envelope, |e| e.advance(dt, timing.tau_down, timing.tau_up));
        scale_pcm_in_place(&mut buf[..n], gain);

        tokio::select! {
            () = stop.cancelled() => break LoopEnd::Stopped,
            result = sink.write(&buf[..n]) => {
                if let Err(e) = result {
                    warn!("music write failed: {e}");
                    break LoopEnd::WriteFailed;
                }
            }
        }
        written_samples += (n / 2) as u64;

        if let Some(delay) = pacing_delay(
            written_samples,
            timing.sample_rate,
            start.elapsed(),
            timing.max_ahead,
            timing.target_ahead,
        ) {
            tokio::select! {
                () = stop.cancelled() => break LoopEnd::Stopped,
                () = tokio::time::sleep(delay) => {}
            }
        }
    };

    match end {
        LoopEnd::Eof => {
            tokio::select! {
                () = stop.cancelled() => sink.kill().await,
                result = sink.finish() => {
                    if let Err(e) = result {
                        warn!("music player did not exit cleanly: {e}");
                    }
                }
            }
        }
        LoopEnd::Stopped | LoopEnd::WriteFailed => sink.kill().await,
    }

    let cleared = with_lock(&state, |s| match &s.active {
        Some(active) if active.generation == generation => {
            s.active = None;
            true
        }
        _ => false,
    });
    debug!(generation, ?end, cleared, samples = written_samples, "music loop finished");
}

/// Fill `buf` as far as the file allows. Returns the number of bytes read,
/// zero at end of file.
async fn read_chunk(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn with_lock<T, R>(mutex: &Mutex<T>, f: impl FnOnce(&mut T) -> R) -> R {
    let mut guard = match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut guard)
}
