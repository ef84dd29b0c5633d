//! Main orchestrator that wires all stages together.
//!
//! [`Assistant`] owns every collaborator and the shutdown token. The stage
//! tasks it spawns communicate only through the queues, the session manager
//! and the speaker reservation. [`Assistant::handle_text`] is the decision
//! path after recognition and needs no audio hardware.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::playback::SinkLauncher;
use crate::config::AssistantConfig;
use crate::error::{AssistantError, Result};
use crate::intent::{BusyState, IntentRouter, RouteDecision, TrackResolver, VolumeCommand};
use crate::llm::{Directive, LlmStreamer};
use crate::music::{MusicManager, RANDOM_QUERY};
use crate::pipeline::capture::{CaptureStage, DuckControl, run_capture_stage};
use crate::pipeline::messages::{PcmChunk, PlaybackCommand, TtsCommand, Utterance};
use crate::pipeline::playback::{PlaybackControl, PlaybackMultiplexer, run_playback_stage};
use crate::pipeline::queue::FlushQueue;
use crate::pipeline::session::{PlaybackReservation, Session, SessionManager};
use crate::stt::AsrClient;
use crate::tts::TtsSessionManager;
use crate::volume::VolumeControl;
use crate::wake::{BusyProbe, GateDecision, WakeGate, run_idle_monitor};

/// Channel buffer sizes.
const UTTERANCE_CHANNEL_SIZE: usize = 4;
const PLAYBACK_CONTROL_SIZE: usize = 8;

/// How often the exit path checks whether the farewell has drained.
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Output devices the assistant drives.
pub struct OutputDevices {
    /// Player for synthesized speech.
    pub speech: Arc<dyn SinkLauncher>,
    /// Player for background music.
    pub music: Arc<dyn SinkLauncher>,
    /// Hardware mixer.
    pub volume: Arc<dyn VolumeControl>,
}

/// Multiplexer half that `start_output_stages` hands to its task.
struct PendingPlayback {
    mux: PlaybackMultiplexer,
    control: mpsc::Receiver<PlaybackCommand>,
}

/// The voice assistant.
pub struct Assistant {
    config: AssistantConfig,
    sessions: Arc<SessionManager>,
    wake: Arc<WakeGate>,
    router: IntentRouter,
    asr: AsrClient,
    llm: LlmStreamer,
    tts: Arc<TtsSessionManager>,
    tts_queue: Arc<FlushQueue<TtsCommand>>,
    pcm_queue: Arc<FlushQueue<PcmChunk>>,
    playback: PlaybackControl,
    pending_playback: Mutex<Option<PendingPlayback>>,
    music: Arc<MusicManager>,
    volume: Arc<dyn VolumeControl>,
    reservation: Arc<PlaybackReservation>,
    shutdown: CancellationToken,
}

impl Assistant {
    /// Build the assistant and all of its collaborators.
    ///
    /// Cancelling `shutdown` stops every stage.
    pub fn new(config: AssistantConfig, devices: OutputDevices, shutdown: CancellationToken) -> Self {
        let sessions = Arc::new(SessionManager::new());
        let reservation = Arc::new(PlaybackReservation::new());
        let tts_queue = Arc::new(FlushQueue::new(config.playback.text_queue_capacity));
        let pcm_queue = Arc::new(FlushQueue::new(config.playback.pcm_queue_capacity));

        let music = Arc::new(MusicManager::new(config.music.clone(), devices.music));
        let resolver: Arc<dyn TrackResolver> = Arc::new(music.catalog().clone());
        let router = IntentRouter::new(&config.intent, resolver);

        let tts = Arc::new(TtsSessionManager::new(
            &config.cloud,
            Arc::clone(&sessions),
            Arc::clone(&pcm_queue),
        ));
        let (playback, control) = PlaybackControl::channel(PLAYBACK_CONTROL_SIZE);
        let mux = PlaybackMultiplexer::new(
            devices.speech,
            Arc::clone(&sessions),
            Arc::clone(&reservation),
            Duration::from_millis(config.playback.drain_grace_ms),
        );

        Self {
            sessions,
            wake: Arc::new(WakeGate::new(&config.wake)),
            router,
            asr: AsrClient::new(&config.cloud),
            llm: LlmStreamer::new(&config.cloud, &config.llm),
            tts,
            tts_queue,
            pcm_queue,
            playback,
            pending_playback: Mutex::new(Some(PendingPlayback { mux, control })),
            music,
            volume: devices.volume,
            reservation,
            shutdown,
            config,
        }
    }

    /// Turn sessions.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Wake gate.
    pub fn wake(&self) -> &Arc<WakeGate> {
        &self.wake
    }

    /// Background music.
    pub fn music(&self) -> &Arc<MusicManager> {
        &self.music
    }

    /// Speaker reservation.
    pub fn reservation(&self) -> &Arc<PlaybackReservation> {
        &self.reservation
    }

    /// Root shutdown token.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// What is audible right now.
    pub fn busy(&self) -> BusyState {
        BusyState {
            tts: self.reservation.is_active(),
            music: self.music.is_playing(),
        }
    }

    // ── stages ───────────────────────────────────────────────

    /// Spawn the synthesis, playback and idle-monitor tasks.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::Channel`] if the output stages were already
    /// started.
    pub fn start_output_stages(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let pending = match self.pending_playback.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(PendingPlayback { mux, control }) = pending else {
            return Err(AssistantError::Channel("output stages already started".into()));
        };

        let mut handles = Vec::with_capacity(3);

        // Stage 1: synthesis
        handles.push({
            let tts = Arc::clone(&self.tts);
            let queue = Arc::clone(&self.tts_queue);
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                tts.run(&queue, shutdown).await;
            })
        });

        // Stage 2: speech playback
        handles.push(tokio::spawn(run_playback_stage(
            mux,
            Arc::clone(&self.pcm_queue),
            control,
            self.shutdown.clone(),
        )));

        // Stage 3: idle monitor
        handles.push({
            let reservation = Arc::clone(&self.reservation);
            let music = Arc::clone(&self.music);
            let busy: Arc<dyn BusyProbe> =
                Arc::new(move || reservation.is_active() || music.is_playing());
            tokio::spawn(run_idle_monitor(
                Arc::clone(&self.wake),
                busy,
                Duration::from_secs(self.config.wake.tick_secs),
                self.shutdown.clone(),
            ))
        });

        Ok(handles)
    }

    /// Run every stage until shutdown or capture failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the output stages were already started or the
    /// capture stage fails.
    pub async fn run(self: Arc<Self>, capture: CaptureStage) -> Result<()> {
        let mut handles = self.start_output_stages()?;

        let (utterance_tx, utterance_rx) = mpsc::channel(UTTERANCE_CHANNEL_SIZE);
        handles.push(tokio::spawn(Arc::clone(&self).dispatch_utterances(utterance_rx)));

        info!("assistant running");
        let ducker: Arc<dyn DuckControl> = Arc::clone(&self.music) as Arc<dyn DuckControl>;
        let result = run_capture_stage(capture, ducker, utterance_tx, self.shutdown.clone()).await;
        if let Err(e) = &result {
            error!("capture stage failed: {e}");
        }

        self.shutdown.cancel();
        self.sessions.cancel_current();
        self.tts_queue.close();
        self.pcm_queue.close();
        self.music.stop().await;
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("stage task ended abnormally: {e}");
            }
        }
        info!("assistant stopped");
        result
    }

    /// Hand each utterance to its own recognition task.
    async fn dispatch_utterances(self: Arc<Self>, mut utterances: mpsc::Receiver<Utterance>) {
        loop {
            let utterance = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                u = utterances.recv() => match u {
                    Some(u) => u,
                    None => break,
                },
            };
            let assistant = Arc::clone(&self);
            tokio::spawn(async move {
                assistant.handle_utterance(utterance).await;
            });
        }
        debug!("utterance dispatcher stopped");
    }

    async fn handle_utterance(&self, utterance: Utterance) {
        let duration = utterance.duration();
        if duration < Duration::from_millis(self.config.cloud.asr_min_audio_ms) {
            debug!(ms = duration.as_millis() as u64, "utterance too short for recognition");
            self.music.unduck();
            return;
        }
        match self.asr.recognize(&utterance.samples, &self.shutdown).await {
            Ok(text) => {
                info!(
                    text = %text,
                    latency_ms = utterance.captured_at.elapsed().as_millis() as u64,
                    "recognized"
                );
                self.handle_text(&text).await;
            }
            Err(AssistantError::Cancelled) => {}
            Err(e) => {
                warn!(samples = utterance.samples.len(), "recognition failed: {e}");
                self.music.unduck();
            }
        }
    }

    // ── decisions ────────────────────────────────────────────

    /// Act on one recognized utterance.
    pub async fn handle_text(&self, text: &str) {
        if text.trim().is_empty() {
            self.music.unduck();
            return;
        }

        let forwarded = match self.wake.admit(text) {
            GateDecision::Drop => {
                self.music.unduck();
                return;
            }
            GateDecision::PureWake => {
                self.stop_speech().await;
                let ack = self.config.wake.ack_text.clone();
                self.speak(&ack).await;
                self.music.unduck();
                return;
            }
            GateDecision::Forward(forwarded) => forwarded,
        };

        let busy = self.busy();
        let decision = self.router.route(&forwarded, busy);
        info!(text = %forwarded, ?decision, tts = busy.tts, music = busy.music, "routed");

        match decision {
            RouteDecision::Exit => self.exit().await,
            RouteDecision::Volume(command) => {
                self.change_volume(command, busy).await;
                self.music.unduck();
            }
            RouteDecision::Stop => self.perform_stop().await,
            RouteDecision::QuickSwitch => {
                self.perform_stop().await;
                log_music(self.music.play_random_excluding_last().await);
            }
            RouteDecision::RandomPlay => {
                self.perform_stop().await;
                log_music(self.music.play_query(RANDOM_QUERY).await);
            }
            RouteDecision::PlayTrack(path) => {
                self.perform_stop().await;
                if let Err(e) = self.music.play_file(&path).await {
                    warn!(track = %path.display(), "cannot play track: {e}");
                }
            }
            RouteDecision::Reject => {
                debug!("busy, ignoring chat");
                self.music.unduck();
            }
            RouteDecision::Chat { enable_search } => {
                self.music.unduck();
                self.chat(&forwarded, enable_search).await;
            }
        }
    }

    /// Silence everything: cancel the turn, drop queued text and audio, kill
    /// the speech player, stop the music.
    pub async fn perform_stop(&self) {
        self.stop_speech().await;
        if self.music.stop().await {
            debug!("music stopped");
        }
    }

    /// Cancel the turn and silence speech, leaving music alone.
    async fn stop_speech(&self) {
        self.sessions.cancel_current();
        let dropped = self.tts_queue.flush();
        if dropped > 0 {
            debug!(dropped, "discarded queued speech text");
        }
        if let Err(e) = self.playback.stop().await {
            warn!("speech stop failed: {e}");
            self.reservation.force_release();
        }
    }

    /// Speak fixed text on a fresh session. Returns the session if the
    /// speaker was reserved.
    async fn speak(&self, text: &str) -> Option<Session> {
        let Some(session) = self.reservation.claim(&self.sessions) else {
            info!(owner = ?self.reservation.state(), "speaker busy, not speaking");
            return None;
        };
        let commands = [
            TtsCommand::Speak {
                session: session.id,
                text: text.to_owned(),
            },
            TtsCommand::EndOfTurn { session: session.id },
        ];
        for command in commands {
            if let Err(e) = self.tts_queue.send(command).await {
                warn!(session = session.id, "cannot queue speech: {e}");
                self.reservation.release(session.id);
                return None;
            }
        }
        Some(session)
    }

    async fn exit(&self) {
        info!("exit requested");
        self.perform_stop().await;
        let farewell = self.config.intent.farewell_text.clone();
        if let Some(session) = self.speak(&farewell).await {
            self.wait_for_drain(session.id).await;
        }
        self.shutdown.cancel();
    }

    async fn wait_for_drain(&self, session: u64) {
        let limit = Duration::from_millis(self.config.playback.farewell_timeout_ms);
        let drained = async {
            while self.reservation.is_active() && !self.shutdown.is_cancelled() {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        };
        if tokio::time::timeout(limit, drained).await.is_err() {
            warn!(session, "farewell did not drain in time");
        }
    }

    async fn change_volume(&self, command: VolumeCommand, busy: BusyState) {
        match self.volume.apply(command).await {
            Ok(percent) => {
                info!(percent, "volume changed");
                if !busy.any() {
                    self.speak(&VolumeCommand::Set(percent).ack_text()).await;
                }
            }
            Err(e) => warn!("volume change failed: {e}"),
        }
    }

    async fn chat(&self, prompt: &str, enable_search: bool) {
        let Some(session) = self.reservation.claim(&self.sessions) else {
            info!(owner = ?self.reservation.state(), "speaker busy, dropping chat");
            return;
        };
        let outcome = match self
            .llm
            .stream(prompt, enable_search, &session, &self.tts_queue)
            .await
        {
            Ok(outcome) => outcome,
            Err(AssistantError::Cancelled) => {
                debug!(session = session.id, "chat cancelled");
                return;
            }
            Err(e) => {
                warn!(session = session.id, "chat failed: {e}");
                return;
            }
        };
        if session.is_cancelled() {
            return;
        }
        for directive in outcome.directives {
            match directive {
                Directive::Stop => {
                    self.music.stop().await;
                }
                Directive::Play(name) => match self.music.play_query(&name).await {
                    Ok(true) => {}
                    Ok(false) => info!(track = %name, "requested track not found"),
                    Err(e) => warn!(track = %name, "cannot play requested track: {e}"),
                },
            }
        }
    }
}

fn log_music(result: Result<bool>) {
    match result {
        Ok(true) => {}
        Ok(false) => info!("no track to play"),
        Err(e) => warn!("cannot start music: {e}"),
    }
}
