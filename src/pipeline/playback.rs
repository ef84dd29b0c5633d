//! Speech playback multiplexer.
//!
//! A single task owns the speech player. Non-empty PCM chunks lazily start
//! it and are written in arrival order; the drain sentinel closes it after a
//! short grace delay and releases the speaker reservation. Chunks from a
//! session that is no longer live never reach the player.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::playback::{PcmSink, SinkLauncher};
use crate::error::{AssistantError, Result};
use crate::pipeline::messages::{PcmChunk, PlaybackCommand};
use crate::pipeline::queue::FlushQueue;
use crate::pipeline::session::{PlaybackReservation, SessionManager};

/// Upper bound on waiting for the multiplexer to acknowledge a stop.
const STOP_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Sender side of the multiplexer's control channel.
#[derive(Debug, Clone)]
pub struct PlaybackControl {
    tx: mpsc::Sender<PlaybackCommand>,
}

impl PlaybackControl {
    /// Create a control handle and the receiver the multiplexer consumes.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PlaybackCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Kill the player, discard queued PCM and release the speaker, waiting
    /// until the multiplexer confirms.
    ///
    /// # Errors
    ///
    /// Returns [`AssistantError::Channel`] if the multiplexer is gone or
    /// does not answer in time.
    pub async fn stop(&self) -> Result<()> {
        let (done, ack) = oneshot::channel();
        self.tx
            .send(PlaybackCommand::Stop { done })
            .await
            .map_err(|_| AssistantError::Channel("playback stage stopped".into()))?;
        match tokio::time::timeout(STOP_ACK_TIMEOUT, ack).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(AssistantError::Channel("playback stop dropped".into())),
            Err(_) => Err(AssistantError::Channel("playback stop not acknowledged".into())),
        }
    }
}

/// Owns the speech player handle.
pub struct PlaybackMultiplexer {
    launcher: Arc<dyn SinkLauncher>,
    sessions: Arc<SessionManager>,
    reservation: Arc<PlaybackReservation>,
    drain_grace: Duration,
    sink: Option<Box<dyn PcmSink>>,
    /// Session whose audio is in the current player.
    playing: Option<u64>,
}

impl PlaybackMultiplexer {
    /// Create an idle multiplexer.
    pub fn new(
        launcher: Arc<dyn SinkLauncher>,
        sessions: Arc<SessionManager>,
        reservation: Arc<PlaybackReservation>,
        drain_grace: Duration,
    ) -> Self {
        Self {
            launcher,
            sessions,
            reservation,
            drain_grace,
            sink: None,
            playing: None,
        }
    }

    /// Whether a player process is running.
    pub fn has_player(&self) -> bool {
        self.sink.is_some()
    }

    /// Handle one PCM chunk.
    pub async fn handle_chunk(&mut self, chunk: PcmChunk) {
        if !self.sessions.is_live(chunk.session) {
            debug!(session = chunk.session, bytes = chunk.data.len(), "discarding stale audio");
            // A superseded owner still gives the speaker back.
            if chunk.is_drain() && self.reservation.release(chunk.session) {
                info!(session = chunk.session, "stale owner drained, speaker released");
            }
            return;
        }
        if chunk.is_drain() {
            self.drain(chunk.session).await;
            return;
        }

        if self.sink.is_none() {
            match self.launcher.launch() {
                Ok(sink) => self.sink = Some(sink),
                Err(e) => {
                    warn!(session = chunk.session, "speech player unavailable, dropping audio: {e}");
                    return;
                }
            }
        }
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        if let Err(e) = sink.write(&chunk.data).await {
            warn!(session = chunk.session, "speech write failed, restarting player on next chunk: {e}");
            sink.kill().await;
            self.sink = None;
            self.playing = None;
            return;
        }
        if self.playing != Some(chunk.session) {
            self.playing = Some(chunk.session);
            if self.reservation.mark_speaking(chunk.session) {
                info!(session = chunk.session, "speaking");
            }
        }
    }

    async fn drain(&mut self, session: u64) {
        if self.sink.is_some() && !self.drain_grace.is_zero() {
            tokio::time::sleep(self.drain_grace).await;
        }
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.finish().await {
                warn!(session, "speech player did not exit cleanly: {e}");
            }
        }
        self.playing = None;
        if self.reservation.release(session) {
            info!(session, "speech drained, speaker released");
        }
    }

    /// Kill the player and release the speaker regardless of owner.
    pub async fn stop(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            sink.kill().await;
        }
        self.playing = None;
        self.reservation.force_release();
    }
}

/// Run the multiplexer until `shutdown` fires or the PCM queue closes.
///
/// Stop commands take priority over queued audio.
pub async fn run_playback_stage(
    mut mux: PlaybackMultiplexer,
    pcm: Arc<FlushQueue<PcmChunk>>,
    mut control: mpsc::Receiver<PlaybackCommand>,
    shutdown: CancellationToken,
) {
    info!("playback stage started");
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            Some(command) = control.recv() => match command {
                PlaybackCommand::Stop { done } => {
                    mux.stop().await;
                    let dropped = pcm.flush();
                    debug!(dropped, "speech stopped");
                    let _ = done.send(());
                }
            },
            chunk = pcm.recv() => match chunk {
                Some(chunk) => mux.handle_chunk(chunk).await,
                None => break,
            },
        }
    }
    mux.stop().await;
    info!("playback stage stopped");
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::audio::playback::MemoryLauncher;
    use crate::pipeline::session::Reservation;

    struct Fixture {
        launcher: MemoryLauncher,
        sessions: Arc<SessionManager>,
        reservation: Arc<PlaybackReservation>,
    }

    impl Fixture {
        fn new(launcher: MemoryLauncher) -> Self {
            Self {
                launcher,
                sessions: Arc::new(SessionManager::new()),
                reservation: Arc::new(PlaybackReservation::new()),
            }
        }

        fn mux(&self) -> PlaybackMultiplexer {
            PlaybackMultiplexer::new(
                Arc::new(self.launcher.clone()),
                Arc::clone(&self.sessions),
                Arc::clone(&self.reservation),
                Duration::ZERO,
            )
        }
    }

    fn audio(session: u64, bytes: &[u8]) -> PcmChunk {
        PcmChunk {
            session,
            data: bytes.to_vec(),
        }
    }

    // ── chunks and drain ─────────────────────────────────────

    #[tokio::test]
    async fn chunks_play_then_drain_releases_speaker() {
        let fx = Fixture::new(MemoryLauncher::new());
        let mut mux = fx.mux();
        let session = fx.sessions.begin();
        assert!(fx.reservation.try_reserve(session.id));

        mux.handle_chunk(audio(session.id, &[1, 2])).await;
        assert_eq!(fx.reservation.state(), Reservation::Speaking { session: session.id });
        mux.handle_chunk(audio(session.id, &[3, 4])).await;
        assert!(mux.has_player());

        mux.handle_chunk(PcmChunk::drain(session.id)).await;
        assert!(!mux.has_player());
        assert_eq!(fx.reservation.state(), Reservation::Idle);

        let records = fx.launcher.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bytes, vec![1, 2, 3, 4]);
        assert!(records[0].finished);
    }

    #[tokio::test]
    async fn next_turn_restarts_player_lazily() {
        let fx = Fixture::new(MemoryLauncher::new());
        let mut mux = fx.mux();
        for _ in 0..2 {
            let session = fx.sessions.begin();
            fx.reservation.try_reserve(session.id);
            mux.handle_chunk(audio(session.id, &[9])).await;
            mux.handle_chunk(PcmChunk::drain(session.id)).await;
        }
        assert_eq!(fx.launcher.launches(), 2);
        assert!(!fx.reservation.is_active());
    }

    #[tokio::test]
    async fn drain_without_audio_still_releases() {
        let fx = Fixture::new(MemoryLauncher::new());
        let mut mux = fx.mux();
        let session = fx.sessions.begin();
        fx.reservation.try_reserve(session.id);
        mux.handle_chunk(PcmChunk::drain(session.id)).await;
        assert_eq!(fx.launcher.launches(), 0);
        assert!(!fx.reservation.is_active());
    }

    // ── invalidation ─────────────────────────────────────────

    #[tokio::test]
    async fn stale_session_audio_is_discarded() {
        let fx = Fixture::new(MemoryLauncher::new());
        let mut mux = fx.mux();
        let old = fx.sessions.begin();
        let new = fx.sessions.begin();
        fx.reservation.try_reserve(new.id);

        mux.handle_chunk(audio(old.id, &[1])).await;
        mux.handle_chunk(PcmChunk::drain(old.id)).await;
        assert_eq!(fx.launcher.launches(), 0);
        assert_eq!(fx.reservation.state(), Reservation::Reserved { session: new.id });

        mux.handle_chunk(audio(new.id, &[2])).await;
        assert_eq!(fx.launcher.records()[0].bytes, vec![2]);
    }

    #[tokio::test]
    async fn superseded_owner_drain_still_releases() {
        let fx = Fixture::new(MemoryLauncher::new());
        let mut mux = fx.mux();
        let owner = fx.sessions.begin();
        fx.reservation.try_reserve(owner.id);
        fx.sessions.begin();

        mux.handle_chunk(audio(owner.id, &[1])).await;
        assert_eq!(fx.reservation.state(), Reservation::Reserved { session: owner.id });
        mux.handle_chunk(PcmChunk::drain(owner.id)).await;
        assert_eq!(fx.launcher.launches(), 0);
        assert_eq!(fx.reservation.state(), Reservation::Idle);
    }

    // ── failures ─────────────────────────────────────────────

    #[tokio::test]
    async fn write_failure_clears_handle_for_restart() {
        let fx = Fixture::new(MemoryLauncher::failing());
        let mut mux = fx.mux();
        let session = fx.sessions.begin();
        fx.reservation.try_reserve(session.id);

        mux.handle_chunk(audio(session.id, &[1])).await;
        assert!(!mux.has_player());
        mux.handle_chunk(audio(session.id, &[2])).await;
        assert_eq!(fx.launcher.launches(), 2);
        assert!(fx.launcher.records().iter().all(|r| r.killed));
    }

    // ── stop command ─────────────────────────────────────────

    #[tokio::test]
    async fn stop_command_kills_flushes_and_acknowledges() {
        let fx = Fixture::new(MemoryLauncher::new());
        let session = fx.sessions.begin();
        fx.reservation.try_reserve(session.id);
        let pcm = Arc::new(FlushQueue::new(16));
        let (control, rx) = PlaybackControl::channel(4);
        let shutdown = CancellationToken::new();
        let stage = tokio::spawn(run_playback_stage(fx.mux(), Arc::clone(&pcm), rx, shutdown.clone()));

        pcm.send(audio(session.id, &[1, 1])).await.unwrap();
        for _ in 0..100 {
            if fx.launcher.launches() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        control.stop().await.unwrap();

        let records = fx.launcher.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].killed);
        assert!(pcm.is_empty());
        assert!(!fx.reservation.is_active());

        shutdown.cancel();
        stage.await.unwrap();
    }

    #[tokio::test]
    async fn stop_fails_when_stage_is_gone() {
        let (control, rx) = PlaybackControl::channel(1);
        drop(rx);
        assert!(control.stop().await.is_err());
    }
}
