//! Wake/sleep gate in front of the intent pipeline.
//!
//! While sleeping, only text containing a wake phrase gets through. Once
//! awake, everything is forwarded until the idle monitor puts the gate back
//! to sleep. The monitor never demotes while speech or music is physically
//! playing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::WakeConfig;
use crate::intent::rules::{NormalizedText, normalize, trim_ignorable};

/// Gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeState {
    /// Only wake phrases are admitted.
    Sleeping,
    /// All text is admitted.
    Awake,
}

/// What to do with one recognized utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Sleeping and no wake phrase: ignore.
    Drop,
    /// Just the wake phrase: acknowledge, skip recognition of intent.
    PureWake,
    /// Route this text onward.
    Forward(String),
}

/// Reports whether any output is physically audible.
pub trait BusyProbe: Send + Sync {
    /// `true` while speech or music is playing.
    fn is_busy(&self) -> bool;
}

impl<F> BusyProbe for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_busy(&self) -> bool {
        self()
    }
}

/// Sleep/awake state machine with lock-free timestamps.
#[derive(Debug)]
pub struct WakeGate {
    /// Normalized wake phrases, longest first.
    phrases: Vec<String>,
    idle_timeout: Duration,
    epoch: Instant,
    awake: AtomicBool,
    last_active_ms: AtomicU64,
    last_wake_ms: AtomicU64,
}

impl WakeGate {
    /// Build a sleeping gate.
    pub fn new(config: &WakeConfig) -> Self {
        let mut phrases: Vec<String> = config
            .phrases
            .iter()
            .map(|p| normalize(p))
            .filter(|p| !p.is_empty())
            .collect();
        phrases.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()));
        phrases.dedup();
        Self {
            phrases,
            idle_timeout: config.idle_timeout(),
            epoch: Instant::now(),
            awake: AtomicBool::new(false),
            last_active_ms: AtomicU64::new(0),
            last_wake_ms: AtomicU64::new(0),
        }
    }

    /// Current state.
    pub fn state(&self) -> WakeState {
        if self.awake.load(Ordering::Acquire) {
            WakeState::Awake
        } else {
            WakeState::Sleeping
        }
    }

    /// Whether the gate is awake.
    pub fn is_awake(&self) -> bool {
        self.state() == WakeState::Awake
    }

    /// Decide what to do with recognized `text`.
    pub fn admit(&self, text: &str) -> GateDecision {
        self.admit_at(text, Instant::now())
    }

    /// [`admit`](Self::admit) with an explicit clock.
    pub fn admit_at(&self, text: &str, now: Instant) -> GateDecision {
        let norm = NormalizedText::new(text);
        match self.strip_wake(text, &norm) {
            Some(tail) => {
                let was_awake = self.awake.swap(true, Ordering::AcqRel);
                let ms = self.millis(now);
                self.last_wake_ms.store(ms, Ordering::Release);
                self.last_active_ms.store(ms, Ordering::Release);
                if !was_awake {
                    info!("wake phrase detected, gate awake");
                }
                if tail.is_empty() {
                    GateDecision::PureWake
                } else {
                    debug!(tail = %tail, "wake phrase with trailing command");
                    GateDecision::Forward(tail)
                }
            }
            None if self.is_awake() => {
                self.touch_at(now);
                if norm.text.is_empty() {
                    GateDecision::Drop
                } else {
                    GateDecision::Forward(trim_ignorable(text).to_owned())
                }
            }
            None => {
                debug!(text, "sleeping, dropping utterance");
                GateDecision::Drop
            }
        }
    }

    /// Record activity without a wake phrase.
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    fn touch_at(&self, now: Instant) {
        self.last_active_ms.store(self.millis(now), Ordering::Release);
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self, now: Instant) -> Duration {
        let last = self.last_active_ms.load(Ordering::Acquire);
        Duration::from_millis(self.millis(now).saturating_sub(last))
    }

    /// Time since the last wake phrase, `None` if never woken.
    pub fn since_wake(&self, now: Instant) -> Option<Duration> {
        let last = self.last_wake_ms.load(Ordering::Acquire);
        if last == 0 && !self.is_awake() {
            return None;
        }
        Some(Duration::from_millis(self.millis(now).saturating_sub(last)))
    }

    /// Demote to sleeping if awake, not `busy` and idle past the timeout.
    /// Returns `true` if the gate went to sleep.
    pub fn check_idle_at(&self, now: Instant, busy: bool) -> bool {
        if !self.is_awake() || busy {
            return false;
        }
        if self.idle_for(now) <= self.idle_timeout {
            return false;
        }
        let demoted = self
            .awake
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if demoted {
            info!(
                timeout_secs = self.idle_timeout.as_secs(),
                "idle timeout, gate sleeping"
            );
        }
        demoted
    }

    /// Force the gate to sleep.
    pub fn sleep(&self) {
        self.awake.store(false, Ordering::Release);
    }

    /// Match the longest wake phrase and return the raw text after it with
    /// surrounding punctuation trimmed.
    fn strip_wake(&self, raw: &str, norm: &NormalizedText) -> Option<String> {
        let (start, phrase) = self
            .phrases
            .iter()
            .find_map(|p| norm.text.find(p.as_str()).map(|start| (start, p)))?;
        let norm_end = start + phrase.len();
        if norm.text[norm_end..].is_empty() {
            return Some(String::new());
        }
        let tail = norm
            .raw_end(norm_end)
            .and_then(|raw_end| raw.get(raw_end..))
            .map(trim_ignorable)
            .unwrap_or(raw);
        Some(tail.to_owned())
    }

    fn millis(&self, now: Instant) -> u64 {
        // Offset by one so zero means "never".
        now.saturating_duration_since(self.epoch).as_millis() as u64 + 1
    }
}

/// Tick until cancelled, demoting the gate when idle.
pub async fn run_idle_monitor(
    gate: Arc<WakeGate>,
    busy: Arc<dyn BusyProbe>,
    tick: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(tick.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                gate.check_idle_at(Instant::now(), busy.is_busy());
            }
        }
    }
    debug!("idle monitor stopped");
}
