//! Turn sessions and the speaker reservation.
//!
//! Every spoken turn runs under a [`Session`]. Beginning a new one cancels
//! the previous token under the same lock that publishes the new id, so no
//! side effect of the old turn can be observed after the new turn is
//! current.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One conversational turn.
#[derive(Debug, Clone)]
pub struct Session {
    /// Monotonically increasing id.
    pub id: u64,
    /// Cancelled when the turn is superseded or stopped.
    pub cancel: CancellationToken,
    /// When the turn began.
    pub created_at: Instant,
}

impl Session {
    /// Whether the turn has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Owns the current session.
#[derive(Debug)]
pub struct SessionManager {
    current: Mutex<Session>,
    latest_id: AtomicU64,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    /// Start with an idle, already-cancelled session 0.
    pub fn new() -> Self {
        let cancel = CancellationToken::new();
        cancel.cancel();
        Self {
            current: Mutex::new(Session {
                id: 0,
                cancel,
                created_at: Instant::now(),
            }),
            latest_id: AtomicU64::new(0),
        }
    }

    /// Cancel the current session and make a fresh one current.
    pub fn begin(&self) -> Session {
        let mut current = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        current.cancel.cancel();
        let id = current.id + 1;
        *current = Session {
            id,
            cancel: CancellationToken::new(),
            created_at: Instant::now(),
        };
        self.latest_id.store(id, Ordering::Release);
        debug!(session = id, "session started");
        current.clone()
    }

    /// Cancel the current session without starting another.
    pub fn cancel_current(&self) {
        let current = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !current.cancel.is_cancelled() {
            debug!(session = current.id, "session cancelled");
        }
        current.cancel.cancel();
    }

    /// Snapshot of the current session.
    pub fn current(&self) -> Session {
        match self.current.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Id of the current session, readable without locking.
    pub fn current_id(&self) -> u64 {
        self.latest_id.load(Ordering::Acquire)
    }

    /// Whether `id` is current and still live.
    pub fn is_live(&self, id: u64) -> bool {
        let current = self.current();
        current.id == id && !current.is_cancelled()
    }
}

/// Speaker ownership on the speech side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// Nobody owns the speaker.
    Idle,
    /// A turn has committed to speaking but no audio has played yet.
    Reserved {
        /// Owning session.
        session: u64,
    },
    /// Audio from the owning session is playing.
    Speaking {
        /// Owning session.
        session: u64,
    },
}

/// Compare-and-set gate over [`Reservation`].
#[derive(Debug)]
pub struct PlaybackReservation {
    state: Mutex<Reservation>,
}

impl Default for PlaybackReservation {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackReservation {
    /// Start idle.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Reservation::Idle),
        }
    }

    /// Idle → Reserved for `session`. Returns `false` if someone else
    /// already owns the speaker.
    pub fn try_reserve(&self, session: u64) -> bool {
        self.update(|state| match *state {
            Reservation::Idle => {
                *state = Reservation::Reserved { session };
                true
            }
            _ => false,
        })
    }

    /// Begin a session and reserve the speaker for it in one step.
    ///
    /// Returns `None` without touching `sessions` when the speaker is
    /// already owned, so the owning turn is never cancelled out from under
    /// its own drain.
    pub fn claim(&self, sessions: &SessionManager) -> Option<Session> {
        self.update(|state| match *state {
            Reservation::Idle => {
                let session = sessions.begin();
                *state = Reservation::Reserved { session: session.id };
                Some(session)
            }
            _ => None,
        })
    }

    /// Reserved → Speaking when the owner's first audio plays. Returns
    /// `true` if `session` now owns the speaker.
    pub fn mark_speaking(&self, session: u64) -> bool {
        self.update(|state| match *state {
            Reservation::Reserved { session: owner } if owner == session => {
                *state = Reservation::Speaking { session };
                true
            }
            Reservation::Speaking { session: owner } => owner == session,
            _ => false,
        })
    }

    /// Back to Idle, only if `session` is the owner.
    pub fn release(&self, session: u64) -> bool {
        self.update(|state| match *state {
            Reservation::Reserved { session: owner } | Reservation::Speaking { session: owner }
                if owner == session =>
            {
                *state = Reservation::Idle;
                true
            }
            _ => false,
        })
    }

    /// Back to Idle regardless of owner.
    pub fn force_release(&self) {
        self.update(|state| {
            *state = Reservation::Idle;
        });
    }

    /// Current state.
    pub fn state(&self) -> Reservation {
        self.update(|state| *state)
    }

    /// Whether any turn owns the speaker.
    pub fn is_active(&self) -> bool {
        self.state() != Reservation::Idle
    }

    fn update<R>(&self, f: impl FnOnce(&mut Reservation) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::sync::Arc;

    // ── SessionManager ───────────────────────────────────────

    #[test]
    fn initial_session_is_cancelled() {
        let sessions = SessionManager::new();
        assert_eq!(sessions.current_id(), 0);
        assert!(sessions.current().is_cancelled());
        assert!(!sessions.is_live(0));
    }

    #[test]
    fn begin_cancels_previous_and_increments_id() {
        let sessions = SessionManager::new();
        let first = sessions.begin();
        assert_eq!(first.id, 1);
        assert!(!first.is_cancelled());

        let second = sessions.begin();
        assert_eq!(second.id, 2);
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(sessions.current_id(), 2);
        assert!(sessions.is_live(2));
        assert!(!sessions.is_live(1));
    }

    #[test]
    fn cancel_current_keeps_id() {
        let sessions = SessionManager::new();
        let session = sessions.begin();
        sessions.cancel_current();
        assert!(session.is_cancelled());
        assert_eq!(sessions.current_id(), session.id);
        assert!(!sessions.is_live(session.id));
    }

    #[test]
    fn concurrent_begins_produce_unique_ids() {
        let sessions = Arc::new(SessionManager::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sessions = Arc::clone(&sessions);
                std::thread::spawn(move || (0..50).map(|_| sessions.begin().id).collect::<Vec<_>>())
            })
            .collect();
        let mut ids: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 400);
        assert_eq!(sessions.current_id(), 400);
    }

    // ── PlaybackReservation ──────────────────────────────────

    #[test]
    fn only_one_producer_can_reserve() {
        let reservation = PlaybackReservation::new();
        assert!(reservation.try_reserve(1));
        assert!(!reservation.try_reserve(2));
        assert_eq!(reservation.state(), Reservation::Reserved { session: 1 });
    }

    #[test]
    fn speaking_requires_matching_owner() {
        let reservation = PlaybackReservation::new();
        assert!(!reservation.mark_speaking(1));
        reservation.try_reserve(1);
        assert!(!reservation.mark_speaking(2));
        assert!(reservation.mark_speaking(1));
        assert!(reservation.mark_speaking(1));
        assert_eq!(reservation.state(), Reservation::Speaking { session: 1 });
    }

    #[test]
    fn release_ignores_stale_owner() {
        let reservation = PlaybackReservation::new();
        reservation.try_reserve(3);
        assert!(!reservation.release(2));
        assert!(reservation.is_active());
        assert!(reservation.release(3));
        assert!(!reservation.is_active());
    }

    #[test]
    fn claim_leaves_the_owner_alone_when_busy() {
        let sessions = SessionManager::new();
        let reservation = PlaybackReservation::new();

        let owner = reservation.claim(&sessions).unwrap();
        assert_eq!(reservation.state(), Reservation::Reserved { session: owner.id });

        assert!(reservation.claim(&sessions).is_none());
        assert!(!owner.is_cancelled());
        assert_eq!(sessions.current_id(), owner.id);

        assert!(reservation.release(owner.id));
        let next = reservation.claim(&sessions).unwrap();
        assert!(owner.is_cancelled());
        assert_eq!(reservation.state(), Reservation::Reserved { session: next.id });
    }

    #[test]
    fn force_release_always_idles() {
        let reservation = PlaybackReservation::new();
        reservation.try_reserve(5);
        reservation.mark_speaking(5);
        reservation.force_release();
        assert_eq!(reservation.state(), Reservation::Idle);
        assert!(reservation.try_reserve(6));
    }
}
