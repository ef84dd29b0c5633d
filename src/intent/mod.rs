//! Intent classification and the busy-state penetration rule.
//!
//! Classification runs over normalized text in a fixed priority order:
//! exit, interrupt, volume, music control, chat. Whether the intent may
//! pre-empt audio already playing is decided separately by [`penetrate`],
//! a pure function of the intent and the [`BusyState`].

pub mod numerals;
pub mod rules;
pub mod volume;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::config::IntentConfig;
use crate::music::MusicCatalog;
use rules::{PhraseCategory, PhraseMatch, PhraseTable, normalize};
pub use volume::{VolumeCommand, VolumeParser};

/// Looks up a local track by spoken query.
pub trait TrackResolver: Send + Sync {
    /// Path of the track `query` names, if any.
    fn resolve(&self, query: &str) -> Option<PathBuf>;
}

impl TrackResolver for MusicCatalog {
    fn resolve(&self, query: &str) -> Option<PathBuf> {
        MusicCatalog::resolve(self, query)
    }
}

/// Which outputs are physically active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusyState {
    /// Speech owns the speaker.
    pub tts: bool,
    /// A music track is playing.
    pub music: bool,
}

impl BusyState {
    /// Whether anything is audible.
    pub fn any(self) -> bool {
        self.tts || self.music
    }
}

/// What the user asked for, before busy-state arbitration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Say goodbye and shut down.
    Exit,
    /// Stop whatever is audible.
    Interrupt,
    /// Change the hardware volume.
    Volume(VolumeCommand),
    /// Stop the music.
    MusicStop,
    /// Skip to another track.
    QuickSwitch,
    /// Play any track.
    RandomPlay,
    /// Play a specific track.
    PlayTrack {
        /// Query as heard.
        query: String,
        /// Resolved track.
        path: PathBuf,
    },
    /// Anything else goes to the language model.
    Chat {
        /// Whether the question needs live information.
        enable_search: bool,
    },
}

impl Intent {
    /// Whether this intent may pre-empt audio that is already playing.
    pub fn penetrates(&self) -> bool {
        matches!(
            self,
            Self::Interrupt
                | Self::MusicStop
                | Self::QuickSwitch
                | Self::RandomPlay
                | Self::PlayTrack { .. }
        )
    }
}

/// What the coordinator should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Farewell, then shut down.
    Exit,
    /// Physical stop, nothing else.
    Stop,
    /// Apply a volume change without interrupting anything.
    Volume(VolumeCommand),
    /// Physical stop, then a random track other than the one just playing.
    QuickSwitch,
    /// Physical stop, then a random track.
    RandomPlay,
    /// Physical stop, then this track.
    PlayTrack(PathBuf),
    /// Busy with unrelated chat: ignore and restore the music.
    Reject,
    /// Start a generation turn.
    Chat {
        /// Whether the question needs live information.
        enable_search: bool,
    },
}

/// Arbitrate `intent` against what is currently playing.
///
/// Exit and volume always pass. While anything is audible, only intents
/// that [`penetrate`](Intent::penetrates) are acted on; chat is rejected.
pub fn penetrate(intent: Intent, busy: BusyState) -> RouteDecision {
    match intent {
        Intent::Exit => RouteDecision::Exit,
        Intent::Volume(cmd) => RouteDecision::Volume(cmd),
        intent if busy.any() && !intent.penetrates() => RouteDecision::Reject,
        Intent::Interrupt | Intent::MusicStop => RouteDecision::Stop,
        Intent::QuickSwitch if busy.music => RouteDecision::QuickSwitch,
        Intent::QuickSwitch | Intent::RandomPlay => RouteDecision::RandomPlay,
        Intent::PlayTrack { path, .. } => RouteDecision::PlayTrack(path),
        Intent::Chat { enable_search } => RouteDecision::Chat { enable_search },
    }
}

/// Table-driven intent classifier.
pub struct IntentRouter {
    table: PhraseTable,
    volume: VolumeParser,
    resolver: Arc<dyn TrackResolver>,
}

impl IntentRouter {
    /// Router over the configured phrase tables.
    pub fn new(config: &IntentConfig, resolver: Arc<dyn TrackResolver>) -> Self {
        Self {
            table: PhraseTable::from_config(config),
            volume: VolumeParser::new(config.volume_step_percent),
            resolver,
        }
    }

    /// Classify `text` and arbitrate it against `busy`.
    pub fn route(&self, text: &str, busy: BusyState) -> RouteDecision {
        let intent = self.classify(text);
        let decision = penetrate(intent.clone(), busy);
        debug!(?intent, ?busy, ?decision, "routed");
        decision
    }

    /// Classify `text` on its own.
    pub fn classify(&self, text: &str) -> Intent {
        let text = normalize(text);
        if self.table.contains(PhraseCategory::Exit, &text) {
            return Intent::Exit;
        }
        if self.table.contains(PhraseCategory::Interrupt, &text) {
            return Intent::Interrupt;
        }
        if let Some(cmd) = self.volume.parse(&text) {
            return Intent::Volume(cmd);
        }
        if let Some(intent) = self.music_intent(&text) {
            return intent;
        }
        Intent::Chat {
            enable_search: self.table.contains(PhraseCategory::Search, &text),
        }
    }

    fn music_intent(&self, text: &str) -> Option<Intent> {
        if self.table.contains(PhraseCategory::MusicStop, text) {
            return Some(Intent::MusicStop);
        }
        if self.table.contains(PhraseCategory::QuickSwitch, text) {
            return Some(Intent::QuickSwitch);
        }
        if self
            .table
            .find(PhraseCategory::RandomPlay, text)
            .is_some_and(|m| !self.is_negated(text, &m))
        {
            return Some(Intent::RandomPlay);
        }

        let verb = self.table.find(PhraseCategory::MusicVerb, text)?;
        if self.is_negated(text, &verb) {
            return None;
        }
        let query = text[verb.end..].trim_start_matches(['一', '首']);
        if query.is_empty() || self.table.is_exactly(PhraseCategory::GenericQuery, query) {
            return Some(Intent::RandomPlay);
        }
        match self.resolver.resolve(query) {
            Some(path) => Some(Intent::PlayTrack {
                query: query.to_owned(),
                path,
            }),
            None => {
                debug!(query, "music query did not resolve");
                None
            }
        }
    }

    /// Whether a negation phrase starts before `m` and reaches it, as in
    /// `不要放歌` or the overlapping `不想听`.
    fn is_negated(&self, text: &str, m: &PhraseMatch<'_>) -> bool {
        self.table.phrases(PhraseCategory::Negation).any(|neg| {
            text.match_indices(neg)
                .any(|(at, _)| at < m.start && at + neg.len() >= m.start)
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    struct Library(Vec<&'static str>);

    impl TrackResolver for Library {
        fn resolve(&self, query: &str) -> Option<PathBuf> {
            self.0
                .iter()
                .find(|name| name.contains(query))
                .map(|name| PathBuf::from(format!("/music/{name}.wav")))
        }
    }

    fn router() -> IntentRouter {
        IntentRouter::new(
            &IntentConfig::default(),
            Arc::new(Library(vec!["陈楚生《庙堂之外》", "心跳"])),
        )
    }

    const IDLE: BusyState = BusyState { tts: false, music: false };
    const SPEAKING: BusyState = BusyState { tts: true, music: false };
    const MUSIC: BusyState = BusyState { tts: false, music: true };
    const BOTH: BusyState = BusyState { tts: true, music: true };

    // ── classification ───────────────────────────────────────

    #[test]
    fn priority_order_exit_over_interrupt_over_volume() {
        let r = router();
        assert_eq!(r.classify("停止运行"), Intent::Exit);
        assert_eq!(r.classify("好的，再见！"), Intent::Exit);
        assert_eq!(r.classify("别说了"), Intent::Interrupt);
        assert_eq!(r.classify("音量调到40"), Intent::Volume(VolumeCommand::Set(40)));
    }

    #[test]
    fn music_controls() {
        let r = router();
        assert_eq!(r.classify("关掉音乐"), Intent::MusicStop);
        assert_eq!(r.classify("下一首。"), Intent::QuickSwitch);
        assert_eq!(r.classify("唱首歌"), Intent::RandomPlay);
        assert_eq!(r.classify("放音乐"), Intent::RandomPlay);
        assert_eq!(r.classify("我想听歌"), Intent::RandomPlay);
        assert_eq!(r.classify("播放"), Intent::RandomPlay);
    }

    #[test]
    fn play_by_query_resolves_against_catalog() {
        let r = router();
        assert_eq!(
            r.classify("我 想 听 庙堂之外。"),
            Intent::PlayTrack {
                query: "庙堂之外".into(),
                path: PathBuf::from("/music/陈楚生《庙堂之外》.wav"),
            }
        );
        assert!(matches!(r.classify("播放一首心跳"), Intent::PlayTrack { .. }));
    }

    #[test]
    fn unresolved_query_falls_through_to_chat() {
        let r = router();
        assert_eq!(r.classify("播放不存在的歌"), Intent::Chat { enable_search: false });
    }

    #[test]
    fn negation_blocks_music_requests() {
        let r = router();
        assert_eq!(r.classify("不要放歌"), Intent::Chat { enable_search: false });
        assert_eq!(r.classify("我不想听心跳"), Intent::Chat { enable_search: false });
        // The stop table names its own negated forms.
        assert_eq!(r.classify("别放了"), Intent::MusicStop);
    }

    #[test]
    fn search_keywords_enable_search() {
        let r = router();
        assert_eq!(r.classify("今天天气怎么样？"), Intent::Chat { enable_search: true });
        assert_eq!(r.classify("讲个笑话"), Intent::Chat { enable_search: false });
    }

    // ── penetration matrix ───────────────────────────────────

    #[test]
    fn idle_routes_everything() {
        assert_eq!(penetrate(Intent::Interrupt, IDLE), RouteDecision::Stop);
        assert_eq!(penetrate(Intent::QuickSwitch, IDLE), RouteDecision::RandomPlay);
        assert_eq!(
            penetrate(Intent::Chat { enable_search: true }, IDLE),
            RouteDecision::Chat { enable_search: true }
        );
    }

    #[test]
    fn busy_rejects_chat_in_every_busy_combination() {
        for busy in [SPEAKING, MUSIC, BOTH] {
            assert_eq!(
                penetrate(Intent::Chat { enable_search: false }, busy),
                RouteDecision::Reject,
                "{busy:?}"
            );
        }
    }

    #[test]
    fn busy_lets_control_intents_through() {
        for busy in [IDLE, SPEAKING, MUSIC, BOTH] {
            assert_eq!(penetrate(Intent::Interrupt, busy), RouteDecision::Stop);
            assert_eq!(penetrate(Intent::MusicStop, busy), RouteDecision::Stop);
            assert_eq!(penetrate(Intent::RandomPlay, busy), RouteDecision::RandomPlay);
            assert_eq!(
                penetrate(
                    Intent::PlayTrack {
                        query: "心跳".into(),
                        path: "/music/心跳.wav".into()
                    },
                    busy
                ),
                RouteDecision::PlayTrack("/music/心跳.wav".into())
            );
            assert_eq!(penetrate(Intent::Exit, busy), RouteDecision::Exit);
            assert_eq!(
                penetrate(Intent::Volume(VolumeCommand::Set(10)), busy),
                RouteDecision::Volume(VolumeCommand::Set(10))
            );
        }
    }

    #[test]
    fn quick_switch_needs_music_to_switch() {
        assert_eq!(penetrate(Intent::QuickSwitch, MUSIC), RouteDecision::QuickSwitch);
        assert_eq!(penetrate(Intent::QuickSwitch, BOTH), RouteDecision::QuickSwitch);
        assert_eq!(penetrate(Intent::QuickSwitch, SPEAKING), RouteDecision::RandomPlay);
    }

    #[test]
    fn penetrates_flags_only_control_intents() {
        assert!(Intent::Interrupt.penetrates());
        assert!(Intent::QuickSwitch.penetrates());
        assert!(!Intent::Exit.penetrates());
        assert!(!Intent::Chat { enable_search: false }.penetrates());
    }

    #[test]
    fn unrelated_chat_while_speaking_is_rejected_end_to_end() {
        let r = router();
        assert_eq!(r.route("给我讲讲历史", SPEAKING), RouteDecision::Reject);
        assert_eq!(r.route("下一首", MUSIC), RouteDecision::QuickSwitch);
    }
}
