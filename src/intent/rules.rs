//! Text normalization and the phrase → category rule table.

use crate::config::IntentConfig;

/// Whether `c` is dropped by [`normalize`]: whitespace plus the ASCII and
/// full-width punctuation ASR output commonly carries.
pub fn is_ignorable(c: char) -> bool {
    c.is_whitespace()
        || matches!(
            c,
            '，' | '。'
                | '！'
                | '？'
                | ','
                | '.'
                | '!'
                | '?'
                | '；'
                | ';'
                | '：'
                | ':'
                | '“'
                | '”'
                | '"'
                | '\''
                | '《'
                | '》'
                | '('
                | ')'
                | '（'
                | '）'
                | '【'
                | '】'
                | '['
                | ']'
                | '、'
                | '~'
                | '～'
        )
}

/// Lowercase and strip punctuation/whitespace.
///
/// `"我 想 听 庙堂之外。"` → `"我想听庙堂之外"`.
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !is_ignorable(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Text normalized alongside a map back into the raw string.
#[derive(Debug, Clone)]
pub struct NormalizedText {
    /// The normalized text.
    pub text: String,
    /// For each normalized byte offset that starts a char, the raw byte
    /// offset just past the raw char it came from.
    ends: Vec<(usize, usize)>,
}

impl NormalizedText {
    /// Normalize `raw`, remembering where every kept char ended.
    pub fn new(raw: &str) -> Self {
        let mut text = String::with_capacity(raw.len());
        let mut ends = Vec::with_capacity(raw.len());
        for (pos, c) in raw.char_indices() {
            if is_ignorable(c) {
                continue;
            }
            let raw_end = pos + c.len_utf8();
            for lower in c.to_lowercase() {
                ends.push((text.len(), raw_end));
                text.push(lower);
            }
        }
        Self { text, ends }
    }

    /// Raw byte offset just past the raw char that produced the normalized
    /// char ending at `norm_end`.
    pub fn raw_end(&self, norm_end: usize) -> Option<usize> {
        if norm_end == 0 {
            return Some(0);
        }
        self.ends
            .iter()
            .rev()
            .find(|(start, _)| *start < norm_end)
            .map(|(_, raw_end)| *raw_end)
    }
}

/// Trim whitespace and punctuation from both ends.
pub fn trim_ignorable(text: &str) -> &str {
    text.trim_matches(is_ignorable)
}

/// What a phrase signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhraseCategory {
    /// Shut down.
    Exit,
    /// Stop everything currently audible.
    Interrupt,
    /// Skip to another track.
    QuickSwitch,
    /// Stop the music.
    MusicStop,
    /// Introduces a song query.
    MusicVerb,
    /// Any song will do.
    RandomPlay,
    /// Negates a following music request.
    Negation,
    /// A query too vague to name a track.
    GenericQuery,
    /// Needs live information.
    Search,
    /// Names the volume (音量, 声音).
    VolumeSubject,
    /// Sets an absolute volume.
    VolumeSet,
    /// Raises the volume.
    VolumeUp,
    /// Lowers the volume.
    VolumeDown,
    /// Full volume.
    VolumeMax,
    /// Zero volume.
    VolumeMin,
}

/// One normalized phrase and its category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhraseRule {
    /// Normalized phrase.
    pub phrase: String,
    /// What it signals.
    pub category: PhraseCategory,
}

/// A match of a phrase inside normalized text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhraseMatch<'a> {
    /// Matched phrase.
    pub phrase: &'a str,
    /// Byte offset of the match.
    pub start: usize,
    /// Byte offset just past the match.
    pub end: usize,
}

/// Declarative phrase table. Within a category longer phrases are tried
/// first so `想要听` wins over `要听`.
#[derive(Debug, Clone, Default)]
pub struct PhraseTable {
    rules: Vec<PhraseRule>,
}

impl PhraseTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table built from the configured phrase lists.
    pub fn from_config(config: &IntentConfig) -> Self {
        let mut table = Self::new();
        table.extend(PhraseCategory::Exit, &config.exit_phrases);
        table.extend(PhraseCategory::Interrupt, &config.interrupt_phrases);
        table.extend(PhraseCategory::QuickSwitch, &config.quick_switch_phrases);
        table.extend(PhraseCategory::MusicStop, &config.music_stop_phrases);
        table.extend(PhraseCategory::MusicVerb, &config.music_verbs);
        table.extend(PhraseCategory::RandomPlay, &config.random_play_phrases);
        table.extend(PhraseCategory::Negation, &config.negation_prefixes);
        table.extend(PhraseCategory::GenericQuery, &config.generic_queries);
        table.extend(PhraseCategory::Search, &config.search_keywords);
        table
    }

    /// Add phrases under `category`. Phrases that normalize to nothing are
    /// skipped.
    pub fn extend<S: AsRef<str>>(&mut self, category: PhraseCategory, phrases: &[S]) {
        for phrase in phrases {
            let phrase = normalize(phrase.as_ref());
            if phrase.is_empty() {
                continue;
            }
            self.rules.push(PhraseRule { phrase, category });
        }
        self.rules
            .sort_by(|a, b| b.phrase.chars().count().cmp(&a.phrase.chars().count()));
    }

    /// Phrases of `category`, longest first.
    pub fn phrases(&self, category: PhraseCategory) -> impl Iterator<Item = &str> {
        self.rules
            .iter()
            .filter(move |r| r.category == category)
            .map(|r| r.phrase.as_str())
    }

    /// Whether `normalized` contains any phrase of `category`.
    pub fn contains(&self, category: PhraseCategory, normalized: &str) -> bool {
        self.phrases(category).any(|p| normalized.contains(p))
    }

    /// Whether `normalized` is exactly one phrase of `category`.
    pub fn is_exactly(&self, category: PhraseCategory, normalized: &str) -> bool {
        self.phrases(category).any(|p| p == normalized)
    }

    /// Earliest match of `category` in `normalized`; ties go to the longer
    /// phrase.
    pub fn find(&self, category: PhraseCategory, normalized: &str) -> Option<PhraseMatch<'_>> {
        self.phrases(category)
            .filter_map(|p| {
                normalized.find(p).map(|start| PhraseMatch {
                    phrase: p,
                    start,
                    end: start + p.len(),
                })
            })
            .min_by_key(|m| (m.start, std::cmp::Reverse(m.end)))
    }
}
