//! Spoken volume requests.

use crate::intent::numerals::{clamp_percent, leading_number};
use crate::intent::rules::{PhraseCategory, PhraseMatch, PhraseTable};

const SUBJECTS: &[&str] = &["音量", "声音"];
const SET_VERBS: &[&str] = &["调到", "调成", "设为", "设置为", "设置到", "开到"];
const UP_VERBS: &[&str] = &["调大", "调高", "大一点", "大点", "增大", "提高", "加大"];
const DOWN_VERBS: &[&str] = &["调小", "调低", "小一点", "小点", "减小", "降低"];
const MAX_PHRASES: &[&str] = &["最大"];
const MIN_PHRASES: &[&str] = &["最小", "静音"];
const MUTE: &str = "静音";

/// A parsed volume request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeCommand {
    /// Absolute percentage.
    Set(u8),
    /// Relative change in percentage points.
    Adjust {
        /// Louder when `true`.
        up: bool,
        /// Step size.
        percent: u8,
    },
}

impl VolumeCommand {
    /// Short spoken confirmation.
    pub fn ack_text(&self) -> String {
        match self {
            Self::Set(p) => format!("好的，音量已调到{p}%"),
            Self::Adjust { up: true, percent } => format!("好的，音量已调大{percent}%"),
            Self::Adjust { up: false, percent } => format!("好的，音量已调小{percent}%"),
        }
    }
}

/// Table-driven volume request parser over normalized text.
#[derive(Debug, Clone)]
pub struct VolumeParser {
    table: PhraseTable,
    step: u8,
}

impl VolumeParser {
    /// Parser whose bare "louder"/"quieter" moves by `step` percent.
    pub fn new(step: u8) -> Self {
        let mut table = PhraseTable::new();
        table.extend(PhraseCategory::VolumeSubject, SUBJECTS);
        table.extend(PhraseCategory::VolumeSet, SET_VERBS);
        table.extend(PhraseCategory::VolumeUp, UP_VERBS);
        table.extend(PhraseCategory::VolumeDown, DOWN_VERBS);
        table.extend(PhraseCategory::VolumeMax, MAX_PHRASES);
        table.extend(PhraseCategory::VolumeMin, MIN_PHRASES);
        Self {
            table,
            step: step.clamp(1, 100),
        }
    }

    /// Parse normalized text. `None` when it is not a volume request.
    pub fn parse(&self, normalized: &str) -> Option<VolumeCommand> {
        if normalized == MUTE {
            return Some(VolumeCommand::Set(0));
        }
        let subject = self.table.find(PhraseCategory::VolumeSubject, normalized)?;

        if let Some(verb) = self.table.find(PhraseCategory::VolumeSet, normalized) {
            if let Some(percent) = self.number_after(normalized, &verb, &subject) {
                return Some(VolumeCommand::Set(clamp_percent(percent)));
            }
        }
        if self.table.contains(PhraseCategory::VolumeMax, normalized) {
            return Some(VolumeCommand::Set(100));
        }
        if self.table.contains(PhraseCategory::VolumeMin, normalized) {
            return Some(VolumeCommand::Set(0));
        }

        let up = self.table.find(PhraseCategory::VolumeUp, normalized);
        let down = self.table.find(PhraseCategory::VolumeDown, normalized);
        let (verb, is_up) = match (up, down) {
            (Some(u), Some(d)) if d.start < u.start => (d, false),
            (Some(u), _) => (u, true),
            (None, Some(d)) => (d, false),
            (None, None) => return None,
        };
        let percent = self
            .number_after(normalized, &verb, &subject)
            .map_or(self.step, clamp_percent);
        Some(VolumeCommand::Adjust { up: is_up, percent })
    }

    /// Number right after the verb, or right after the subject when the
    /// subject follows the verb (`调大音量20`). `一点` means "a bit", not 1.
    fn number_after(
        &self,
        text: &str,
        verb: &PhraseMatch<'_>,
        subject: &PhraseMatch<'_>,
    ) -> Option<u32> {
        let mut candidates = vec![verb.end];
        if subject.start >= verb.end {
            candidates.push(subject.end);
        }
        candidates.into_iter().find_map(|at| {
            let (value, rest) = leading_number(&text[at..])?;
            if rest.starts_with('点') || rest.starts_with('些') {
                return None;
            }
            Some(value)
        })
    }
}
