//! Bracketed control directives embedded in generated text.
//!
//! The model appends `[PLAY: 歌名]`, `[PLAY: RANDOM]` or `[STOP]` when the
//! user asked for music control. Tags are acted on after the stream ends and
//! must never reach the synthesizer.

/// Longest tag body held back before treating `[` as ordinary text.
const MAX_TAG_BYTES: usize = 96;

/// A control action requested by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Play the named track, or any track for `RANDOM`.
    Play(String),
    /// Stop the music.
    Stop,
}

/// Parse one tag body (the text between the brackets).
fn parse_tag(body: &str) -> Option<Directive> {
    let body = body.trim();
    if body.eq_ignore_ascii_case("STOP") {
        return Some(Directive::Stop);
    }
    let head = body.get(..4)?;
    if !head.eq_ignore_ascii_case("PLAY") {
        return None;
    }
    let rest = body[4..].trim_start();
    let name = rest
        .strip_prefix(':')
        .or_else(|| rest.strip_prefix('：'))?
        .trim();
    (!name.is_empty()).then(|| Directive::Play(name.to_owned()))
}

/// Every directive in `text`, in order of appearance.
pub fn extract_directives(text: &str) -> Vec<Directive> {
    let mut directives = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find('[') {
        let after = &rest[open + 1..];
        let Some(close) = after.find(']') else { break };
        if let Some(d) = parse_tag(&after[..close]) {
            directives.push(d);
        }
        rest = &after[close + 1..];
    }
    directives
}

/// Streaming filter that removes bracketed tags, even when a tag is split
/// across deltas. Everything after the first complete tag is suppressed.
#[derive(Debug, Default)]
pub struct ControlTagFilter {
    tag: Option<String>,
    closed: bool,
}

impl ControlTagFilter {
    /// Create a filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter one delta, returning the speakable part.
    pub fn push(&mut self, delta: &str) -> String {
        let mut out = String::with_capacity(delta.len());
        for c in delta.chars() {
            if self.closed {
                break;
            }
            match self.tag.as_mut() {
                Some(_) if c == ']' => {
                    self.tag = None;
                    self.closed = true;
                }
                Some(body) => {
                    body.push(c);
                    if body.len() > MAX_TAG_BYTES {
                        out.push('[');
                        out.push_str(body);
                        self.tag = None;
                    }
                }
                None if c == '[' => self.tag = Some(String::new()),
                None => out.push(c),
            }
        }
        out
    }

    /// Whether a tag has closed and the rest of the stream is suppressed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Remove emoji the synthesizer would read out or choke on.
pub fn strip_emoji(text: &str) -> String {
    text.chars()
        .filter(|c| {
            !matches!(
                u32::from(*c),
                0x1F300..=0x1F5FF
                    | 0x1F600..=0x1F64F
                    | 0x1F680..=0x1F6FF
                    | 0x1F900..=0x1F9FF
                    | 0x2600..=0x27BF
                    | 0xFE0F
            )
        })
        .collect()
}
