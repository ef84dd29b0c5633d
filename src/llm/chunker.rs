//! Splits streamed text into speakable chunks.
//!
//! A chunk is cut as soon as a delta carries sentence punctuation or the
//! buffer outgrows its threshold. The first chunk uses a smaller threshold so
//! speech starts early.

/// Punctuation that ends a speakable chunk.
pub const CHUNK_PUNCTUATION: &[char] = &['，', '。', '！', '？', ',', '.', '!', '?', '\n'];

/// Buffers deltas until a chunk boundary.
#[derive(Debug, Clone)]
pub struct ChunkSplitter {
    first_threshold: usize,
    next_threshold: usize,
    buffer: String,
    first_sent: bool,
}

impl ChunkSplitter {
    /// Splitter with byte thresholds for the first and later chunks.
    pub fn new(first_threshold: usize, next_threshold: usize) -> Self {
        Self {
            first_threshold,
            next_threshold,
            buffer: String::new(),
            first_sent: false,
        }
    }

    /// Add a delta. Returns a chunk when a boundary was reached.
    pub fn push(&mut self, delta: &str) -> Option<String> {
        if delta.is_empty() {
            return None;
        }
        self.buffer.push_str(delta);
        let threshold = if self.first_sent {
            self.next_threshold
        } else {
            self.first_threshold
        };
        if delta.contains(CHUNK_PUNCTUATION) || self.buffer.len() > threshold {
            self.take()
        } else {
            None
        }
    }

    /// Whatever is left at the end of the stream.
    pub fn finish(&mut self) -> Option<String> {
        self.take()
    }

    fn take(&mut self) -> Option<String> {
        let text = std::mem::take(&mut self.buffer);
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        self.first_sent = true;
        Some(text.to_owned())
    }
}
