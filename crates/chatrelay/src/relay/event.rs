//! Classification of reassembled SSE lines

/// Literal line that ends an OpenAI-style stream
pub const DONE_LINE: &str = "data: [DONE]";

const DATA_PREFIX: &str = "data:";

/// The classified form of one upstream line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Terminal `data: [DONE]` marker
    Terminator,
    /// `data:` line with a non-empty payload, prefix and whitespace removed
    Data(String),
    /// Anything else, trimmed: comments, `event:`/`id:` fields, bare `data:`
    /// heartbeats, and blank separators (empty text)
    PassThrough(String),
}

impl SseEvent {
    /// Classify a single line. Surrounding whitespace, including a trailing
    /// `\r` from CRLF framing, is ignored.
    pub fn classify(line: &str) -> Self {
        let line = line.trim();

        if line == DONE_LINE {
            return SseEvent::Terminator;
        }

        if let Some(payload) = line.strip_prefix(DATA_PREFIX) {
            let payload = payload.trim();
            if !payload.is_empty() {
                return SseEvent::Data(payload.to_string());
            }
        }

        SseEvent::PassThrough(line.to_string())
    }

    /// Blank separator line
    pub fn is_blank(&self) -> bool {
        matches!(self, SseEvent::PassThrough(text) if text.is_empty())
    }
}
