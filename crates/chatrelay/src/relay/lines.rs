//! Reassembles newline-delimited lines from arbitrarily fragmented chunks
//!
//! Upstream transports hand us bytes in whatever sizes the network produced,
//! so a single SSE line can be spread over several chunks and a chunk can
//! end in the middle of a multi-byte UTF-8 character. The reassembler keeps
//! the unterminated tail as raw bytes and only decodes complete lines, which
//! makes the output independent of how the input was partitioned.

use thiserror::Error;

/// A complete line contained bytes that are not valid UTF-8
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Upstream sent invalid UTF-8 at byte {valid_up_to} of a {line_len}-byte line")]
pub struct DecodeError {
    /// Offset of the first invalid byte within the line
    pub valid_up_to: usize,
    /// Length of the offending line in bytes
    pub line_len: usize,
}

/// Splits an incoming byte stream into lines, carrying a residue between calls
#[derive(Debug, Default)]
pub struct LineReassembler {
    residue: Vec<u8>,
}

impl LineReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every line it completed, in order.
    ///
    /// Lines are returned without their `\n`; a preceding `\r` is left for
    /// the classifier's trim. Bytes after the last newline stay buffered.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>, DecodeError> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            let line = if self.residue.is_empty() {
                decode(head)?
            } else {
                self.residue.extend_from_slice(head);
                let bytes = std::mem::take(&mut self.residue);
                decode(&bytes)?
            };
            lines.push(line);
        }

        self.residue.extend_from_slice(rest);
        Ok(lines)
    }

    /// Take the unterminated tail left at end of stream, if any
    pub fn finish(&mut self) -> Result<Option<String>, DecodeError> {
        if self.residue.is_empty() {
            return Ok(None);
        }
        let bytes = std::mem::take(&mut self.residue);
        decode(&bytes).map(Some)
    }

    /// Number of buffered bytes not yet terminated by a newline
    pub fn pending(&self) -> usize {
        self.residue.len()
    }
}

fn decode(bytes: &[u8]) -> Result<String, DecodeError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|e| DecodeError {
            valid_up_to: e.valid_up_to(),
            line_len: bytes.len(),
        })
}
