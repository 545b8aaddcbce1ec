//! Completion detection for control-RPC replies.
//!
//! Agents do not length-prefix their replies, so the reader keeps pulling chunks until the
//! buffer holds one complete JSON object. Two detectors are available:
//!
//! - [`FramingMode::Structural`] tracks object depth and skips braces inside string
//!   literals (escape aware). Complete once the first top-level object closes.
//! - [`FramingMode::BraceCount`] counts every `{` and `}` in the buffer and is complete
//!   when both counts match. Kept for agents that were tuned against it.

use serde::{Deserialize, Serialize};

/// Replies larger than this are treated as a protocol violation.
pub const MAX_RESPONSE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingMode {
    #[default]
    Structural,
    BraceCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Pending,
    Complete,
    Overflow,
}

/// Incremental reply buffer. Each byte is scanned once.
#[derive(Debug)]
pub struct ResponseAccumulator {
    mode: FramingMode,
    buf: Vec<u8>,
    depth: usize,
    in_string: bool,
    escaped: bool,
    seen_open: bool,
    opens: usize,
    closes: usize,
    complete: bool,
}

impl ResponseAccumulator {
    pub fn new(mode: FramingMode) -> Self {
        Self {
            mode,
            buf: Vec::with_capacity(4096),
            depth: 0,
            in_string: false,
            escaped: false,
            seen_open: false,
            opens: 0,
            closes: 0,
            complete: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Progress {
        if self.complete {
            return Progress::Complete;
        }
        if self.buf.len() + chunk.len() > MAX_RESPONSE_BYTES {
            return Progress::Overflow;
        }
        let start = self.buf.len();
        self.buf.extend_from_slice(chunk);

        for i in start..self.buf.len() {
            let b = self.buf[i];
            match self.mode {
                FramingMode::BraceCount => match b {
                    b'{' => self.opens += 1,
                    b'}' => self.closes += 1,
                    _ => {}
                },
                FramingMode::Structural => {
                    if self.scan_structural(b) {
                        self.complete = true;
                        // bytes after the first object are dropped
                        self.buf.truncate(i + 1);
                        return Progress::Complete;
                    }
                }
            }
        }

        if self.mode == FramingMode::BraceCount && self.opens > 0 && self.opens == self.closes {
            self.complete = true;
            return Progress::Complete;
        }
        Progress::Pending
    }

    /// Returns true when `b` closes the first top-level object.
    fn scan_structural(&mut self, b: u8) -> bool {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if b == b'\\' {
                self.escaped = true;
            } else if b == b'"' {
                self.in_string = false;
            }
            return false;
        }
        match b {
            b'"' if self.seen_open => self.in_string = true,
            b'{' => {
                self.seen_open = true;
                self.depth += 1;
            }
            b'}' if self.depth > 0 => {
                self.depth -= 1;
                return self.depth == 0;
            }
            _ => {}
        }
        false
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Buffer contents as text. Invalid UTF-8 is replaced rather than rejected; the JSON
    /// parser reports the damage.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}
