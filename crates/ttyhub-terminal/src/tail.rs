//! Best-effort plain-text tail of recent PTY output.
//!
//! Escape sequences are stripped with a persistent `vte` parser so that a
//! sequence split across chunks never leaks into the text. The tail is
//! lossy and capped; it is not the scrollback (see [`crate::TerminalMirror`]).

use vte::{Params, Parser, Perform};

use crate::ring::CharRing;

pub const DEFAULT_TAIL_CHARS: usize = 4000;

/// Collects printable characters into a bounded ring.
struct TailSink {
    ring: CharRing,
    /// Text printed during the current `push`.
    chunk: String,
    /// Consecutive newlines seen; blank line runs collapse to one empty line.
    newlines: u8,
}

impl TailSink {
    fn push_newline(&mut self) {
        if self.newlines >= 2 || self.ring.is_empty() {
            return;
        }
        self.ring.push('\n');
        self.chunk.push('\n');
        self.newlines += 1;
    }
}

impl Perform for TailSink {
    fn print(&mut self, c: char) {
        self.ring.push(c);
        self.chunk.push(c);
        self.newlines = 0;
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' => self.push_newline(),
            b'\t' => self.print(' '),
            _ => {}
        }
    }

    fn csi_dispatch(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, action: char) {
        // Cursor-down / next-line moves usually separate visual lines
        if matches!(action, 'E' | 'B') && self.ring.last() != Some('\n') {
            self.push_newline();
        }
    }
}

/// ANSI-stripped, char-bounded tail of the output stream.
pub struct OutputTail {
    parser: Parser,
    sink: TailSink,
}

impl OutputTail {
    pub fn new(char_budget: usize) -> Self {
        Self {
            parser: Parser::new(),
            sink: TailSink {
                ring: CharRing::new(char_budget),
                chunk: String::new(),
                newlines: 0,
            },
        }
    }

    /// Feed a chunk and return the text it contributed.
    pub fn push(&mut self, data: &[u8]) -> &str {
        self.sink.chunk.clear();
        for byte in data {
            self.parser.advance(&mut self.sink, *byte);
        }
        &self.sink.chunk
    }

    /// Entire retained tail.
    pub fn text(&self) -> String {
        self.sink.ring.as_string()
    }

    pub fn len(&self) -> usize {
        self.sink.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sink.ring.is_empty()
    }
}

impl Default for OutputTail {
    fn default() -> Self {
        Self::new(DEFAULT_TAIL_CHARS)
    }
}

impl std::fmt::Debug for OutputTail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputTail")
            .field("len", &self.len())
            .finish()
    }
}
