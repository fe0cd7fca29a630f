//! Off-screen terminal mirror.
//!
//! Replays the PTY byte stream into a `vt100` emulator and serializes
//! screen + scrollback into a snapshot string that, written into a fresh
//! terminal of the same size, reproduces what a long-attached viewer sees.
//!
//! The mirror is not safe under concurrent mutation; callers serialize every
//! operation (the broker runs it inside a single actor task).

use vt100::Parser;
use vte::Perform;

pub const DEFAULT_SCROLLBACK_LINES: usize = 5000;

const SHOW_PRIMARY: &[u8] = b"\x1b[?47l";
const SHOW_ALTERNATE: &[u8] = b"\x1b[?47h";
const ENTER_ALTERNATE: &[u8] = b"\x1b[?1049h";

/// Tracks whether the stream sits between escape sequences, so the mirror
/// can inject its own control sequences without splitting one.
///
/// Conservative: any byte that completes nothing clears the flag, and a
/// later print or dispatch sets it again.
struct Boundary {
    settled: bool,
    fired: bool,
}

impl Perform for Boundary {
    fn print(&mut self, _c: char) {
        self.fired = true;
        self.settled = true;
    }

    fn execute(&mut self, _byte: u8) {
        // C0 controls run inside sequences too; they keep the previous state
        self.fired = true;
    }

    fn csi_dispatch(&mut self, _params: &vte::Params, _intermediates: &[u8], _ignore: bool, _action: char) {
        self.fired = true;
        self.settled = true;
    }

    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, _byte: u8) {
        self.fired = true;
        self.settled = true;
    }
}

/// Terminal emulator state for one session.
pub struct TerminalMirror {
    parser: Parser,
    boundary_parser: vte::Parser,
    boundary: Boundary,
}

impl TerminalMirror {
    pub fn new(cols: u16, rows: u16, scrollback_lines: usize) -> Self {
        Self {
            parser: Parser::new(rows, cols, scrollback_lines),
            boundary_parser: vte::Parser::new(),
            boundary: Boundary {
                settled: true,
                fired: false,
            },
        }
    }

    /// Apply raw PTY output.
    pub fn process(&mut self, data: &[u8]) {
        self.parser.process(data);
        for byte in data {
            self.boundary.fired = false;
            self.boundary_parser.advance(&mut self.boundary, *byte);
            if !self.boundary.fired {
                self.boundary.settled = false;
            }
        }
    }

    /// Apply a client-supplied snapshot before any live data.
    pub fn seed(&mut self, snapshot: &str) {
        self.process(snapshot.as_bytes());
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.parser.screen_mut().set_size(rows, cols);
    }

    /// Current `(cols, rows)`.
    pub fn geometry(&self) -> (u16, u16) {
        let (rows, cols) = self.parser.screen().size();
        (cols, rows)
    }

    /// `(row, col)` of the cursor on the visible screen.
    pub fn cursor_position(&self) -> (u16, u16) {
        self.parser.screen().cursor_position()
    }

    /// Number of lines currently held in scrollback.
    pub fn scrollback_depth(&mut self) -> usize {
        self.parser.screen_mut().set_scrollback(usize::MAX);
        let depth = self.parser.screen().scrollback();
        self.parser.screen_mut().set_scrollback(0);
        depth
    }

    /// Unformatted contents of the visible screen.
    pub fn plain_text(&self) -> String {
        self.parser.screen().contents()
    }

    /// Serialize scrollback (oldest first) followed by the visible screen.
    ///
    /// History rows are printed line by line and then scrolled off the top
    /// so they land in the receiving terminal's scrollback; the visible
    /// screen, cursor and input modes are then redrawn in place. While a
    /// program holds the alternate screen, the primary screen is written
    /// first and the alternate one is drawn after entering it, so the
    /// viewer gets its shell back when the program exits.
    pub fn snapshot(&mut self) -> String {
        let mut out: Vec<u8> = Vec::new();

        if self.parser.screen().alternate_screen() && self.boundary.settled {
            self.parser.process(SHOW_PRIMARY);
            self.write_primary(&mut out);
            self.parser.process(SHOW_ALTERNATE);

            out.extend_from_slice(ENTER_ALTERNATE);
            out.extend_from_slice(&self.parser.screen().state_formatted());
        } else {
            self.write_primary(&mut out);
        }

        String::from_utf8_lossy(&out).into_owned()
    }

    /// Scrollback plus the active screen. Scrollback is only reachable
    /// while the primary screen is active.
    fn write_primary(&mut self, out: &mut Vec<u8>) {
        let (rows, cols) = self.parser.screen().size();

        // set_scrollback clamps to the available history
        self.parser.screen_mut().set_scrollback(usize::MAX);
        let depth = self.parser.screen().scrollback();

        if depth > 0 {
            out.extend_from_slice(b"\x1b[m\x1b[H");
            for offset in (1..=depth).rev() {
                self.parser.screen_mut().set_scrollback(offset);
                if let Some(row) = self.parser.screen().rows_formatted(0, cols).next() {
                    out.extend_from_slice(&row);
                }
                out.extend_from_slice(b"\x1b[m\r\n");
            }
            for _ in 1..rows {
                out.push(b'\n');
            }
        }

        self.parser.screen_mut().set_scrollback(0);
        out.extend_from_slice(&self.parser.screen().state_formatted());
    }
}

impl std::fmt::Debug for TerminalMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (cols, rows) = self.geometry();
        f.debug_struct("TerminalMirror")
            .field("cols", &cols)
            .field("rows", &rows)
            .finish()
    }
}
