//! OSC (Operating System Command) scanner.
//!
//! Extracts out-of-band metadata from PTY output: window titles, working
//! directory hints and the application-defined activity signal. The scanner
//! is incremental: a sequence whose introducer arrives at the end of one chunk
//! and whose terminator arrives in the next is parsed exactly as if it had
//! been delivered in one piece.
//!
//! Recognized forms (terminated by BEL or `ESC \`):
//! - `ESC ] 0 ; title` / `ESC ] 2 ; title` - window title
//! - `ESC ] 7 ; file://host/path` - working directory
//! - `ESC ] 1337 ; CurrentDir=/path` - working directory (iTerm2 style)
//! - `ESC ] 7777 ; running|idle|done` - explicit activity signal

use std::fmt;
use std::str::FromStr;

use crate::ring::ByteRing;

/// OSC code reserved for the explicit activity signal.
pub const ACTIVITY_OSC_CODE: &str = "7777";

/// Default cap for a single in-flight sequence.
pub const DEFAULT_CARRY_CAPACITY: usize = 4096;

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;
const CAN: u8 = 0x18;
const SUB: u8 = 0x1a;

/// Explicit activity signal emitted by cooperating CLIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivitySignal {
    Running,
    Idle,
    Done,
}

impl ActivitySignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivitySignal::Running => "running",
            ActivitySignal::Idle => "idle",
            ActivitySignal::Done => "done",
        }
    }
}

impl fmt::Display for ActivitySignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivitySignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        let value = value.strip_prefix("state=").unwrap_or(value);
        match value.to_ascii_lowercase().as_str() {
            "running" | "busy" => Ok(ActivitySignal::Running),
            "idle" => Ok(ActivitySignal::Idle),
            "done" => Ok(ActivitySignal::Done),
            other => Err(format!("unknown activity signal: {other}")),
        }
    }
}

/// Metadata extracted from a completed OSC sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OscEvent {
    Title(String),
    WorkingDirectory(String),
    Activity(ActivitySignal),
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
enum ScanState {
    #[default]
    Normal,
    /// Saw ESC outside of a sequence
    Escape,
    /// Inside `ESC ]`, accumulating code and payload
    Osc,
    /// Saw ESC inside an OSC; `\` terminates
    OscEscape,
}

/// Stateful, chunk-boundary tolerant OSC scanner.
#[derive(Debug)]
pub struct OscScanner {
    state: ScanState,
    /// Carry-over for the sequence currently being read.
    carry: ByteRing,
    /// `carry.dropped()` when the current sequence started; any growth means
    /// the sequence overflowed the cap and must not be dispatched.
    dropped_mark: u64,
}

impl Default for OscScanner {
    fn default() -> Self {
        Self::new(DEFAULT_CARRY_CAPACITY)
    }
}

impl OscScanner {
    pub fn new(carry_capacity: usize) -> Self {
        Self {
            state: ScanState::Normal,
            carry: ByteRing::new(carry_capacity),
            dropped_mark: 0,
        }
    }

    /// Number of bytes currently held for an unterminated sequence.
    pub fn pending_len(&self) -> usize {
        self.carry.len()
    }

    /// Feed one chunk of PTY output and return every sequence it completed.
    pub fn scan(&mut self, data: &[u8]) -> Vec<OscEvent> {
        let mut events = Vec::new();

        for &byte in data {
            match self.state {
                ScanState::Normal => {
                    if byte == ESC {
                        self.state = ScanState::Escape;
                    }
                }
                ScanState::Escape => {
                    self.state = match byte {
                        b']' => {
                            self.begin_sequence();
                            ScanState::Osc
                        }
                        ESC => ScanState::Escape,
                        _ => ScanState::Normal,
                    };
                }
                ScanState::Osc => match byte {
                    BEL => {
                        self.finish_sequence(&mut events);
                        self.state = ScanState::Normal;
                    }
                    ESC => self.state = ScanState::OscEscape,
                    CAN | SUB => {
                        self.carry.clear();
                        self.state = ScanState::Normal;
                    }
                    _ => self.carry.push(&[byte]),
                },
                ScanState::OscEscape => {
                    if byte == b'\\' {
                        self.finish_sequence(&mut events);
                        self.state = ScanState::Normal;
                    } else if byte == b']' {
                        // Unterminated sequence followed by a new OSC
                        self.begin_sequence();
                        self.state = ScanState::Osc;
                    } else {
                        // Any other escape aborts the OSC
                        self.carry.clear();
                        self.state = ScanState::Normal;
                    }
                }
            }
        }

        events
    }

    fn begin_sequence(&mut self) {
        self.carry.clear();
        self.dropped_mark = self.carry.dropped();
    }

    fn finish_sequence(&mut self, events: &mut Vec<OscEvent>) {
        let overflowed = self.carry.dropped() != self.dropped_mark;
        let content = self.carry.take();
        if overflowed {
            return;
        }
        dispatch(&content, events);
    }
}

fn dispatch(content: &[u8], events: &mut Vec<OscEvent>) {
    let text = String::from_utf8_lossy(content);
    let (code, payload) = match text.split_once(';') {
        Some((code, payload)) => (code, payload),
        None => (text.as_ref(), ""),
    };

    match code {
        "0" | "2" => {
            let title = payload.trim();
            if title.is_empty() {
                return;
            }
            events.push(OscEvent::Title(title.to_string()));
            if let Some(cwd) = cwd_from_title(title) {
                events.push(OscEvent::WorkingDirectory(cwd));
            }
        }
        "7" => {
            if let Some(cwd) = path_from_file_uri(payload.trim()) {
                events.push(OscEvent::WorkingDirectory(cwd));
            }
        }
        "1337" => {
            if let Some(dir) = payload.trim().strip_prefix("CurrentDir=") {
                if !dir.is_empty() {
                    events.push(OscEvent::WorkingDirectory(dir.to_string()));
                }
            }
        }
        ACTIVITY_OSC_CODE => {
            if let Ok(signal) = payload.parse::<ActivitySignal>() {
                events.push(OscEvent::Activity(signal));
            }
        }
        _ => {}
    }
}

/// Guess a working directory from a window title.
///
/// Shells commonly set titles like `user@host: ~/src`, `user@host:/tmp`,
/// `host: /var/log` or just `~/src`. `file://` URIs are also accepted.
pub fn cwd_from_title(title: &str) -> Option<String> {
    let title = title.trim();
    if title.starts_with("file://") {
        return path_from_file_uri(title);
    }

    let candidate = match title.find('@') {
        Some(at) => {
            let after_at = &title[at + 1..];
            let colon = after_at.find(':')?;
            after_at[colon + 1..].trim()
        }
        None => match title.split_once(": ") {
            Some((host, rest)) if !host.contains(char::is_whitespace) => rest.trim(),
            _ => title,
        },
    };

    if looks_like_path(candidate) {
        Some(candidate.to_string())
    } else {
        None
    }
}

fn looks_like_path(s: &str) -> bool {
    if s.is_empty() || s.contains('\n') {
        return false;
    }
    (s.starts_with('/') || s == "~" || s.starts_with("~/")) && !s.contains("  ")
}

/// Extract the path component of a `file://host/path` URI, percent-decoded.
pub fn path_from_file_uri(uri: &str) -> Option<String> {
    let rest = uri.strip_prefix("file://")?;
    // Skip the hostname (everything up to the next /)
    let path = match rest.find('/') {
        Some(slash) => &rest[slash..],
        None => return None,
    };
    let decoded = percent_decode(path);
    if decoded.is_empty() {
        None
    } else {
        Some(decoded)
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(chunks: &[&[u8]]) -> Vec<OscEvent> {
        let mut scanner = OscScanner::default();
        chunks.iter().flat_map(|c| scanner.scan(c)).collect()
    }

    #[test]
    fn parses_bel_terminated_title() {
        let events = scan_all(&[b"hello\x1b]0;my title\x07world"]);
        assert_eq!(events, vec![OscEvent::Title("my title".into())]);
    }

    #[test]
    fn parses_st_terminated_title() {
        let events = scan_all(&[b"\x1b]2;other\x1b\\"]);
        assert_eq!(events, vec![OscEvent::Title("other".into())]);
    }

    #[test]
    fn split_sequence_matches_whole_sequence() {
        let whole: &[u8] = b"pre\x1b]0;dev@box: ~/proj\x07post";
        let expected = scan_all(&[whole]);
        assert_eq!(
            expected,
            vec![
                OscEvent::Title("dev@box: ~/proj".into()),
                OscEvent::WorkingDirectory("~/proj".into()),
            ]
        );

        for split in 0..=whole.len() {
            let (a, b) = whole.split_at(split);
            assert_eq!(scan_all(&[a, b]), expected, "split at {split}");
        }
    }

    #[test]
    fn split_st_terminator() {
        let events = scan_all(&[b"\x1b]2;title\x1b", b"\\"]);
        assert_eq!(events, vec![OscEvent::Title("title".into())]);
    }

    #[test]
    fn unterminated_sequence_is_carried() {
        let mut scanner = OscScanner::default();
        assert!(scanner.scan(b"\x1b]0;partial").is_empty());
        assert_eq!(scanner.pending_len(), "0;partial".len());
        let events = scanner.scan(b" title\x07");
        assert_eq!(events, vec![OscEvent::Title("partial title".into())]);
        assert_eq!(scanner.pending_len(), 0);
    }

    #[test]
    fn oversized_sequence_is_dropped_and_bounded() {
        let mut scanner = OscScanner::new(16);
        scanner.scan(b"\x1b]0;");
        scanner.scan(&[b'x'; 100]);
        assert!(scanner.pending_len() <= 16);
        assert!(scanner.scan(b"\x07").is_empty());

        // Scanner recovers for the next sequence
        let events = scanner.scan(b"\x1b]0;ok\x07");
        assert_eq!(events, vec![OscEvent::Title("ok".into())]);
    }

    #[test]
    fn parses_osc7_working_directory() {
        let events = scan_all(&[b"\x1b]7;file://host/home/me/my%20project\x07"]);
        assert_eq!(
            events,
            vec![OscEvent::WorkingDirectory("/home/me/my project".into())]
        );
    }

    #[test]
    fn parses_iterm_current_dir() {
        let events = scan_all(&[b"\x1b]1337;CurrentDir=/srv/app\x07"]);
        assert_eq!(events, vec![OscEvent::WorkingDirectory("/srv/app".into())]);
    }

    #[test]
    fn parses_activity_signals() {
        let events = scan_all(&[
            b"\x1b]7777;running\x07",
            b"\x1b]7777;state=done\x1b\\",
            b"\x1b]7777;idle\x07",
            b"\x1b]7777;bogus\x07",
        ]);
        assert_eq!(
            events,
            vec![
                OscEvent::Activity(ActivitySignal::Running),
                OscEvent::Activity(ActivitySignal::Done),
                OscEvent::Activity(ActivitySignal::Idle),
            ]
        );
    }

    #[test]
    fn ignores_other_escapes() {
        let events = scan_all(&[b"\x1b[31mred\x1b[0m \x1b]52;c;Zm9v\x07"]);
        assert!(events.is_empty());
    }

    #[test]
    fn can_aborts_sequence() {
        let events = scan_all(&[b"\x1b]0;abc\x18def\x07"]);
        assert!(events.is_empty());
    }

    #[test]
    fn title_heuristics() {
        assert_eq!(cwd_from_title("me@host:/tmp"), Some("/tmp".into()));
        assert_eq!(cwd_from_title("me@host: ~/src/app"), Some("~/src/app".into()));
        assert_eq!(cwd_from_title("server: /var/log"), Some("/var/log".into()));
        assert_eq!(cwd_from_title("~"), Some("~".into()));
        assert_eq!(cwd_from_title("file:///etc"), Some("/etc".into()));
        assert_eq!(cwd_from_title("vim README.md"), None);
        assert_eq!(cwd_from_title("me@host"), None);
    }

    #[test]
    fn non_file_uri_is_rejected() {
        assert_eq!(path_from_file_uri("http://example.com/x"), None);
        assert_eq!(path_from_file_uri("file://hostonly"), None);
    }
}
