//! ttyhub-terminal: terminal-side building blocks for the session broker
//!
//! This crate provides:
//! - `TerminalMirror`: off-screen `vt100` emulator with scrollback snapshots
//! - `OscScanner`: incremental OSC scanner for titles, cwd hints and activity signals
//! - `OutputTail`: ANSI-stripped, bounded tail of recent output
//! - `ByteRing`, `CharRing`: fixed-capacity ring buffers
//!
//! # Usage
//!
//! ```rust
//! use ttyhub_terminal::{OscEvent, OscScanner, TerminalMirror};
//!
//! let mut mirror = TerminalMirror::new(80, 24, 1000);
//! mirror.process(b"Hello, World!\r\n");
//! assert!(mirror.snapshot().contains("Hello, World!"));
//!
//! let mut scanner = OscScanner::default();
//! assert!(scanner.scan(b"\x1b]0;ti").is_empty());
//! assert_eq!(scanner.scan(b"tle\x07"), vec![OscEvent::Title("title".into())]);
//! ```

mod mirror;
mod ring;
mod scanner;
mod tail;

pub use mirror::{TerminalMirror, DEFAULT_SCROLLBACK_LINES};
pub use ring::{ByteRing, CharRing};
pub use scanner::{
    cwd_from_title, path_from_file_uri, ActivitySignal, OscEvent, OscScanner, ACTIVITY_OSC_CODE,
    DEFAULT_CARRY_CAPACITY,
};
pub use tail::{OutputTail, DEFAULT_TAIL_CHARS};
