//! Advisory "is the foreground program busy" state.
//!
//! Explicit OSC signals from the program win over the output heuristic:
//! an explicit `running` locks the state until an explicit `idle`/`done`.

use serde::{Deserialize, Serialize};
use ttyhub_terminal::ActivitySignal;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    #[default]
    Idle,
    Running,
    Done,
}

/// What the caller should do with the idle-reversion timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heuristic {
    /// Output looked busy: (re)arm the timer.
    Armed,
    Ignored,
}

const SPINNER_GLYPHS: &[char] = &[
    '⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏', '✻', '✽', '✶', '✢',
];

const BUSY_MARKERS: &[&str] = &["esc to interrupt", "Thinking…", "Working…", "Thinking...", "Working..."];

fn looks_busy(text: &str) -> bool {
    text.chars().any(|c| SPINNER_GLYPHS.contains(&c))
        || BUSY_MARKERS.iter().any(|marker| text.contains(marker))
}

#[derive(Debug, Clone, Default)]
pub struct ActivityTracker {
    state: ActivityState,
    locked: bool,
}

impl ActivityTracker {
    pub fn state(&self) -> ActivityState {
        self.state
    }

    /// Apply an explicit signal. Returns whether the state changed.
    pub fn on_signal(&mut self, signal: ActivitySignal) -> bool {
        let next = match signal {
            ActivitySignal::Running => ActivityState::Running,
            ActivitySignal::Idle => ActivityState::Idle,
            ActivitySignal::Done => ActivityState::Done,
        };
        self.locked = next == ActivityState::Running;
        let changed = next != self.state;
        self.state = next;
        changed
    }

    /// Run the output heuristic on stripped text.
    pub fn on_output(&mut self, text: &str) -> Heuristic {
        if self.locked || !looks_busy(text) {
            return Heuristic::Ignored;
        }
        self.state = ActivityState::Running;
        Heuristic::Armed
    }

    /// Idle-reversion timer fired. Returns whether the state changed.
    pub fn revert(&mut self) -> bool {
        if self.locked || self.state != ActivityState::Running {
            return false;
        }
        self.state = ActivityState::Idle;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle_and_unlocked() {
        let mut tracker = ActivityTracker::default();
        assert_eq!(tracker.state(), ActivityState::Idle);
        assert_eq!(tracker.on_output("⠋"), Heuristic::Armed);
    }

    #[test]
    fn heuristic_arms_and_reverts() {
        let mut tracker = ActivityTracker::default();
        assert_eq!(tracker.on_output("plain output"), Heuristic::Ignored);
        assert_eq!(tracker.state(), ActivityState::Idle);

        assert_eq!(tracker.on_output("⠙ Thinking… (esc to interrupt)"), Heuristic::Armed);
        assert_eq!(tracker.state(), ActivityState::Running);

        assert!(tracker.revert());
        assert_eq!(tracker.state(), ActivityState::Idle);
        assert!(!tracker.revert());
    }

    #[test]
    fn explicit_running_locks_out_heuristic_and_revert() {
        let mut tracker = ActivityTracker::default();
        assert!(tracker.on_signal(ActivitySignal::Running));

        assert_eq!(tracker.on_output("esc to interrupt"), Heuristic::Ignored);
        assert!(!tracker.revert());
        assert_eq!(tracker.state(), ActivityState::Running);
    }

    #[test]
    fn explicit_done_unlocks() {
        let mut tracker = ActivityTracker::default();
        tracker.on_signal(ActivitySignal::Running);
        assert!(tracker.on_signal(ActivitySignal::Done));
        assert_eq!(tracker.state(), ActivityState::Done);

        assert_eq!(tracker.on_output("⠋"), Heuristic::Armed);
        assert_eq!(tracker.state(), ActivityState::Running);
    }

    #[test]
    fn repeated_signal_reports_no_change() {
        let mut tracker = ActivityTracker::default();
        assert!(!tracker.on_signal(ActivitySignal::Idle));
        assert!(tracker.on_signal(ActivitySignal::Running));
        assert!(!tracker.on_signal(ActivitySignal::Running));
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ActivityState::Running).unwrap(),
            "\"running\""
        );
    }
}
