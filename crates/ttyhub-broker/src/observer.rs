use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    UserClose,
    ProcessExit,
    IdleTimeout,
    DetachGraceExpired,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::UserClose => "user_close",
            CloseReason::ProcessExit => "process_exit",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::DetachGraceExpired => "detach_grace_expired",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hooks for side consumers (persistence, audit, notifications).
///
/// Called outside every session lock. Output is delivered from a
/// per-session task, in order, so a slow observer only delays itself.
pub trait SessionObserver: Send + Sync {
    fn on_output(&self, _session_id: &str, _bytes: &[u8]) {}
    fn on_session_closed(&self, session_id: &str, reason: CloseReason);
}

#[derive(Debug, Default, Clone)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {
    fn on_session_closed(&self, _session_id: &str, _reason: CloseReason) {}
}

/// Audit trail through `tracing`.
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl SessionObserver for TracingObserver {
    fn on_session_closed(&self, session_id: &str, reason: CloseReason) {
        info!("[session:{}] Closed ({})", session_id, reason);
    }
}
