use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::activity::ActivityState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub cols: u16,
    pub rows: u16,
}

impl Geometry {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateSessionRequest {
    #[serde(default = "default_mode")]
    pub mode: String,
    pub cwd: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    /// Stable external name, e.g. the tmux session to create or attach.
    pub name: Option<String>,
    /// Client-chosen idempotency key for "reattach to my session".
    pub resume_key: Option<String>,
    /// Snapshot saved by the client before a reload; replayed into the
    /// mirror ahead of any live output.
    pub initial_snapshot: Option<String>,
    /// File followed by the read-only `tail` mode.
    pub path: Option<String>,
    pub env: Option<HashMap<String, String>>,
}

fn default_mode() -> String {
    "shell".to_string()
}

impl Default for CreateSessionRequest {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            cwd: None,
            cols: None,
            rows: None,
            name: None,
            resume_key: None,
            initial_snapshot: None,
            path: None,
            env: None,
        }
    }
}

impl CreateSessionRequest {
    /// Requested geometry, falling back to `default` per missing dimension.
    pub fn geometry_or(&self, default: Geometry) -> Geometry {
        Geometry {
            cols: self.cols.unwrap_or(default.cols),
            rows: self.rows.unwrap_or(default.rows),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub owner: String,
    pub mode: String,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_key: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub created_at: f64,
    /// Seconds since the last input or output.
    pub idle_secs: f64,
    pub output_seq: u64,
    pub viewers: usize,
    pub activity: ActivityState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Terminal event sent when the process is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitEvent {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl ExitEvent {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// The process died from `signal` (e.g. `"SIGTERM"`).
    pub fn signaled(signal: &str) -> Self {
        Self {
            code: None,
            signal: Some(signal.to_string()),
        }
    }

    /// The broker killed the process (close, idle timeout, grace expiry, shutdown).
    pub fn killed() -> Self {
        Self::signaled("SIGKILL")
    }
}

/// Frames sent server -> client as WebSocket text. Raw output travels as
/// binary frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "snapshot")]
    Snapshot { data: String },

    #[serde(rename = "exit")]
    Exit {
        code: Option<i32>,
        signal: Option<String>,
    },
}

/// Control frames sent client -> server as WebSocket text.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "resize")]
    Resize { cols: u16, rows: u16 },

    #[serde(rename = "input")]
    Input { data: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSessionResponse {
    pub session: SessionInfo,
    /// True when an existing session matched the resume key.
    pub resumed: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputRequest {
    pub data: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MintTokenRequest {
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MintTokenResponse {
    pub token: String,
    pub expires_in_ms: u64,
    pub ws_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachQuery {
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_defaults() {
        let req: CreateSessionRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.mode, "shell");
        assert_eq!(req.geometry_or(Geometry::new(80, 24)), Geometry::new(80, 24));

        let req: CreateSessionRequest = serde_json::from_str(r#"{"cols": 120}"#).unwrap();
        assert_eq!(req.geometry_or(Geometry::new(80, 24)), Geometry::new(120, 24));
    }

    #[test]
    fn client_frames_parse() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"resize","cols":100,"rows":30}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Resize { cols: 100, rows: 30 }));
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn server_frames_serialize_with_type_tag() {
        let json = serde_json::to_value(ServerFrame::Exit {
            code: Some(0),
            signal: None,
        })
        .unwrap();
        assert_eq!(json["type"], "exit");
        assert_eq!(json["code"], 0);
    }
}
