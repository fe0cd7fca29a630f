//! Mapping from a session mode to the command line that backs it.

use std::collections::HashMap;

use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::models::CreateSessionRequest;

/// Everything needed to start the process behind a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub executable: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub env: HashMap<String, String>,
    /// Name of the backing multiplexer session, when there is one.
    pub external_name: Option<String>,
}

pub trait ModeResolver: Send + Sync {
    fn resolve(&self, request: &CreateSessionRequest) -> BrokerResult<SpawnSpec>;
}

/// Built-in modes: `shell`, `tail` and `tmux`.
#[derive(Debug, Clone)]
pub struct DefaultModes {
    shell: String,
    enabled: Vec<String>,
}

impl DefaultModes {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            enabled: config.enabled_modes.iter().cloned().collect(),
        }
    }

    fn base_env(request: &CreateSessionRequest) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("TERM".to_string(), "xterm-256color".to_string());
        env.insert("COLORTERM".to_string(), "truecolor".to_string());
        if let Some(extra) = &request.env {
            env.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        env
    }
}

fn resolve_cwd(request: &CreateSessionRequest) -> String {
    request
        .cwd
        .clone()
        .filter(|cwd| !cwd.is_empty())
        .or_else(|| std::env::var("HOME").ok())
        .unwrap_or_else(|| "/".to_string())
}

/// tmux rejects `.` and `:` in session names.
fn sanitize_external_name(name: &str) -> String {
    name.chars()
        .map(|c| if c == '.' || c == ':' || c.is_whitespace() { '-' } else { c })
        .collect()
}

impl ModeResolver for DefaultModes {
    fn resolve(&self, request: &CreateSessionRequest) -> BrokerResult<SpawnSpec> {
        let mode = request.mode.as_str();
        if !self.enabled.iter().any(|m| m == mode) {
            return Err(BrokerError::ModeDisabled(mode.to_string()));
        }

        let cwd = resolve_cwd(request);
        let env = Self::base_env(request);

        match mode {
            "shell" => Ok(SpawnSpec {
                executable: self.shell.clone(),
                args: vec!["-l".to_string()],
                cwd,
                env,
                external_name: None,
            }),
            "tail" => {
                let path = request
                    .path
                    .clone()
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| BrokerError::BadRequest("tail mode requires a path".to_string()))?;
                Ok(SpawnSpec {
                    executable: "tail".to_string(),
                    args: vec!["-n".into(), "200".into(), "-F".into(), path],
                    cwd,
                    env,
                    external_name: None,
                })
            }
            "tmux" => {
                let name = sanitize_external_name(
                    request
                        .name
                        .as_deref()
                        .or(request.resume_key.as_deref())
                        .unwrap_or("ttyhub"),
                );
                Ok(SpawnSpec {
                    executable: "tmux".to_string(),
                    args: vec![
                        "new-session".into(),
                        "-A".into(),
                        "-s".into(),
                        name.clone(),
                    ],
                    cwd,
                    env,
                    external_name: Some(name),
                })
            }
            other => Err(BrokerError::ModeDisabled(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(mode: &str) -> CreateSessionRequest {
        CreateSessionRequest {
            mode: mode.to_string(),
            cwd: Some("/tmp".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn shell_mode_runs_login_shell() {
        let mut config = BrokerConfig::default();
        config.shell = "/bin/zsh".to_string();
        let spec = DefaultModes::new(&config).resolve(&request("shell")).unwrap();
        assert_eq!(spec.executable, "/bin/zsh");
        assert_eq!(spec.args, vec!["-l"]);
        assert_eq!(spec.cwd, "/tmp");
        assert_eq!(spec.env.get("TERM").map(String::as_str), Some("xterm-256color"));
    }

    #[test]
    fn tmux_mode_uses_stable_name() {
        let modes = DefaultModes::new(&BrokerConfig::default());
        let mut req = request("tmux");
        req.name = Some("work.main".to_string());
        let spec = modes.resolve(&req).unwrap();
        assert_eq!(spec.executable, "tmux");
        assert_eq!(spec.external_name.as_deref(), Some("work-main"));
        assert_eq!(spec.args.last().map(String::as_str), Some("work-main"));
    }

    #[test]
    fn tail_mode_needs_path() {
        let modes = DefaultModes::new(&BrokerConfig::default());
        assert!(matches!(
            modes.resolve(&request("tail")),
            Err(BrokerError::BadRequest(_))
        ));

        let mut req = request("tail");
        req.path = Some("/var/log/syslog".to_string());
        let spec = modes.resolve(&req).unwrap();
        assert_eq!(spec.args, vec!["-n", "200", "-F", "/var/log/syslog"]);
    }

    #[test]
    fn disabled_and_unknown_modes_fail() {
        let mut config = BrokerConfig::default();
        config.enabled_modes.remove("tmux");
        let modes = DefaultModes::new(&config);
        assert!(matches!(
            modes.resolve(&request("tmux")),
            Err(BrokerError::ModeDisabled(m)) if m == "tmux"
        ));
        assert!(matches!(
            modes.resolve(&request("vnc")),
            Err(BrokerError::ModeDisabled(_))
        ));
    }
}
