use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use ttyhub_terminal::{DEFAULT_CARRY_CAPACITY, DEFAULT_SCROLLBACK_LINES, DEFAULT_TAIL_CHARS};

use crate::models::Geometry;

pub const DEFAULT_PORT: u16 = 39390;

/// Runtime limits and timeouts of the broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub max_sessions_per_owner: usize,
    /// Sessions with no input or output for this long are torn down.
    pub idle_timeout: Duration,
    /// How long a session lives with zero viewers.
    pub detach_grace: Duration,
    pub sweep_interval: Duration,
    pub token_ttl: Duration,
    /// Running reverts to Idle after this long without heuristic evidence.
    pub activity_revert: Duration,
    pub tail_chars: usize,
    pub carry_bytes: usize,
    pub scrollback_lines: usize,
    pub min_cols: u16,
    pub max_cols: u16,
    pub min_rows: u16,
    pub max_rows: u16,
    pub default_geometry: Geometry,
    pub enabled_modes: BTreeSet<String>,
    pub shell: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_owner: 8,
            idle_timeout: Duration::from_secs(12 * 60 * 60),
            detach_grace: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(30),
            token_ttl: Duration::from_secs(30),
            activity_revert: Duration::from_secs(2),
            tail_chars: DEFAULT_TAIL_CHARS,
            carry_bytes: DEFAULT_CARRY_CAPACITY,
            scrollback_lines: DEFAULT_SCROLLBACK_LINES,
            min_cols: 10,
            max_cols: 1000,
            min_rows: 5,
            max_rows: 500,
            default_geometry: Geometry::new(80, 24),
            enabled_modes: ["shell", "tail", "tmux"]
                .into_iter()
                .map(String::from)
                .collect(),
            shell: default_shell(),
        }
    }
}

impl BrokerConfig {
    /// Whether `geometry` is inside the configured bounds.
    pub fn accepts(&self, geometry: Geometry) -> bool {
        (self.min_cols..=self.max_cols).contains(&geometry.cols)
            && (self.min_rows..=self.max_rows).contains(&geometry.rows)
    }

    pub fn mode_enabled(&self, mode: &str) -> bool {
        self.enabled_modes.contains(mode)
    }
}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}

/// `serve` options. Every limit can also come from a `TTYHUB_*` variable.
#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address the HTTP server binds to
    #[arg(long, env = "TTYHUB_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port for the HTTP server
    #[arg(short, long, env = "TTYHUB_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, env = "TTYHUB_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Maximum concurrent sessions per owner
    #[arg(long, env = "TTYHUB_MAX_SESSIONS", default_value_t = 8)]
    pub max_sessions: usize,

    /// Idle timeout in seconds
    #[arg(long, env = "TTYHUB_IDLE_TIMEOUT_SECS", default_value_t = 12 * 60 * 60)]
    pub idle_timeout_secs: u64,

    /// Seconds a session survives with no attached viewer
    #[arg(long, env = "TTYHUB_DETACH_GRACE_SECS", default_value_t = 300)]
    pub detach_grace_secs: u64,

    /// Seconds between idle sweeps
    #[arg(long, env = "TTYHUB_SWEEP_INTERVAL_SECS", default_value_t = 30)]
    pub sweep_interval_secs: u64,

    /// Attach token lifetime in seconds
    #[arg(long, env = "TTYHUB_TOKEN_TTL_SECS", default_value_t = 30)]
    pub token_ttl_secs: u64,

    /// Milliseconds of quiet before a heuristic "running" reverts to idle
    #[arg(long, env = "TTYHUB_ACTIVITY_REVERT_MS", default_value_t = 2000)]
    pub activity_revert_ms: u64,

    /// Lines of scrollback kept by each session mirror
    #[arg(long, env = "TTYHUB_SCROLLBACK_LINES", default_value_t = DEFAULT_SCROLLBACK_LINES)]
    pub scrollback_lines: usize,

    /// Comma-separated list of enabled session modes
    #[arg(
        long,
        env = "TTYHUB_MODES",
        value_delimiter = ',',
        default_value = "shell,tail,tmux"
    )]
    pub modes: Vec<String>,

    /// Shell used by the `shell` mode (defaults to $SHELL)
    #[arg(long, env = "TTYHUB_SHELL")]
    pub shell: Option<String>,
}

impl ServerArgs {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn to_config(&self) -> BrokerConfig {
        let defaults = BrokerConfig::default();
        BrokerConfig {
            max_sessions_per_owner: self.max_sessions,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            detach_grace: Duration::from_secs(self.detach_grace_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            token_ttl: Duration::from_secs(self.token_ttl_secs),
            activity_revert: Duration::from_millis(self.activity_revert_ms),
            scrollback_lines: self.scrollback_lines,
            enabled_modes: self
                .modes
                .iter()
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect(),
            shell: self.shell.clone().unwrap_or(defaults.shell.clone()),
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: ServerArgs,
    }

    #[test]
    fn geometry_bounds_are_inclusive() {
        let config = BrokerConfig::default();
        assert!(config.accepts(Geometry::new(10, 5)));
        assert!(config.accepts(Geometry::new(1000, 500)));
        assert!(!config.accepts(Geometry::new(9, 24)));
        assert!(!config.accepts(Geometry::new(80, 501)));
        assert!(!config.accepts(Geometry::new(0, 0)));
    }

    #[test]
    fn args_convert_to_config() {
        let cli = TestCli::parse_from([
            "ttyhub",
            "--max-sessions",
            "2",
            "--detach-grace-secs",
            "10",
            "--modes",
            "shell, tmux",
            "--shell",
            "/bin/sh",
        ]);
        let config = cli.args.to_config();
        assert_eq!(config.max_sessions_per_owner, 2);
        assert_eq!(config.detach_grace, Duration::from_secs(10));
        assert!(config.mode_enabled("shell"));
        assert!(config.mode_enabled("tmux"));
        assert!(!config.mode_enabled("tail"));
        assert_eq!(config.shell, "/bin/sh");
        assert_eq!(config.default_geometry, Geometry::new(80, 24));
    }
}
