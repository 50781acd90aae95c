//! Layered configuration: CLI > env > TOML > built-in default.
//!
//! Mirrors `clawd::config::DaemonConfig`'s resolution order. The TOML layer
//! is error-tolerant: a missing or malformed file falls back to defaults
//! with a `warn!`, never a hard failure.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;
use tracing::warn;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:4777";
const DEFAULT_MAX_LINE_BYTES: usize = 100 * 1024;
const DEFAULT_KILL_GRACE_MS: u64 = 5_000;
const DEFAULT_BASH_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MAX_CONCURRENT_SESSIONS: usize = 16;
const DEFAULT_TOOL_OUTPUT_CAP_BYTES: usize = 100 * 1024;

/// CLI flags (`clap::Parser` derive), the highest-priority configuration
/// layer.
#[derive(Debug, Parser)]
#[command(name = "agentbrokerd", about = "Local agent-session broker daemon")]
pub struct Args {
    /// Address the BoundaryAPI listens on (WebSocket + shared-port health check).
    #[arg(long, env = "AGENTBROKERD_BIND_ADDR")]
    pub bind_addr: Option<String>,

    /// Path to a TOML config file. Defaults to `~/.config/agentbrokerd/config.toml`.
    #[arg(long, env = "AGENTBROKERD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to a file containing the bearer auth token. Never embedded in TOML.
    #[arg(long, env = "AGENTBROKERD_AUTH_TOKEN_FILE")]
    pub auth_token_file: Option<PathBuf>,

    /// Emit logs as JSON instead of human-readable text.
    #[arg(long, env = "AGENTBROKERD_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Optional log file; when set, logs are additionally written here via a
    /// non-blocking rolling appender.
    #[arg(long, env = "AGENTBROKERD_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

/// The on-disk TOML shape. Every field optional — an absent or malformed
/// file simply contributes no overrides.
#[derive(Debug, Default, Deserialize)]
struct TomlConfig {
    bind_addr: Option<String>,
    max_line_bytes: Option<usize>,
    kill_grace_ms: Option<u64>,
    bash_timeout_secs: Option<u64>,
    max_concurrent_sessions: Option<usize>,
    tool_output_cap_bytes: Option<usize>,
    permission_mode: Option<String>,
}

impl TomlConfig {
    fn load(path: &std::path::Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<TomlConfig>(&contents) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "malformed config file, using defaults");
                    TomlConfig::default()
                }
            },
            Err(err) => {
                warn!(path = %path.display(), error = %err, "config file not found, using defaults");
                TomlConfig::default()
            }
        }
    }
}

/// Resolved, immutable configuration shared through `AppContext`.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub bind_addr: String,
    pub max_line_bytes: usize,
    pub kill_grace: std::time::Duration,
    pub bash_timeout: std::time::Duration,
    pub max_concurrent_sessions: usize,
    pub tool_output_cap_bytes: usize,
    pub default_permission_mode: String,
    pub auth_token: String,
    pub log_format_json: bool,
    pub log_file: Option<PathBuf>,
}

impl DaemonConfig {
    /// Resolve the final configuration: CLI flags win, then env (already
    /// folded into `Args` via clap's `env` feature), then TOML, then the
    /// built-in defaults above.
    pub fn resolve(args: &Args) -> anyhow::Result<Self> {
        let config_path = args
            .config
            .clone()
            .or_else(default_config_path)
            .unwrap_or_else(|| PathBuf::from("agentbrokerd.toml"));
        let toml_cfg = TomlConfig::load(&config_path);

        let auth_token = match &args.auth_token_file {
            Some(path) => std::fs::read_to_string(path)
                .map(|s| s.trim().to_string())
                .map_err(|e| anyhow::anyhow!("reading auth token file {}: {e}", path.display()))?,
            None => {
                warn!("no --auth-token-file given; generating an ephemeral token for this run");
                uuid::Uuid::new_v4().to_string()
            }
        };

        Ok(DaemonConfig {
            bind_addr: args
                .bind_addr
                .clone()
                .or(toml_cfg.bind_addr)
                .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            max_line_bytes: toml_cfg.max_line_bytes.unwrap_or(DEFAULT_MAX_LINE_BYTES),
            kill_grace: std::time::Duration::from_millis(
                toml_cfg.kill_grace_ms.unwrap_or(DEFAULT_KILL_GRACE_MS),
            ),
            bash_timeout: std::time::Duration::from_secs(
                toml_cfg.bash_timeout_secs.unwrap_or(DEFAULT_BASH_TIMEOUT_SECS),
            ),
            max_concurrent_sessions: toml_cfg
                .max_concurrent_sessions
                .unwrap_or(DEFAULT_MAX_CONCURRENT_SESSIONS),
            tool_output_cap_bytes: toml_cfg
                .tool_output_cap_bytes
                .unwrap_or(DEFAULT_TOOL_OUTPUT_CAP_BYTES),
            default_permission_mode: toml_cfg
                .permission_mode
                .unwrap_or_else(|| "auto".to_string()),
            auth_token,
            log_format_json: args
                .log_format
                .as_deref()
                .map(|f| f.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
            log_file: args.log_file.clone(),
        })
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs_config_dir().map(|d| d.join("agentbrokerd").join("config.toml"))
}

fn dirs_config_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_defaults_when_no_config_present() {
        let args = Args {
            bind_addr: None,
            config: Some(PathBuf::from("/nonexistent/path/config.toml")),
            auth_token_file: None,
            log_format: None,
            log_file: None,
        };
        let cfg = DaemonConfig::resolve(&args).expect("resolve");
        assert_eq!(cfg.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(cfg.max_concurrent_sessions, DEFAULT_MAX_CONCURRENT_SESSIONS);
    }

    #[test]
    fn cli_flag_overrides_default() {
        let args = Args {
            bind_addr: Some("0.0.0.0:9999".to_string()),
            config: Some(PathBuf::from("/nonexistent/path/config.toml")),
            auth_token_file: None,
            log_format: None,
            log_file: None,
        };
        let cfg = DaemonConfig::resolve(&args).expect("resolve");
        assert_eq!(cfg.bind_addr, "0.0.0.0:9999");
    }
}
