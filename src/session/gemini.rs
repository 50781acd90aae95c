//! ProviderAdapter (Gemini) — §4.3a.
//!
//! Grounded on `apps/daemon/src/agents/gemini.rs`: `is_available`,
//! `version`, and `supports_sessions` (detected by scanning `--help`
//! output for `--session`/`--continue` flags) drive the Mode A vs. Mode B
//! decision in `ShimDriver` (open question #1, DESIGN.md).

use std::process::Stdio;

use tokio::process::Command;

pub const PROVIDER_NAME: &str = "gemini";

pub async fn is_available() -> bool {
    Command::new("gemini")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

pub async fn version() -> Option<String> {
    let out = Command::new("gemini").arg("--version").output().await.ok()?;
    if out.status.success() {
        Some(String::from_utf8_lossy(&out.stdout).trim().to_string())
    } else {
        None
    }
}

/// Whether the installed `gemini` CLI supports multi-turn session flags.
/// Cached by the caller for the process lifetime — this spawns a child.
pub async fn supports_sessions() -> bool {
    let out = Command::new("gemini").arg("--help").output().await;
    match out {
        Ok(out) => {
            let help = String::from_utf8_lossy(&out.stdout);
            help.contains("--session") && help.contains("--continue")
        }
        Err(_) => false,
    }
}

/// A small capability summary surfaced to `ShimDriver` when choosing Mode A
/// vs. Mode B, mirroring the JSON capability object the source produced.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CapabilityMatrix {
    pub provider: &'static str,
    pub available: bool,
    pub version: Option<String>,
    pub supports_sessions: bool,
}

pub async fn capability_matrix() -> CapabilityMatrix {
    CapabilityMatrix {
        provider: PROVIDER_NAME,
        available: is_available().await,
        version: version().await,
        supports_sessions: supports_sessions().await,
    }
}

/// Build argv for a single-shot (no native session support) invocation.
pub fn build_argv_oneshot(content: &str) -> Vec<String> {
    vec!["-p".to_string(), content.to_string()]
}

/// Build argv for a multi-turn invocation when the CLI supports
/// `--session`/`--continue`.
pub fn build_argv_session(session_id: &str, content: &str) -> Vec<String> {
    vec![
        "--session".to_string(),
        session_id.to_string(),
        "-p".to_string(),
        content.to_string(),
    ]
}
