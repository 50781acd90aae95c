//! ProviderAdapter (OpenAI/Codex) — §4.3a.
//!
//! Grounded on `clawd`'s `session/codex.rs`: `codex --approval-mode
//! full-auto -q "<content>"`, non-interactive so the shim (not Codex
//! itself) owns approval gating when running Mode B.

use std::process::Stdio;

use tokio::process::Command;

pub const PROVIDER_NAME: &str = "codex";

pub async fn is_available() -> bool {
    Command::new("codex")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

pub fn build_argv(content: &str) -> Vec<String> {
    vec![
        "--approval-mode".to_string(),
        "full-auto".to_string(),
        "-q".to_string(),
        content.to_string(),
    ]
}
