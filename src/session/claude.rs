//! ProviderAdapter (Claude passthrough) — C5.
//!
//! The Claude CLI already emits canonical-enough stream-json; this
//! adapter's job is argv construction, a readiness probe, and piping stdout
//! through StreamParser unchanged. Grounded directly on `clawd`'s
//! `session/claude.rs` (`ClaudeCodeRunner`): argv shape, `event_loop`
//! pattern, and the SIGSTOP/SIGCONT/SIGKILL `impl Runner`.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::errors::RESUME_FAILURE_MARKER;
use crate::process::{ProcessRegistry, RunId};
use crate::stream::{frame_and_validate, CanonicalEvent, ResultPayload, StreamParser};

use super::runner::Runner;

/// Readiness outcome for a provider CLI, checked before a session slot is
/// consumed (§4.3, §7 *AuthMissing* / *CliNotInstalled*).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    CliNotInstalled,
    AuthMissing,
}

/// Probe `claude --version` and an auth-status check without spawning a
/// turn-consuming process.
pub async fn check_claude_ready() -> Readiness {
    let version = Command::new("claude").arg("--version").output().await;
    match version {
        Ok(out) if out.status.success() => {}
        _ => return Readiness::CliNotInstalled,
    }

    let auth = Command::new("claude").args(["auth", "status"]).output().await;
    match auth {
        Ok(out) if out.status.success() => Readiness::Ready,
        Ok(_) => Readiness::AuthMissing,
        Err(_) => Readiness::CliNotInstalled,
    }
}

/// Translate a Windows path (`X:\path\to\file`) into the WSL-mounted form
/// (`/mnt/x/path/to/file`) used when bridging through WSL (§4.3).
pub fn wsl_translate_path(windows_path: &str) -> String {
    let bytes = windows_path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        let drive = (bytes[0] as char).to_ascii_lowercase();
        let rest = &windows_path[2..].replace('\\', "/");
        format!("/mnt/{drive}{rest}")
    } else {
        windows_path.replace('\\', "/")
    }
}

/// Quote a single argument for safe inclusion in a POSIX shell command line
/// (single-quote the whole thing, escaping embedded single quotes), used
/// when bridging argv through `wsl.exe bash -lc "..."` (§4.3).
fn posix_shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

pub struct ClaudeRunner {
    session_id: String,
    cwd: String,
    model: String,
    permission_mode: String,
    max_line_bytes: usize,
    provider_session_id: Arc<RwLock<Option<String>>>,
    registry: Arc<ProcessRegistry>,
    run_id: RwLock<Option<RunId>>,
}

impl ClaudeRunner {
    pub fn new(
        session_id: String,
        cwd: String,
        model: String,
        permission_mode: String,
        max_line_bytes: usize,
        registry: Arc<ProcessRegistry>,
    ) -> Self {
        Self::resuming(session_id, cwd, model, permission_mode, max_line_bytes, registry, None)
    }

    /// Like [`Self::new`], but seeded with a `providerSessionId` carried
    /// over from a prior turn on the same session, so `--resume` is passed
    /// on the very first `run_turn` call rather than only after this
    /// instance has seen its own `system(init)` event.
    #[allow(clippy::too_many_arguments)]
    pub fn resuming(
        session_id: String,
        cwd: String,
        model: String,
        permission_mode: String,
        max_line_bytes: usize,
        registry: Arc<ProcessRegistry>,
        provider_session_id: Option<String>,
    ) -> Self {
        Self {
            session_id,
            cwd,
            model,
            permission_mode,
            max_line_bytes,
            provider_session_id: Arc::new(RwLock::new(provider_session_id)),
            registry,
            run_id: RwLock::new(None),
        }
    }

    pub async fn provider_session_id(&self) -> Option<String> {
        self.provider_session_id.read().await.clone()
    }

    fn build_argv(&self, content: &str, resume_id: Option<String>) -> Vec<String> {
        let mut argv = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            format!("--permission-mode={}", self.permission_mode),
            "--model".to_string(),
            self.model.clone(),
        ];
        if let Some(resume_id) = resume_id {
            argv.push("--resume".to_string());
            argv.push(resume_id);
        }
        argv.push("-p".to_string());
        argv.push(content.to_string());
        argv
    }

    /// Spawn the `claude` child, bridging through WSL on Windows (§4.3):
    /// the cwd is translated to its `/mnt/<drive>/...` form and the whole
    /// command line is quoted into a single `bash -lc` string, since `wsl.exe`
    /// hands its trailing arguments to a POSIX shell rather than exec'ing
    /// `claude` directly. On every other platform `claude` is spawned
    /// natively with `cwd`/`argv` untouched.
    fn spawn_child(&self, argv: &[String]) -> std::io::Result<tokio::process::Child> {
        if cfg!(windows) {
            let bridged_cwd = wsl_translate_path(&self.cwd);
            let command_line = std::iter::once("claude".to_string())
                .chain(argv.iter().cloned())
                .map(|a| posix_shell_quote(&a))
                .collect::<Vec<_>>()
                .join(" ");
            Command::new("wsl.exe")
                .args(["bash", "-lc", &format!("cd {} && {}", posix_shell_quote(&bridged_cwd), command_line)])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
        } else {
            Command::new("claude")
                .args(argv)
                .current_dir(&self.cwd)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
        }
    }
}

#[async_trait]
impl Runner for ClaudeRunner {
    async fn run_turn(&self, content: &str, events: mpsc::Sender<CanonicalEvent>) -> anyhow::Result<()> {
        let resume_id = self.provider_session_id.read().await.clone();
        let argv = self.build_argv(content, resume_id);
        let mut child = self.spawn_child(&argv).map_err(|e| anyhow::anyhow!("spawn claude: {e}"))?;

        let stdout = child.stdout.take().expect("piped stdout");
        let mut stderr = child.stderr.take().expect("piped stderr");

        let run_id = self
            .registry
            .register(&self.session_id, child, &self.cwd, &self.model)
            .await?;
        *self.run_id.write().await = Some(run_id);

        // Drain stderr concurrently with stdout so a child that writes a
        // lot to stderr before exiting can't deadlock the stdout pipe.
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            stderr.read_to_string(&mut buf).await.ok();
            buf
        });

        let mut reader = BufReader::new(stdout);
        let mut parser = StreamParser::new(self.max_line_bytes);
        let mut saw_result = false;
        let mut line = Vec::new();

        loop {
            line.clear();
            let n = reader.read_until(b'\n', &mut line).await?;
            if n == 0 {
                break;
            }
            self.registry
                .append_live_output(run_id, String::from_utf8_lossy(&line).to_string())
                .await;

            for ev in frame_and_validate(&mut parser, &line) {
                if let Some(init) = ev.as_system_init() {
                    if let Some(sid) = init.session_id {
                        *self.provider_session_id.write().await = Some(sid);
                    }
                }
                if ev.is_terminal() {
                    saw_result = true;
                }
                if events.send(ev).await.is_err() {
                    debug!(session_id = %self.session_id, "subscriber gone, stopping turn early");
                    break;
                }
            }
        }

        self.registry.unregister(run_id).await;

        let stderr_buf = stderr_task.await.unwrap_or_default();
        if stderr_buf.contains(RESUME_FAILURE_MARKER) {
            *self.provider_session_id.write().await = None;
            let _ = events
                .send(CanonicalEvent::Result(ResultPayload {
                    is_error: true,
                    requires_checkpoint_restore: true,
                    ..Default::default()
                }))
                .await;
            let _ = events.send(CanonicalEvent::MessageStop).await;
            return Ok(());
        }

        if !saw_result {
            warn!(session_id = %self.session_id, "child exited without a terminal result, synthesizing one");
            let _ = events
                .send(CanonicalEvent::Result(ResultPayload {
                    is_error: true,
                    ..Default::default()
                }))
                .await;
        }
        let _ = events.send(CanonicalEvent::MessageStop).await;
        Ok(())
    }

    async fn send(&self, _content: &str) -> anyhow::Result<()> {
        anyhow::bail!("ClaudeRunner does not support mid-turn stdin injection")
    }

    async fn pause(&self) -> anyhow::Result<()> {
        #[cfg(unix)]
        if let Some(run_id) = *self.run_id.read().await {
            self.registry.pause(run_id).await;
        }
        Ok(())
    }

    async fn resume(&self) -> anyhow::Result<()> {
        #[cfg(unix)]
        if let Some(run_id) = *self.run_id.read().await {
            self.registry.resume(run_id).await;
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(run_id) = *self.run_id.read().await {
            self.registry.kill(run_id).await;
        }
        Ok(())
    }
}
