//! ShimDriver (C6) — spawns `gemini`/`codex`, frames their stdout through
//! [`crate::stream::StreamParser`], and picks Mode A (translation-only) or
//! Mode B (shim-as-agent) per a runtime capability probe (open question #1,
//! DESIGN.md), not a config flag.

pub mod agent_loop;
pub mod buffer;
pub mod translate;

use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

use crate::approval::ApprovalRouter;
use crate::errors::RESUME_FAILURE_MARKER;
use crate::process::ProcessRegistry;
use crate::session::{codex, gemini};
use crate::session::runner::Runner;
use crate::stream::{CanonicalEvent, ResultPayload, StreamParser, Usage};
use crate::tools::ToolExecutor;

use agent_loop::{PermissionMode, ShimAgentLoop};
use translate::{AlienEvent, ShimTranslator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShimMode {
    TranslationOnly,
    ShimAsAgent,
}

pub struct ShimDriver {
    provider: String,
    session_id: String,
    cwd: String,
    model: String,
    max_line_bytes: usize,
    registry: Arc<ProcessRegistry>,
    executor: Arc<ToolExecutor>,
    approvals: Arc<ApprovalRouter>,
    permission_mode: PermissionMode,
    approval_timeout: Duration,
    mode: RwLock<Option<ShimMode>>,
    run_id: RwLock<Option<crate::process::RunId>>,
    turn_counter: AtomicU32,
}

impl ShimDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: impl Into<String>,
        session_id: impl Into<String>,
        cwd: impl Into<String>,
        model: impl Into<String>,
        max_line_bytes: usize,
        registry: Arc<ProcessRegistry>,
        executor: Arc<ToolExecutor>,
        approvals: Arc<ApprovalRouter>,
        permission_mode: PermissionMode,
        approval_timeout: Duration,
    ) -> Self {
        Self {
            provider: provider.into(),
            session_id: session_id.into(),
            cwd: cwd.into(),
            model: model.into(),
            max_line_bytes,
            registry,
            executor,
            approvals,
            permission_mode,
            approval_timeout,
            mode: RwLock::new(None),
            run_id: RwLock::new(None),
            turn_counter: AtomicU32::new(0),
        }
    }

    async fn resolve_mode(&self) -> ShimMode {
        if let Some(mode) = *self.mode.read().await {
            return mode;
        }
        let supports_agent = match self.provider.as_str() {
            gemini::PROVIDER_NAME => gemini::supports_sessions().await,
            codex::PROVIDER_NAME => false,
            _ => false,
        };
        let resolved = if supports_agent { ShimMode::TranslationOnly } else { ShimMode::ShimAsAgent };
        *self.mode.write().await = Some(resolved);
        resolved
    }

    fn build_argv(&self, content: &str) -> Vec<String> {
        match self.provider.as_str() {
            gemini::PROVIDER_NAME => gemini::build_argv_oneshot(content),
            codex::PROVIDER_NAME => codex::build_argv(content),
            other => {
                warn!(provider = other, "unknown shim provider, falling back to plain content argv");
                vec![content.to_string()]
            }
        }
    }

    async fn run_translation_only(&self, content: &str, events: mpsc::Sender<CanonicalEvent>) -> anyhow::Result<()> {
        let argv = self.build_argv(content);
        let mut child = Command::new(&self.provider)
            .args(&argv)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take().expect("piped stdout");
        let mut stderr = child.stderr.take().expect("piped stderr");

        let run_id = self
            .registry
            .register(&self.session_id, child, &self.cwd, &self.model)
            .await?;
        *self.run_id.write().await = Some(run_id);

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            tokio::io::AsyncReadExt::read_to_string(&mut stderr, &mut buf).await.ok();
            buf
        });

        let mut translator = ShimTranslator::new(self.provider.clone());
        let mut parser = StreamParser::new(self.max_line_bytes);
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();

        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                break;
            }
            self.registry.append_live_output(run_id, line.clone()).await;
            for framed in parser.push(line.as_bytes()) {
                if let crate::stream::Framed::Object(raw) = framed {
                    match serde_json::from_str::<AlienEvent>(&raw) {
                        Ok(alien) => {
                            for ev in translator.translate(alien) {
                                if events.send(ev).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "dropped unparseable alien event"),
                    }
                }
            }
        }

        self.registry.unregister(run_id).await;
        let stderr_buf = stderr_task.await.unwrap_or_default();
        if stderr_buf.contains(RESUME_FAILURE_MARKER) {
            events
                .send(CanonicalEvent::Result(ResultPayload { is_error: true, requires_checkpoint_restore: true, ..Default::default() }))
                .await
                .ok();
            events.send(CanonicalEvent::MessageStop).await.ok();
        }
        Ok(())
    }

    async fn run_shim_as_agent(&self, content: &str, events: mpsc::Sender<CanonicalEvent>) -> anyhow::Result<()> {
        let loop_ = ShimAgentLoop::new(
            Arc::clone(&self.executor),
            Arc::clone(&self.approvals),
            self.permission_mode,
            self.approval_timeout,
        );
        let provider = self.provider.clone();
        let cwd = self.cwd.clone();

        loop_
            .run(
                &self.session_id,
                vec![("user".to_string(), content.to_string())],
                move |transcript| {
                    let provider = provider.clone();
                    let cwd = cwd.clone();
                    async move {
                        let prompt = render_transcript(&transcript);
                        let argv = match provider.as_str() {
                            codex::PROVIDER_NAME => codex::build_argv(&prompt),
                            gemini::PROVIDER_NAME => gemini::build_argv_oneshot(&prompt),
                            _ => vec![prompt],
                        };
                        let output = Command::new(&provider)
                            .args(&argv)
                            .current_dir(&cwd)
                            .stdin(Stdio::null())
                            .stdout(Stdio::piped())
                            .stderr(Stdio::piped())
                            .output()
                            .await?;
                        Ok(String::from_utf8_lossy(&output.stdout).to_string())
                    }
                },
                events,
            )
            .await
    }
}

fn render_transcript(transcript: &[(String, String)]) -> String {
    transcript
        .iter()
        .map(|(role, content)| format!("[{role}]\n{content}"))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[async_trait]
impl Runner for ShimDriver {
    async fn run_turn(&self, content: &str, events: mpsc::Sender<CanonicalEvent>) -> anyhow::Result<()> {
        self.turn_counter.fetch_add(1, Ordering::SeqCst);
        match self.resolve_mode().await {
            ShimMode::TranslationOnly => self.run_translation_only(content, events).await,
            ShimMode::ShimAsAgent => self.run_shim_as_agent(content, events).await,
        }
    }

    async fn send(&self, _content: &str) -> anyhow::Result<()> {
        // Both shim modes are single-shot per turn (no long-lived stdin
        // channel); a mid-turn send isn't a shape this driver supports.
        Err(anyhow::anyhow!("ShimDriver does not support sending input to an in-flight turn"))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_transcript_preserves_order() {
        let transcript = vec![
            ("user".to_string(), "hi".to_string()),
            ("assistant".to_string(), "hello".to_string()),
        ];
        let rendered = render_transcript(&transcript);
        assert!(rendered.find("[user]").unwrap() < rendered.find("[assistant]").unwrap());
    }
}
