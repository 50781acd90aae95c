//! ShimAgentLoop — Mode B (C7): Think -> Act -> Observe over a provider
//! whose native output contains no tool-calling at all, so this crate
//! drives the loop itself rather than just translating events.
//!
//! Grounded on `clawd`'s `policy/approval.rs` gating idiom (already reused
//! verbatim in [`crate::approval`]) and the corpus's turn-based runner
//! shape in `session/runner.rs`. Each iteration: feed the transcript to the
//! provider, parse any tool calls it asked for out of its text response,
//! execute them serially through [`crate::tools::ToolExecutor`] (gated by
//! [`crate::approval::ApprovalRouter`] when in interactive permission
//! mode), append the tool results to the transcript, and loop until the
//! provider's response contains no further tool calls.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::approval::{ApprovalRouter, ApprovalStatus};
use crate::stream::{CanonicalEvent, ResultPayload, Usage};
use crate::tools::ToolExecutor;

/// A single tool call parsed out of the provider's free-text response. The
/// wire shape providers are asked (via system prompt, out of this crate's
/// scope) to emit inline is a fenced block:
/// ```text
/// ```tool_call
/// {"name":"Read","input":{"file_path":"a.txt"}}
/// ```
/// ```
#[derive(Debug, Clone, Deserialize)]
struct ParsedToolCall {
    name: String,
    input: serde_json::Value,
}

const TOOL_CALL_FENCE_OPEN: &str = "```tool_call";
const TOOL_CALL_FENCE_CLOSE: &str = "```";
const MAX_ITERATIONS: usize = 50;

/// Whether tool calls require a human decision before running, or run
/// unattended (§4.4 permission modes: `interactive` vs `auto`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    Interactive,
    Auto,
}

pub struct ShimAgentLoop {
    executor: Arc<ToolExecutor>,
    approvals: Arc<ApprovalRouter>,
    permission_mode: PermissionMode,
    approval_timeout: Duration,
}

impl ShimAgentLoop {
    pub fn new(
        executor: Arc<ToolExecutor>,
        approvals: Arc<ApprovalRouter>,
        permission_mode: PermissionMode,
        approval_timeout: Duration,
    ) -> Self {
        Self { executor, approvals, permission_mode, approval_timeout }
    }

    /// Run the loop to completion, given a function that sends the current
    /// transcript to the provider and returns its raw text response. The
    /// caller (the provider-specific driver) owns process spawning; this
    /// loop only owns the think/act/observe control flow and tool gating.
    pub async fn run<F, Fut>(
        &self,
        session_id: &str,
        mut transcript: Vec<(String, String)>,
        mut ask_provider: F,
        events: mpsc::Sender<CanonicalEvent>,
    ) -> anyhow::Result<()>
    where
        F: FnMut(Vec<(String, String)>) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<String>>,
    {
        let mut usage = Usage::default();
        usage.estimated = true;

        for iteration in 0..MAX_ITERATIONS {
            let response = ask_provider(transcript.clone()).await?;
            usage.output_tokens += (response.chars().count() / 4) as u64;

            let (prose, calls) = extract_tool_calls(&response);
            if !prose.is_empty() {
                events.send(CanonicalEvent::Text { content: prose.clone(), id: None }).await.ok();
            }
            transcript.push(("assistant".to_string(), response.clone()));

            if calls.is_empty() {
                events.send(CanonicalEvent::Usage(usage.clone())).await.ok();
                events
                    .send(CanonicalEvent::Result(ResultPayload { is_error: false, ..Default::default() }))
                    .await
                    .ok();
                events.send(CanonicalEvent::MessageStop).await.ok();
                return Ok(());
            }

            for (index, call) in calls.iter().enumerate() {
                let tool_use_id = format!("call_shim_{session_id}_{iteration}_{index}");
                events
                    .send(CanonicalEvent::ToolUse {
                        id: tool_use_id.clone(),
                        name: call.name.clone(),
                        input: call.input.clone(),
                    })
                    .await
                    .ok();

                let decision = self.gate(session_id, &tool_use_id, &call.name, &call.input).await;
                let outcome = match decision {
                    ApprovalStatus::Granted => self.executor.run(&call.name, &call.input).await,
                    _ => crate::tools::ToolOutcome { content: "tool call denied by user".into(), is_error: true },
                };

                events
                    .send(CanonicalEvent::ToolResult {
                        tool_use_id: tool_use_id.clone(),
                        content: serde_json::Value::String(outcome.content.clone()),
                        is_error: outcome.is_error,
                    })
                    .await
                    .ok();

                transcript.push((
                    "tool_result".to_string(),
                    format!("[{}] {}", call.name, outcome.content),
                ));
            }
        }

        warn!(session_id, "ShimAgentLoop hit MAX_ITERATIONS without converging");
        events
            .send(CanonicalEvent::Error {
                message: "agent loop exceeded maximum iterations".into(),
                code: Some("LOOP_OVERFLOW".into()),
            })
            .await
            .ok();
        events.send(CanonicalEvent::MessageStop).await.ok();
        Ok(())
    }

    async fn gate(&self, session_id: &str, tool_use_id: &str, name: &str, input: &serde_json::Value) -> ApprovalStatus {
        if self.permission_mode == PermissionMode::Auto {
            return ApprovalStatus::Granted;
        }
        let summary = serde_json::to_string(input).unwrap_or_default();
        let approval_id = self.approvals.request_approval(session_id, tool_use_id, name, summary).await;
        debug!(session_id, tool_use_id, name, "awaiting tool approval");
        self.approvals.wait_for_decision(&approval_id, self.approval_timeout).await
    }
}

/// Strip fenced `tool_call` blocks out of a response, returning the
/// remaining prose plus every parsed call in document order. A block that
/// fails to parse is dropped with a warning rather than aborting the turn
/// (providers occasionally emit malformed JSON; one bad call shouldn't
/// sink the whole response).
fn extract_tool_calls(response: &str) -> (String, Vec<ParsedToolCall>) {
    let mut prose = String::new();
    let mut calls = Vec::new();
    let mut rest = response;

    while let Some(start) = rest.find(TOOL_CALL_FENCE_OPEN) {
        prose.push_str(&rest[..start]);
        let after_open = &rest[start + TOOL_CALL_FENCE_OPEN.len()..];
        match after_open.find(TOOL_CALL_FENCE_CLOSE) {
            Some(end) => {
                let body = after_open[..end].trim();
                match serde_json::from_str::<ParsedToolCall>(body) {
                    Ok(call) => calls.push(call),
                    Err(e) => warn!(error = %e, "dropped malformed tool_call block"),
                }
                rest = &after_open[end + TOOL_CALL_FENCE_CLOSE.len()..];
            }
            None => {
                // Unterminated fence: treat the remainder as prose rather
                // than looping forever.
                prose.push_str(after_open);
                rest = "";
                break;
            }
        }
    }
    prose.push_str(rest);
    (prose.trim().to_string(), calls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::sandbox::SandboxPolicy;

    fn executor() -> Arc<ToolExecutor> {
        Arc::new(ToolExecutor::new(SandboxPolicy::new("/tmp", vec![]), 64 * 1024, Duration::from_secs(5)))
    }

    #[test]
    fn extracts_single_tool_call_and_prose() {
        let response = "I'll read the file.\n```tool_call\n{\"name\":\"Read\",\"input\":{\"file_path\":\"a.txt\"}}\n```\nDone.";
        let (prose, calls) = extract_tool_calls(response);
        assert!(prose.contains("I'll read the file."));
        assert!(prose.contains("Done."));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "Read");
    }

    #[test]
    fn malformed_tool_call_is_dropped_not_fatal() {
        let response = "```tool_call\nnot json\n```\nstill here";
        let (prose, calls) = extract_tool_calls(response);
        assert_eq!(calls.len(), 0);
        assert!(prose.contains("still here"));
    }

    #[test]
    fn response_without_tool_calls_is_all_prose() {
        let (prose, calls) = extract_tool_calls("just a plain answer");
        assert_eq!(prose, "just a plain answer");
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn loop_runs_to_completion_without_tool_calls() {
        let loop_ = ShimAgentLoop::new(
            executor(),
            Arc::new(ApprovalRouter::new()),
            PermissionMode::Auto,
            Duration::from_secs(1),
        );
        let (tx, mut rx) = mpsc::channel(32);
        loop_
            .run(
                "s1",
                vec![("user".to_string(), "hi".to_string())],
                |_transcript| async { Ok("hello there".to_string()) },
                tx,
            )
            .await
            .unwrap();

        let mut saw_result = false;
        let mut saw_stop = false;
        while let Some(ev) = rx.recv().await {
            match ev {
                CanonicalEvent::Result(_) => saw_result = true,
                CanonicalEvent::MessageStop => saw_stop = true,
                _ => {}
            }
        }
        assert!(saw_result && saw_stop);
    }

    #[tokio::test]
    async fn loop_executes_tool_call_then_converges() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let executor = Arc::new(ToolExecutor::new(
            SandboxPolicy::new(dir.path(), vec![]),
            64 * 1024,
            Duration::from_secs(5),
        ));
        let loop_ = ShimAgentLoop::new(executor, Arc::new(ApprovalRouter::new()), PermissionMode::Auto, Duration::from_secs(1));
        let (tx, mut rx) = mpsc::channel(32);

        let call_count = std::sync::atomic::AtomicU32::new(0);
        loop_
            .run(
                "s1",
                vec![("user".to_string(), "read a.txt".to_string())],
                |_transcript| {
                    let n = call_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Ok("```tool_call\n{\"name\":\"Read\",\"input\":{\"file_path\":\"a.txt\"}}\n```".to_string())
                        } else {
                            Ok("the file says hello".to_string())
                        }
                    }
                },
                tx,
            )
            .await
            .unwrap();

        let mut tool_uses = 0;
        let mut saw_result = false;
        while let Some(ev) = rx.recv().await {
            match ev {
                CanonicalEvent::ToolUse { .. } => tool_uses += 1,
                CanonicalEvent::Result(_) => saw_result = true,
                _ => {}
            }
        }
        assert_eq!(tool_uses, 1);
        assert!(saw_result);
    }

    #[tokio::test]
    async fn interactive_mode_denies_on_timeout() {
        let loop_ = ShimAgentLoop::new(
            executor(),
            Arc::new(ApprovalRouter::new()),
            PermissionMode::Interactive,
            Duration::from_millis(20),
        );
        let (tx, mut rx) = mpsc::channel(32);
        let call_count = std::sync::atomic::AtomicU32::new(0);
        loop_
            .run(
                "s1",
                vec![("user".to_string(), "do something".to_string())],
                |_transcript| {
                    let n = call_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Ok("```tool_call\n{\"name\":\"Bash\",\"input\":{\"command\":\"echo hi\"}}\n```".to_string())
                        } else {
                            Ok("ok".to_string())
                        }
                    }
                },
                tx,
            )
            .await
            .unwrap();

        let mut denied = false;
        while let Some(ev) = rx.recv().await {
            if let CanonicalEvent::ToolResult { is_error, content, .. } = ev {
                if is_error && content.as_str().unwrap_or_default().contains("denied") {
                    denied = true;
                }
            }
        }
        assert!(denied, "unattended approval with no grant must deny (fail closed)");
    }
}
