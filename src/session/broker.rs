//! SessionBroker (C4) — the per-session state machine that turns a user
//! turn into a spawned (or resumed) provider process and fans its
//! canonical events out to subscribers (§4.2).
//!
//! Grounded on `clawd`'s `session_manager.rs` state-transition shape, with
//! one deliberate divergence recorded in DESIGN.md: fan-out here is
//! per-session (`SessionEntry` owns its own `broadcast::Sender`), not a
//! single global channel filtered client-side — required so a slow or
//! malicious subscriber to session A can never starve session B (P3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::approval::ApprovalRouter;
use crate::config::DaemonConfig;
use crate::process::ProcessRegistry;
use crate::session::claude::ClaudeRunner;
use crate::session::codex;
use crate::session::gemini;
use crate::session::record::{SessionRecord, SessionState, TurnRecord, TurnRole};
use crate::session::runner::Runner;
use crate::session::shim::agent_loop::PermissionMode;
use crate::session::shim::ShimDriver;
use crate::stream::{CanonicalEvent, ResultPayload};
use crate::tools::ToolExecutor;

const FAN_OUT_CAPACITY: usize = 1024;
const YOUNG_PROCESS_RETRY_DELAY: Duration = Duration::from_secs(2);
const FILE_OP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const RUNNING_GRACE_TIMER: Duration = Duration::from_millis(200);
const APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

struct SessionEntry {
    record: Mutex<SessionRecord>,
    tx: broadcast::Sender<CanonicalEvent>,
    epoch: AtomicU64,
    active_runner: Mutex<Option<Arc<dyn Runner>>>,
}

/// Owns every `SessionRecord` and drives its state machine. Shared across
/// the BoundaryAPI's connection handlers via `Arc`.
pub struct SessionBroker {
    sessions: Mutex<HashMap<String, Arc<SessionEntry>>>,
    registry: Arc<ProcessRegistry>,
    executor: Arc<ToolExecutor>,
    approvals: Arc<ApprovalRouter>,
    config: Arc<DaemonConfig>,
}

impl SessionBroker {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        executor: Arc<ToolExecutor>,
        approvals: Arc<ApprovalRouter>,
        config: Arc<DaemonConfig>,
    ) -> Self {
        Self { sessions: Mutex::new(HashMap::new()), registry, executor, approvals, config }
    }

    /// Subscribe to a session's event fan-out, creating the session record
    /// (in `idle` state) if it doesn't exist yet.
    pub async fn subscribe(
        &self,
        session_id: &str,
        provider: &str,
        model: &str,
        cwd: &str,
    ) -> broadcast::Receiver<CanonicalEvent> {
        let entry = self.entry_for(session_id, provider, model, cwd).await;
        entry.tx.subscribe()
    }

    async fn entry_for(&self, session_id: &str, provider: &str, model: &str, cwd: &str) -> Arc<SessionEntry> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                let (tx, _rx) = broadcast::channel(FAN_OUT_CAPACITY);
                Arc::new(SessionEntry {
                    record: Mutex::new(SessionRecord::new(
                        session_id.to_string(),
                        provider.to_string(),
                        model.to_string(),
                        cwd.to_string(),
                    )),
                    tx,
                    epoch: AtomicU64::new(0),
                    active_runner: Mutex::new(None),
                })
            })
            .clone()
    }

    /// Submit a user turn for `session_id`. Handles the quiescence windows,
    /// force-restart-on-concurrent-turn policy, and deferred interrupts
    /// before spawning (or re-spawning) the provider process.
    pub async fn submit_turn(
        self: &Arc<Self>,
        session_id: &str,
        provider: &str,
        model: &str,
        cwd: &str,
        content: &str,
    ) -> anyhow::Result<()> {
        let entry = self.entry_for(session_id, provider, model, cwd).await;

        let state = entry.record.lock().await.state;
        match state {
            SessionState::Running => {
                let young = entry.record.lock().await.in_young_process_window();
                if young {
                    info!(session_id, "turn arrived in young-process window, deferring 2s");
                    let broker = Arc::clone(self);
                    let session_id = session_id.to_string();
                    let provider = provider.to_string();
                    let model = model.to_string();
                    let cwd = cwd.to_string();
                    let content = content.to_string();
                    tokio::spawn(async move {
                        tokio::time::sleep(YOUNG_PROCESS_RETRY_DELAY).await;
                        if let Err(e) = broker.submit_turn(&session_id, &provider, &model, &cwd, &content).await {
                            warn!(session_id, error = %e, "deferred turn resubmission failed");
                        }
                    });
                    return Ok(());
                }
                self.wait_for_file_ops_then_interrupt(&entry).await;
            }
            SessionState::Spawning | SessionState::Interrupting => {
                self.wait_for_file_ops_then_interrupt(&entry).await;
            }
            SessionState::Idle | SessionState::Terminated => {}
        }

        {
            let mut record = entry.record.lock().await;
            record.state = SessionState::Spawning;
            record.spawned_at = Some(std::time::Instant::now());
            record.pending_interrupt = false;
        }
        let my_epoch = entry.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let resume_id = entry.record.lock().await.provider_session_id.clone();

        let runner: Arc<dyn Runner> = Arc::from(self.build_runner(session_id, provider, model, cwd, resume_id));
        *entry.active_runner.lock().await = Some(Arc::clone(&runner));

        let broker = Arc::clone(self);
        let entry_clone = Arc::clone(&entry);
        let session_id = session_id.to_string();
        let content = content.to_string();

        tokio::spawn(async move {
            broker.drive_turn(entry_clone, runner, my_epoch, session_id, content).await;
        });

        Ok(())
    }

    /// Wait up to 5 s for in-flight file operations to drain (§4.2
    /// Quiescence windows), then force-stop the currently running turn so
    /// the new one can start (§4.2 "force-restart policy").
    async fn wait_for_file_ops_then_interrupt(&self, entry: &Arc<SessionEntry>) {
        let deadline = tokio::time::Instant::now() + FILE_OP_DRAIN_TIMEOUT;
        loop {
            let drained = entry.record.lock().await.active_file_ops.is_empty();
            if drained || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        entry.record.lock().await.state = SessionState::Interrupting;
        self.stop_active_run(entry).await;
    }

    async fn stop_active_run(&self, entry: &Arc<SessionEntry>) {
        let runner = entry.active_runner.lock().await.clone();
        if let Some(runner) = runner {
            if let Err(e) = runner.stop().await {
                warn!(error = %e, "failed to stop active run");
            }
        }
    }

    fn build_runner(&self, session_id: &str, provider: &str, model: &str, cwd: &str, resume_id: Option<String>) -> Box<dyn Runner> {
        let permission_mode = if self.config.default_permission_mode == "interactive" {
            PermissionMode::Interactive
        } else {
            PermissionMode::Auto
        };

        match provider {
            gemini::PROVIDER_NAME | codex::PROVIDER_NAME => Box::new(ShimDriver::new(
                provider.to_string(),
                session_id.to_string(),
                cwd.to_string(),
                model.to_string(),
                self.config.max_line_bytes,
                Arc::clone(&self.registry),
                Arc::clone(&self.executor),
                Arc::clone(&self.approvals),
                permission_mode,
                APPROVAL_TIMEOUT,
            )),
            other => {
                if other != "claude" {
                    warn!(provider = other, "unknown provider, defaulting to claude passthrough");
                }
                Box::new(ClaudeRunner::resuming(
                    session_id.to_string(),
                    cwd.to_string(),
                    model.to_string(),
                    self.config.default_permission_mode.clone(),
                    self.config.max_line_bytes,
                    Arc::clone(&self.registry),
                    resume_id,
                ))
            }
        }
    }

    /// Drive a single turn: run the provider to completion, forwarding
    /// every event into the session's fan-out topic, updating state along
    /// the way (spawning -> running on first byte or a 200ms grace timer,
    /// -> terminated on exit).
    async fn drive_turn(
        self: Arc<Self>,
        entry: Arc<SessionEntry>,
        runner: Arc<dyn Runner>,
        my_epoch: u64,
        session_id: String,
        content: String,
    ) {
        let (internal_tx, mut internal_rx) = mpsc::channel::<CanonicalEvent>(256);

        let grace_entry = Arc::clone(&entry);
        tokio::spawn(async move {
            tokio::time::sleep(RUNNING_GRACE_TIMER).await;
            let mut record = grace_entry.record.lock().await;
            if grace_entry.epoch.load(Ordering::SeqCst) == my_epoch && record.state == SessionState::Spawning {
                record.state = SessionState::Running;
            }
        });

        let drain_entry = Arc::clone(&entry);
        let drain_task = tokio::spawn(async move {
            let mut saw_terminal = false;
            while let Some(ev) = internal_rx.recv().await {
                if drain_entry.epoch.load(Ordering::SeqCst) != my_epoch {
                    break;
                }

                let mut fire_deferred_interrupt = false;
                {
                    let mut record = drain_entry.record.lock().await;
                    if record.state == SessionState::Spawning {
                        record.state = SessionState::Running;
                    }
                    if let Some(init) = ev.as_system_init() {
                        record.provider_session_id = init.session_id.clone();
                    }
                    if let CanonicalEvent::Result(ResultPayload { requires_checkpoint_restore: true, .. }) = &ev {
                        record.provider_session_id = None;
                    }
                    let is_content_block = matches!(ev, CanonicalEvent::Text { .. } | CanonicalEvent::ToolUse { .. });
                    if is_content_block && record.pending_interrupt {
                        record.pending_interrupt = false;
                        fire_deferred_interrupt = true;
                    }
                    if ev.is_terminal() {
                        saw_terminal = true;
                    }
                }

                let _ = drain_entry.tx.send(ev);

                if fire_deferred_interrupt {
                    debug!(session_id = %drain_entry.record.lock().await.session_id, "executing deferred interrupt on first content block");
                    if let Some(runner) = drain_entry.active_runner.lock().await.clone() {
                        let _ = runner.stop().await;
                    }
                    let _ = drain_entry.tx.send(CanonicalEvent::System {
                        subtype: crate::stream::SystemSubtype::Interrupted,
                        session_id: None,
                        model: None,
                        cwd: None,
                        permission_mode: None,
                        tools: Vec::new(),
                        message: None,
                    });
                }
            }
            saw_terminal
        });

        let outcome = runner.run_turn(&content, internal_tx).await;
        let saw_terminal = drain_task.await.unwrap_or(false);

        if entry.epoch.load(Ordering::SeqCst) != my_epoch {
            return;
        }
        *entry.active_runner.lock().await = None;
        entry.record.lock().await.state = SessionState::Terminated;

        if let Err(e) = &outcome {
            warn!(session_id, error = %e, "turn failed to run to completion");
            let _ = entry.tx.send(CanonicalEvent::Error { message: e.to_string(), code: Some("SPAWN_FAILED".into()) });
            let _ = entry.tx.send(CanonicalEvent::Result(ResultPayload { is_error: true, ..Default::default() }));
        } else if !saw_terminal {
            warn!(session_id, "turn ended without a terminal result, synthesizing one");
            let _ = entry.tx.send(CanonicalEvent::Result(ResultPayload { is_error: true, ..Default::default() }));
        }
        let _ = entry.tx.send(CanonicalEvent::System {
            subtype: crate::stream::SystemSubtype::StreamEnd,
            session_id: None,
            model: None,
            cwd: None,
            permission_mode: None,
            tools: Vec::new(),
            message: None,
        });
    }

    /// Explicit client-issued interrupt. If the assistant hasn't emitted a
    /// content block yet, defers (§4.2 "Deferred interrupts"); otherwise
    /// stops the active run immediately.
    pub async fn interrupt(&self, session_id: &str) {
        let entry = {
            let sessions = self.sessions.lock().await;
            match sessions.get(session_id) {
                Some(e) => Arc::clone(e),
                None => return,
            }
        };

        let is_running = {
            let mut record = entry.record.lock().await;
            record.was_interrupted = true;
            if record.state != SessionState::Running {
                record.pending_interrupt = true;
                false
            } else {
                record.state = SessionState::Interrupting;
                true
            }
        };

        if is_running {
            self.stop_active_run(&entry).await;
        }
    }

    pub async fn history(&self, session_id: &str) -> Vec<TurnRecord> {
        let sessions = self.sessions.lock().await;
        match sessions.get(session_id) {
            Some(entry) => entry.record.lock().await.history.clone(),
            None => Vec::new(),
        }
    }

    /// Drop a session's in-memory entry entirely (clear/delete operations).
    /// Stops any active run first so the child isn't orphaned.
    pub async fn remove(&self, session_id: &str) {
        let entry = self.sessions.lock().await.remove(session_id);
        if let Some(entry) = entry {
            self.stop_active_run(&entry).await;
        }
    }

    pub async fn record_turn(&self, session_id: &str, _role: TurnRole, turn: TurnRecord) {
        let entry = {
            let sessions = self.sessions.lock().await;
            sessions.get(session_id).cloned()
        };
        if let Some(entry) = entry {
            let mut record = entry.record.lock().await;
            if let Some(usage) = &turn.usage {
                record.usage.accumulate(usage);
            }
            record.history.push(turn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::sandbox::SandboxPolicy;

    fn test_broker() -> Arc<SessionBroker> {
        let registry = Arc::new(ProcessRegistry::new(8, Duration::from_millis(200)));
        let executor = Arc::new(ToolExecutor::new(SandboxPolicy::new("/tmp", vec![]), 1024, Duration::from_secs(5)));
        let approvals = Arc::new(ApprovalRouter::new());
        let config = Arc::new(DaemonConfig {
            bind_addr: "127.0.0.1:0".into(),
            max_line_bytes: 4096,
            kill_grace: Duration::from_millis(100),
            bash_timeout: Duration::from_secs(5),
            max_concurrent_sessions: 8,
            tool_output_cap_bytes: 1024,
            default_permission_mode: "auto".into(),
            auth_token: "test".into(),
            log_format_json: false,
            log_file: None,
        });
        Arc::new(SessionBroker::new(registry, executor, approvals, config))
    }

    #[tokio::test]
    async fn subscribe_creates_idle_session() {
        let broker = test_broker();
        let _rx = broker.subscribe("s1", "claude", "sonnet", "/tmp").await;
        let sessions = broker.sessions.lock().await;
        let entry = sessions.get("s1").unwrap();
        assert_eq!(entry.record.lock().await.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn interrupt_on_idle_session_defers_rather_than_panics() {
        let broker = test_broker();
        let _rx = broker.subscribe("s1", "claude", "sonnet", "/tmp").await;
        broker.interrupt("s1").await;
        let sessions = broker.sessions.lock().await;
        let entry = sessions.get("s1").unwrap();
        let record = entry.record.lock().await;
        assert!(record.was_interrupted);
        assert!(record.pending_interrupt);
    }

    #[tokio::test]
    async fn interrupt_on_unknown_session_does_not_panic() {
        let broker = test_broker();
        broker.interrupt("does-not-exist").await;
    }
}
