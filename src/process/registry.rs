//! ProcessRegistry (C3) — owns all live child processes.
//!
//! Grounded on `clawd`'s `session/claude.rs` `impl Runner` kill sequence
//! (graceful SIGTERM, bounded wait, forced SIGKILL, `#[cfg(unix)]`
//! SIGSTOP/SIGCONT for pause/resume) and `process_pool.rs`'s cross-platform
//! `is_process_alive`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::errors::RegistryError;

pub type RunId = u64;

/// A ring buffer of recent raw output lines, retained per-run for
/// post-mortem diagnostics after a crash (§4.2 `appendLiveOutput`).
pub struct LiveOutputRing {
    cap: usize,
    lines: Vec<String>,
}

impl LiveOutputRing {
    fn new(cap: usize) -> Self {
        Self { cap, lines: Vec::new() }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() >= self.cap {
            self.lines.remove(0);
        }
        self.lines.push(line);
    }

    pub fn tail(&self) -> &[String] {
        &self.lines
    }
}

/// Registry entry — owns the child handle and its kill-function closure.
pub struct ProcessHandle {
    pub run_id: RunId,
    pub session_id: String,
    pub project_path: String,
    pub model: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub pid: AtomicU32,
    pub cancelled: std::sync::atomic::AtomicBool,
    child: Mutex<Option<Child>>,
    pub live_output: Mutex<LiveOutputRing>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        let p = self.pid.load(Ordering::SeqCst);
        if p == 0 { None } else { Some(p) }
    }
}

/// Snapshot used by `listRunning`.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub run_id: RunId,
    pub session_id: String,
    pub pid: Option<u32>,
    pub project_path: String,
    pub model: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

pub struct ProcessRegistry {
    next_run_id: AtomicU64,
    handles: Mutex<HashMap<RunId, Arc<ProcessHandle>>>,
    by_session: Mutex<HashMap<String, RunId>>,
    max_concurrent: usize,
    kill_grace: Duration,
}

impl ProcessRegistry {
    pub fn new(max_concurrent: usize, kill_grace: Duration) -> Self {
        Self {
            next_run_id: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
            by_session: Mutex::new(HashMap::new()),
            max_concurrent,
            kill_grace,
        }
    }

    /// Register a freshly spawned child. Idempotent per `sessionId`: a
    /// second call for an already-running session first kills the previous
    /// run and waits for its reaper (P4 — unregister precedes the new
    /// registration).
    pub async fn register(
        &self,
        session_id: &str,
        child: Child,
        project_path: &str,
        model: &str,
    ) -> Result<RunId, RegistryError> {
        if let Some(previous) = self.lookup(session_id).await {
            info!(session_id, previous, "superseding still-running process for session");
            self.kill(previous).await;
        }

        {
            let handles = self.handles.lock().await;
            if handles.len() >= self.max_concurrent {
                return Err(RegistryError::CapacityExceeded(self.max_concurrent));
            }
        }

        let run_id = self.next_run_id.fetch_add(1, Ordering::SeqCst);
        let pid = child.id().unwrap_or(0);
        let handle = Arc::new(ProcessHandle {
            run_id,
            session_id: session_id.to_string(),
            project_path: project_path.to_string(),
            model: model.to_string(),
            started_at: chrono::Utc::now(),
            pid: AtomicU32::new(pid),
            cancelled: std::sync::atomic::AtomicBool::new(false),
            child: Mutex::new(Some(child)),
            live_output: Mutex::new(LiveOutputRing::new(500)),
        });

        self.handles.lock().await.insert(run_id, handle);
        self.by_session.lock().await.insert(session_id.to_string(), run_id);
        Ok(run_id)
    }

    /// Unregister a finished run. Must be called before the registry
    /// accepts a replacement child for the same session (P4, invariant b).
    pub async fn unregister(&self, run_id: RunId) {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.remove(&run_id) {
            let mut by_session = self.by_session.lock().await;
            if by_session.get(&handle.session_id) == Some(&run_id) {
                by_session.remove(&handle.session_id);
            }
        }
    }

    pub async fn lookup(&self, session_id: &str) -> Option<RunId> {
        self.by_session.lock().await.get(session_id).copied()
    }

    pub async fn get(&self, run_id: RunId) -> Option<Arc<ProcessHandle>> {
        self.handles.lock().await.get(&run_id).cloned()
    }

    pub async fn list_running(&self) -> Vec<ProcessInfo> {
        self.handles
            .lock()
            .await
            .values()
            .map(|h| ProcessInfo {
                run_id: h.run_id,
                session_id: h.session_id.clone(),
                pid: h.pid(),
                project_path: h.project_path.clone(),
                model: h.model.clone(),
                started_at: h.started_at,
            })
            .collect()
    }

    pub async fn append_live_output(&self, run_id: RunId, chunk: String) {
        if let Some(handle) = self.get(run_id).await {
            handle.live_output.lock().await.push(chunk);
        }
    }

    /// Two-phase kill: graceful signal, bounded wait, then forced
    /// termination. Returns `true` if a process was actually killed.
    pub async fn kill(&self, run_id: RunId) -> bool {
        let Some(handle) = self.get(run_id).await else { return false };
        handle.cancelled.store(true, Ordering::SeqCst);

        let mut child_guard = handle.child.lock().await;
        let Some(child) = child_guard.as_mut() else { return false };

        #[cfg(unix)]
        {
            if let Some(pid) = handle.pid() {
                signal_process_group(pid, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        let waited = tokio::time::timeout(self.kill_grace, child.wait()).await;
        if waited.is_err() {
            warn!(run_id, "graceful kill timed out, forcing termination");
            #[cfg(unix)]
            {
                if let Some(pid) = handle.pid() {
                    signal_process_group(pid, libc::SIGKILL);
                }
            }
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        true
    }

    /// Pause a running child via SIGSTOP (unix only — no-op elsewhere).
    #[cfg(unix)]
    pub async fn pause(&self, run_id: RunId) -> bool {
        let Some(handle) = self.get(run_id).await else { return false };
        match handle.pid() {
            Some(pid) => {
                signal_process_group(pid, libc::SIGSTOP);
                true
            }
            None => false,
        }
    }

    /// Resume a paused child via SIGCONT (unix only — no-op elsewhere).
    #[cfg(unix)]
    pub async fn resume(&self, run_id: RunId) -> bool {
        let Some(handle) = self.get(run_id).await else { return false };
        match handle.pid() {
            Some(pid) => {
                signal_process_group(pid, libc::SIGCONT);
                true
            }
            None => false,
        }
    }
}

#[cfg(unix)]
fn signal_process_group(pid: u32, sig: i32) {
    // SAFETY: `pid` is a plain process id previously obtained from
    // `Child::id()`; sending a signal to it (or its process group) has no
    // memory-safety implications, only the documented kernel effect.
    unsafe {
        libc::kill(pid as i32, sig);
    }
}
