//! `agentbrokerd` — a local broker mediating between a GUI client and
//! external AI coding CLIs (Claude, Gemini, OpenAI/Codex) over a canonical
//! stream-json wire format.

pub mod approval;
pub mod boundary;
pub mod config;
pub mod errors;
pub mod index;
pub mod persistence;
pub mod process;
pub mod session;
pub mod stream;
pub mod tools;

use std::sync::Arc;

use tracing::info;

use approval::ApprovalRouter;
use config::DaemonConfig;
use index::SessionIndex;
use persistence::PersistenceStore;
use process::ProcessRegistry;
use session::SessionBroker;
use tools::sandbox::SandboxPolicy;
use tools::ToolExecutor;

/// Everything the BoundaryAPI needs to dispatch a request. Deliberately
/// narrow: eight subsystems, not a kitchen-sink god object — config,
/// process registry, session broker, tool executor, approval router,
/// session index, persistence store, and the started-at clock. Per-session
/// event fan-out lives inside `SessionBroker`'s own `SessionEntry`, not as
/// a separate top-level subsystem here.
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub registry: Arc<ProcessRegistry>,
    pub broker: Arc<SessionBroker>,
    pub executor: Arc<ToolExecutor>,
    pub approvals: Arc<ApprovalRouter>,
    pub index: Arc<SessionIndex>,
    pub persistence: Arc<PersistenceStore>,
    pub started_at: std::time::Instant,
}

impl AppContext {
    pub fn build(config: DaemonConfig) -> anyhow::Result<Arc<Self>> {
        let config = Arc::new(config);

        let registry = Arc::new(ProcessRegistry::new(config.max_concurrent_sessions, config.kill_grace));

        let sandbox = SandboxPolicy::new(
            std::env::current_dir().unwrap_or_else(|_| std::path::PathBuf::from(".")),
            vec![index::native_claude::default_claude_projects_root(), index::shim_store::default_shim_sessions_root()],
        );
        let executor = Arc::new(ToolExecutor::new(sandbox, config.tool_output_cap_bytes, config.bash_timeout));

        let approvals = Arc::new(ApprovalRouter::new());

        let broker = Arc::new(SessionBroker::new(
            Arc::clone(&registry),
            Arc::clone(&executor),
            Arc::clone(&approvals),
            Arc::clone(&config),
        ));

        let home = std::env::var_os("HOME").map(std::path::PathBuf::from).unwrap_or_else(|| std::path::PathBuf::from("."));
        let index = Arc::new(SessionIndex::new(
            home.join(".yume").join("session-index.json"),
            index::native_claude::default_claude_projects_root(),
            index::shim_store::default_shim_sessions_root(),
        ));

        let persistence = Arc::new(PersistenceStore::new(index::shim_store::default_shim_sessions_root()));

        info!(bind_addr = %config.bind_addr, "AppContext built");

        Ok(Arc::new(Self { config, registry, broker, executor, approvals, index, persistence, started_at: std::time::Instant::now() }))
    }
}
