//! SessionRecord / TurnRecord (§3) and the broker's per-session state
//! machine (§4.2).

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::process::RunId;
use crate::stream::ContentBlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Spawning,
    Running,
    Interrupting,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
    ToolResult,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_id: String,
    pub timestamp: DateTime<Utc>,
    pub role: TurnRole,
    pub content: Vec<ContentBlock>,
    pub parent_tool_use_id: Option<String>,
    pub usage: Option<crate::stream::Usage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub total_cost_usd: f64,
}

impl UsageTotals {
    pub fn accumulate(&mut self, usage: &crate::stream::Usage) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.cache_read_tokens += usage.cache_read_tokens.unwrap_or(0);
        self.cache_creation_tokens += usage.cache_creation_tokens.unwrap_or(0);
    }
}

/// The unit of broker state (§3). Mutated only by `SessionBroker` — no
/// other component is allowed to write through this type directly.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub provider_session_id: Option<String>,
    pub provider: String,
    pub model: String,
    pub cwd: String,
    pub history: Vec<TurnRecord>,
    pub has_generated_title: bool,
    pub was_interrupted: bool,
    pub title_text: Option<String>,
    pub active_run_id: Option<RunId>,
    pub pending_interrupt: bool,
    pub active_file_ops: HashSet<String>,
    pub usage: UsageTotals,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub spawned_at: Option<std::time::Instant>,
}

impl SessionRecord {
    pub fn new(session_id: String, provider: String, model: String, cwd: String) -> Self {
        Self {
            session_id,
            provider_session_id: None,
            provider,
            model,
            cwd,
            history: Vec::new(),
            has_generated_title: false,
            was_interrupted: false,
            title_text: None,
            active_run_id: None,
            pending_interrupt: false,
            active_file_ops: HashSet::new(),
            usage: UsageTotals::default(),
            state: SessionState::Idle,
            created_at: Utc::now(),
            spawned_at: None,
        }
    }

    /// Whether this session is within the 3 s "young-process window"
    /// during which a new turn should be deferred rather than killing the
    /// just-started child (§4.2 Quiescence windows, B4).
    pub fn in_young_process_window(&self) -> bool {
        match self.spawned_at {
            Some(t) => t.elapsed() < std::time::Duration::from_secs(3),
            None => false,
        }
    }
}
