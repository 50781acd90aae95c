//! Common `Runner` interface every provider adapter and the shim implement.
//!
//! Grounded on `clawd`'s `session/runner.rs`. That trait only declares
//! `send`/`pause`/`resume`/`stop`, yet its own `CodexRunner` implements
//! `run_turn` outside the trait; here `run_turn` is part of the contract
//! from the start since `SessionBroker` dispatches to it polymorphically
//! across providers.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::stream::CanonicalEvent;

/// Outcome of an approval-gated tool call, forwarded from the client
/// through the broker into the shim's approval channel (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolDecision {
    Approved,
    Rejected,
}

/// A provider adapter or shim driver: spawns (or continues) the upstream
/// process for one turn and streams canonical events back to the caller
/// until the turn's terminal `result`.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run one user turn to completion, sending every canonical event
    /// (including the terminal `result` and `message_stop`) on `events`.
    async fn run_turn(&self, content: &str, events: mpsc::Sender<CanonicalEvent>) -> anyhow::Result<()>;

    /// Send additional input to an already-running turn (used by Mode B's
    /// tool-result feedback and by providers that support interactive
    /// stdin).
    async fn send(&self, content: &str) -> anyhow::Result<()>;

    /// Pause the underlying process (SIGSTOP on unix).
    async fn pause(&self) -> anyhow::Result<()>;

    /// Resume a paused process (SIGCONT on unix).
    async fn resume(&self) -> anyhow::Result<()>;

    /// Stop the underlying process immediately (two-phase kill).
    async fn stop(&self) -> anyhow::Result<()>;
}
