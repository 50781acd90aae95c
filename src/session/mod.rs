//! Session-layer modules: the per-provider `Runner` implementations, the
//! shim (translation + shim-as-agent), session records, and the broker
//! state machine that ties them to the BoundaryAPI (§4).

pub mod broker;
pub mod claude;
pub mod codex;
pub mod gemini;
pub mod record;
pub mod runner;
pub mod shim;

pub use broker::SessionBroker;
pub use record::{SessionRecord, SessionState, TurnRecord, TurnRole, UsageTotals};
pub use runner::{Runner, ToolDecision};
