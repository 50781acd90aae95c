//! CanonicalEventModel (C2) — typed sum over stream-json event kinds.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single content block within an `assistant`/`user` envelope or a
/// `TurnRecord` (SPEC_FULL.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Thinking { text: String, #[serde(default)] hidden: bool },
    ToolUse { id: String, name: String, input: Value },
    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    Code { language: String, text: String },
    Image { mime_type: String, #[serde(flatten)] source: ImageSource },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    Data { data: String },
    Url { url: String },
}

/// System-event subtypes (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SystemSubtype {
    Init,
    SessionId,
    CompactBoundary,
    Error,
    Clear,
    Info,
    Interrupted,
    StreamEnd,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemInit {
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub cwd: Option<String>,
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: Option<u64>,
    #[serde(default)]
    pub cache_creation_tokens: Option<u64>,
    /// Set by ShimDriver when usage was estimated via a char-count
    /// heuristic rather than reported by the upstream CLI (§4.4).
    #[serde(default)]
    pub estimated: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResultPayload {
    pub is_error: bool,
    pub subtype: Option<String>,
    pub usage: Option<Usage>,
    pub total_cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub errors: Option<Vec<String>>,
    /// Resume-failure signal (§4.2, §7 *ResumeNotFound*): tells the client
    /// its last turn must be resent against a fresh session.
    #[serde(default)]
    pub requires_checkpoint_restore: bool,
}

/// The authoritative set of canonical stream-json event variants
/// (SPEC_FULL.md §4.1). Unknown `type` values round-trip through `Raw`
/// rather than being dropped (validation rule).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalEvent {
    System {
        subtype: SystemSubtype,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        permission_mode: Option<String>,
        #[serde(default)]
        tools: Vec<String>,
        #[serde(default)]
        message: Option<String>,
    },
    Text {
        content: String,
        #[serde(default)]
        id: Option<String>,
    },
    Thinking {
        text: String,
        #[serde(default)]
        hidden: bool,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        #[serde(alias = "toolUseId")]
        tool_use_id: String,
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    Usage(Usage),
    Result(ResultPayload),
    Error {
        message: String,
        code: Option<String>,
    },
    Interrupt,
    MessageStop,
    Assistant {
        content: Vec<ContentBlock>,
        parent_tool_use_id: Option<String>,
    },
    User {
        content: Vec<ContentBlock>,
        parent_tool_use_id: Option<String>,
    },
    /// Catch-all for any type this process doesn't (yet) recognize —
    /// preserved opaquely rather than dropped, per the validation rules in
    /// §4.1. Never constructed by this crate's own emitters.
    #[serde(other)]
    Raw,
}

impl CanonicalEvent {
    /// Whether this variant terminates a turn (used by the broker to know
    /// when to stop waiting for more events — P2).
    pub fn is_terminal(&self) -> bool {
        matches!(self, CanonicalEvent::Result(_))
    }

    pub fn is_message_stop(&self) -> bool {
        matches!(self, CanonicalEvent::MessageStop)
    }

    /// If this is a `system(subtype=init)` event, extract its payload as a
    /// `SystemInit` for the broker's session-id late-binding (§4.2).
    pub fn as_system_init(&self) -> Option<SystemInit> {
        match self {
            CanonicalEvent::System { subtype: SystemSubtype::Init, session_id, model, cwd, permission_mode, tools, .. } => {
                Some(SystemInit {
                    session_id: session_id.clone(),
                    model: model.clone(),
                    cwd: cwd.clone(),
                    permission_mode: permission_mode.clone(),
                    tools: tools.clone(),
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_text_event() {
        let ev = CanonicalEvent::Text { content: "hi".into(), id: None };
        let line = serde_json::to_string(&ev).unwrap();
        let back: CanonicalEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(ev, back);
    }

    #[test]
    fn unknown_type_becomes_raw_not_an_error() {
        let line = r#"{"type":"some_future_event","foo":"bar"}"#;
        let ev: CanonicalEvent = serde_json::from_str(line).expect("should not error");
        assert_eq!(ev, CanonicalEvent::Raw);
    }

    #[test]
    fn result_is_terminal() {
        let ev = CanonicalEvent::Result(ResultPayload::default());
        assert!(ev.is_terminal());
        assert!(!CanonicalEvent::MessageStop.is_terminal());
    }
}
