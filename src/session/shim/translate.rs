//! Mode A — translation-only ShimDriver (C6).
//!
//! Spawns `gemini`/`codex`, reads its native stream-json, and reshapes each
//! message into a canonical event (§4.4). The alien wire shape mirrored
//! here is the minimal one SPEC_FULL.md §4.4 describes: `text_delta`,
//! `function_call_delta` (streamed argument chunks), `function_call_result`,
//! and `done`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;

use crate::stream::{CanonicalEvent, ResultPayload, Usage};

use super::buffer::ToolCallBuffer;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlienEvent {
    TextDelta { text: String },
    FunctionCallDelta { call_index: u32, name: Option<String>, args_chunk: String },
    FunctionCallResult { call_index: u32, content: serde_json::Value, #[serde(default)] is_error: bool },
    Usage { input_tokens: Option<u64>, output_tokens: Option<u64> },
    Done,
}

/// Translates one provider's alien stream-json into canonical events,
/// owning the id-rewrite table and in-flight tool-call buffers for a
/// single turn.
pub struct ShimTranslator {
    provider: String,
    counter: AtomicU64,
    /// alien call_index -> (synthetic id, buffer)
    pending: HashMap<u32, ToolCallBuffer>,
    /// synthetic id -> alien call_index, so tool_results can be matched
    /// back to the upstream CLI (§4.4 tool-use id scheme).
    id_table: HashMap<String, u32>,
    chars_seen: usize,
    saw_real_usage: bool,
}

impl ShimTranslator {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            counter: AtomicU64::new(0),
            pending: HashMap::new(),
            id_table: HashMap::new(),
            chars_seen: 0,
            saw_real_usage: false,
        }
    }

    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("call_{}_{}", self.provider, n)
    }

    /// Translate one alien event, possibly producing zero canonical events
    /// (a still-incomplete argument chunk) or more than one (a completed
    /// tool call that was previously named but not yet fully buffered).
    pub fn translate(&mut self, alien: AlienEvent) -> Vec<CanonicalEvent> {
        match alien {
            AlienEvent::TextDelta { text } => {
                self.chars_seen += text.chars().count();
                vec![CanonicalEvent::Text { content: text, id: None }]
            }
            AlienEvent::FunctionCallDelta { call_index, name, args_chunk } => {
                let syn_id = self.synthetic_id_for(call_index);
                let buffer = self
                    .pending
                    .entry(call_index)
                    .or_insert_with(|| ToolCallBuffer::new(syn_id, name.clone().unwrap_or_default()));
                if let Some(name) = name {
                    if buffer.tool_name.is_empty() {
                        buffer.tool_name = name;
                    }
                }
                match buffer.push(&args_chunk) {
                    Some(input) => {
                        let id = buffer.tool_id.clone();
                        let name = buffer.tool_name.clone();
                        self.pending.remove(&call_index);
                        vec![CanonicalEvent::ToolUse { id, name, input }]
                    }
                    None => vec![],
                }
            }
            AlienEvent::FunctionCallResult { call_index, content, is_error } => {
                let id = self
                    .id_table
                    .iter()
                    .find(|(_, idx)| **idx == call_index)
                    .map(|(id, _)| id.clone())
                    .unwrap_or_else(|| self.synthetic_id_for(call_index));
                vec![CanonicalEvent::ToolResult { tool_use_id: id, content, is_error }]
            }
            AlienEvent::Usage { input_tokens, output_tokens } => {
                self.saw_real_usage = true;
                vec![CanonicalEvent::Usage(Usage {
                    input_tokens: input_tokens.unwrap_or(0),
                    output_tokens: output_tokens.unwrap_or(0),
                    cache_read_tokens: None,
                    cache_creation_tokens: None,
                    estimated: false,
                })]
            }
            AlienEvent::Done => {
                let mut out = Vec::new();
                if !self.saw_real_usage {
                    // Char-count heuristic: ~4 chars/token, matching the
                    // common rough estimate used when a provider doesn't
                    // report usage at all.
                    out.push(CanonicalEvent::Usage(Usage {
                        input_tokens: 0,
                        output_tokens: (self.chars_seen / 4) as u64,
                        cache_read_tokens: None,
                        cache_creation_tokens: None,
                        estimated: true,
                    }));
                }
                out.push(CanonicalEvent::Result(ResultPayload { is_error: false, ..Default::default() }));
                out.push(CanonicalEvent::MessageStop);
                out
            }
        }
    }

    fn synthetic_id_for(&mut self, call_index: u32) -> String {
        if let Some((id, _)) = self.id_table.iter().find(|(_, idx)| **idx == call_index) {
            return id.clone();
        }
        let id = self.next_id();
        self.id_table.insert(id.clone(), call_index);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_delta_becomes_text_event() {
        let mut t = ShimTranslator::new("gemini");
        let out = t.translate(AlienEvent::TextDelta { text: "hi".into() });
        assert_eq!(out, vec![CanonicalEvent::Text { content: "hi".into(), id: None }]);
    }

    #[test]
    fn partial_function_call_coalesces_to_one_tool_use() {
        let mut t = ShimTranslator::new("codex");
        let chunks = [
            "{\"file_path\":\"/w/",
            "a.txt\",\"old_string\":\"x\",\"new_string",
            ":\"y\"}",
        ];
        let mut tool_uses = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            let name = if i == 0 { Some("Edit".to_string()) } else { None };
            let out = t.translate(AlienEvent::FunctionCallDelta {
                call_index: 0,
                name,
                args_chunk: chunk.to_string(),
            });
            tool_uses += out
                .iter()
                .filter(|e| matches!(e, CanonicalEvent::ToolUse { .. }))
                .count();
        }
        assert_eq!(tool_uses, 1, "exactly one tool_use regardless of chunk count (B2)");
    }

    #[test]
    fn missing_usage_is_estimated_at_done() {
        let mut t = ShimTranslator::new("gemini");
        t.translate(AlienEvent::TextDelta { text: "a".repeat(8) });
        let out = t.translate(AlienEvent::Done);
        let usage = out.iter().find_map(|e| match e {
            CanonicalEvent::Usage(u) => Some(u.clone()),
            _ => None,
        });
        assert!(usage.unwrap().estimated);
    }
}
