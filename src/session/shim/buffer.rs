//! Partial tool-call argument buffering (B2, S3).
//!
//! Reuses the brace/quote/escape depth-tracking idea from C1's framing
//! scanner, but at argument-object granularity: a `ToolCallBuffer`
//! accumulates chunks and only attempts a full `serde_json::from_str` once
//! depth has returned to zero, rather than reparsing the growing string on
//! every chunk. Grounded on the `ToolCallBuffer{tool_id, tool_name,
//! json_checker, ...}` shape seen in the corpus's streaming tool-call
//! handling.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Normal,
    InString,
    InStringEscape,
}

/// Incremental completeness checker for a single JSON object being
/// assembled from chunks. Tracks brace depth so the buffer knows the
/// object is syntactically complete without reparsing from scratch.
#[derive(Debug)]
struct JsonChecker {
    state: ScanState,
    depth: i64,
    started: bool,
}

impl JsonChecker {
    fn new() -> Self {
        Self { state: ScanState::Normal, depth: 0, started: false }
    }

    /// Feed a chunk; returns `true` once the object is syntactically
    /// complete (depth returned to zero after having opened).
    fn feed(&mut self, chunk: &str) -> bool {
        for b in chunk.bytes() {
            match self.state {
                ScanState::Normal => match b {
                    b'"' => self.state = ScanState::InString,
                    b'{' | b'[' => {
                        self.depth += 1;
                        self.started = true;
                    }
                    b'}' | b']' => self.depth -= 1,
                    _ => {}
                },
                ScanState::InString => match b {
                    b'\\' => self.state = ScanState::InStringEscape,
                    b'"' => self.state = ScanState::Normal,
                    _ => {}
                },
                ScanState::InStringEscape => self.state = ScanState::InString,
            }
        }
        self.started && self.depth <= 0
    }
}

/// Buffers a single tool call's streamed argument chunks until the
/// argument object is syntactically complete, then parses it exactly once.
pub struct ToolCallBuffer {
    pub tool_id: String,
    pub tool_name: String,
    raw: String,
    checker: JsonChecker,
}

impl ToolCallBuffer {
    pub fn new(tool_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            tool_id: tool_id.into(),
            tool_name: tool_name.into(),
            raw: String::new(),
            checker: JsonChecker::new(),
        }
    }

    /// Feed the next chunk of serialized argument bytes. Returns the parsed
    /// `input` object once (and only once) the object is complete.
    pub fn push(&mut self, chunk: &str) -> Option<Value> {
        self.raw.push_str(chunk);
        if self.checker.feed(chunk) {
            serde_json::from_str::<Value>(&self.raw).ok()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_three_chunk_partial_object() {
        let mut buf = ToolCallBuffer::new("call_gemini_1", "Edit");
        assert!(buf.push("{\"file_path\":\"/w/").is_none());
        assert!(buf
            .push("a.txt\",\"old_string\":\"x\",\"new_string")
            .is_none());
        let result = buf.push(":\"y\"}");
        let value = result.expect("object should be complete after third chunk");
        assert_eq!(value["file_path"], "/w/a.txt");
        assert_eq!(value["old_string"], "x");
        assert_eq!(value["new_string"], "y");
    }

    #[test]
    fn single_chunk_object_completes_immediately() {
        let mut buf = ToolCallBuffer::new("call_codex_1", "Bash");
        let result = buf.push("{\"command\":\"ls\"}");
        assert!(result.is_some());
    }

    #[test]
    fn nested_braces_inside_string_dont_complete_early() {
        let mut buf = ToolCallBuffer::new("call_gemini_2", "Write");
        assert!(buf
            .push("{\"file_path\":\"/w/a.txt\",\"content\":\"looks like { json }\"")
            .is_none());
        let result = buf.push("}");
        assert!(result.is_some());
    }
}
