//! StreamParser (C1) — frames line-delimited JSON out of arbitrary byte
//! chunks, tolerant of the legacy `$`-terminated JSONL dialect.
//!
//! The framing state machine is total: every branch returns a value, never
//! panics, and a malformed object never corrupts the objects that follow it
//! (§4.1, §9 "exceptions/panics for control flow" re-architecture note).

use tracing::{debug, warn};

use super::event::CanonicalEvent;

/// A fully framed line, ready for CanonicalEventModel validation, or a
/// diagnostic about a byte range that could not be framed.
#[derive(Debug, Clone, PartialEq)]
pub enum Framed {
    Object(String),
    ParseError { line_offset: u64, reason: String },
    FramingOverflow { bytes_dropped: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Between objects, skipping whitespace.
    Idle,
    /// Inside an object, tracking brace depth.
    InObject,
    InString,
    InStringEscape,
}

/// Incremental framer over a byte stream. Feed it chunks via `push`; it
/// returns zero or more `Framed` items per call. Owns its own buffer so it
/// can be fed arbitrarily-sized chunks (chunking-invariance, P8).
pub struct StreamParser {
    max_line_bytes: usize,
    buf: Vec<u8>,
    state: ScanState,
    depth: u32,
    line_offset: u64,
    /// Byte offset into `buf` where the current object scan started.
    object_start: usize,
}

impl StreamParser {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes,
            buf: Vec::new(),
            state: ScanState::Idle,
            depth: 0,
            line_offset: 0,
            object_start: 0,
        }
    }

    /// Feed a chunk of bytes (may split a JSON object, or a multibyte UTF-8
    /// codepoint, at any boundary). Bytes are buffered raw and only decoded
    /// once a full object has been framed (`scan`), so a split codepoint
    /// never gets corrupted into a replacement character (P8).
    /// Returns every object/diagnostic completed by this chunk, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Framed> {
        self.buf.extend_from_slice(chunk);
        self.scan()
    }

    /// Signal EOF — flushes any pending partial object as a diagnostic
    /// rather than silently dropping it.
    pub fn finish(&mut self) -> Vec<Framed> {
        let mut out = self.scan();
        if self.state != ScanState::Idle && !self.buf[self.object_start..].is_empty() {
            out.push(Framed::ParseError {
                line_offset: self.line_offset,
                reason: "stream ended mid-object".to_string(),
            });
        }
        self.buf.clear();
        self.object_start = 0;
        self.state = ScanState::Idle;
        out
    }

    fn scan(&mut self) -> Vec<Framed> {
        let mut out = Vec::new();
        let mut i = self.object_start;
        let len = self.buf.len();

        while i < len {
            let b = self.buf[i];
            match self.state {
                ScanState::Idle => {
                    if b == b' ' || b == b'\t' || b == b'\n' || b == b'\r' || b == b'$' {
                        i += 1;
                        self.object_start = i;
                        continue;
                    }
                    if b == b'{' {
                        self.state = ScanState::InObject;
                        self.depth = 1;
                        i += 1;
                        continue;
                    }
                    // Unexpected byte outside an object: skip to next newline.
                    let mut j = i;
                    while j < len && self.buf[j] != b'\n' {
                        j += 1;
                    }
                    out.push(Framed::ParseError {
                        line_offset: self.line_offset,
                        reason: format!(
                            "unexpected byte {:?} outside object",
                            b as char
                        ),
                    });
                    self.line_offset += 1;
                    i = if j < len { j + 1 } else { j };
                    self.object_start = i;
                    self.state = ScanState::Idle;
                }
                ScanState::InObject => {
                    match b {
                        b'"' => self.state = ScanState::InString,
                        b'{' => self.depth += 1,
                        b'}' => {
                            self.depth -= 1;
                            if self.depth == 0 {
                                let obj_bytes = &self.buf[self.object_start..=i];
                                let obj = String::from_utf8_lossy(obj_bytes).to_string();
                                out.push(Framed::Object(obj));
                                self.line_offset += 1;
                                i += 1;
                                self.object_start = i;
                                self.state = ScanState::Idle;
                                continue;
                            }
                        }
                        _ => {}
                    }
                    i += 1;
                }
                ScanState::InString => {
                    match b {
                        b'\\' => self.state = ScanState::InStringEscape,
                        b'"' => self.state = ScanState::InObject,
                        _ => {}
                    }
                    i += 1;
                }
                ScanState::InStringEscape => {
                    // Any byte following a backslash is consumed literally;
                    // return to normal string scanning.
                    self.state = ScanState::InString;
                    i += 1;
                }
            }

            if self.state != ScanState::Idle {
                let pending = i - self.object_start;
                if pending > self.max_line_bytes {
                    out.push(Framed::FramingOverflow { bytes_dropped: pending });
                    warn!(pending, "framing overflow, resetting buffer");
                    self.state = ScanState::Idle;
                    self.depth = 0;
                    self.object_start = i;
                }
            }
        }

        // Compact the buffer: drop everything already consumed so it
        // doesn't grow unboundedly across many `push` calls.
        if self.object_start > 0 {
            self.buf.drain(0..self.object_start);
            self.object_start = 0;
        }

        out
    }
}

/// Parse a single already-framed JSON object into a `CanonicalEvent`,
/// applying the validation rules in §4.1: unknown fields/types pass through
/// rather than erroring (handled by serde's `#[serde(other)]` on the enum
/// itself); a genuinely invalid JSON object becomes a diagnostic, not a
/// panic.
pub fn validate(object: &str) -> Result<CanonicalEvent, String> {
    serde_json::from_str(object).map_err(|e| e.to_string())
}

/// High-level helper combining framing + validation, used by provider
/// adapters that just want a vec of events per chunk plus any diagnostics
/// (diagnostics are logged, never surfaced to clients — §4.1 "Failure
/// modes").
pub fn frame_and_validate(parser: &mut StreamParser, chunk: &[u8]) -> Vec<CanonicalEvent> {
    let mut events = Vec::new();
    for framed in parser.push(chunk) {
        match framed {
            Framed::Object(obj) => match validate(&obj) {
                Ok(ev) => events.push(ev),
                Err(reason) => debug!(reason, "parse_error diagnostic, not surfaced to client"),
            },
            Framed::ParseError { line_offset, reason } => {
                debug!(line_offset, reason, "parse_error diagnostic, not surfaced to client");
            }
            Framed::FramingOverflow { bytes_dropped } => {
                events.push(CanonicalEvent::Error {
                    message: format!("framing overflow: {bytes_dropped} bytes dropped"),
                    code: Some("framing_overflow".to_string()),
                });
            }
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_single_newline_terminated_object() {
        let mut p = StreamParser::new(1024);
        let out = p.push(b"{\"type\":\"text\",\"content\":\"hi\"}\n");
        assert_eq!(out, vec![Framed::Object("{\"type\":\"text\",\"content\":\"hi\"}".to_string())]);
    }

    #[test]
    fn frames_legacy_dollar_terminated_object() {
        let mut p = StreamParser::new(1024);
        let out = p.push(b"{\"type\":\"text\",\"content\":\"hi\"}$");
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Framed::Object(_)));
    }

    #[test]
    fn handles_arbitrary_chunk_boundaries() {
        let full = b"{\"type\":\"text\",\"content\":\"hello world\"}\n{\"type\":\"message_stop\"}\n";
        // Baseline: parse in one shot.
        let mut whole = StreamParser::new(4096);
        let baseline = whole.push(full);

        // Split at every byte boundary and assert the same objects result.
        for split in 1..full.len() {
            let mut p = StreamParser::new(4096);
            let mut out = p.push(&full[..split]);
            out.extend(p.push(&full[split..]));
            assert_eq!(out, baseline, "split at {split} produced a different result");
        }
    }

    #[test]
    fn quotes_with_escaped_braces_dont_confuse_depth() {
        let mut p = StreamParser::new(1024);
        let line = br#"{"type":"text","content":"a \"brace-like\" } inside a string"}"#;
        let mut chunk = line.to_vec();
        chunk.push(b'\n');
        let out = p.push(&chunk);
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Framed::Object(_)));
    }

    #[test]
    fn overflow_does_not_corrupt_following_object() {
        let mut p = StreamParser::new(16);
        let giant = format!("{{\"type\":\"text\",\"content\":\"{}\"}}\n", "x".repeat(100));
        let next = "{\"type\":\"message_stop\"}\n";
        let out = p.push(format!("{giant}{next}").as_bytes());
        assert!(out.iter().any(|f| matches!(f, Framed::FramingOverflow { .. })));
        assert!(out.iter().any(|f| matches!(f, Framed::Object(o) if o.contains("message_stop"))));
    }

    #[test]
    fn multibyte_codepoint_split_across_chunks_is_not_corrupted() {
        // "é" is 2 bytes (0xC3 0xA9); split the object so the chunk boundary
        // falls between those two bytes.
        let full = "{\"type\":\"text\",\"content\":\"caf\u{e9}\"}\n".as_bytes().to_vec();
        let split = full.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut p = StreamParser::new(4096);
        let mut out = p.push(&full[..split]);
        out.extend(p.push(&full[split..]));

        assert_eq!(out.len(), 1);
        match &out[0] {
            Framed::Object(obj) => {
                let ev: CanonicalEvent = validate(obj).unwrap();
                assert!(matches!(ev, CanonicalEvent::Text { content, .. } if content == "caf\u{e9}"));
            }
            other => panic!("expected a framed object, got {other:?}"),
        }
    }

    #[test]
    fn exactly_at_max_line_bytes_parses() {
        // Build an object whose total byte length equals max_line_bytes exactly.
        let prefix = "{\"type\":\"text\",\"content\":\"";
        let suffix = "\"}";
        let max = 200usize;
        let filler_len = max - prefix.len() - suffix.len();
        let obj = format!("{prefix}{}{suffix}", "a".repeat(filler_len));
        assert_eq!(obj.len(), max);

        let mut p = StreamParser::new(max);
        let out = p.push(format!("{obj}\n").as_bytes());
        assert!(out.iter().all(|f| !matches!(f, Framed::FramingOverflow { .. })));
        assert!(matches!(&out[0], Framed::Object(_)));
    }
}
