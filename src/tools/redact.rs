//! Secret redaction for ToolExecutor output (§4.4 "Secret redaction", P7).
//!
//! Grounded near-verbatim on `clawd`'s `policy/secrets.rs` pattern set and
//! `telemetry/redact.rs`'s Shannon-entropy fallback, applied here to tool
//! *output* rather than tool *arguments* — the broker scans both
//! directions, since a `Read` of a `.env` file is just as much of a leak
//! vector as a crafted argument.

use once_cell::sync::Lazy;
use regex::Regex;

/// Regex patterns for common credential shapes. Matches are replaced with
/// `[REDACTED:<prefix>...]` rather than dropped entirely, so the surrounding
/// context ("found API key: ...") stays readable.
static SECRET_PATTERNS: &[&str] = &[
    r"sk-[A-Za-z0-9\-_]{20,}",
    r"ghp_[A-Za-z0-9]{36}",
    r"github_pat_[A-Za-z0-9_]{82}",
    r"AKIA[0-9A-Z]{16}",
    r"-----BEGIN\s+(?:RSA |EC |OPENSSH )?PRIVATE KEY-----[\s\S]*?-----END\s+(?:RSA |EC |OPENSSH )?PRIVATE KEY-----",
    r"(?i)bearer\s+[A-Za-z0-9\-_.]{16,}",
    r#"(?i)(password|secret|token|api_key|auth_key|private_key)\s*[:=]\s*["']?[A-Za-z0-9+/\-_]{8,}"#,
];

static COMPILED_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    SECRET_PATTERNS
        .iter()
        .map(|p| Regex::new(p).expect("SECRET_PATTERNS: invalid regex"))
        .collect()
});

/// Shannon entropy in bits/char, used to catch high-entropy tokens that
/// don't match a known credential shape.
pub fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }
    let mut counts = std::collections::HashMap::new();
    for c in s.chars() {
        *counts.entry(c).or_insert(0u32) += 1;
    }
    let len = s.chars().count() as f64;
    counts
        .values()
        .map(|&count| {
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

pub fn is_high_entropy(token: &str) -> bool {
    token.len() >= 20 && shannon_entropy(token) > 4.5
}

/// Result of redacting a block of tool output: the sanitized text plus how
/// many matches were replaced (surfaced as a stderr diagnostic — §4.4).
pub struct RedactionResult {
    pub text: String,
    pub count: usize,
}

/// Scan `content` for known secret patterns and high-entropy tokens,
/// replacing each match with `[REDACTED:<prefix>...]`.
pub fn redact(content: &str) -> RedactionResult {
    let mut text = content.to_string();
    let mut count = 0;

    for pattern in COMPILED_PATTERNS.iter() {
        text = replace_all_tracked(pattern, &text, &mut count);
    }

    // High-entropy fallback: scan whitespace-delimited words in what's left.
    let words: Vec<String> = text.split_whitespace().map(|w| w.to_string()).collect();
    let mut rebuilt = text.clone();
    for word in words {
        let token = word.trim_matches(|c: char| !c.is_alphanumeric() && c != '+' && c != '/');
        if token.len() >= 20 && is_high_entropy(token) && !token.starts_with("[REDACTED") {
            let prefix = &token[..token.len().min(4)];
            let replacement = format!("[REDACTED:{prefix}...]");
            rebuilt = rebuilt.replacen(token, &replacement, 1);
            count += 1;
        }
    }

    RedactionResult { text: rebuilt, count }
}

fn replace_all_tracked(pattern: &Regex, text: &str, count: &mut usize) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for m in pattern.find_iter(text) {
        out.push_str(&text[last..m.start()]);
        let matched = m.as_str();
        let prefix = &matched[..matched.len().min(4)];
        out.push_str(&format!("[REDACTED:{prefix}...]"));
        last = m.end();
        *count += 1;
    }
    out.push_str(&text[last..]);
    out
}

/// Truncate tool content beyond `cap_bytes`, appending a visible marker
/// rather than silently dropping the tail (§4.4 "Output cap").
pub fn cap_output(content: &str, cap_bytes: usize) -> String {
    if content.len() <= cap_bytes {
        return content.to_string();
    }
    let mut end = cap_bytes;
    while end > 0 && !content.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}\n[TRUNCATED: {} bytes omitted]",
        &content[..end],
        content.len() - end
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_openai_style_key() {
        let out = redact("my key is sk-abcdefghijklmnopqrstuvwxyz1234567890 please keep it safe");
        assert!(out.text.contains("[REDACTED:sk-a..."));
        assert_eq!(out.count, 1);
    }

    #[test]
    fn redacts_aws_key() {
        let out = redact("AKIAIOSFODNN7EXAMPLE1234 is the access key");
        assert!(out.text.contains("[REDACTED:"));
        assert_eq!(out.count, 1);
    }

    #[test]
    fn leaves_clean_output_untouched() {
        let out = redact("fn main() { println!(\"hello\"); }");
        assert_eq!(out.count, 0);
        assert_eq!(out.text, "fn main() { println!(\"hello\"); }");
    }

    #[test]
    fn caps_output_beyond_limit() {
        let content = "x".repeat(200);
        let capped = cap_output(&content, 100);
        assert!(capped.contains("[TRUNCATED: 100 bytes omitted]"));
        assert!(capped.len() < content.len());
    }
}
