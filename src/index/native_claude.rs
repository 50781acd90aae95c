//! Native Claude JSONL project-directory parser (§4.5).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::SessionIndexEntry;

/// Encode a project's absolute path the way the native Claude CLI encodes
/// its `~/.claude/projects/<encoded>` directory names: separators become
/// `-`, and the whole thing is prefixed with `-`.
pub fn encode_project_dir(cwd: &str) -> String {
    format!("-{}", cwd.replace(['/', '\\'], "-"))
}

/// Whether `file_name` should be skipped entirely: subagent session files
/// (`agent-` prefix) are not user-visible sessions.
fn is_subagent_file(file_name: &str) -> bool {
    file_name.starts_with("agent-")
}

/// Parse a single `<sessionId>.jsonl` file into a `SessionIndexEntry`.
/// Returns `None` for zero-byte files or files with no parseable lines.
pub fn parse_session_file(path: &Path, project_path: &str) -> Option<SessionIndexEntry> {
    let file_name = path.file_name()?.to_str()?;
    if is_subagent_file(file_name) {
        return None;
    }
    let metadata = std::fs::metadata(path).ok()?;
    if metadata.len() == 0 {
        return None;
    }

    let session_id = path.file_stem()?.to_str()?.to_string();
    let contents = std::fs::read_to_string(path).ok()?;

    let mut title: Option<String> = None;
    let mut summary: Option<String> = None;
    let mut first_user_message: Option<String> = None;
    let mut message_count = 0u64;
    let mut model = String::new();
    let mut total_tokens = 0u64;
    let mut total_cost = 0.0f64;

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else { continue };
        let line_type = value.get("type").and_then(Value::as_str).unwrap_or("");

        match line_type {
            "title" => {
                if let Some(t) = value.get("title").and_then(Value::as_str) {
                    title = Some(t.to_string());
                }
            }
            "summary" => {
                if title.is_none() {
                    if let Some(s) = value.get("summary").and_then(Value::as_str) {
                        summary = Some(s.to_string());
                    }
                }
            }
            "user" => {
                message_count += 1;
                if first_user_message.is_none() {
                    if let Some(text) = extract_first_text(&value) {
                        first_user_message = Some(text);
                    }
                }
            }
            "assistant" => {
                message_count += 1;
                if let Some(m) = value.get("model").and_then(Value::as_str) {
                    model = m.to_string();
                }
            }
            "system" => {
                if model.is_empty() {
                    if let Some(m) = value.get("model").and_then(Value::as_str) {
                        model = m.to_string();
                    }
                }
            }
            "result" => {
                if let Some(usage) = value.get("usage") {
                    let input = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
                    let output = usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
                    total_tokens += input + output;
                }
                if let Some(cost) = value.get("total_cost_usd").and_then(Value::as_f64) {
                    total_cost += cost;
                }
            }
            _ => {}
        }
    }

    let resolved_summary = title
        .or(summary)
        .or_else(|| first_user_message.map(|m| truncate_chars(&m, 100)));
    let sanitized_summary = resolved_summary.map(|s| sanitize_summary(&s));

    let created: DateTime<Utc> = metadata
        .created()
        .ok()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(Utc::now);
    let updated: DateTime<Utc> = metadata
        .modified()
        .ok()
        .map(DateTime::<Utc>::from)
        .unwrap_or(created);

    Some(SessionIndexEntry {
        session_id,
        provider: "claude".to_string(),
        model: model.clone(),
        model_display: model,
        title: sanitized_summary.clone().unwrap_or_default(),
        summary: sanitized_summary,
        project_path: project_path.to_string(),
        message_count,
        created,
        updated,
        file_path: path.display().to_string(),
        file_size: metadata.len(),
        claude_project_dir: Some(encode_project_dir(project_path)),
        compaction_count: None,
        total_tokens: Some(total_tokens),
        total_cost: Some(total_cost),
    })
}

fn extract_first_text(value: &Value) -> Option<String> {
    let content = value.get("message").and_then(|m| m.get("content")).or_else(|| value.get("content"))?;
    if let Some(s) = content.as_str() {
        return Some(s.to_string());
    }
    if let Some(blocks) = content.as_array() {
        for block in blocks {
            if block.get("type").and_then(Value::as_str) == Some("text") {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    return Some(text.to_string());
                }
            }
        }
    }
    None
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// HTML-escape and cap at 200 characters (§4.5 "Summaries are sanitized").
fn sanitize_summary(s: &str) -> String {
    let escaped = s
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;");
    truncate_chars(&escaped, 200)
}

/// Walk all project directories under the native Claude store root and
/// parse every session file found.
pub fn scan_all(claude_projects_root: &Path) -> Vec<SessionIndexEntry> {
    let mut entries = Vec::new();
    let Ok(project_dirs) = std::fs::read_dir(claude_projects_root) else { return entries };

    for project_dir in project_dirs.flatten() {
        let dir_path = project_dir.path();
        if !dir_path.is_dir() {
            continue;
        }
        let project_path = decode_project_dir(&dir_path);
        let Ok(files) = std::fs::read_dir(&dir_path) else { continue };
        for file in files.flatten() {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Some(entry) = parse_session_file(&path, &project_path) {
                entries.push(entry);
            }
        }
    }
    entries
}

fn decode_project_dir(dir_path: &Path) -> String {
    let name = dir_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    name.trim_start_matches('-').replace('-', "/")
}

/// Default root for native Claude project files.
pub fn default_claude_projects_root() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join("projects")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_project_dir_with_leading_dash() {
        assert_eq!(encode_project_dir("/home/dev/project"), "-home-dev-project");
    }

    #[test]
    fn skips_agent_prefixed_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent-123.jsonl");
        std::fs::write(&path, "{\"type\":\"user\"}\n").unwrap();
        assert!(parse_session_file(&path, "/tmp").is_none());
    }

    #[test]
    fn skips_zero_byte_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.jsonl");
        std::fs::write(&path, "").unwrap();
        assert!(parse_session_file(&path, "/tmp").is_none());
    }

    #[test]
    fn prefers_explicit_title_over_summary_and_first_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.jsonl");
        std::fs::write(
            &path,
            "{\"type\":\"user\",\"content\":\"hello there\"}\n{\"type\":\"summary\",\"summary\":\"a summary\"}\n{\"type\":\"title\",\"title\":\"The Title\"}\n",
        )
        .unwrap();
        let entry = parse_session_file(&path, "/tmp").expect("parsed");
        assert_eq!(entry.title, "The Title");
    }

    #[test]
    fn falls_back_to_truncated_first_user_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.jsonl");
        let long_message = "x".repeat(150);
        std::fs::write(&path, format!("{{\"type\":\"user\",\"content\":\"{long_message}\"}}\n")).unwrap();
        let entry = parse_session_file(&path, "/tmp").expect("parsed");
        assert_eq!(entry.title.chars().count(), 100);
    }

    #[test]
    fn html_escapes_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.jsonl");
        std::fs::write(&path, "{\"type\":\"title\",\"title\":\"<script>alert(1)</script>\"}\n").unwrap();
        let entry = parse_session_file(&path, "/tmp").expect("parsed");
        assert!(!entry.title.contains('<'));
        assert!(entry.title.contains("&lt;"));
    }
}
