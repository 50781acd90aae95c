//! ToolExecutor (C8) — file/search/shell tools with sandboxing, output
//! caps, redaction, and timeouts (§4.4).

pub mod redact;
pub mod sandbox;

use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::errors::ToolError;
use sandbox::SandboxPolicy;

/// Result of a tool operation — a pure function of `(input, cwd, policy)`.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutcome {
    fn ok(content: impl Into<String>) -> Self {
        Self { content: content.into(), is_error: false }
    }

    fn err(content: impl Into<String>) -> Self {
        Self { content: content.into(), is_error: true }
    }
}

/// Commands whose argument string triggers an advisory (not blocking)
/// stderr warning (§4.4 "Dangerous-command warnings").
const DANGEROUS_MARKERS: &[&str] = &["rm -rf /", "sudo ", ":(){:|:&};:"];

pub struct ToolExecutor {
    policy: SandboxPolicy,
    output_cap_bytes: usize,
    bash_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(policy: SandboxPolicy, output_cap_bytes: usize, bash_timeout: Duration) -> Self {
        Self { policy, output_cap_bytes, bash_timeout }
    }

    /// Dispatch by tool name using the exact field names §6.1 mandates
    /// (`file_path`, not `path`, for file-oriented tools).
    pub async fn run(&self, name: &str, input: &Value) -> ToolOutcome {
        let outcome = match name {
            "Read" => self.read(input).await,
            "Write" => self.write(input).await,
            "Edit" => self.edit(input).await,
            "MultiEdit" => self.multi_edit(input).await,
            "Glob" => self.glob(input).await,
            "Grep" => self.grep(input).await,
            "LS" => self.ls(input).await,
            "Bash" => self.bash(input).await,
            other => Err(ToolError::UnknownTool(other.to_string())),
        };

        match outcome {
            Ok(mut outcome) => {
                let redaction = redact::redact(&outcome.content);
                if redaction.count > 0 {
                    warn!(tool = name, redacted = redaction.count, "redacted secrets from tool output");
                }
                outcome.content = redact::cap_output(&redaction.text, self.output_cap_bytes);
                outcome
            }
            Err(ToolError::SandboxViolation) => ToolOutcome::err("path outside sandbox"),
            Err(e) => ToolOutcome::err(e.to_string()),
        }
    }

    async fn read(&self, input: &Value) -> Result<ToolOutcome, ToolError> {
        let path = require_str(input, "file_path")?;
        let resolved = self.policy.check(path)?;
        let content = tokio::fs::read_to_string(&resolved).await?;
        let offset = input.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
        let limit = input.get("limit").and_then(Value::as_u64).map(|l| l as usize);

        let lines: Vec<&str> = content.lines().collect();
        let end = match limit {
            Some(l) => (offset + l).min(lines.len()),
            None => lines.len(),
        };
        let slice = lines.get(offset.min(lines.len())..end).unwrap_or(&[]);
        Ok(ToolOutcome::ok(slice.join("\n")))
    }

    async fn write(&self, input: &Value) -> Result<ToolOutcome, ToolError> {
        let path = require_str(input, "file_path")?;
        let content = require_str(input, "content")?;
        let resolved = self.policy.check(path)?;
        atomic_write(&resolved, content.as_bytes()).await?;
        Ok(ToolOutcome::ok("ok"))
    }

    async fn edit(&self, input: &Value) -> Result<ToolOutcome, ToolError> {
        let path = require_str(input, "file_path")?;
        let old_string = require_str(input, "old_string")?;
        let new_string = require_str(input, "new_string")?;
        let resolved = self.policy.check(path)?;
        let content = tokio::fs::read_to_string(&resolved).await?;

        let occurrences = content.matches(old_string).count();
        if occurrences == 0 {
            return Err(ToolError::NoMatch);
        }
        if occurrences > 1 {
            return Err(ToolError::AmbiguousMatch(occurrences));
        }
        let replaced = content.replacen(old_string, new_string, 1);
        atomic_write(&resolved, replaced.as_bytes()).await?;
        Ok(ToolOutcome::ok("ok"))
    }

    async fn multi_edit(&self, input: &Value) -> Result<ToolOutcome, ToolError> {
        let path = require_str(input, "file_path")?;
        let edits = input
            .get("edits")
            .and_then(Value::as_array)
            .ok_or_else(|| ToolError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "missing edits[]")))?;
        let resolved = self.policy.check(path)?;
        let mut content = tokio::fs::read_to_string(&resolved).await?;

        // All-or-nothing: validate every edit applies before writing any.
        let mut staged = content.clone();
        for edit in edits {
            let old_string = require_str(edit, "old_string")?;
            let new_string = require_str(edit, "new_string")?;
            let occurrences = staged.matches(old_string).count();
            if occurrences == 0 {
                return Err(ToolError::NoMatch);
            }
            if occurrences > 1 {
                return Err(ToolError::AmbiguousMatch(occurrences));
            }
            staged = staged.replacen(old_string, new_string, 1);
        }
        content = staged;
        atomic_write(&resolved, content.as_bytes()).await?;
        Ok(ToolOutcome::ok("ok"))
    }

    async fn glob(&self, input: &Value) -> Result<ToolOutcome, ToolError> {
        let pattern = require_str(input, "pattern")?;
        let base = match input.get("path").and_then(Value::as_str) {
            Some(p) => self.policy.check(p)?,
            None => self.policy.cwd.clone(),
        };
        let mut matches = Vec::new();
        let mut stack = vec![base.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path.clone());
                }
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if glob_match(pattern, name) {
                        matches.push(path.display().to_string());
                    }
                }
            }
        }
        matches.sort();
        Ok(ToolOutcome::ok(matches.join("\n")))
    }

    async fn grep(&self, input: &Value) -> Result<ToolOutcome, ToolError> {
        let pattern_str = require_str(input, "pattern")?;
        let re = regex::Regex::new(pattern_str)
            .map_err(|e| ToolError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())))?;
        let base = match input.get("path").and_then(Value::as_str) {
            Some(p) => self.policy.check(p)?,
            None => self.policy.cwd.clone(),
        };

        let mut hits = Vec::new();
        let mut stack = vec![base];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                if let Ok(content) = tokio::fs::read_to_string(&path).await {
                    for (n, line) in content.lines().enumerate() {
                        if re.is_match(line) {
                            hits.push(format!("{}:{}:{}", path.display(), n + 1, line));
                        }
                    }
                }
            }
        }
        Ok(ToolOutcome::ok(hits.join("\n")))
    }

    async fn ls(&self, input: &Value) -> Result<ToolOutcome, ToolError> {
        let base = match input.get("path").and_then(Value::as_str) {
            Some(p) => self.policy.check(p)?,
            None => self.policy.cwd.clone(),
        };
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&base).await?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(ToolOutcome::ok(names.join("\n")))
    }

    async fn bash(&self, input: &Value) -> Result<ToolOutcome, ToolError> {
        let command = require_str(input, "command")?;
        if DANGEROUS_MARKERS.iter().any(|m| command.contains(m)) {
            warn!(command, "dangerous command detected — advisory only, not blocked");
        }

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.policy.cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .output();

        match tokio::time::timeout(self.bash_timeout, child).await {
            Ok(Ok(output)) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                if output.status.success() {
                    Ok(ToolOutcome::ok(combined))
                } else {
                    Ok(ToolOutcome::err(combined))
                }
            }
            Ok(Err(e)) => Err(ToolError::Io(e)),
            Err(_) => Err(ToolError::Timeout(self.bash_timeout)),
        }
    }
}

fn require_str<'a>(input: &'a Value, field: &str) -> Result<&'a str, ToolError> {
    input
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("missing field '{field}'"))))
}

/// Atomic write via temp+rename (§4.4 `Write`, `MultiEdit`).
async fn atomic_write(path: &Path, content: &[u8]) -> Result<(), ToolError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp_path = dir.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|f| f.to_str()).unwrap_or("file"),
        uuid::Uuid::new_v4()
    ));
    {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(content).await?;
        file.flush().await?;
    }
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Minimal glob matcher supporting `*` and `?` — sufficient for the tool
/// input shapes this spec defines (`Glob{pattern,path?}`); not a full glob
/// crate since only filename-level matching is required here.
fn glob_match(pattern: &str, name: &str) -> bool {
    fn helper(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => helper(&p[1..], n) || (!n.is_empty() && helper(p, &n[1..])),
            (Some(b'?'), Some(_)) => helper(&p[1..], &n[1..]),
            (Some(pc), Some(nc)) if pc == nc => helper(&p[1..], &n[1..]),
            _ => false,
        }
    }
    helper(pattern.as_bytes(), name.as_bytes())
}

pub fn tool_to_json(outcome: &ToolOutcome) -> Value {
    json!({ "content": outcome.content, "is_error": outcome.is_error })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn executor(dir: &Path) -> ToolExecutor {
        ToolExecutor::new(SandboxPolicy::new(dir, vec![]), 100 * 1024, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let ex = executor(dir.path());
        let write_in = json!({"file_path": "a.txt", "content": "hello"});
        let out = ex.run("Write", &write_in).await;
        assert!(!out.is_error);

        let read_in = json!({"file_path": "a.txt"});
        let out = ex.run("Read", &read_in).await;
        assert_eq!(out.content, "hello");
    }

    #[tokio::test]
    async fn edit_single_occurrence_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "foo bar").unwrap();
        let ex = executor(dir.path());
        let out = ex
            .run("Edit", &json!({"file_path": "a.txt", "old_string": "foo", "new_string": "baz"}))
            .await;
        assert!(!out.is_error);
        let content = std::fs::read_to_string(dir.path().join("a.txt")).unwrap();
        assert_eq!(content, "baz bar");
    }

    #[tokio::test]
    async fn edit_ambiguous_match_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "foo foo").unwrap();
        let ex = executor(dir.path());
        let out = ex
            .run("Edit", &json!({"file_path": "a.txt", "old_string": "foo", "new_string": "baz"}))
            .await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn sandbox_violation_blocks_outside_path() {
        let dir = tempfile::tempdir().unwrap();
        let ex = executor(dir.path());
        let out = ex.run("Read", &json!({"file_path": "/etc/passwd"})).await;
        assert!(out.is_error);
        assert_eq!(out.content, "path outside sandbox");
    }

    #[tokio::test]
    async fn bash_runs_and_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let ex = executor(dir.path());
        let out = ex.run("Bash", &json!({"command": "echo hi"})).await;
        assert!(!out.is_error);
        assert!(out.content.contains("hi"));
    }

    #[tokio::test]
    async fn bash_nonzero_exit_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let ex = executor(dir.path());
        let out = ex.run("Bash", &json!({"command": "exit 1"})).await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn secret_in_tool_output_is_redacted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".env"),
            "API_KEY=sk-abcdefghijklmnopqrstuvwxyz1234567890",
        )
        .unwrap();
        let ex = executor(dir.path());
        let out = ex.run("Read", &json!({"file_path": ".env"})).await;
        assert!(!out.content.contains("sk-abcdefghijklmnopqrstuvwxyz1234567890"));
        assert!(out.content.contains("[REDACTED"));
    }
}
