//! Typed error taxonomy (§7 of SPEC_FULL.md).
//!
//! Library-internal errors are `thiserror` enums scoped per component.
//! Call-site boundaries (CLI commands, RPC dispatch) wrap these in
//! `anyhow::Result` with added context; the typed variant survives through
//! `anyhow::Error::downcast_ref` for `classify_error` at the BoundaryAPI.

use thiserror::Error;

/// Errors raised while framing/parsing the stream-json wire format (C1/C2).
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("framing overflow: {bytes_dropped} bytes dropped before object completed")]
    FramingOverflow { bytes_dropped: usize },

    #[error("malformed object at line offset {line_offset}: {reason}")]
    MalformedObject { line_offset: u64, reason: String },
}

/// Errors raised by the process registry (C3).
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session '{0}' already has a running process")]
    AlreadyRunning(String),

    #[error("no running process for session '{0}'")]
    NotRunning(String),

    #[error("max concurrent sessions ({0}) reached")]
    CapacityExceeded(usize),

    #[error("failed to spawn upstream CLI: {0}")]
    SpawnFailed(#[source] std::io::Error),
}

/// Errors raised by tool execution (C8).
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("path outside sandbox")]
    SandboxViolation,

    #[error("no occurrences of old_string found")]
    NoMatch,

    #[error("{0} occurrences of old_string found, expected exactly 1")]
    AmbiguousMatch(usize),

    #[error("command timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by the session index / persistence layer (C9/C11).
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error("index version mismatch: on disk {on_disk}, expected {expected}")]
    VersionMismatch { on_disk: u32, expected: u32 },
}

/// Taxonomy kinds from SPEC_FULL.md §7, used to classify a turn-ending
/// failure into the fixed set of canonical-event-producing error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AuthMissing,
    CliNotInstalled,
    ResumeNotFound,
    ProviderTransient,
    ToolError,
    PartialJsonOverflow,
    SandboxViolation,
    Fatal,
}

/// Substring marker looked for in a child's stderr to detect a resume
/// failure (SPEC_FULL.md §4.2 "Failure semantics").
pub const RESUME_FAILURE_MARKER: &str = "No conversation found with session ID";

/// Classify a free-text error (typically an `anyhow::Error`'s display form,
/// or raw child stderr) into the fixed taxonomy. Mirrors the corpus's own
/// string-marker `classify_error` at the RPC boundary, extended with the
/// broker-specific markers this spec defines.
pub fn classify_error_text(text: &str) -> ErrorKind {
    if text.contains(RESUME_FAILURE_MARKER) {
        ErrorKind::ResumeNotFound
    } else if text.contains("AUTH_MISSING") || text.contains("not authenticated") {
        ErrorKind::AuthMissing
    } else if text.contains("CLI_NOT_INSTALLED") || text.contains("command not found") {
        ErrorKind::CliNotInstalled
    } else if text.contains("PROVIDER_TRANSIENT") || text.contains("rate limit") {
        ErrorKind::ProviderTransient
    } else if text.contains("SANDBOX_VIOLATION") {
        ErrorKind::SandboxViolation
    } else if text.contains("FRAMING_OVERFLOW") {
        ErrorKind::PartialJsonOverflow
    } else {
        ErrorKind::Fatal
    }
}

/// Strip the invoking user's home directory from an outgoing error message
/// before it crosses the BoundaryAPI, so a stray absolute path never leaks
/// the operator's username. Mirrors the corpus's `sanitize_path_in_message`.
pub fn sanitize_path_in_message(message: &str) -> String {
    match dirs_home() {
        Some(home) if !home.is_empty() => message.replace(&home, "~"),
        _ => message.to_string(),
    }
}

fn dirs_home() -> Option<String> {
    std::env::var("HOME").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_resume_failure() {
        let text = "child stderr: No conversation found with session ID p-old";
        assert_eq!(classify_error_text(text), ErrorKind::ResumeNotFound);
    }

    #[test]
    fn classifies_unknown_as_fatal() {
        assert_eq!(classify_error_text("segfault in libfoo"), ErrorKind::Fatal);
    }

    #[test]
    fn sanitizes_home_prefix() {
        std::env::set_var("HOME", "/home/alice");
        let msg = sanitize_path_in_message("error reading /home/alice/project/secret.env");
        assert!(!msg.contains("/home/alice"));
        assert!(msg.contains("~/project/secret.env"));
    }
}
