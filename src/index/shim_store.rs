//! Shim session-store parser (§4.5) — one JSON document per session under
//! `~/.yume/sessions/<provider>/<sessionId>.json`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SessionIndexEntry;

/// On-disk shape of a shim session document. Distinct from `SessionRecord`
/// (the in-memory broker type) — this is the persisted projection written
/// by `PersistenceStore` for non-Claude providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShimSessionDocument {
    pub session_id: String,
    pub provider: String,
    pub model: String,
    pub project_path: String,
    pub title: Option<String>,
    pub message_count: u64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub total_tokens: u64,
    pub total_cost: f64,
}

/// Parse one shim session file, rejecting it if the `provider` field
/// doesn't match the directory it was found in (§4.5 validation rule —
/// guards against a misplaced or tampered file being indexed under the
/// wrong provider).
pub fn parse_session_file(path: &Path, expected_provider: &str) -> Option<SessionIndexEntry> {
    let metadata = std::fs::metadata(path).ok()?;
    if metadata.len() == 0 {
        return None;
    }
    let contents = std::fs::read_to_string(path).ok()?;
    let doc: ShimSessionDocument = serde_json::from_str(&contents).ok()?;
    if doc.provider != expected_provider {
        return None;
    }

    let title = sanitize_summary(doc.title.as_deref().unwrap_or(""));

    Some(SessionIndexEntry {
        session_id: doc.session_id,
        provider: doc.provider,
        model: doc.model.clone(),
        model_display: doc.model,
        title: title.clone(),
        summary: if title.is_empty() { None } else { Some(title) },
        project_path: doc.project_path,
        message_count: doc.message_count,
        created: doc.created,
        updated: doc.updated,
        file_path: path.display().to_string(),
        file_size: metadata.len(),
        claude_project_dir: None,
        compaction_count: None,
        total_tokens: Some(doc.total_tokens),
        total_cost: Some(doc.total_cost),
    })
}

fn sanitize_summary(s: &str) -> String {
    let escaped = s
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;");
    escaped.chars().take(200).collect()
}

pub fn scan_provider(sessions_root: &Path, provider: &str) -> Vec<SessionIndexEntry> {
    let provider_dir = sessions_root.join(provider);
    let Ok(files) = std::fs::read_dir(&provider_dir) else { return Vec::new() };
    files
        .flatten()
        .filter(|f| f.path().extension().and_then(|e| e.to_str()) == Some("json"))
        .filter_map(|f| parse_session_file(&f.path(), provider))
        .collect()
}

pub fn default_shim_sessions_root() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".yume")
        .join("sessions")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc(provider: &str) -> ShimSessionDocument {
        ShimSessionDocument {
            session_id: "s1".into(),
            provider: provider.into(),
            model: "gemini-2.5-pro".into(),
            project_path: "/tmp/proj".into(),
            title: Some("fix the bug".into()),
            message_count: 4,
            created: Utc::now(),
            updated: Utc::now(),
            total_tokens: 1200,
            total_cost: 0.05,
        }
    }

    #[test]
    fn parses_matching_provider() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.json");
        std::fs::write(&path, serde_json::to_string(&sample_doc("gemini")).unwrap()).unwrap();
        let entry = parse_session_file(&path, "gemini").expect("parsed");
        assert_eq!(entry.provider, "gemini");
    }

    #[test]
    fn rejects_provider_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.json");
        std::fs::write(&path, serde_json::to_string(&sample_doc("gemini")).unwrap()).unwrap();
        assert!(parse_session_file(&path, "openai").is_none());
    }

    #[test]
    fn rejects_zero_byte_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s1.json");
        std::fs::write(&path, "").unwrap();
        assert!(parse_session_file(&path, "gemini").is_none());
    }
}
