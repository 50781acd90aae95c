//! PersistenceStore (C11) — durable per-session event log and shim session
//! summary documents.
//!
//! Grounded on `clawd`'s `storage/event_log.rs` (`AuditLog`): a cached,
//! lazily-opened file handle per log, reused for the file's lifetime rather
//! than re-opened on every write. Generalized here from size-based rotation
//! to the index's backup-on-every-write requirement (§4.5) for the summary
//! document, while the per-session transcript log keeps the teacher's
//! append-only shape unchanged.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::errors::PersistenceError;
use crate::index::shim_store::ShimSessionDocument;
use crate::stream::CanonicalEvent;

/// Append-only per-session transcript, one JSON line per canonical event.
/// Mirrors the shape of a native Claude `.jsonl` file closely enough that
/// the same `native_claude` parser idioms apply if a shim transcript ever
/// needs to be read back directly.
pub struct PersistenceStore {
    sessions_root: PathBuf,
    open_logs: Mutex<HashMap<String, tokio::fs::File>>,
}

impl PersistenceStore {
    pub fn new(sessions_root: PathBuf) -> Self {
        Self { sessions_root, open_logs: Mutex::new(HashMap::new()) }
    }

    fn transcript_path(&self, provider: &str, session_id: &str) -> PathBuf {
        self.sessions_root.join(provider).join(format!("{session_id}.jsonl"))
    }

    fn summary_path(&self, provider: &str, session_id: &str) -> PathBuf {
        self.sessions_root.join(provider).join(format!("{session_id}.json"))
    }

    /// Append one canonical event to the session's transcript log, opening
    /// (and caching) the file handle on first use. Errors are logged, never
    /// propagated — a broken transcript log must not interrupt a turn.
    pub async fn append_event(&self, provider: &str, session_id: &str, event: &CanonicalEvent) {
        if let Err(e) = self.try_append_event(provider, session_id, event).await {
            warn!(provider, session_id, error = %e, "transcript append failed");
        }
    }

    async fn try_append_event(&self, provider: &str, session_id: &str, event: &CanonicalEvent) -> Result<(), PersistenceError> {
        let line = serde_json::to_string(event)? + "\n";
        let key = format!("{provider}/{session_id}");

        let mut logs = self.open_logs.lock().await;
        if !logs.contains_key(&key) {
            let path = self.transcript_path(provider, session_id);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
            logs.insert(key.clone(), file);
        }

        let file = logs.get_mut(&key).expect("just inserted");
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Drop the cached handle for a session (called when a session is
    /// deleted or a resume-failure clears its transcript) so the next
    /// append reopens cleanly.
    pub async fn close(&self, provider: &str, session_id: &str) {
        self.open_logs.lock().await.remove(&format!("{provider}/{session_id}"));
    }

    /// Overwrite the shim session summary document atomically (temp+rename
    /// with a rotated backup), the same idiom `SessionIndex::persist` uses
    /// for the whole-index document.
    pub async fn write_shim_summary(&self, doc: &ShimSessionDocument) -> Result<(), PersistenceError> {
        let path = self.summary_path(&doc.provider, &doc.session_id);
        let serialized = serde_json::to_string_pretty(doc)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
            if tokio::fs::metadata(&path).await.is_ok() {
                let backups_dir = parent.join("backups");
                tokio::fs::create_dir_all(&backups_dir).await?;
                let backup_name = format!("{}-{}.json", doc.session_id, chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f"));
                tokio::fs::copy(&path, backups_dir.join(backup_name)).await?;
            }
        }

        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &serialized).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    pub async fn delete_session(&self, provider: &str, session_id: &str) -> Result<(), PersistenceError> {
        self.close(provider, session_id).await;
        let transcript = self.transcript_path(provider, session_id);
        let summary = self.summary_path(provider, session_id);
        remove_if_exists(&transcript).await?;
        remove_if_exists(&summary).await?;
        Ok(())
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), PersistenceError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ResultPayload;

    #[tokio::test]
    async fn appends_events_reusing_cached_handle() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().to_path_buf());

        store.append_event("gemini", "s1", &CanonicalEvent::Text { content: "hi".into(), id: None }).await;
        store.append_event("gemini", "s1", &CanonicalEvent::Result(ResultPayload::default())).await;

        let path = dir.path().join("gemini").join("s1.jsonl");
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn write_shim_summary_then_backup_on_second_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().to_path_buf());
        let mut doc = ShimSessionDocument {
            session_id: "s1".into(),
            provider: "gemini".into(),
            model: "gemini-2.5-pro".into(),
            project_path: "/tmp/proj".into(),
            title: Some("first".into()),
            message_count: 1,
            created: chrono::Utc::now(),
            updated: chrono::Utc::now(),
            total_tokens: 10,
            total_cost: 0.01,
        };
        store.write_shim_summary(&doc).await.unwrap();
        doc.title = Some("second".into());
        store.write_shim_summary(&doc).await.unwrap();

        let path = dir.path().join("gemini").join("s1.json");
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.contains("second"));

        let backups_dir = dir.path().join("gemini").join("backups");
        let mut entries = tokio::fs::read_dir(&backups_dir).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1, "first write should be backed up before the second overwrites it");
    }

    #[tokio::test]
    async fn delete_session_removes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().to_path_buf());
        store.append_event("gemini", "s1", &CanonicalEvent::MessageStop).await;
        store.delete_session("gemini", "s1").await.unwrap();
        let path = dir.path().join("gemini").join("s1.jsonl");
        assert!(!path.exists());
    }
}
