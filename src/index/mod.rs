//! SessionIndex (C9) — a cached, atomically-persisted catalog over both
//! native Claude project files and shim session documents.

pub mod native_claude;
pub mod shim_store;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::errors::PersistenceError;

const INDEX_VERSION: u32 = 1;
const LIST_CACHE_TTL: Duration = Duration::from_secs(30);
const REBUILD_MIN_INTERVAL: Duration = Duration::from_secs(60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Persisted index element (§3). Owned exclusively by `SessionIndex`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionIndexEntry {
    pub session_id: String,
    pub provider: String,
    pub model: String,
    pub model_display: String,
    pub title: String,
    pub summary: Option<String>,
    pub project_path: String,
    pub message_count: u64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub file_path: String,
    pub file_size: u64,
    pub claude_project_dir: Option<String>,
    pub compaction_count: Option<u32>,
    pub total_tokens: Option<u64>,
    pub total_cost: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexDocument {
    version: u32,
    last_updated: DateTime<Utc>,
    entries: Vec<SessionIndexEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub provider: Option<String>,
    pub project_path: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

struct ListCache {
    built_at: std::time::Instant,
    entries: Vec<SessionIndexEntry>,
}

pub struct SessionIndex {
    index_path: PathBuf,
    claude_projects_root: PathBuf,
    shim_sessions_root: PathBuf,
    entries: RwLock<HashMap<String, SessionIndexEntry>>,
    list_cache: Mutex<Option<ListCache>>,
    last_rebuild: Mutex<Option<std::time::Instant>>,
}

impl SessionIndex {
    pub fn new(index_path: PathBuf, claude_projects_root: PathBuf, shim_sessions_root: PathBuf) -> Self {
        Self {
            index_path,
            claude_projects_root,
            shim_sessions_root,
            entries: RwLock::new(HashMap::new()),
            list_cache: Mutex::new(None),
            last_rebuild: Mutex::new(None),
        }
    }

    /// Load the on-disk document, falling back to a full rebuild if the
    /// file is missing or its version doesn't match (§4.5 "Full rebuild").
    pub async fn load_or_rebuild(&self) -> Result<(), PersistenceError> {
        match std::fs::read_to_string(&self.index_path) {
            Ok(contents) => match serde_json::from_str::<IndexDocument>(&contents) {
                Ok(doc) if doc.version == INDEX_VERSION => {
                    let mut entries = self.entries.write().await;
                    for entry in doc.entries {
                        entries.insert(entry.session_id.clone(), entry);
                    }
                    Ok(())
                }
                Ok(doc) => {
                    warn!(on_disk = doc.version, expected = INDEX_VERSION, "index version mismatch, rebuilding");
                    self.rebuild().await
                }
                Err(e) => {
                    warn!(error = %e, "index file corrupt, rebuilding");
                    self.rebuild().await
                }
            },
            Err(_) => self.rebuild().await,
        }
    }

    /// Full rebuild from both provider stores, rate-limited to once per
    /// minute (§4.5). A rebuild requested within the cooldown window is a
    /// silent no-op against the in-memory state already held.
    pub async fn rebuild(&self) -> Result<(), PersistenceError> {
        {
            let mut last = self.last_rebuild.lock().await;
            if let Some(t) = *last {
                if t.elapsed() < REBUILD_MIN_INTERVAL {
                    info!("rebuild requested within cooldown window, skipping");
                    return Ok(());
                }
            }
            *last = Some(std::time::Instant::now());
        }

        let mut fresh = native_claude::scan_all(&self.claude_projects_root);
        for provider in ["gemini", "openai"] {
            fresh.extend(shim_store::scan_provider(&self.shim_sessions_root, provider));
        }

        let mut entries = self.entries.write().await;
        entries.clear();
        for entry in fresh {
            entries.insert(entry.session_id.clone(), entry);
        }
        drop(entries);

        *self.list_cache.lock().await = None;
        self.persist().await
    }

    /// Upsert a single entry (§4.5 "Incremental update" — create, resume,
    /// title generation).
    pub async fn upsert(&self, entry: SessionIndexEntry) -> Result<(), PersistenceError> {
        self.entries.write().await.insert(entry.session_id.clone(), entry);
        *self.list_cache.lock().await = None;
        self.persist().await
    }

    pub async fn remove(&self, session_id: &str) -> Result<(), PersistenceError> {
        self.entries.write().await.remove(session_id);
        *self.list_cache.lock().await = None;
        self.persist().await
    }

    /// List entries with a 30 s read-through cache in front of the filter
    /// (§4.5 "Listing").
    pub async fn list(&self, filter: ListFilter) -> Vec<SessionIndexEntry> {
        let base = {
            let mut cache = self.list_cache.lock().await;
            let needs_refresh = match &*cache {
                Some(c) => c.built_at.elapsed() > LIST_CACHE_TTL,
                None => true,
            };
            if needs_refresh {
                let mut all: Vec<SessionIndexEntry> = self.entries.read().await.values().cloned().collect();
                all.sort_by(|a, b| b.updated.cmp(&a.updated));
                *cache = Some(ListCache { built_at: std::time::Instant::now(), entries: all.clone() });
                all
            } else {
                cache.as_ref().unwrap().entries.clone()
            }
        };

        let filtered: Vec<SessionIndexEntry> = base
            .into_iter()
            .filter(|e| filter.provider.as_deref().map(|p| p == e.provider).unwrap_or(true))
            .filter(|e| filter.project_path.as_deref().map(|p| p == e.project_path).unwrap_or(true))
            .collect();

        let start = filter.offset.min(filtered.len());
        let end = match filter.limit {
            Some(l) => (start + l).min(filtered.len()),
            None => filtered.len(),
        };
        filtered[start..end].to_vec()
    }

    async fn persist(&self) -> Result<(), PersistenceError> {
        let doc = IndexDocument {
            version: INDEX_VERSION,
            last_updated: Utc::now(),
            entries: self.entries.read().await.values().cloned().collect(),
        };
        let serialized = serde_json::to_string_pretty(&doc)?;

        if let Some(parent) = self.index_path.parent() {
            std::fs::create_dir_all(parent)?;
            let backups_dir = parent.join("backups");
            if self.index_path.exists() {
                std::fs::create_dir_all(&backups_dir)?;
                let backup_name = format!("index-{}.json", Utc::now().format("%Y%m%dT%H%M%S%.3f"));
                std::fs::copy(&self.index_path, backups_dir.join(backup_name))?;
            }
        }

        let tmp_path = self.index_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &serialized)?;
        std::fs::rename(&tmp_path, &self.index_path)?;
        Ok(())
    }
}

/// Background sweeper: every `SWEEP_INTERVAL`, reconcile the index against
/// filesystem mtimes (§4.5 "Incremental update"). Spawned once at startup.
pub fn spawn_sweeper(index: Arc<SessionIndex>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(SWEEP_INTERVAL).await;
            if let Err(e) = index.rebuild().await {
                warn!(error = %e, "background sweep rebuild failed");
            }
        }
    })
}
