// src/monitor/mod.rs
//! # Change Monitor
//! Polls sources, fingerprints content, and hands changed bodies onward.
//!
//! The committed fingerprint of a source only moves on `acknowledge`, which the
//! orchestrator calls after a successful downstream commit. Until then every
//! poll of a changed source yields its content again.

pub mod fetcher;
pub mod scheduler;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::FetchError;
use crate::model::{Priority, SourceConfig};
use fetcher::{FetchOutcome, Fetcher};

/// Changed content of one source, not yet committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawContent {
    pub source: String,
    pub priority: Priority,
    pub body: String,
    /// Hex SHA-256 of `body`.
    pub fingerprint: String,
    pub etag: Option<String>,
}

/// Committed fingerprint entry, also the on-disk format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub hash: String,
    #[serde(default)]
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub priority: Priority,
    pub committed_fingerprint: Option<String>,
    pub last_polled: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone)]
struct SourceState {
    config: SourceConfig,
    committed: Option<Fingerprint>,
    last_polled: Option<DateTime<Utc>>,
    last_error: Option<String>,
    consecutive_failures: u32,
    /// Fingerprint whose rejections are already in the audit log.
    rejections_logged: Option<String>,
}

pub struct ChangeMonitor {
    fetcher: Arc<dyn Fetcher>,
    sources: RwLock<HashMap<String, SourceState>>,
    order: Vec<String>,
    state_path: Option<PathBuf>,
    fetch_timeout: Duration,
}

pub fn fingerprint(body: &str) -> String {
    let digest = Sha256::digest(body.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

impl ChangeMonitor {
    pub fn new(fetcher: Arc<dyn Fetcher>, sources: &[SourceConfig], fetch_timeout: Duration) -> Self {
        let order = sources.iter().map(|s| s.name.clone()).collect();
        let sources = sources
            .iter()
            .map(|s| {
                (
                    s.name.clone(),
                    SourceState {
                        config: s.clone(),
                        committed: None,
                        last_polled: None,
                        last_error: None,
                        consecutive_failures: 0,
                        rejections_logged: None,
                    },
                )
            })
            .collect();
        Self {
            fetcher,
            sources: RwLock::new(sources),
            order,
            state_path: None,
            fetch_timeout,
        }
    }

    /// Load committed fingerprints from `path` (if present) and persist
    /// further acknowledgments there.
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let saved = read_fingerprints(&path);
        {
            let mut map = self.sources.write().unwrap_or_else(|e| e.into_inner());
            for (name, fp) in saved {
                if let Some(st) = map.get_mut(&name) {
                    st.committed = Some(fp);
                }
            }
        }
        self.state_path = Some(path);
        self
    }

    pub fn source_names(&self) -> &[String] {
        &self.order
    }

    pub fn source(&self, name: &str) -> Option<SourceConfig> {
        let map = self.sources.read().unwrap_or_else(|e| e.into_inner());
        map.get(name).map(|s| s.config.clone())
    }

    pub fn committed(&self, name: &str) -> Option<Fingerprint> {
        let map = self.sources.read().unwrap_or_else(|e| e.into_inner());
        map.get(name).and_then(|s| s.committed.clone())
    }

    /// `None` when the source is unchanged since the last acknowledged commit.
    pub async fn poll(&self, name: &str) -> Result<Option<RawContent>, FetchError> {
        let (config, committed) = {
            let map = self.sources.read().unwrap_or_else(|e| e.into_inner());
            let st = map.get(name).ok_or_else(|| FetchError::Transport {
                source_name: name.to_string(),
                message: "unknown source".into(),
            })?;
            (st.config.clone(), st.committed.clone())
        };
        let etag = committed.as_ref().and_then(|c| c.etag.as_deref());

        let res = match tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch(&config, etag))
            .await
        {
            Ok(r) => r,
            Err(_) => Err(FetchError::Timeout {
                source_name: name.to_string(),
                secs: self.fetch_timeout.as_secs(),
            }),
        };
        self.note_poll(name, res.as_ref().err());

        let (body, etag) = match res? {
            FetchOutcome::NotModified => {
                tracing::debug!(target: "monitor", source = %name, "not modified");
                return Ok(None);
            }
            FetchOutcome::Content { body, etag } => (body, etag),
        };
        let fp = fingerprint(&body);
        if committed.as_ref().map(|c| c.hash.as_str()) == Some(fp.as_str()) {
            tracing::debug!(target: "monitor", source = %name, "content unchanged");
            return Ok(None);
        }
        tracing::info!(
            target: "monitor",
            source = %name,
            bytes = body.len(),
            fingerprint = &fp[..12],
            "source changed"
        );
        Ok(Some(RawContent {
            source: config.name,
            priority: config.priority,
            body,
            fingerprint: fp,
            etag,
        }))
    }

    fn note_poll(&self, name: &str, err: Option<&FetchError>) {
        let mut map = self.sources.write().unwrap_or_else(|e| e.into_inner());
        if let Some(st) = map.get_mut(name) {
            st.last_polled = Some(Utc::now());
            match err {
                Some(e) => {
                    st.consecutive_failures += 1;
                    st.last_error = Some(e.to_string());
                }
                None => {
                    st.consecutive_failures = 0;
                    st.last_error = None;
                }
            }
        }
    }

    /// Whether rejections for this exact content were already recorded.
    pub fn rejections_logged(&self, raw: &RawContent) -> bool {
        let map = self.sources.read().unwrap_or_else(|e| e.into_inner());
        map.get(&raw.source)
            .and_then(|s| s.rejections_logged.as_deref())
            == Some(raw.fingerprint.as_str())
    }

    pub fn mark_rejections_logged(&self, raw: &RawContent) {
        let mut map = self.sources.write().unwrap_or_else(|e| e.into_inner());
        if let Some(st) = map.get_mut(&raw.source) {
            st.rejections_logged = Some(raw.fingerprint.clone());
        }
    }

    /// Mark `raw` as committed downstream.
    pub async fn acknowledge(&self, raw: &RawContent) {
        let snapshot = {
            let mut map = self.sources.write().unwrap_or_else(|e| e.into_inner());
            let Some(st) = map.get_mut(&raw.source) else {
                return;
            };
            st.committed = Some(Fingerprint {
                hash: raw.fingerprint.clone(),
                etag: raw.etag.clone(),
            });
            map.iter()
                .filter_map(|(k, v)| v.committed.clone().map(|c| (k.clone(), c)))
                .collect::<BTreeMap<_, _>>()
        };
        tracing::debug!(target: "monitor", source = %raw.source, "fingerprint acknowledged");
        if let Some(path) = &self.state_path {
            write_fingerprints(path, &snapshot).await;
        }
    }

    pub fn status(&self) -> Vec<SourceStatus> {
        let map = self.sources.read().unwrap_or_else(|e| e.into_inner());
        self.order
            .iter()
            .filter_map(|n| map.get(n))
            .map(|st| SourceStatus {
                name: st.config.name.clone(),
                priority: st.config.priority,
                committed_fingerprint: st.committed.as_ref().map(|c| c.hash.clone()),
                last_polled: st.last_polled,
                last_error: st.last_error.clone(),
                consecutive_failures: st.consecutive_failures,
            })
            .collect()
    }
}

fn read_fingerprints(path: &Path) -> BTreeMap<String, Fingerprint> {
    match std::fs::read_to_string(path) {
        Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
            tracing::warn!(target: "monitor", path = %path.display(), "ignoring fingerprint state: {e}");
            BTreeMap::new()
        }),
        Err(_) => BTreeMap::new(),
    }
}

async fn write_fingerprints(path: &Path, map: &BTreeMap<String, Fingerprint>) {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            tracing::warn!(target: "monitor", "state dir: {e:#}");
        }
    }
    let bytes = serde_json::to_vec_pretty(map).unwrap_or_default();
    if let Err(e) = tokio::fs::write(path, bytes).await {
        tracing::warn!(target: "monitor", "write fingerprint state: {e:#}");
    }
}
