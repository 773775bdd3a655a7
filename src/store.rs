// src/store.rs
//! Pattern Record Store: append-only persistence behind the ledger.
//!
//! Versions are stored as deltas against their parent and replayed in order
//! on open. Rejections are stored as-is for audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::StoreError;
use crate::model::{
    ChangeStats, Diff, Origin, PatternKey, PatternRecord, PatternSet, RejectionRecord, Version,
    VersionId,
};

pub const VERSIONS_FILE: &str = "versions.jsonl";
pub const REJECTIONS_FILE: &str = "rejections.jsonl";

/// One persisted version: header plus the records that changed vs. parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: VersionId,
    pub parent: Option<VersionId>,
    pub timestamp: DateTime<Utc>,
    pub origin: Origin,
    pub message: String,
    #[serde(default)]
    pub reverts: Option<VersionId>,
    #[serde(default)]
    pub restores: Option<VersionId>,
    pub stats: ChangeStats,
    #[serde(default)]
    pub upserts: Vec<PatternRecord>,
    #[serde(default)]
    pub removals: Vec<PatternKey>,
}

impl VersionRecord {
    pub fn from_version(parent: &PatternSet, v: &Version) -> Self {
        let diff = Diff::between(VersionId::ROOT, parent, v.id, &v.patterns);
        let mut upserts = diff.added;
        upserts.extend(diff.changed.into_iter().map(|(_, new)| new));
        // first_version may differ without a content change (restored keys)
        for (key, rec) in &v.patterns {
            if let Some(old) = parent.get(key) {
                if old.first_version != rec.first_version && old.same_content(rec) {
                    upserts.push(rec.clone());
                }
            }
        }
        Self {
            id: v.id,
            parent: v.parent,
            timestamp: v.timestamp,
            origin: v.origin,
            message: v.message.clone(),
            reverts: v.reverts,
            restores: v.restores,
            stats: v.stats,
            upserts,
            removals: diff.removed.iter().map(PatternRecord::key).collect(),
        }
    }

    /// Rebuild the full version on top of the parent's pattern set.
    pub fn into_version(self, parent: &PatternSet) -> Version {
        let mut patterns = parent.clone();
        for key in &self.removals {
            patterns.remove(key);
        }
        for rec in self.upserts {
            patterns.insert(rec.key(), rec);
        }
        Version {
            id: self.id,
            parent: self.parent,
            timestamp: self.timestamp,
            origin: self.origin,
            message: self.message,
            reverts: self.reverts,
            restores: self.restores,
            stats: self.stats,
            patterns,
        }
    }
}

/// Everything a store holds, in append order.
#[derive(Debug, Clone, Default)]
pub struct StoredState {
    pub versions: Vec<VersionRecord>,
    pub rejections: Vec<RejectionRecord>,
}

pub trait VersionStore: Send + Sync {
    fn load(&self) -> Result<StoredState, StoreError>;
    fn append_version(&self, record: &VersionRecord) -> Result<(), StoreError>;
    fn append_rejections(&self, records: &[RejectionRecord]) -> Result<(), StoreError>;
}

/// In-process store. Survives ledger re-opens, not process restarts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoredState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VersionStore for MemoryStore {
    fn load(&self) -> Result<StoredState, StoreError> {
        let st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(st.clone())
    }

    fn append_version(&self, record: &VersionRecord) -> Result<(), StoreError> {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.versions.push(record.clone());
        Ok(())
    }

    fn append_rejections(&self, records: &[RejectionRecord]) -> Result<(), StoreError> {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.rejections.extend_from_slice(records);
        Ok(())
    }
}

/// Append-only JSON-lines files under one directory.
#[derive(Debug)]
pub struct JsonlStore {
    dir: PathBuf,
    // serializes appends from concurrent writers
    write_lock: Mutex<()>,
}

impl JsonlStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn append_lines<T: Serialize>(&self, file: &str, items: &[T]) -> Result<(), StoreError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for it in items {
            serde_json::to_writer(&mut buf, it)?;
            buf.push(b'\n');
        }
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))?;
        f.write_all(&buf)?;
        f.sync_data()?;
        Ok(())
    }
}

impl VersionStore for JsonlStore {
    fn load(&self) -> Result<StoredState, StoreError> {
        Ok(StoredState {
            versions: read_lines(&self.dir.join(VERSIONS_FILE))?,
            rejections: read_lines(&self.dir.join(REJECTIONS_FILE))?,
        })
    }

    fn append_version(&self, record: &VersionRecord) -> Result<(), StoreError> {
        self.append_lines(VERSIONS_FILE, std::slice::from_ref(record))
    }

    fn append_rejections(&self, records: &[RejectionRecord]) -> Result<(), StoreError> {
        self.append_lines(REJECTIONS_FILE, records)
    }
}

/// Parse one JSON document per line. A torn final line (interrupted append)
/// is dropped with a warning; any other bad line is corruption.
fn read_lines<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, StoreError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let lines: Vec<String> = BufReader::new(file).lines().collect::<Result<_, _>>()?;
    let last = lines.len();
    let mut out = Vec::with_capacity(last);
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(v) => out.push(v),
            Err(e) if idx + 1 == last => {
                tracing::warn!(
                    target: "ledger",
                    file = %path.display(),
                    line = idx + 1,
                    "dropping torn trailing record: {e}"
                );
            }
            Err(e) => {
                return Err(StoreError::Corrupted {
                    line: idx + 1,
                    message: e.to_string(),
                })
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PatternKind;
    use std::collections::BTreeSet;

    fn rec(p: &str, first: u64) -> PatternRecord {
        PatternRecord {
            kind: PatternKind::Domain,
            pattern: p.into(),
            sources: BTreeSet::from(["A".to_string()]),
            confidence: 0.9,
            first_version: VersionId(first),
        }
    }

    fn version(id: u64, recs: &[PatternRecord]) -> Version {
        Version {
            id: VersionId(id),
            parent: id.checked_sub(1).map(VersionId),
            timestamp: Utc::now(),
            origin: Origin::AutoUpdate,
            message: format!("v{id}"),
            reverts: None,
            restores: None,
            stats: ChangeStats::default(),
            patterns: recs.iter().map(|r| (r.key(), r.clone())).collect(),
        }
    }

    #[test]
    fn record_round_trips_through_parent() {
        let parent = version(1, &[rec("a.com", 1), rec("b.com", 1)]).patterns;
        let v2 = version(2, &[rec("a.com", 1), rec("c.com", 2)]);
        let r = VersionRecord::from_version(&parent, &v2);
        assert_eq!(r.upserts.len(), 1);
        assert_eq!(r.removals.len(), 1);
        assert_eq!(r.into_version(&parent), v2);
    }

    #[test]
    fn jsonl_store_replays_after_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let v1 = version(1, &[rec("a.com", 1)]);
        {
            let s = JsonlStore::open(tmp.path()).unwrap();
            s.append_version(&VersionRecord::from_version(&PatternSet::new(), &v1))
                .unwrap();
        }
        let s = JsonlStore::open(tmp.path()).unwrap();
        let st = s.load().unwrap();
        assert_eq!(st.versions.len(), 1);
        assert!(st.rejections.is_empty());
        assert_eq!(st.versions[0].clone().into_version(&PatternSet::new()), v1);
    }

    #[test]
    fn torn_tail_is_dropped_but_middle_corruption_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let s = JsonlStore::open(tmp.path()).unwrap();
        let v1 = version(1, &[rec("a.com", 1)]);
        s.append_version(&VersionRecord::from_version(&PatternSet::new(), &v1))
            .unwrap();
        let path = tmp.path().join(VERSIONS_FILE);
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"id\":2,\"par").unwrap();
        assert_eq!(s.load().unwrap().versions.len(), 1);

        f.write_all(b"\n{}\n").unwrap();
        assert!(matches!(s.load(), Err(StoreError::Corrupted { line: 2, .. })));
    }
}
