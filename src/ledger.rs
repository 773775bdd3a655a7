// src/ledger.rs
//! # Version Control Ledger
//! Linear commit log of immutable versions addressed by id.
//!
//! Writers are serialized by one mutex and persist to the store before the
//! new version becomes visible. Readers clone `Arc<Version>` handles and never
//! wait on a writer for longer than a vector push.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{LedgerError, StoreError};
use crate::model::{
    Delta, Diff, Origin, PatternAction, PatternEvent, PatternKey, PatternSet, RejectionRecord,
    Version, VersionId,
};
use crate::store::{MemoryStore, VersionRecord, VersionStore};

pub struct Ledger {
    store: Arc<dyn VersionStore>,
    /// Index == version id.
    versions: RwLock<Vec<Arc<Version>>>,
    rejections: RwLock<Vec<RejectionRecord>>,
    writer: Mutex<()>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("head", &self.head_id())
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Replay the store; an empty store gets the root version.
    pub fn open(store: Arc<dyn VersionStore>) -> Result<Self, LedgerError> {
        let state = store.load()?;
        let mut versions: Vec<Arc<Version>> = Vec::with_capacity(state.versions.len().max(1));
        let empty = PatternSet::new();
        for (idx, rec) in state.versions.into_iter().enumerate() {
            let expected_parent = idx.checked_sub(1).map(|p| VersionId(p as u64));
            if rec.id != VersionId(idx as u64) || rec.parent != expected_parent {
                return Err(StoreError::Corrupted {
                    line: idx + 1,
                    message: format!("expected {} but found {}", VersionId(idx as u64), rec.id),
                }
                .into());
            }
            let parent = versions.last().map(|v| &v.patterns).unwrap_or(&empty);
            versions.push(Arc::new(rec.into_version(parent)));
        }

        if versions.is_empty() {
            let root = root_version();
            store.append_version(&VersionRecord::from_version(&empty, &root))?;
            versions.push(Arc::new(root));
        }

        tracing::info!(
            target: "ledger",
            head = versions.len() - 1,
            rejections = state.rejections.len(),
            "ledger opened"
        );

        Ok(Self {
            store,
            versions: RwLock::new(versions),
            rejections: RwLock::new(state.rejections),
            writer: Mutex::new(()),
        })
    }

    pub fn in_memory() -> Self {
        let store = MemoryStore::new();
        let root = root_version();
        // MemoryStore appends are infallible
        let _ = store.append_version(&VersionRecord::from_version(&PatternSet::new(), &root));
        Self {
            store: Arc::new(store),
            versions: RwLock::new(vec![Arc::new(root)]),
            rejections: RwLock::new(Vec::new()),
            writer: Mutex::new(()),
        }
    }

    pub fn head(&self) -> Arc<Version> {
        let vs = self.versions.read().unwrap_or_else(|e| e.into_inner());
        // never empty after open
        Arc::clone(&vs[vs.len() - 1])
    }

    pub fn head_id(&self) -> VersionId {
        self.head().id
    }

    pub fn get(&self, id: VersionId) -> Option<Arc<Version>> {
        let vs = self.versions.read().unwrap_or_else(|e| e.into_inner());
        vs.get(id.0 as usize).cloned()
    }

    /// Append parent + delta. `delta.base` must be the current head.
    pub fn commit(
        &self,
        delta: &Delta,
        message: impl Into<String>,
        origin: Origin,
    ) -> Result<VersionId, LedgerError> {
        let _w = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let parent = self.head();
        if delta.base != parent.id {
            return Err(LedgerError::Conflict {
                expected: delta.base,
                head: parent.id,
            });
        }
        let id = parent.id.next();
        let patterns = delta.apply(&parent.patterns, id);
        let version = self.build(&parent, id, origin, message.into(), None, None, patterns);
        self.append(&parent, version)
    }

    /// New version whose content equals `target`, reverting the current head.
    pub fn rollback(&self, target: VersionId) -> Result<VersionId, LedgerError> {
        let _w = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let parent = self.head();
        let restored = self.get(target).ok_or(LedgerError::NotFound(target))?;
        let id = parent.id.next();
        let message = format!("rollback to {} (reverts {})", target, parent.id);
        let version = self.build(
            &parent,
            id,
            Origin::Rollback,
            message,
            Some(parent.id),
            Some(target),
            restored.patterns.clone(),
        );
        self.append(&parent, version)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        &self,
        parent: &Version,
        id: VersionId,
        origin: Origin,
        message: String,
        reverts: Option<VersionId>,
        restores: Option<VersionId>,
        patterns: PatternSet,
    ) -> Version {
        let stats = Diff::between(parent.id, &parent.patterns, id, &patterns).stats();
        Version {
            id,
            parent: Some(parent.id),
            timestamp: next_timestamp(parent.timestamp, Utc::now()),
            origin,
            message,
            reverts,
            restores,
            stats,
            patterns,
        }
    }

    fn append(&self, parent: &Version, version: Version) -> Result<VersionId, LedgerError> {
        self.store
            .append_version(&VersionRecord::from_version(&parent.patterns, &version))?;
        let id = version.id;
        tracing::info!(
            target: "ledger",
            version = id.0,
            origin = %version.origin,
            added = version.stats.added,
            removed = version.stats.removed,
            changed = version.stats.changed,
            patterns = version.pattern_count(),
            "committed {}",
            version.message
        );
        self.versions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(version));
        Ok(id)
    }

    /// Most recent first, starting strictly below `before` when given.
    pub fn history(&self, limit: usize, before: Option<VersionId>) -> Vec<Arc<Version>> {
        let vs = self.versions.read().unwrap_or_else(|e| e.into_inner());
        let end = before.map(|b| (b.0 as usize).min(vs.len())).unwrap_or(vs.len());
        vs[..end].iter().rev().take(limit).cloned().collect()
    }

    /// Versions with `from <= timestamp <= to`, oldest first.
    pub fn versions_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Arc<Version>> {
        let vs = self.versions.read().unwrap_or_else(|e| e.into_inner());
        vs.iter()
            .filter(|v| v.timestamp >= from && v.timestamp <= to)
            .cloned()
            .collect()
    }

    pub fn diff(&self, from: VersionId, to: VersionId) -> Result<Diff, LedgerError> {
        let a = self.get(from).ok_or(LedgerError::NotFound(from))?;
        let b = self.get(to).ok_or(LedgerError::NotFound(to))?;
        Ok(Diff::between(a.id, &a.patterns, b.id, &b.patterns))
    }

    /// Trail of one pattern, newest first. Versions in which the pattern
    /// was neither present nor removed are skipped.
    pub fn pattern_history(&self, key: &PatternKey, limit: usize) -> Vec<PatternEvent> {
        let vs = self.versions.read().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        for (idx, v) in vs.iter().enumerate().rev() {
            if out.len() >= limit {
                break;
            }
            let before = idx.checked_sub(1).and_then(|p| vs[p].patterns.get(key));
            let (action, rec) = match (before, v.patterns.get(key)) {
                (None, Some(now)) => (PatternAction::Added, now),
                (Some(old), None) => (PatternAction::Removed, old),
                (Some(old), Some(now)) if !old.same_content(now) => (PatternAction::Changed, now),
                (Some(_), Some(now)) => (PatternAction::Present, now),
                (None, None) => continue,
            };
            out.push(PatternEvent {
                version: v.id,
                timestamp: v.timestamp,
                origin: v.origin,
                message: v.message.clone(),
                action,
                sources: rec.sources.clone(),
            });
        }
        out
    }

    pub fn record_rejections(&self, records: &[RejectionRecord]) -> Result<(), LedgerError> {
        if records.is_empty() {
            return Ok(());
        }
        let _w = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        self.store.append_rejections(records)?;
        self.rejections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(records);
        Ok(())
    }

    pub fn rejections_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<RejectionRecord> {
        let rs = self.rejections.read().unwrap_or_else(|e| e.into_inner());
        rs.iter()
            .filter(|r| r.timestamp >= from && r.timestamp <= to)
            .cloned()
            .collect()
    }
}

fn root_version() -> Version {
    Version {
        id: VersionId::ROOT,
        parent: None,
        timestamp: Utc::now(),
        origin: Origin::Manual,
        message: "initial".into(),
        reverts: None,
        restores: None,
        stats: Default::default(),
        patterns: PatternSet::new(),
    }
}

/// Strictly after the parent, even when the clock has not advanced.
fn next_timestamp(parent: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if now > parent {
        now
    } else {
        parent + Duration::milliseconds(1)
    }
}
