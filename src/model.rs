//! # Data Model
//! Shared types for sources, candidates, pattern records, versions and diffs.
//!
//! Everything that crosses a component boundary lives here so that the
//! monitor, the validation pipeline, the ledger and the engine agree on
//! identity (`PatternKey`) and on provenance (`sources`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Syntactic kind of a tracker pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// Host name; matches the host itself and every subdomain.
    Domain,
    /// Regular expression evaluated against full URLs.
    UrlRegex,
    /// Regular expression evaluated against CSS fragments.
    CssRegex,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::Domain => "domain",
            PatternKind::UrlRegex => "url_regex",
            PatternKind::CssRegex => "css_regex",
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority tier of a source. Drives poll cadence and community confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        };
        f.write_str(s)
    }
}

/// Source definition as read from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub priority: Priority,
    /// Per-source override of the tier poll interval.
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
}

/// Unvalidated rule extracted from one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Original line as it appeared in the feed.
    pub raw: String,
    pub kind: PatternKind,
    /// Normalized pattern text (lowercased host, or regex source).
    pub pattern: String,
    pub source: String,
}

impl Candidate {
    pub fn key(&self) -> PatternKey {
        PatternKey::new(self.kind, self.pattern.clone())
    }
}

/// Identity of a pattern across sources and versions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PatternKey {
    pub kind: PatternKind,
    pub pattern: String,
}

impl PatternKey {
    pub fn new(kind: PatternKind, pattern: impl Into<String>) -> Self {
        Self {
            kind,
            pattern: pattern.into(),
        }
    }
}

impl fmt::Display for PatternKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.pattern)
    }
}

/// Monotonically increasing version id. The root version is `0`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct VersionId(pub u64);

impl VersionId {
    pub const ROOT: VersionId = VersionId(0);

    pub fn next(self) -> VersionId {
        VersionId(self.0 + 1)
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Accepted pattern, owned by the ledger. Never mutated after commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRecord {
    pub kind: PatternKind,
    pub pattern: String,
    /// Sources currently listing this pattern.
    pub sources: BTreeSet<String>,
    /// Community confidence in `[0.0, 1.0]` at acceptance time.
    pub confidence: f32,
    /// Version in which the pattern first appeared.
    pub first_version: VersionId,
}

impl PatternRecord {
    pub fn key(&self) -> PatternKey {
        PatternKey::new(self.kind, self.pattern.clone())
    }

    /// Content equality ignoring `first_version`.
    pub fn same_content(&self, other: &PatternRecord) -> bool {
        self.kind == other.kind
            && self.pattern == other.pattern
            && self.sources == other.sources
            && (self.confidence - other.confidence).abs() < 1e-6
    }
}

/// Full pattern content of one version, ordered by key.
pub type PatternSet = BTreeMap<PatternKey, PatternRecord>;

/// Who produced a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    AutoUpdate,
    Manual,
    Rollback,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Origin::AutoUpdate => "auto-update",
            Origin::Manual => "manual",
            Origin::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// Change counts between a version and its parent, computed at commit time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStats {
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
}

/// One commit in the linear history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    pub parent: Option<VersionId>,
    pub timestamp: DateTime<Utc>,
    pub origin: Origin,
    pub message: String,
    /// For rollback commits: the head that was reverted.
    #[serde(default)]
    pub reverts: Option<VersionId>,
    /// For rollback commits: the version whose content was restored.
    #[serde(default)]
    pub restores: Option<VersionId>,
    pub stats: ChangeStats,
    pub patterns: PatternSet,
}

impl Version {
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}

/// Patterns to apply on top of `base`. Upserts replace whole records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    pub base: VersionId,
    pub upserts: Vec<PatternRecord>,
    pub removals: Vec<PatternKey>,
}

impl Delta {
    pub fn new(base: VersionId) -> Self {
        Self {
            base,
            upserts: Vec::new(),
            removals: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }

    /// Apply onto `parent`, stamping new keys with `version`.
    pub fn apply(&self, parent: &PatternSet, version: VersionId) -> PatternSet {
        let mut out = parent.clone();
        for key in &self.removals {
            out.remove(key);
        }
        for rec in &self.upserts {
            let key = rec.key();
            let first_version = out
                .get(&key)
                .map(|existing| existing.first_version)
                .unwrap_or(version);
            let mut rec = rec.clone();
            rec.first_version = first_version;
            out.insert(key, rec);
        }
        out
    }
}

/// Set difference between two versions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    pub from: VersionId,
    pub to: VersionId,
    pub added: Vec<PatternRecord>,
    pub removed: Vec<PatternRecord>,
    /// `(old, new)` pairs for keys present in both with different content.
    pub changed: Vec<(PatternRecord, PatternRecord)>,
}

impl Diff {
    /// Pure set difference of two pattern sets.
    pub fn between(from: VersionId, a: &PatternSet, to: VersionId, b: &PatternSet) -> Diff {
        let mut diff = Diff {
            from,
            to,
            ..Diff::default()
        };
        for (key, old) in a {
            match b.get(key) {
                None => diff.removed.push(old.clone()),
                Some(new) if !old.same_content(new) => {
                    diff.changed.push((old.clone(), new.clone()))
                }
                Some(_) => {}
            }
        }
        for (key, new) in b {
            if !a.contains_key(key) {
                diff.added.push(new.clone());
            }
        }
        diff
    }

    pub fn stats(&self) -> ChangeStats {
        ChangeStats {
            added: self.added.len(),
            removed: self.removed.len(),
            changed: self.changed.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// What one version did to a single pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternAction {
    Added,
    Removed,
    /// Still present with different sources or confidence.
    Changed,
    /// Carried over unchanged.
    Present,
}

/// One entry of a pattern's trail through the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternEvent {
    pub version: VersionId,
    pub timestamp: DateTime<Utc>,
    pub origin: Origin,
    pub message: String,
    pub action: PatternAction,
    /// Sources after the version, or before it for a removal.
    pub sources: BTreeSet<String>,
}

/// Validation stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Syntax,
    Performance,
    FalsePositive,
    Community,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Syntax,
        Stage::Performance,
        Stage::FalsePositive,
        Stage::Community,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Syntax => "syntax",
            Stage::Performance => "performance",
            Stage::FalsePositive => "false_positive",
            Stage::Community => "community",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit entry for a rejected candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionRecord {
    pub timestamp: DateTime<Utc>,
    pub sources: BTreeSet<String>,
    pub kind: PatternKind,
    pub pattern: String,
    pub stage: Stage,
    /// Sub-score of the failing stage.
    pub score: f64,
    pub reason: String,
}
