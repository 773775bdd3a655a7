//! Audit export: read-only summary of ledger activity over a time range.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::ledger::Ledger;
use crate::model::{Diff, Origin, RejectionRecord, Stage, VersionId};

/// Rejections included verbatim in a report; the counts cover all of them.
pub const REJECTION_SAMPLE_LIMIT: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct CommitEntry {
    pub id: VersionId,
    pub timestamp: DateTime<Utc>,
    pub origin: Origin,
    pub message: String,
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
    /// Sources of every record the commit touched.
    pub sources: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub total_commits: usize,
    pub patterns_added: usize,
    pub patterns_removed: usize,
    pub patterns_changed: usize,
    pub rollback_count: usize,
    /// Distinct sources touched across all commits in range.
    pub sources_modified: usize,
    pub rejected_total: usize,
    /// Every stage is present, zero when nothing failed there.
    pub rejected_by_stage: BTreeMap<Stage, usize>,
    pub commits: Vec<CommitEntry>,
    /// Most recent rejections first.
    pub rejections: Vec<RejectionRecord>,
}

pub fn export(ledger: &Ledger, from: DateTime<Utc>, to: DateTime<Utc>) -> AuditReport {
    let versions = ledger.versions_between(from, to);
    let commits: Vec<CommitEntry> = versions
        .iter()
        .filter_map(|v| v.parent.map(|parent| (parent, v)))
        .map(|(parent, v)| CommitEntry {
            id: v.id,
            timestamp: v.timestamp,
            origin: v.origin,
            message: v.message.clone(),
            added: v.stats.added,
            removed: v.stats.removed,
            changed: v.stats.changed,
            sources: ledger
                .diff(parent, v.id)
                .map(|d| touched_sources(&d))
                .unwrap_or_default(),
        })
        .collect();
    let sources_modified = commits
        .iter()
        .flat_map(|c| c.sources.iter())
        .collect::<BTreeSet<_>>()
        .len();

    let mut rejected_by_stage: BTreeMap<Stage, usize> =
        Stage::ALL.iter().map(|s| (*s, 0)).collect();
    let mut rejections = ledger.rejections_between(from, to);
    for r in &rejections {
        *rejected_by_stage.entry(r.stage).or_default() += 1;
    }
    let rejected_total = rejections.len();
    rejections.reverse();
    rejections.truncate(REJECTION_SAMPLE_LIMIT);

    AuditReport {
        from,
        to,
        total_commits: commits.len(),
        patterns_added: commits.iter().map(|c| c.added).sum(),
        patterns_removed: commits.iter().map(|c| c.removed).sum(),
        patterns_changed: commits.iter().map(|c| c.changed).sum(),
        rollback_count: commits
            .iter()
            .filter(|c| c.origin == Origin::Rollback)
            .count(),
        sources_modified,
        rejected_total,
        rejected_by_stage,
        commits,
        rejections,
    }
}

fn touched_sources(diff: &Diff) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for r in diff.added.iter().chain(&diff.removed) {
        out.extend(r.sources.iter().cloned());
    }
    for (old, new) in &diff.changed {
        out.extend(old.sources.union(&new.sources).cloned());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Delta, PatternKind, PatternRecord};
    use chrono::Duration;
    use std::collections::BTreeSet;

    fn rec(p: &str) -> PatternRecord {
        PatternRecord {
            kind: PatternKind::Domain,
            pattern: p.into(),
            sources: BTreeSet::from(["A".to_string()]),
            confidence: 0.9,
            first_version: VersionId::ROOT,
        }
    }

    fn rejection(stage: Stage) -> RejectionRecord {
        RejectionRecord {
            timestamp: Utc::now(),
            sources: BTreeSet::from(["A".to_string()]),
            kind: PatternKind::Domain,
            pattern: "gmail.com".into(),
            stage,
            score: 0.5,
            reason: "matches clean corpus".into(),
        }
    }

    #[test]
    fn counts_commits_rollbacks_and_rejections() {
        let ledger = Ledger::in_memory();
        let from = Utc::now() - Duration::seconds(5);

        let mut d = Delta::new(ledger.head_id());
        d.upserts = vec![rec("a.example"), rec("b.example")];
        let v1 = ledger.commit(&d, "two", Origin::AutoUpdate).unwrap();
        let mut d = Delta::new(v1);
        d.removals.push(rec("a.example").key());
        ledger.commit(&d, "drop one", Origin::AutoUpdate).unwrap();
        ledger.rollback(v1).unwrap();
        ledger
            .record_rejections(&[rejection(Stage::FalsePositive), rejection(Stage::FalsePositive), rejection(Stage::Syntax)])
            .unwrap();

        let report = export(&ledger, from, Utc::now() + Duration::seconds(5));
        assert_eq!(report.total_commits, 3);
        assert_eq!(report.rollback_count, 1);
        assert_eq!(report.patterns_added, 3);
        assert_eq!(report.patterns_removed, 1);
        assert_eq!(report.rejected_total, 3);
        assert_eq!(report.rejected_by_stage[&Stage::FalsePositive], 2);
        assert_eq!(report.rejected_by_stage[&Stage::Community], 0);
        assert_eq!(report.rejections[0].stage, Stage::Syntax);
    }

    #[test]
    fn commits_list_the_sources_they_touched() {
        let ledger = Ledger::in_memory();
        let from = Utc::now() - Duration::seconds(5);
        let mut d = Delta::new(ledger.head_id());
        d.upserts = vec![rec("a.example")];
        let v1 = ledger.commit(&d, "from A", Origin::AutoUpdate).unwrap();
        let mut d = Delta::new(v1);
        d.upserts = vec![PatternRecord {
            sources: BTreeSet::from(["A".to_string(), "B".to_string()]),
            ..rec("a.example")
        }];
        d.upserts.push(PatternRecord {
            sources: BTreeSet::from(["C".to_string()]),
            ..rec("c.example")
        });
        ledger.commit(&d, "B corroborates, C adds", Origin::AutoUpdate).unwrap();

        let report = export(&ledger, from, Utc::now() + Duration::seconds(5));
        let touched: Vec<Vec<&str>> = report
            .commits
            .iter()
            .map(|c| c.sources.iter().map(String::as_str).collect())
            .collect();
        assert_eq!(touched, vec![vec!["A"], vec!["A", "B", "C"]]);
        assert_eq!(report.sources_modified, 3);
    }

    #[test]
    fn empty_range_reports_zeroes() {
        let ledger = Ledger::in_memory();
        let past = Utc::now() - Duration::days(2);
        let report = export(&ledger, past, past + Duration::hours(1));
        assert_eq!(report.total_commits, 0);
        assert_eq!(report.rejected_total, 0);
        assert_eq!(report.sources_modified, 0);
        assert_eq!(report.rejected_by_stage.len(), 4);
    }
}
