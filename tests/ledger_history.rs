// tests/ledger_history.rs
//
// Ledger over the file-backed store: linear history, rollback commits,
// replay after reopen, per-pattern trails, and the delta-apply property.

use std::collections::BTreeSet;
use std::sync::Arc;

use pixeltrace_autoupdate::error::LedgerError;
use pixeltrace_autoupdate::ledger::Ledger;
use pixeltrace_autoupdate::model::{
    Delta, Origin, PatternAction, PatternKind, PatternRecord, VersionId,
};
use pixeltrace_autoupdate::store::{JsonlStore, VersionStore};

fn rec(pattern: &str, sources: &[&str]) -> PatternRecord {
    PatternRecord {
        kind: PatternKind::Domain,
        pattern: pattern.into(),
        sources: sources.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
        confidence: 0.9,
        first_version: VersionId::ROOT,
    }
}

fn open(dir: &std::path::Path) -> Ledger {
    let store: Arc<dyn VersionStore> = Arc::new(JsonlStore::open(dir).expect("open store"));
    Ledger::open(store).expect("open ledger")
}

fn commit(ledger: &Ledger, upserts: Vec<PatternRecord>, removals: &[&str]) -> VersionId {
    let mut d = Delta::new(ledger.head_id());
    d.upserts = upserts;
    d.removals = removals
        .iter()
        .map(|p| rec(p, &[]).key())
        .collect();
    ledger.commit(&d, "test", Origin::AutoUpdate).expect("commit")
}

#[test]
fn history_is_a_time_ordered_chain() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = open(dir.path());
    let v1 = commit(&ledger, vec![rec("a.example", &["A"])], &[]);
    let v2 = commit(&ledger, vec![rec("b.example", &["A"])], &[]);
    ledger.rollback(v1).unwrap();
    commit(&ledger, vec![rec("c.example", &["B"])], &[]);

    let all = ledger.history(100, None);
    assert_eq!(all.len(), 5);
    for pair in all.windows(2) {
        let (newer, older) = (&pair[0], &pair[1]);
        assert_eq!(newer.parent, Some(older.id));
        assert!(newer.timestamp > older.timestamp);
    }
    assert_eq!(all.last().unwrap().parent, None);

    let page = ledger.history(2, Some(v2.next()));
    assert_eq!(page.iter().map(|v| v.id).collect::<Vec<_>>(), vec![v2, v1]);
}

#[test]
fn rollback_twice_yields_identical_content() {
    let ledger = Ledger::in_memory();
    let v1 = commit(&ledger, vec![rec("a.example", &["A"]), rec("b.example", &["A"])], &[]);
    commit(&ledger, vec![rec("c.example", &["A"])], &["a.example"]);

    let r1 = ledger.rollback(v1).unwrap();
    let r2 = ledger.rollback(v1).unwrap();
    let target = ledger.get(v1).unwrap();
    assert_eq!(ledger.get(r1).unwrap().patterns, target.patterns);
    assert_eq!(ledger.get(r2).unwrap().patterns, target.patterns);
    assert_ne!(r1, r2);
    assert!(ledger.diff(r1, r2).unwrap().is_empty());

    assert!(matches!(ledger.rollback(VersionId(42)), Err(LedgerError::NotFound(VersionId(42)))));
}

#[test]
fn committed_set_equals_parent_with_delta_applied() {
    let ledger = Ledger::in_memory();
    commit(&ledger, vec![rec("a.example", &["A"]), rec("b.example", &["A"])], &[]);
    let parent = ledger.head();

    let mut d = Delta::new(parent.id);
    d.upserts = vec![rec("a.example", &["A", "B"]), rec("n.example", &["B"])];
    d.removals = vec![rec("b.example", &[]).key()];
    let id = ledger.commit(&d, "mix", Origin::AutoUpdate).unwrap();

    let v = ledger.get(id).unwrap();
    assert_eq!(v.patterns, d.apply(&parent.patterns, id));
    assert_eq!((v.stats.added, v.stats.removed, v.stats.changed), (1, 1, 1));

    let stale = Delta {
        base: parent.id,
        ..Delta::default()
    };
    assert!(matches!(
        ledger.commit(&stale, "late", Origin::Manual),
        Err(LedgerError::Conflict { .. })
    ));
}

#[test]
fn reopened_ledger_replays_identical_history() {
    let dir = tempfile::tempdir().unwrap();
    let (head, versions) = {
        let ledger = open(dir.path());
        let v1 = commit(&ledger, vec![rec("a.example", &["A"])], &[]);
        commit(&ledger, vec![rec("b.example", &["A"])], &["a.example"]);
        ledger.rollback(v1).unwrap();
        (ledger.head(), ledger.history(10, None))
    };

    let reopened = open(dir.path());
    assert_eq!(reopened.head_id(), head.id);
    assert_eq!(reopened.head().patterns, head.patterns);
    let replayed = reopened.history(10, None);
    assert_eq!(replayed.len(), versions.len());
    for (a, b) in replayed.iter().zip(versions.iter()) {
        assert_eq!(a.as_ref(), b.as_ref());
    }
}

#[test]
fn pattern_trail_follows_one_key() {
    let ledger = Ledger::in_memory();
    let key = rec("p.example", &[]).key();
    let v1 = commit(&ledger, vec![rec("p.example", &["A"])], &[]);
    let v2 = commit(&ledger, vec![rec("other.example", &["A"])], &[]);
    let v3 = commit(&ledger, vec![rec("p.example", &["A", "B"])], &[]);
    let v4 = commit(&ledger, vec![], &["p.example"]);
    let v5 = ledger.rollback(v3).unwrap();

    let trail = ledger.pattern_history(&key, 10);
    let seen: Vec<(VersionId, PatternAction)> = trail.iter().map(|e| (e.version, e.action)).collect();
    assert_eq!(
        seen,
        vec![
            (v5, PatternAction::Added),
            (v4, PatternAction::Removed),
            (v3, PatternAction::Changed),
            (v2, PatternAction::Present),
            (v1, PatternAction::Added),
        ]
    );
    assert_eq!(trail[0].origin, Origin::Rollback);
    // a removal reports the sources it took away
    assert_eq!(trail[1].sources.len(), 2);
    assert_eq!(trail[4].sources.iter().collect::<Vec<_>>(), vec!["A"]);

    assert_eq!(ledger.pattern_history(&key, 2).len(), 2);
    assert!(ledger.pattern_history(&rec("never.example", &[]).key(), 10).is_empty());
}
