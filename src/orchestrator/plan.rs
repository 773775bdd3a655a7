//! Delta planning: which keys need validation, which records change
//! attribution, which records disappear.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::model::{Candidate, Delta, PatternKey, PatternRecord, Priority, Version, VersionId};
use crate::validate::{CandidateGroup, ValidationResult};

/// Parsed content of one source for this cycle.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub source: String,
    pub priority: Priority,
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Default)]
pub struct DeltaPlan {
    pub base: VersionId,
    /// Head records that only gained sources.
    pub reattributed: Vec<PatternRecord>,
    /// Head records that lost a source but kept others. They must pass
    /// validation again under their reduced attribution.
    pub rechecks: Vec<CandidateGroup>,
    /// Head records left without any source.
    pub removals: Vec<PatternKey>,
    /// Keys absent from head, grouped across sources.
    pub groups: Vec<CandidateGroup>,
}

/// Outcome of combining a plan with validation results.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub delta: Delta,
    pub accepted: usize,
    pub rejected: Vec<ValidationResult>,
}

pub fn plan_delta<P, C>(head: &Version, deliveries: &[Delivery], priority_of: P, confidence: C) -> DeltaPlan
where
    P: Fn(&str) -> Priority,
    C: Fn(&[Priority]) -> f32,
{
    let delivered: BTreeMap<&str, HashSet<PatternKey>> = deliveries
        .iter()
        .map(|d| (d.source.as_str(), d.candidates.iter().map(Candidate::key).collect()))
        .collect();

    let mut plan = DeltaPlan {
        base: head.id,
        ..DeltaPlan::default()
    };

    for (key, rec) in &head.patterns {
        let mut sources = rec.sources.clone();
        for (src, keys) in &delivered {
            if keys.contains(key) {
                sources.insert((*src).to_string());
            } else {
                sources.remove(*src);
            }
        }
        if sources == rec.sources {
            continue;
        }
        if sources.is_empty() {
            plan.removals.push(key.clone());
            continue;
        }
        let priorities: Vec<Priority> = sources.iter().map(|s| priority_of(s)).collect();
        if !sources.is_superset(&rec.sources) {
            plan.rechecks.push(CandidateGroup {
                kind: rec.kind,
                pattern: rec.pattern.clone(),
                sources,
                priorities,
            });
            continue;
        }
        plan.reattributed.push(PatternRecord {
            confidence: confidence(&priorities),
            sources,
            ..rec.clone()
        });
    }

    let mut groups: BTreeMap<PatternKey, CandidateGroup> = BTreeMap::new();
    for d in deliveries {
        for c in &d.candidates {
            let key = c.key();
            if head.patterns.contains_key(&key) {
                continue;
            }
            let g = groups.entry(key).or_insert_with(|| CandidateGroup {
                kind: c.kind,
                pattern: c.pattern.clone(),
                sources: BTreeSet::new(),
                priorities: Vec::new(),
            });
            if g.sources.insert(d.source.clone()) {
                g.priorities.push(d.priority);
            }
        }
    }
    plan.groups = groups.into_values().collect();
    plan
}

impl DeltaPlan {
    /// Groups and rechecks without a result in `cache` for the same source set.
    pub fn pending(&self, cache: &HashMap<PatternKey, ValidationResult>) -> Vec<CandidateGroup> {
        self.groups
            .iter()
            .chain(&self.rechecks)
            .filter(|g| {
                cache
                    .get(&g.key())
                    .map(|r| r.sources != g.sources)
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Build the delta. Every group must have an entry in `results`;
    /// groups without one are left out, rechecks without one keep their
    /// head record. A failed recheck becomes a removal.
    pub fn resolve(&self, results: &HashMap<PatternKey, ValidationResult>) -> Resolution {
        let mut delta = Delta::new(self.base);
        delta.upserts.extend(self.reattributed.iter().cloned());
        delta.removals.extend(self.removals.iter().cloned());

        let mut accepted = 0;
        let mut rejected = Vec::new();
        for g in &self.groups {
            let Some(r) = results.get(&g.key()) else {
                continue;
            };
            match r.record() {
                Some(rec) => {
                    accepted += 1;
                    delta.upserts.push(rec);
                }
                None => rejected.push(r.clone()),
            }
        }
        for g in &self.rechecks {
            let Some(r) = results.get(&g.key()).filter(|r| r.sources == g.sources) else {
                continue;
            };
            match r.record() {
                Some(rec) => delta.upserts.push(rec),
                None => {
                    delta.removals.push(g.key());
                    rejected.push(r.clone());
                }
            }
        }
        Resolution {
            delta,
            accepted,
            rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeStats, Origin, PatternKind, PatternSet};
    use chrono::Utc;

    fn cand(source: &str, pattern: &str) -> Candidate {
        Candidate {
            raw: pattern.into(),
            kind: PatternKind::Domain,
            pattern: pattern.into(),
            source: source.into(),
        }
    }

    fn delivery(source: &str, priority: Priority, patterns: &[&str]) -> Delivery {
        Delivery {
            source: source.into(),
            priority,
            candidates: patterns.iter().map(|p| cand(source, p)).collect(),
        }
    }

    fn head(records: &[(&str, &[&str])]) -> Version {
        let patterns: PatternSet = records
            .iter()
            .map(|(p, srcs)| {
                let rec = PatternRecord {
                    kind: PatternKind::Domain,
                    pattern: (*p).into(),
                    sources: srcs.iter().map(|s| s.to_string()).collect(),
                    confidence: 0.9,
                    first_version: VersionId(1),
                };
                (rec.key(), rec)
            })
            .collect();
        Version {
            id: VersionId(1),
            parent: Some(VersionId::ROOT),
            timestamp: Utc::now(),
            origin: Origin::AutoUpdate,
            message: "seed".into(),
            reverts: None,
            restores: None,
            stats: ChangeStats::default(),
            patterns,
        }
    }

    fn prio(_: &str) -> Priority {
        Priority::High
    }

    fn conf(p: &[Priority]) -> f32 {
        p.len() as f32 / 10.0
    }

    #[test]
    fn known_keys_skip_validation_and_missing_ones_lose_the_source() {
        let h = head(&[("kept.example", &["A"]), ("dropped.example", &["A"]), ("shared.example", &["A", "B"])]);
        let d = [delivery("A", Priority::High, &["kept.example", "new.example"])];
        let plan = plan_delta(&h, &d, prio, conf);

        assert_eq!(plan.base, VersionId(1));
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(plan.groups[0].pattern, "new.example");
        assert_eq!(plan.removals, vec![PatternKey::new(PatternKind::Domain, "dropped.example")]);
        assert!(plan.reattributed.is_empty());
        assert_eq!(plan.rechecks.len(), 1);
        let shared = &plan.rechecks[0];
        assert_eq!(shared.pattern, "shared.example");
        assert_eq!(shared.sources.iter().collect::<Vec<_>>(), vec!["B"]);
        assert_eq!(plan.pending(&HashMap::new()).len(), 2);
    }

    #[test]
    fn record_losing_its_strong_source_is_revalidated() {
        use crate::validate::cost::FixedCost;
        use crate::validate::corpus::CleanCorpus;
        use crate::validate::{PipelineSettings, ValidationPipeline};
        use std::sync::Arc;

        let mut settings = PipelineSettings::default();
        settings.min_confidence = 0.6;
        let pipeline = ValidationPipeline::new(
            settings,
            Arc::new(CleanCorpus::default_seed()),
            Arc::new(FixedCost::new(1.0)),
        );
        let prio_of = |s: &str| if s == "H" { Priority::High } else { Priority::Low };
        let h = head(&[
            ("weak.tracker.example", &["H", "L"]),
            ("solid.tracker.example", &["H", "L2"]),
        ]);
        // H drops the first record; L2 drops the second
        let d = [
            delivery("H", Priority::High, &["solid.tracker.example"]),
            delivery("L2", Priority::Low, &[]),
        ];
        let plan = plan_delta(&h, &d, prio_of, |p| pipeline.confidence(p));
        assert_eq!(plan.rechecks.len(), 2);

        let results: HashMap<PatternKey, ValidationResult> = plan
            .pending(&HashMap::new())
            .iter()
            .map(|g| {
                let r = pipeline.validate(g);
                (r.key(), r)
            })
            .collect();
        let res = plan.resolve(&results);
        assert_eq!(res.accepted, 0);
        assert_eq!(
            res.delta.removals,
            vec![PatternKey::new(PatternKind::Domain, "weak.tracker.example")]
        );
        assert_eq!(res.rejected.len(), 1);
        assert_eq!(
            res.rejected[0].rejection.as_ref().map(|r| r.stage),
            Some(crate::model::Stage::Community)
        );
        assert_eq!(res.delta.upserts.len(), 1);
        assert_eq!(res.delta.upserts[0].pattern, "solid.tracker.example");
        assert_eq!(res.delta.upserts[0].sources.iter().collect::<Vec<_>>(), vec!["H"]);
    }

    #[test]
    fn overlapping_new_keys_form_one_group() {
        let h = head(&[]);
        let d = [
            delivery("A", Priority::High, &["tracker.example.com", "a-only.example"]),
            delivery("B", Priority::Low, &["tracker.example.com"]),
        ];
        let plan = plan_delta(&h, &d, prio, conf);
        assert_eq!(plan.groups.len(), 2);
        let g = plan.groups.iter().find(|g| g.pattern == "tracker.example.com").unwrap();
        assert_eq!(g.sources.len(), 2);
        assert_eq!(g.priorities, vec![Priority::High, Priority::Low]);
    }

    #[test]
    fn existing_key_from_a_new_source_is_corroboration() {
        let h = head(&[("tracker.example", &["A"])]);
        let d = [delivery("B", Priority::Medium, &["tracker.example"])];
        let plan = plan_delta(&h, &d, prio, conf);
        assert!(plan.groups.is_empty());
        assert_eq!(plan.reattributed[0].sources.len(), 2);
        assert!((plan.reattributed[0].confidence - 0.2).abs() < 1e-6);
    }

    #[test]
    fn unchanged_delivery_plans_nothing() {
        let h = head(&[("tracker.example", &["A"])]);
        let d = [delivery("A", Priority::High, &["tracker.example"])];
        let plan = plan_delta(&h, &d, prio, conf);
        let res = plan.resolve(&HashMap::new());
        assert!(res.delta.is_empty());
        assert_eq!(res.accepted, 0);
    }
}
