//! The evaluation state machine (component C6).
//!
//! A small struct holding read-only references to the stores it needs, with
//! one entry point, supporting the full prerequisite/target/rule/rollout/
//! segment evaluation chain.
//!
//! Evaluation order, normative: off -> prerequisites -> targets -> rules (in
//! order) -> fallthrough. A flag that is off never touches prerequisites,
//! targets or rules.

use crate::bucketing;
use crate::clause;
use crate::models::{FeatureFlag, Prerequisite, RolloutKind, VariationOrRollout};
use crate::reason::{BigSegmentsStatus, ErrorKind, EvalResult, Reason};
use crate::segment::{BigSegmentStore, SegmentEvalContext, SegmentLookup};
use crate::store::FlagLookup;
use crate::user::User;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Flag key reserved for exercising the panic safety net in tests; never a
/// real flag a store would hold.
pub const PANIC_TEST_FLAG_KEY: &str = "$internal-panic-test-flag$";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("flag not found: {0}")]
    FlagNotFound(String),
}

/// Sink for prerequisite sub-evaluations, so a caller can record evaluation
/// events for flags that were evaluated only because another flag depended
/// on them, without the evaluator itself taking on an events dependency.
pub trait PrerequisiteSink {
    fn record(&self, flag_key: &str, result: &Arc<EvalResult>, user: &User);
}

/// Result of resolving a single prerequisite: satisfied, failed on its own
/// terms, or carrying an error that must propagate to the dependent flag's
/// own result rather than being folded into a plain `PrerequisiteFailed`.
enum PrereqOutcome {
    Satisfied,
    Failed,
    Errored(Arc<EvalResult>),
}

pub struct NullSink;

impl PrerequisiteSink for NullSink {
    fn record(&self, _flag_key: &str, _result: &Arc<EvalResult>, _user: &User) {}
}

pub struct Evaluator<'a> {
    flags: &'a dyn FlagLookup,
    segments: &'a dyn SegmentLookup,
    big_segments: Option<&'a dyn BigSegmentStore>,
    sink: &'a dyn PrerequisiteSink,
}

impl<'a> Evaluator<'a> {
    pub fn new(flags: &'a dyn FlagLookup, segments: &'a dyn SegmentLookup) -> Self {
        Self {
            flags,
            segments,
            big_segments: None,
            sink: &NullSink,
        }
    }

    pub fn with_big_segments(mut self, store: &'a dyn BigSegmentStore) -> Self {
        self.big_segments = Some(store);
        self
    }

    pub fn with_prerequisite_sink(mut self, sink: &'a dyn PrerequisiteSink) -> Self {
        self.sink = sink;
        self
    }

    /// Evaluate one flag for one user. Never panics: an internal fault is
    /// caught and reported as an `Exception` reason rather than propagated.
    pub fn evaluate(&self, flag_key: &str, user: Option<&User>) -> Result<Arc<EvalResult>, Error> {
        let flag = self
            .flags
            .flag(flag_key)
            .ok_or_else(|| Error::FlagNotFound(flag_key.to_string()))?;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match user {
            Some(user) => {
                let mut visited = HashSet::new();
                self.evaluate_flag(&flag, user, &mut visited)
            }
            None => EvalResult::error(ErrorKind::UserNotSpecified).shared(),
        }));

        match outcome {
            Ok(result) => Ok(result),
            Err(_) => {
                tracing::error!(flag_key, "flag evaluation panicked");
                Ok(EvalResult::error(ErrorKind::Exception).shared())
            }
        }
    }

    pub fn bool_variation(&self, flag_key: &str, user: Option<&User>, default: bool) -> bool {
        self.evaluate(flag_key, user)
            .ok()
            .and_then(|r| r.value.clone())
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }

    fn evaluate_flag(
        &self,
        flag: &FeatureFlag,
        user: &User,
        visited_flags: &mut HashSet<String>,
    ) -> Arc<EvalResult> {
        if flag.key == PANIC_TEST_FLAG_KEY {
            panic!("internal panic test flag evaluated");
        }

        if !flag.on {
            return match &flag.preprocessed {
                Some(p) => p.off_result.clone(),
                None => self.off_result(flag),
            };
        }

        for (i, prereq) in flag.prerequisites.iter().enumerate() {
            match self.evaluate_prerequisite(prereq, user, visited_flags) {
                PrereqOutcome::Satisfied => {}
                PrereqOutcome::Failed => {
                    return match &flag.preprocessed {
                        Some(p) => p.prereq_failed_results[i].clone(),
                        None => self.off_variation_result(
                            flag,
                            Reason::prerequisite_failed(prereq.key.clone()),
                        ),
                    };
                }
                PrereqOutcome::Errored(result) => return result,
            }
        }

        for (i, target) in flag.targets.iter().enumerate() {
            if target.values.contains(&user.key) {
                return match &flag.preprocessed {
                    Some(p) => p.target_results[i].clone(),
                    None => self.variation_result(flag, target.variation, Reason::target_match()),
                };
            }
        }

        let mut seg_ctx = SegmentEvalContext::new(self.segments, self.big_segments);

        for (i, rule) in flag.rules.iter().enumerate() {
            let matched = rule
                .clauses
                .iter()
                .all(|c| clause::matches(c, user, &mut seg_ctx));
            if !matched {
                continue;
            }
            let status = seg_ctx.big_segments_status();
            if let Some(p) = &flag.preprocessed {
                if let Some(fixed) = &p.rule_fixed_results[i] {
                    return with_status_on_fixed(fixed, status);
                }
                let reason = with_status_reason((*p.rule_reasons[i]).clone(), status);
                return self.resolve_variation_or_rollout(
                    flag,
                    &rule.variation_or_rollout,
                    user,
                    reason,
                    rule.track_events,
                );
            }
            let reason = with_status_reason(Reason::rule_match(i, rule.id.clone(), false), status);
            return self.resolve_variation_or_rollout(
                flag,
                &rule.variation_or_rollout,
                user,
                reason,
                rule.track_events,
            );
        }

        let status = seg_ctx.big_segments_status();
        if let Some(p) = &flag.preprocessed {
            if let Some(fixed) = &p.fallthrough_fixed_result {
                return with_status_on_fixed(fixed, status);
            }
            let reason = with_status_reason((*p.fallthrough_reason).clone(), status);
            return self.resolve_variation_or_rollout(
                flag,
                &flag.fallthrough,
                user,
                reason,
                flag.track_events_fallthrough,
            );
        }
        let reason = with_status_reason(Reason::fallthrough(false), status);
        self.resolve_variation_or_rollout(
            flag,
            &flag.fallthrough,
            user,
            reason,
            flag.track_events_fallthrough,
        )
    }

    fn evaluate_prerequisite(
        &self,
        prereq: &Prerequisite,
        user: &User,
        visited_flags: &mut HashSet<String>,
    ) -> PrereqOutcome {
        if !visited_flags.insert(prereq.key.clone()) {
            return PrereqOutcome::Errored(EvalResult::error(ErrorKind::MalformedFlag).shared());
        }
        let outcome = match self.flags.flag(&prereq.key) {
            Some(prereq_flag) => {
                let result = self.evaluate_flag(&prereq_flag, user, visited_flags);
                self.sink.record(&prereq.key, &result, user);
                if matches!(result.reason.kind, crate::reason::ReasonKind::Error(ErrorKind::MalformedFlag)) {
                    PrereqOutcome::Errored(result)
                } else if prereq_flag.on && result.variation_index == Some(prereq.variation) {
                    PrereqOutcome::Satisfied
                } else {
                    PrereqOutcome::Failed
                }
            }
            None => PrereqOutcome::Failed,
        };
        visited_flags.remove(&prereq.key);
        outcome
    }

    fn resolve_variation_or_rollout(
        &self,
        flag: &FeatureFlag,
        vr: &VariationOrRollout,
        user: &User,
        mut reason: Reason,
        force_tracking: bool,
    ) -> Arc<EvalResult> {
        if vr.variation.is_some() && vr.rollout.is_some() {
            return EvalResult::error(ErrorKind::MalformedFlag).shared();
        }
        let result = if let Some(variation) = vr.variation {
            self.variation_result(flag, variation, reason)
        } else {
            match &vr.rollout {
                Some(rollout) if !rollout.variations.is_empty() => {
                    let bucket_value = bucketing::bucket(
                        user,
                        &flag.key,
                        &flag.salt,
                        &rollout.bucket_by,
                        rollout.seed,
                    );
                    let selected = bucketing::select_weighted_variation(bucket_value, &rollout.variations);
                    reason.in_experiment = rollout.kind == RolloutKind::Experiment && !selected.untracked;
                    self.variation_result(flag, selected.variation, reason)
                }
                _ => return EvalResult::error(ErrorKind::MalformedFlag).shared(),
            }
        };
        if force_tracking {
            Arc::new((*result).clone().with_force_tracking(true))
        } else {
            result
        }
    }

    fn variation_result(&self, flag: &FeatureFlag, variation: usize, reason: Reason) -> Arc<EvalResult> {
        match flag.variations.get(variation) {
            Some(value) => EvalResult::new(Some(value.clone()), Some(variation), reason).shared(),
            None => EvalResult::error(ErrorKind::MalformedFlag).shared(),
        }
    }

    fn off_result(&self, flag: &FeatureFlag) -> Arc<EvalResult> {
        self.off_variation_result(flag, Reason::off())
    }

    /// Resolve `flag.off_variation` under an arbitrary reason. Used for the
    /// real OFF result and for prerequisite-failed results, which resolve
    /// the same variation tagged with `PREREQUISITE_FAILED` instead.
    fn off_variation_result(&self, flag: &FeatureFlag, reason: Reason) -> Arc<EvalResult> {
        match flag.off_variation {
            Some(v) => self.variation_result(flag, v, reason),
            None => EvalResult::new(None, None, reason).shared(),
        }
    }
}

fn with_status(mut result: EvalResult, status: Option<BigSegmentsStatus>) -> EvalResult {
    result.reason.big_segments_status = status;
    result
}

/// Apply a big-segment status to an interned fixed result, only cloning out
/// of the `Arc` when there is actually a status to fold in. Keeps the common
/// case (no segment clauses consulted) reference-equal across evaluations.
fn with_status_on_fixed(fixed: &Arc<EvalResult>, status: Option<BigSegmentsStatus>) -> Arc<EvalResult> {
    match status {
        Some(_) => Arc::new(with_status((**fixed).clone(), status)),
        None => fixed.clone(),
    }
}

fn with_status_reason(mut reason: Reason, status: Option<BigSegmentsStatus>) -> Reason {
    reason.big_segments_status = status;
    reason
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Clause, Operator, Rollout, Target, UserAttribute, WeightedVariation};
    use crate::reason::ReasonKind;
    use crate::store::{LoadOptions, MemoryStore};
    use crate::test_utils::{FlagBuilder, MockBigSegmentStore, SegmentBuilder};
    use serde_json::json;

    #[test]
    fn off_flag_returns_off_variation() {
        let store = MemoryStore::new();
        let flag = FlagBuilder::new("f1").off().off_variation(0).build();
        store.upsert_flag(flag, LoadOptions::default());
        let eval = Evaluator::new(&store, &store);
        let result = eval.evaluate("f1", Some(&User::new("u1"))).unwrap();
        assert_eq!(result.reason.kind, ReasonKind::Off);
        assert_eq!(result.value, Some(json!(false)));
    }

    #[test]
    fn target_match_wins_over_rules() {
        let store = MemoryStore::new();
        let mut flag = FlagBuilder::new("f1").on().build();
        flag.targets.push(Target {
            values: ["u1".to_string()].into_iter().collect(),
            variation: 1,
        });
        store.upsert_flag(flag, LoadOptions::default());
        let eval = Evaluator::new(&store, &store);
        let result = eval.evaluate("f1", Some(&User::new("u1"))).unwrap();
        assert_eq!(result.value, Some(json!(true)));
        assert_eq!(result.reason.kind, ReasonKind::TargetMatch);
    }

    #[test]
    fn fallthrough_rollout_selects_by_bucket() {
        let store = MemoryStore::new();
        let mut flag = FlagBuilder::new("f1").on().build();
        flag.fallthrough = VariationOrRollout {
            variation: None,
            rollout: Some(Rollout {
                variations: vec![
                    WeightedVariation {
                        variation: 0,
                        weight: 0,
                        untracked: false,
                    },
                    WeightedVariation {
                        variation: 1,
                        weight: 100_000,
                        untracked: false,
                    },
                ],
                bucket_by: UserAttribute::Key,
                kind: RolloutKind::Rollout,
                seed: None,
            }),
        };
        store.upsert_flag(flag, LoadOptions::default());
        let eval = Evaluator::new(&store, &store);
        let result = eval.evaluate("f1", Some(&User::new("u1"))).unwrap();
        assert_eq!(result.value, Some(json!(true)));
        assert_eq!(result.reason.kind, ReasonKind::Fallthrough);
    }

    #[test]
    fn rule_with_matching_clause_wins() {
        let store = MemoryStore::new();
        let mut flag = FlagBuilder::new("f1").on().build();
        flag.rules.push(crate::models::Rule {
            id: "rule-1".into(),
            clauses: vec![Clause {
                attribute: UserAttribute::Custom("country".into()),
                op: Operator::In,
                values: vec![json!("US")],
                negate: false,
                aux: None,
            }],
            variation_or_rollout: VariationOrRollout {
                variation: Some(1),
                rollout: None,
            },
            track_events: false,
        });
        store.upsert_flag(flag, LoadOptions::default());
        let eval = Evaluator::new(&store, &store);
        let user = User::new("u1").with_attribute("country", "US");
        let result = eval.evaluate("f1", Some(&user)).unwrap();
        assert_eq!(result.value, Some(json!(true)));
        match &result.reason.kind {
            ReasonKind::RuleMatch { rule_index, rule_id } => {
                assert_eq!(*rule_index, 0);
                assert_eq!(rule_id, "rule-1");
            }
            other => panic!("unexpected reason {other:?}"),
        }
    }

    #[test]
    fn failed_prerequisite_forces_off_result() {
        let store = MemoryStore::new();
        let prereq_flag = FlagBuilder::new("prereq").on().off_variation(0).build();
        store.upsert_flag(prereq_flag, LoadOptions::default());

        let mut flag = FlagBuilder::new("main").on().build();
        flag.prerequisites.push(Prerequisite {
            key: "prereq".into(),
            variation: 1,
        });
        store.upsert_flag(flag, LoadOptions::default());

        let eval = Evaluator::new(&store, &store);
        let result = eval.evaluate("main", Some(&User::new("u1"))).unwrap();
        match &result.reason.kind {
            ReasonKind::PrerequisiteFailed { prerequisite_key } => {
                assert_eq!(prerequisite_key, "prereq");
            }
            other => panic!("unexpected reason {other:?}"),
        }
    }

    #[test]
    fn satisfied_prerequisite_falls_through_to_rules() {
        let store = MemoryStore::new();
        let prereq_flag = FlagBuilder::new("prereq").on().build();
        store.upsert_flag(prereq_flag, LoadOptions::default());

        let mut flag = FlagBuilder::new("main").on().build();
        flag.prerequisites.push(Prerequisite {
            key: "prereq".into(),
            variation: 1,
        });
        store.upsert_flag(flag, LoadOptions::default());

        let eval = Evaluator::new(&store, &store);
        let result = eval.evaluate("main", Some(&User::new("u1"))).unwrap();
        assert_eq!(result.reason.kind, ReasonKind::Fallthrough);
    }

    #[test]
    fn cyclic_prerequisites_are_malformed_not_merely_failed() {
        let store = MemoryStore::new();
        let mut a = FlagBuilder::new("a").on().build();
        a.prerequisites.push(Prerequisite {
            key: "b".into(),
            variation: 1,
        });
        let mut b = FlagBuilder::new("b").on().build();
        b.prerequisites.push(Prerequisite {
            key: "a".into(),
            variation: 1,
        });
        store.upsert_flag(a, LoadOptions::default());
        store.upsert_flag(b, LoadOptions::default());

        let eval = Evaluator::new(&store, &store);
        let result = eval.evaluate("a", Some(&User::new("u1"))).unwrap();
        assert_eq!(result.reason.kind, ReasonKind::Error(ErrorKind::MalformedFlag));
    }

    #[test]
    fn self_referencing_prerequisite_is_malformed() {
        let store = MemoryStore::new();
        let mut a = FlagBuilder::new("a").on().build();
        a.prerequisites.push(Prerequisite {
            key: "a".into(),
            variation: 1,
        });
        store.upsert_flag(a, LoadOptions::default());

        let eval = Evaluator::new(&store, &store);
        let result = eval.evaluate("a", Some(&User::new("u1"))).unwrap();
        assert_eq!(result.reason.kind, ReasonKind::Error(ErrorKind::MalformedFlag));
    }

    #[test]
    fn rule_variation_out_of_range_is_malformed() {
        let store = MemoryStore::new();
        let mut flag = FlagBuilder::new("f1").on().build();
        flag.rules.push(crate::models::Rule {
            id: "r0".into(),
            clauses: vec![Clause {
                attribute: UserAttribute::Key,
                op: Operator::In,
                values: vec![json!("u1")],
                negate: false,
                aux: None,
            }],
            variation_or_rollout: VariationOrRollout {
                variation: Some(999),
                rollout: None,
            },
            track_events: false,
        });
        store.upsert_flag(flag, LoadOptions::default());

        let eval = Evaluator::new(&store, &store);
        let result = eval.evaluate("f1", Some(&User::new("u1"))).unwrap();
        assert_eq!(result.reason.kind, ReasonKind::Error(ErrorKind::MalformedFlag));
    }

    struct RecordingSink {
        calls: std::cell::RefCell<Vec<String>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                calls: std::cell::RefCell::new(Vec::new()),
            }
        }
    }

    impl PrerequisiteSink for RecordingSink {
        fn record(&self, flag_key: &str, _result: &Arc<EvalResult>, _user: &User) {
            self.calls.borrow_mut().push(flag_key.to_string());
        }
    }

    #[test]
    fn prerequisite_chain_records_events_in_dependency_order() {
        let store = MemoryStore::new();

        let f2 = FlagBuilder::new("f2")
            .on()
            .with_variations([json!("red"), json!("green")])
            .with_fallthrough_variation(1)
            .build();
        store.upsert_flag(f2, LoadOptions::default());

        let mut f1 = FlagBuilder::new("f1")
            .on()
            .with_variations([json!("red"), json!("green")])
            .with_fallthrough_variation(1)
            .build();
        f1.prerequisites.push(Prerequisite {
            key: "f2".into(),
            variation: 1,
        });
        store.upsert_flag(f1, LoadOptions::default());

        let mut f = FlagBuilder::new("f")
            .on()
            .with_variations([json!("red"), json!("green")])
            .with_fallthrough_variation(1)
            .build();
        f.prerequisites.push(Prerequisite {
            key: "f1".into(),
            variation: 1,
        });
        store.upsert_flag(f, LoadOptions::default());

        let sink = RecordingSink::new();
        let eval = Evaluator::new(&store, &store).with_prerequisite_sink(&sink);
        let result = eval.evaluate("f", Some(&User::new("u1"))).unwrap();

        assert_eq!(result.value, Some(json!("green")));
        assert_eq!(result.reason.kind, ReasonKind::Fallthrough);
        assert_eq!(*sink.calls.borrow(), vec!["f2".to_string(), "f1".to_string()]);
    }

    #[test]
    fn missing_user_yields_error_result_not_err() {
        let store = MemoryStore::new();
        store.upsert_flag(FlagBuilder::new("f1").on().build(), LoadOptions::default());
        let eval = Evaluator::new(&store, &store);
        let result = eval.evaluate("f1", None).unwrap();
        assert_eq!(
            result.reason.kind,
            ReasonKind::Error(ErrorKind::UserNotSpecified)
        );
    }

    #[test]
    fn missing_flag_is_an_error() {
        let store = MemoryStore::new();
        let eval = Evaluator::new(&store, &store);
        let err = eval.evaluate("missing", Some(&User::new("u1"))).unwrap_err();
        assert!(matches!(err, Error::FlagNotFound(_)));
    }

    #[test]
    fn panic_in_evaluation_is_caught() {
        let store = MemoryStore::new();
        let eval = Evaluator::new(&store, &store);
        let result = eval
            .evaluate(PANIC_TEST_FLAG_KEY, Some(&User::new("u1")))
            .unwrap();
        assert_eq!(result.reason.kind, ReasonKind::Error(ErrorKind::Exception));
    }

    #[test]
    fn segment_match_clause_consults_store() {
        let store = MemoryStore::new();
        let mut segment = crate::models::Segment {
            key: "seg".into(),
            version: 1,
            included: Default::default(),
            excluded: Default::default(),
            rules: Vec::new(),
            salt: "s".into(),
            unbounded: false,
            generation: None,
            preprocessed: None,
        };
        segment.included.insert("u1".into());
        store.upsert_segment(segment, LoadOptions::default());

        let mut flag = FlagBuilder::new("f1").on().build();
        flag.rules.push(crate::models::Rule {
            id: "rule-1".into(),
            clauses: vec![Clause {
                attribute: UserAttribute::Key,
                op: Operator::SegmentMatch,
                values: vec![json!("seg")],
                negate: false,
                aux: None,
            }],
            variation_or_rollout: VariationOrRollout {
                variation: Some(1),
                rollout: None,
            },
            track_events: false,
        });
        store.upsert_flag(flag, LoadOptions::default());

        let eval = Evaluator::new(&store, &store);
        let in_segment = eval.evaluate("f1", Some(&User::new("u1"))).unwrap();
        assert_eq!(in_segment.value, Some(json!(true)));

        let not_in_segment = eval.evaluate("f1", Some(&User::new("u2"))).unwrap();
        assert_eq!(not_in_segment.reason.kind, ReasonKind::Fallthrough);
    }

    #[test]
    fn unbounded_segment_match_reports_healthy_status() {
        let store = MemoryStore::new();
        let segment = SegmentBuilder::new("big").unbounded(3).build();
        store.upsert_segment(segment, LoadOptions::default());

        let mut big_store = MockBigSegmentStore::new();
        let mut membership = std::collections::HashMap::new();
        membership.insert("big.g3".to_string(), true);
        big_store.set_membership("u1", membership);

        let mut flag = FlagBuilder::new("f1").on().build();
        flag.rules.push(crate::models::Rule {
            id: "rule-1".into(),
            clauses: vec![Clause {
                attribute: UserAttribute::Key,
                op: Operator::SegmentMatch,
                values: vec![json!("big")],
                negate: false,
                aux: None,
            }],
            variation_or_rollout: VariationOrRollout {
                variation: Some(1),
                rollout: None,
            },
            track_events: false,
        });
        store.upsert_flag(flag, LoadOptions::default());

        let eval = Evaluator::new(&store, &store).with_big_segments(&big_store);
        let result = eval.evaluate("f1", Some(&User::new("u1"))).unwrap();
        assert_eq!(result.value, Some(json!(true)));
        assert_eq!(
            result.reason.big_segments_status,
            Some(BigSegmentsStatus::Healthy)
        );
        assert_eq!(big_store.call_count(), 1);
    }

    #[test]
    fn rule_match_force_tracks_when_rule_requests_it() {
        let store = MemoryStore::new();
        let mut flag = FlagBuilder::new("f1").on().build();
        flag.rules.push(crate::models::Rule {
            id: "rule-1".into(),
            clauses: vec![Clause {
                attribute: UserAttribute::Key,
                op: Operator::In,
                values: vec![json!("u1")],
                negate: false,
                aux: None,
            }],
            variation_or_rollout: VariationOrRollout {
                variation: Some(1),
                rollout: None,
            },
            track_events: true,
        });
        store.upsert_flag(flag, LoadOptions::default());

        let eval = Evaluator::new(&store, &store);
        let result = eval.evaluate("f1", Some(&User::new("u1"))).unwrap();
        assert!(result.force_reason_tracking);
    }

    #[test]
    fn rule_match_does_not_force_track_by_default() {
        let store = MemoryStore::new();
        let mut flag = FlagBuilder::new("f1").on().build();
        flag.rules.push(crate::models::Rule {
            id: "rule-1".into(),
            clauses: vec![Clause {
                attribute: UserAttribute::Key,
                op: Operator::In,
                values: vec![json!("u1")],
                negate: false,
                aux: None,
            }],
            variation_or_rollout: VariationOrRollout {
                variation: Some(1),
                rollout: None,
            },
            track_events: false,
        });
        store.upsert_flag(flag, LoadOptions::default());

        let eval = Evaluator::new(&store, &store);
        let result = eval.evaluate("f1", Some(&User::new("u1"))).unwrap();
        assert!(!result.force_reason_tracking);
    }

    #[test]
    fn fallthrough_force_tracks_when_flag_requests_it() {
        let store = MemoryStore::new();
        let mut flag = FlagBuilder::new("f1").on().build();
        flag.track_events_fallthrough = true;
        store.upsert_flag(flag, LoadOptions::default());

        let eval = Evaluator::new(&store, &store);
        let result = eval.evaluate("f1", Some(&User::new("u1"))).unwrap();
        assert_eq!(result.reason.kind, ReasonKind::Fallthrough);
        assert!(result.force_reason_tracking);
    }

    #[test]
    fn rollout_fallthrough_force_tracks_when_flag_requests_it() {
        let store = MemoryStore::new();
        let mut flag = FlagBuilder::new("f1").on().build();
        flag.track_events_fallthrough = true;
        flag.fallthrough = VariationOrRollout {
            variation: None,
            rollout: Some(Rollout {
                variations: vec![WeightedVariation {
                    variation: 1,
                    weight: 100_000,
                    untracked: false,
                }],
                bucket_by: UserAttribute::Key,
                kind: RolloutKind::Rollout,
                seed: None,
            }),
        };
        store.upsert_flag(flag, LoadOptions::default());

        let eval = Evaluator::new(&store, &store);
        let result = eval.evaluate("f1", Some(&User::new("u1"))).unwrap();
        assert!(result.force_reason_tracking);
    }

    /// Property 7: evaluating through the preprocessed fast path and through
    /// the on-demand fallback must produce structurally identical results.
    #[test]
    fn preprocessing_is_equivalent_to_on_demand_evaluation() {
        fn build_flag() -> FeatureFlag {
            let mut flag = FlagBuilder::new("f1")
                .on()
                .with_variations([json!("red"), json!("green"), json!("blue")])
                .with_fallthrough_variation(2)
                .build();
            flag.rules.push(crate::models::Rule {
                id: "rule-1".into(),
                clauses: vec![Clause {
                    attribute: UserAttribute::Custom("country".into()),
                    op: Operator::In,
                    values: vec![json!("US")],
                    negate: false,
                    aux: None,
                }],
                variation_or_rollout: VariationOrRollout {
                    variation: None,
                    rollout: Some(Rollout {
                        variations: vec![
                            WeightedVariation {
                                variation: 0,
                                weight: 0,
                                untracked: false,
                            },
                            WeightedVariation {
                                variation: 1,
                                weight: 100_000,
                                untracked: false,
                            },
                        ],
                        bucket_by: UserAttribute::Key,
                        kind: RolloutKind::Rollout,
                        seed: None,
                    }),
                },
                track_events: true,
            });
            flag
        }

        let preprocessed_store = MemoryStore::new();
        preprocessed_store.upsert_flag(build_flag(), LoadOptions::default());
        let on_demand_store = MemoryStore::new();
        on_demand_store.upsert_flag(
            build_flag(),
            LoadOptions {
                disable_preprocessing: true,
            },
        );

        let preprocessed_eval = Evaluator::new(&preprocessed_store, &preprocessed_store);
        let on_demand_eval = Evaluator::new(&on_demand_store, &on_demand_store);

        for (key, user) in [
            ("rule-match", User::new("u1").with_attribute("country", "US")),
            ("fallthrough", User::new("u2").with_attribute("country", "FR")),
        ] {
            let a = preprocessed_eval.evaluate("f1", Some(&user)).unwrap();
            let b = on_demand_eval.evaluate("f1", Some(&user)).unwrap();
            assert_eq!(*a, *b, "mismatch for {key}");
        }
    }

    /// Property 8: repeated evaluations that land on the same interned
    /// branch of a preprocessed flag must return reference-equal results.
    #[test]
    fn preprocessed_fixed_results_are_interned() {
        let store = MemoryStore::new();
        let mut flag = FlagBuilder::new("f1").off().off_variation(0).build();
        flag.rules.push(crate::models::Rule {
            id: "rule-1".into(),
            clauses: vec![Clause {
                attribute: UserAttribute::Key,
                op: Operator::In,
                values: vec![json!("u1")],
                negate: false,
                aux: None,
            }],
            variation_or_rollout: VariationOrRollout {
                variation: Some(1),
                rollout: None,
            },
            track_events: false,
        });
        store.upsert_flag(flag, LoadOptions::default());
        let eval = Evaluator::new(&store, &store);

        let off_a = eval.evaluate("f1", Some(&User::new("u1"))).unwrap();
        let off_b = eval.evaluate("f1", Some(&User::new("u2"))).unwrap();
        assert!(Arc::ptr_eq(&off_a, &off_b));

        let mut on_flag = FlagBuilder::new("f2").on().build();
        on_flag.rules.push(crate::models::Rule {
            id: "rule-1".into(),
            clauses: vec![Clause {
                attribute: UserAttribute::Key,
                op: Operator::In,
                values: vec![json!("u1")],
                negate: false,
                aux: None,
            }],
            variation_or_rollout: VariationOrRollout {
                variation: Some(1),
                rollout: None,
            },
            track_events: false,
        });
        store.upsert_flag(on_flag, LoadOptions::default());

        let rule_a = eval.evaluate("f2", Some(&User::new("u1"))).unwrap();
        let rule_b = eval.evaluate("f2", Some(&User::new("u1"))).unwrap();
        assert!(Arc::ptr_eq(&rule_a, &rule_b));
    }
}
