//! Interns immutable evaluation artifacts for steady-state allocation-free
//! evaluation.
//!
//! Run once per inbound flag/segment, immediately after deserialization.
//! Every artifact built here has an equivalent on-demand builder the
//! evaluator falls back to when preprocessing was disabled, so `evaluate`
//! behaves identically either way — just with reference-equal results in
//! the preprocessed case.

use crate::models::{Clause, FeatureFlag, Operator, Segment};
use crate::operators::{parse_date_value, parse_semver_lenient};
use crate::reason::{ErrorKind, EvalResult, Reason};
use chrono::{DateTime, Utc};
use regex::Regex;
use semver::Version;
use std::collections::HashSet;
use std::sync::Arc;

/// Preprocessed auxiliary data for a single clause value, matching the
/// operator that will consume it. `None` inside a variant means parsing
/// failed for that value (it will simply never match, not panic).
#[derive(Debug, Clone)]
pub enum ClauseValueAux {
    None,
    Regex(Option<Arc<Regex>>),
    Date(Option<DateTime<Utc>>),
    SemVer(Option<Version>),
}

/// Preprocessed form of a [`Clause`]: a fast lookup set for `in`, plus
/// per-value auxiliary data for the other typed operators.
#[derive(Debug, Clone, Default)]
pub struct PreprocessedClause {
    pub in_set: Option<HashSet<String>>,
    pub per_value: Vec<ClauseValueAux>,
}

fn canonical_key(value: &serde_json::Value) -> String {
    // Values compared with `in` are scalars in practice; a plain JSON
    // serialization is a stable, cheap canonical key for them.
    serde_json::to_string(value).unwrap_or_default()
}

pub fn preprocess_clause(clause: &Clause) -> PreprocessedClause {
    let in_set = if clause.op == Operator::In {
        Some(clause.values.iter().map(canonical_key).collect())
    } else {
        None
    };

    let per_value = clause
        .values
        .iter()
        .map(|v| match clause.op {
            Operator::Matches => ClauseValueAux::Regex(
                v.as_str()
                    .and_then(|s| Regex::new(s).ok())
                    .map(Arc::new),
            ),
            Operator::Before | Operator::After => ClauseValueAux::Date(parse_date_value(v)),
            Operator::SemVerEqual | Operator::SemVerLessThan | Operator::SemVerGreaterThan => {
                ClauseValueAux::SemVer(v.as_str().and_then(parse_semver_lenient))
            }
            _ => ClauseValueAux::None,
        })
        .collect();

    PreprocessedClause { in_set, per_value }
}

/// Per-flag interned artifacts.
#[derive(Debug, Clone)]
pub struct PreprocessedFlag {
    pub off_result: Arc<EvalResult>,
    /// Parallel to `FeatureFlag::targets`.
    pub target_results: Vec<Arc<EvalResult>>,
    /// Parallel to `FeatureFlag::rules`: the `RuleMatch` reason (shared
    /// regardless of whether the rule resolves a fixed variation or a
    /// rollout, since the rollout-selected variation is only known at
    /// evaluation time).
    pub rule_reasons: Vec<Arc<Reason>>,
    /// Parallel to `FeatureFlag::rules`: `Some` only for rules with a fixed
    /// `variation` (not a rollout), where the whole `EvalResult` can be
    /// interned up front.
    pub rule_fixed_results: Vec<Option<Arc<EvalResult>>>,
    /// Parallel to `FeatureFlag::prerequisites`.
    pub prereq_failed_results: Vec<Arc<EvalResult>>,
    pub fallthrough_reason: Arc<Reason>,
    /// `Some` only when the fallthrough has a fixed `variation`.
    pub fallthrough_fixed_result: Option<Arc<EvalResult>>,
}

fn result_for_variation(
    variations: &[serde_json::Value],
    variation: usize,
    reason: Reason,
) -> Option<EvalResult> {
    variations
        .get(variation)
        .map(|v| EvalResult::new(Some(v.clone()), Some(variation), reason))
}

/// Resolve a flag's `offVariation` under an arbitrary reason. Shared by the
/// real OFF result and by prerequisite-failed results, which resolve the
/// same owning flag's off variation, just tagged with a different reason.
fn off_variation_result(variations: &[serde_json::Value], off_variation: Option<usize>, reason: Reason) -> EvalResult {
    match off_variation {
        Some(v) => result_for_variation(variations, v, reason)
            .unwrap_or_else(|| EvalResult::error(ErrorKind::MalformedFlag)),
        None => EvalResult::new(None, None, reason),
    }
}

/// Populate `flag.preprocessed` and every clause's `aux` field. Mutates the
/// flag in place — flags are built once at load time and then shared
/// read-only, so this only needs to run once per flag version.
pub fn preprocess_flag(flag: &mut FeatureFlag) {
    let off_result = off_variation_result(&flag.variations, flag.off_variation, Reason::off()).shared();

    let target_results = flag
        .targets
        .iter()
        .map(|t| {
            result_for_variation(&flag.variations, t.variation, Reason::target_match())
                .unwrap_or_else(|| EvalResult::error(ErrorKind::MalformedFlag))
                .shared()
        })
        .collect();

    let mut rule_reasons = Vec::with_capacity(flag.rules.len());
    let mut rule_fixed_results = Vec::with_capacity(flag.rules.len());
    for (i, rule) in flag.rules.iter_mut().enumerate() {
        let reason = Arc::new(Reason::rule_match(i, rule.id.clone(), false));
        rule_reasons.push(reason.clone());
        let fixed = rule.variation_or_rollout.variation.map(|v| {
            result_for_variation(&flag.variations, v, (*reason).clone())
                .unwrap_or_else(|| EvalResult::error(ErrorKind::MalformedFlag))
                .with_force_tracking(rule.track_events)
                .shared()
        });
        rule_fixed_results.push(fixed);
        for clause in rule.clauses.iter_mut() {
            clause.aux = Some(preprocess_clause(clause));
        }
    }

    let prereq_failed_results = flag
        .prerequisites
        .iter()
        .map(|p| {
            off_variation_result(
                &flag.variations,
                flag.off_variation,
                Reason::prerequisite_failed(p.key.clone()),
            )
            .shared()
        })
        .collect();

    let fallthrough_reason = Arc::new(Reason::fallthrough(false));
    let fallthrough_fixed_result = flag.fallthrough.variation.map(|v| {
        result_for_variation(&flag.variations, v, (*fallthrough_reason).clone())
            .unwrap_or_else(|| EvalResult::error(ErrorKind::MalformedFlag))
            .with_force_tracking(flag.track_events_fallthrough)
            .shared()
    });

    flag.preprocessed = Some(PreprocessedFlag {
        off_result,
        target_results,
        rule_reasons,
        rule_fixed_results,
        prereq_failed_results,
        fallthrough_reason,
        fallthrough_fixed_result,
    });
}

/// Per-segment interned artifacts. Segments only carry clause-level
/// preprocessing (the clauses inside `SegmentRule`), since a segment never
/// produces an `EvalResult` of its own — it only yields a bool.
#[derive(Debug, Clone, Default)]
pub struct PreprocessedSegment {
    _private: (),
}

pub fn preprocess_segment(segment: &mut Segment) {
    for rule in segment.rules.iter_mut() {
        for clause in rule.clauses.iter_mut() {
            clause.aux = Some(preprocess_clause(clause));
        }
    }
    segment.preprocessed = Some(PreprocessedSegment::default());
}
