//! Single (attribute, operator, value) predicate evaluation.
//!
//! Operators are a tagged enum dispatched with `match`, not a trait
//! hierarchy. A type-mismatched or missing input is never an error here —
//! it simply doesn't match, the same posture the rest of the evaluator
//! takes toward absent prerequisites/targets: "does not apply" rather than
//! a hard failure.

use crate::models::{Operator, Value};
use crate::preprocessor::ClauseValueAux;
use chrono::{DateTime, Utc};
use semver::Version;

/// Evaluate `attribute_value op clause_value`, using preprocessed auxiliary
/// data (compiled regex / parsed date / parsed semver) when available so the
/// hot path never reparses.
pub fn apply(
    op: Operator,
    attribute_value: &Value,
    clause_value: &Value,
    aux: Option<&ClauseValueAux>,
) -> bool {
    match op {
        Operator::In => values_equal(attribute_value, clause_value),
        Operator::StartsWith => string_op(attribute_value, clause_value, |a, b| a.starts_with(b)),
        Operator::EndsWith => string_op(attribute_value, clause_value, |a, b| a.ends_with(b)),
        Operator::Contains => string_op(attribute_value, clause_value, |a, b| a.contains(b)),
        Operator::Matches => match_regex(attribute_value, clause_value, aux),
        Operator::LessThan => numeric_op(attribute_value, clause_value, |a, b| a < b),
        Operator::LessThanOrEqual => numeric_op(attribute_value, clause_value, |a, b| a <= b),
        Operator::GreaterThan => numeric_op(attribute_value, clause_value, |a, b| a > b),
        Operator::GreaterThanOrEqual => numeric_op(attribute_value, clause_value, |a, b| a >= b),
        Operator::Before => date_op(attribute_value, clause_value, aux, |a, b| a < b),
        Operator::After => date_op(attribute_value, clause_value, aux, |a, b| a > b),
        Operator::SemVerEqual => semver_op(attribute_value, clause_value, aux, |a, b| a == b),
        Operator::SemVerLessThan => semver_op(attribute_value, clause_value, aux, |a, b| a < b),
        Operator::SemVerGreaterThan => semver_op(attribute_value, clause_value, aux, |a, b| a > b),
        // segmentMatch is resolved by `clause::matches`, which never calls into
        // this dispatcher for that operator (its "values" are segment keys,
        // not operator operands).
        Operator::SegmentMatch => false,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    a == b
}

fn string_op(a: &Value, b: &Value, f: impl Fn(&str, &str) -> bool) -> bool {
    match (a.as_str(), b.as_str()) {
        (Some(a), Some(b)) => f(a, b),
        _ => false,
    }
}

fn numeric_op(a: &Value, b: &Value, f: impl Fn(f64, f64) -> bool) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => f(a, b),
        _ => false,
    }
}

fn match_regex(attribute_value: &Value, clause_value: &Value, aux: Option<&ClauseValueAux>) -> bool {
    let attr = match attribute_value.as_str() {
        Some(s) => s,
        None => return false,
    };
    if let Some(ClauseValueAux::Regex(Some(re))) = aux {
        return re.is_match(attr);
    }
    let pattern = match clause_value.as_str() {
        Some(s) => s,
        None => return false,
    };
    match regex::Regex::new(pattern) {
        Ok(re) => re.is_match(attr),
        Err(_) => false,
    }
}

fn date_op(
    attribute_value: &Value,
    clause_value: &Value,
    aux: Option<&ClauseValueAux>,
    f: impl Fn(DateTime<Utc>, DateTime<Utc>) -> bool,
) -> bool {
    let attr_date = match parse_date_value(attribute_value) {
        Some(d) => d,
        None => return false,
    };
    let clause_date = if let Some(ClauseValueAux::Date(Some(d))) = aux {
        *d
    } else {
        match parse_date_value(clause_value) {
            Some(d) => d,
            None => return false,
        }
    };
    f(attr_date, clause_date)
}

/// Dates may be given as an epoch-millisecond number or an RFC3339 string.
pub fn parse_date_value(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(ms) = value.as_i64() {
        return DateTime::from_timestamp_millis(ms);
    }
    if let Some(s) = value.as_str() {
        return DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc));
    }
    None
}

fn semver_op(
    attribute_value: &Value,
    clause_value: &Value,
    aux: Option<&ClauseValueAux>,
    f: impl Fn(&Version, &Version) -> bool,
) -> bool {
    let attr_version = match attribute_value.as_str().and_then(parse_semver_lenient) {
        Some(v) => v,
        None => return false,
    };
    let clause_version = if let Some(ClauseValueAux::SemVer(Some(v))) = aux {
        v.clone()
    } else {
        match clause_value.as_str().and_then(parse_semver_lenient) {
            Some(v) => v,
            None => return false,
        }
    };
    f(&attr_version, &clause_version)
}

/// Semver with tolerance for shortened forms: `"1"` → `1.0.0`, `"1.2"` →
/// `1.2.0`.
pub fn parse_semver_lenient(raw: &str) -> Option<Version> {
    if let Ok(v) = Version::parse(raw) {
        return Some(v);
    }
    let parts: Vec<&str> = raw.split('.').collect();
    let padded = match parts.len() {
        1 => format!("{}.0.0", parts[0]),
        2 => format!("{}.{}.0", parts[0], parts[1]),
        _ => return None,
    };
    Version::parse(&padded).ok()
}
