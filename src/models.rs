//! Wire-format data model for flags and segments.
//!
//! These mirror the JSON shapes shared across every LaunchDarkly-style SDK.
//! Hand-written rather than generated from an OpenAPI document, since no
//! such document describes rules, clauses, rollouts or segments in enough
//! depth for this evaluator (see DESIGN.md).

use crate::preprocessor::{PreprocessedClause, PreprocessedFlag, PreprocessedSegment};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A JSON-typed flag variation value. Kept as `serde_json::Value` since
/// variations are opaque to the evaluator (it only ever returns one by
/// index or compares it for `in`/equality operators).
pub type Value = serde_json::Value;

/// A user (or custom) attribute referenced by a clause, `bucketBy`, or the
/// rollout's `bucketBy`. `Key` and `Secondary` get dedicated enum variants
/// because bucketing and segment rules special-case them; everything else
/// is a named custom attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UserAttribute {
    Key,
    Secondary,
    Custom(String),
}

impl UserAttribute {
    pub fn name(&self) -> &str {
        match self {
            UserAttribute::Key => "key",
            UserAttribute::Secondary => "secondary",
            UserAttribute::Custom(name) => name,
        }
    }
}

impl From<&str> for UserAttribute {
    fn from(value: &str) -> Self {
        match value {
            "key" => UserAttribute::Key,
            "secondary" => UserAttribute::Secondary,
            other => UserAttribute::Custom(other.to_owned()),
        }
    }
}

impl From<String> for UserAttribute {
    fn from(value: String) -> Self {
        UserAttribute::from(value.as_str())
    }
}

impl Serialize for UserAttribute {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for UserAttribute {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(UserAttribute::from(raw))
    }
}

fn default_bucket_by() -> UserAttribute {
    UserAttribute::Key
}

/// Operators supported by a [`Clause`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "in")]
    In,
    #[serde(rename = "startsWith")]
    StartsWith,
    #[serde(rename = "endsWith")]
    EndsWith,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "matches")]
    Matches,
    #[serde(rename = "lessThan")]
    LessThan,
    #[serde(rename = "lessThanOrEqual")]
    LessThanOrEqual,
    #[serde(rename = "greaterThan")]
    GreaterThan,
    #[serde(rename = "greaterThanOrEqual")]
    GreaterThanOrEqual,
    #[serde(rename = "before")]
    Before,
    #[serde(rename = "after")]
    After,
    #[serde(rename = "semVerEqual")]
    SemVerEqual,
    #[serde(rename = "semVerLessThan")]
    SemVerLessThan,
    #[serde(rename = "semVerGreaterThan")]
    SemVerGreaterThan,
    #[serde(rename = "segmentMatch")]
    SegmentMatch,
}

/// A weighted variation inside a [`Rollout`]. `weight` is parts-per-million
/// (0..=100000).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedVariation {
    pub variation: usize,
    pub weight: i64,
    #[serde(default)]
    pub untracked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RolloutKind {
    Rollout,
    Experiment,
}

impl Default for RolloutKind {
    fn default() -> Self {
        RolloutKind::Rollout
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    pub variations: Vec<WeightedVariation>,
    #[serde(default = "default_bucket_by")]
    pub bucket_by: UserAttribute,
    #[serde(default)]
    pub kind: RolloutKind,
    #[serde(default)]
    pub seed: Option<i64>,
}

/// Either a fixed `variation` or a `rollout` — exactly one must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariationOrRollout {
    #[serde(default)]
    pub variation: Option<usize>,
    #[serde(default)]
    pub rollout: Option<Rollout>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prerequisite {
    pub key: String,
    pub variation: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub values: HashSet<String>,
    pub variation: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clause {
    pub attribute: UserAttribute,
    pub op: Operator,
    pub values: Vec<Value>,
    #[serde(default)]
    pub negate: bool,

    /// Populated by [`crate::preprocessor::preprocess_clause`]; `None` when
    /// preprocessing was disabled, in which case the clause matcher builds
    /// the same data on demand, by value.
    #[serde(skip)]
    pub(crate) aux: Option<PreprocessedClause>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    pub clauses: Vec<Clause>,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
    #[serde(default)]
    pub track_events: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub key: String,
    #[serde(default)]
    pub version: u64,
    pub on: bool,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    pub fallthrough: VariationOrRollout,
    #[serde(default)]
    pub off_variation: Option<usize>,
    pub variations: Vec<Value>,
    #[serde(default, rename = "clientSide")]
    pub client_side: bool,
    #[serde(default, rename = "trackEvents")]
    pub track_events: bool,
    #[serde(default, rename = "trackEventsFallthrough")]
    pub track_events_fallthrough: bool,
    #[serde(default, rename = "debugEventsUntilDate")]
    pub debug_events_until_date: Option<i64>,
    #[serde(default)]
    pub deleted: bool,

    /// Populated by [`crate::preprocessor::preprocess_flag`] right after
    /// deserialization; `None` when preprocessing was disabled for this
    /// load
    #[serde(skip)]
    pub(crate) preprocessed: Option<PreprocessedFlag>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRule {
    pub clauses: Vec<Clause>,
    #[serde(default)]
    pub weight: Option<i64>,
    #[serde(default = "default_bucket_by")]
    pub bucket_by: UserAttribute,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub key: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub included: HashSet<String>,
    #[serde(default)]
    pub excluded: HashSet<String>,
    #[serde(default)]
    pub rules: Vec<SegmentRule>,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub unbounded: bool,
    #[serde(default)]
    pub generation: Option<i64>,

    #[serde(skip)]
    pub(crate) preprocessed: Option<PreprocessedSegment>,
}
