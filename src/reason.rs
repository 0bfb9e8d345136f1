//! Immutable result/reason value objects.
//!
//! `EvalResult` equality is always structural (`#[derive(PartialEq)]`);
//! preprocessing additionally gives reference equality for results built
//! from the same rule/target/prerequisite branch, modeled here with `Arc`
//! so callers can check `Arc::ptr_eq`.

use crate::models::Value;
use std::sync::Arc;

/// Per-evaluation worst big-segment availability status seen. Declaration
/// order is the normative ordering: `Healthy < Stale < StoreError <
/// NotConfigured`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BigSegmentsStatus {
    Healthy,
    Stale,
    StoreError,
    NotConfigured,
}

/// Error categories an evaluation result itself can carry. A missing flag
/// is reported separately by [`crate::evaluator::Error`] since there is no
/// flag to attach a result to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UserNotSpecified,
    MalformedFlag,
    Exception,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReasonKind {
    Off,
    Fallthrough,
    TargetMatch,
    RuleMatch { rule_index: usize, rule_id: String },
    PrerequisiteFailed { prerequisite_key: String },
    Error(ErrorKind),
}

/// A tagged description of why an evaluation produced its result.
///
/// `in_experiment` and `big_segments_status` are orthogonal to the tag and
/// can be attached to any variant that resulted from a rollout
/// (`Fallthrough`/`RuleMatch`) or touched a segment lookup, respectively.
#[derive(Debug, Clone, PartialEq)]
pub struct Reason {
    pub kind: ReasonKind,
    pub in_experiment: bool,
    pub big_segments_status: Option<BigSegmentsStatus>,
}

impl Reason {
    pub fn off() -> Self {
        Self::plain(ReasonKind::Off)
    }

    pub fn fallthrough(in_experiment: bool) -> Self {
        Self {
            kind: ReasonKind::Fallthrough,
            in_experiment,
            big_segments_status: None,
        }
    }

    pub fn target_match() -> Self {
        Self::plain(ReasonKind::TargetMatch)
    }

    pub fn rule_match(rule_index: usize, rule_id: impl Into<String>, in_experiment: bool) -> Self {
        Self {
            kind: ReasonKind::RuleMatch {
                rule_index,
                rule_id: rule_id.into(),
            },
            in_experiment,
            big_segments_status: None,
        }
    }

    pub fn prerequisite_failed(prerequisite_key: impl Into<String>) -> Self {
        Self::plain(ReasonKind::PrerequisiteFailed {
            prerequisite_key: prerequisite_key.into(),
        })
    }

    pub fn error(kind: ErrorKind) -> Self {
        Self::plain(ReasonKind::Error(kind))
    }

    fn plain(kind: ReasonKind) -> Self {
        Self {
            kind,
            in_experiment: false,
            big_segments_status: None,
        }
    }

    pub fn with_big_segments_status(mut self, status: Option<BigSegmentsStatus>) -> Self {
        self.big_segments_status = status;
        self
    }
}

/// The immutable outcome of one `evaluate` call.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalResult {
    pub value: Option<Value>,
    /// `None` represents the wire format's `-1` ("no variation").
    pub variation_index: Option<usize>,
    pub reason: Reason,
    pub force_reason_tracking: bool,
}

impl EvalResult {
    pub fn new(value: Option<Value>, variation_index: Option<usize>, reason: Reason) -> Self {
        Self {
            value,
            variation_index,
            reason,
            force_reason_tracking: false,
        }
    }

    pub fn with_force_tracking(mut self, force: bool) -> Self {
        self.force_reason_tracking = force;
        self
    }

    pub fn error(kind: ErrorKind) -> Self {
        Self::new(None, None, Reason::error(kind))
    }

    pub fn shared(self) -> Arc<EvalResult> {
        Arc::new(self)
    }
}
