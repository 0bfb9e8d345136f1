//! Builders and fakes used only by `#[cfg(test)]` modules throughout the
//! crate: a single shared `test_utils` module rather than per-file
//! fixtures.

use crate::models::{FeatureFlag, Segment, SegmentRule, Value, VariationOrRollout};
use crate::segment::{BigSegmentMembership, BigSegmentMembershipResult, BigSegmentStore};
use serde_json::json;
use std::cell::Cell;
use std::collections::{HashMap, HashSet};

pub struct FlagBuilder(FeatureFlag);

impl FlagBuilder {
    pub fn new<K: Into<String>>(key: K) -> Self {
        Self(FeatureFlag {
            key: key.into(),
            version: 1,
            on: true,
            prerequisites: Vec::new(),
            salt: "test-salt".into(),
            targets: Vec::new(),
            rules: Vec::new(),
            fallthrough: VariationOrRollout {
                variation: Some(0),
                rollout: None,
            },
            off_variation: Some(0),
            variations: vec![json!(false), json!(true)],
            client_side: false,
            track_events: false,
            track_events_fallthrough: false,
            debug_events_until_date: None,
            deleted: false,
            preprocessed: None,
        })
    }

    pub fn on(mut self) -> Self {
        self.0.on = true;
        self
    }

    pub fn off(mut self) -> Self {
        self.0.on = false;
        self
    }

    pub fn off_variation(mut self, variation: usize) -> Self {
        self.0.off_variation = Some(variation);
        self
    }

    pub fn with_variations<I: IntoIterator<Item = V>, V: Into<Value>>(mut self, iter: I) -> Self {
        self.0.variations = iter.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fallthrough_variation(mut self, variation: usize) -> Self {
        self.0.fallthrough = VariationOrRollout {
            variation: Some(variation),
            rollout: None,
        };
        self
    }

    pub fn build(self) -> FeatureFlag {
        self.0
    }
}

pub struct SegmentBuilder(Segment);

impl SegmentBuilder {
    pub fn new<K: Into<String>>(key: K) -> Self {
        Self(Segment {
            key: key.into(),
            version: 1,
            included: HashSet::new(),
            excluded: HashSet::new(),
            rules: Vec::new(),
            salt: "test-salt".into(),
            unbounded: false,
            generation: None,
            preprocessed: None,
        })
    }

    pub fn include<K: Into<String>>(mut self, key: K) -> Self {
        self.0.included.insert(key.into());
        self
    }

    pub fn exclude<K: Into<String>>(mut self, key: K) -> Self {
        self.0.excluded.insert(key.into());
        self
    }

    pub fn unbounded(mut self, generation: i64) -> Self {
        self.0.unbounded = true;
        self.0.generation = Some(generation);
        self
    }

    pub fn add_rule(mut self, rule: SegmentRule) -> Self {
        self.0.rules.push(rule);
        self
    }

    pub fn build(self) -> Segment {
        self.0
    }
}

enum MockStatus {
    Healthy,
    Stale,
    Error,
}

/// A big segment store fake: holds membership records keyed by user, and a
/// switch for simulating a stale or unreachable store.
pub struct MockBigSegmentStore {
    memberships: HashMap<String, BigSegmentMembership>,
    status: MockStatus,
    calls: Cell<usize>,
}

impl MockBigSegmentStore {
    pub fn new() -> Self {
        Self {
            memberships: HashMap::new(),
            status: MockStatus::Healthy,
            calls: Cell::new(0),
        }
    }

    pub fn set_membership<K: Into<String>>(&mut self, user_key: K, membership: BigSegmentMembership) {
        self.memberships.insert(user_key.into(), membership);
    }

    pub fn set_stale(&mut self) {
        self.status = MockStatus::Stale;
    }

    pub fn set_error(&mut self) {
        self.status = MockStatus::Error;
    }

    pub fn call_count(&self) -> usize {
        self.calls.get()
    }
}

impl BigSegmentStore for MockBigSegmentStore {
    fn get_membership(&self, user_key: &str) -> BigSegmentMembershipResult {
        self.calls.set(self.calls.get() + 1);
        let membership = self.memberships.get(user_key).cloned();
        match self.status {
            MockStatus::Healthy => BigSegmentMembershipResult::Healthy(membership),
            MockStatus::Stale => BigSegmentMembershipResult::Stale(membership),
            MockStatus::Error => BigSegmentMembershipResult::StoreError,
        }
    }
}
