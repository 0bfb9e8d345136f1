//! Segment membership resolution (component C3/C8).
//!
//! A `SegmentEvalContext` borrows the flag/segment store for the duration of
//! one `evaluate` call. It tracks which segment keys are already on the call
//! stack (cycle guard for `segmentMatch` clauses that reference segments
//! referencing segments) and the worst big-segment store status observed, so
//! it can be folded into the final `Reason`.

use crate::clause;
use crate::models::Segment;
use crate::reason::BigSegmentsStatus;
use crate::user::User;
use std::collections::{HashMap, HashSet};

pub trait SegmentLookup {
    fn segment(&self, key: &str) -> Option<Segment>;
}

/// Per-user-key membership record for one big segment generation: `true`
/// means explicitly included, `false` explicitly excluded. Absence of a key
/// means "fall through to the segment's own rules".
pub type BigSegmentMembership = HashMap<String, bool>;

pub enum BigSegmentMembershipResult {
    Healthy(Option<BigSegmentMembership>),
    Stale(Option<BigSegmentMembership>),
    StoreError,
}

pub trait BigSegmentStore {
    fn get_membership(&self, user_key: &str) -> BigSegmentMembershipResult;
}

pub struct SegmentEvalContext<'a> {
    store: &'a dyn SegmentLookup,
    big_segment_store: Option<&'a dyn BigSegmentStore>,
    visiting: HashSet<String>,
    big_segments_status: Option<BigSegmentsStatus>,
    big_segment_memberships: HashMap<String, Option<BigSegmentMembership>>,
}

impl<'a> SegmentEvalContext<'a> {
    pub fn new(
        store: &'a dyn SegmentLookup,
        big_segment_store: Option<&'a dyn BigSegmentStore>,
    ) -> Self {
        Self {
            store,
            big_segment_store,
            visiting: HashSet::new(),
            big_segments_status: None,
            big_segment_memberships: HashMap::new(),
        }
    }

    pub fn big_segments_status(&self) -> Option<BigSegmentsStatus> {
        self.big_segments_status
    }

    fn note_status(&mut self, status: BigSegmentsStatus) {
        self.big_segments_status = Some(match self.big_segments_status {
            Some(existing) => existing.max(status),
            None => status,
        });
    }

    /// Resolve whether `user` is a member of the named segment. Returns
    /// `false` (never panics or infinitely recurses) if the segment is
    /// unknown or already being evaluated higher up the call stack.
    pub fn is_in_segment(&mut self, segment_key: &str, user: &User) -> bool {
        if !self.visiting.insert(segment_key.to_string()) {
            return false;
        }
        let result = match self.store.segment(segment_key) {
            Some(segment) => self.matches_segment(&segment, user),
            None => false,
        };
        self.visiting.remove(segment_key);
        result
    }

    fn matches_segment(&mut self, segment: &Segment, user: &User) -> bool {
        if segment.excluded.contains(&user.key) {
            return false;
        }
        if segment.included.contains(&user.key) {
            return true;
        }
        if segment.unbounded {
            return self.matches_unbounded_segment(segment, user);
        }
        self.matches_segment_rules(segment, user)
    }

    fn matches_unbounded_segment(&mut self, segment: &Segment, user: &User) -> bool {
        let generation = match segment.generation {
            Some(g) => g,
            None => {
                self.note_status(BigSegmentsStatus::NotConfigured);
                return false;
            }
        };
        let store = match self.big_segment_store {
            Some(store) => store,
            None => {
                self.note_status(BigSegmentsStatus::NotConfigured);
                return false;
            }
        };

        if !self.big_segment_memberships.contains_key(&user.key) {
            let (membership, status) = match store.get_membership(&user.key) {
                BigSegmentMembershipResult::Healthy(m) => (m, BigSegmentsStatus::Healthy),
                BigSegmentMembershipResult::Stale(m) => (m, BigSegmentsStatus::Stale),
                BigSegmentMembershipResult::StoreError => (None, BigSegmentsStatus::StoreError),
            };
            self.note_status(status);
            self.big_segment_memberships
                .insert(user.key.clone(), membership);
        }

        let membership_key = format!("{}.g{}", segment.key, generation);
        self.big_segment_memberships
            .get(&user.key)
            .and_then(|m| m.as_ref())
            .and_then(|m| m.get(&membership_key).copied())
            .unwrap_or(false)
    }

    fn matches_segment_rules(&mut self, segment: &Segment, user: &User) -> bool {
        for rule in &segment.rules {
            let mut matched = true;
            for c in &rule.clauses {
                if !clause::matches(c, user, self) {
                    matched = false;
                    break;
                }
            }
            if !matched {
                continue;
            }
            let weight_ok = match rule.weight {
                Some(weight) => {
                    let bucket = crate::bucketing::bucket(
                        user,
                        &segment.key,
                        &segment.salt,
                        &rule.bucket_by,
                        None,
                    );
                    bucket < (weight as f64 / 100_000.0)
                }
                None => true,
            };
            if weight_ok {
                return true;
            }
        }
        false
    }
}
