//! In-memory flag/segment storage and the load path that wires preprocessing
//! in.
//!
//! An `ArcSwap`-backed `MemoryStore` with two independently swappable maps,
//! one for flags and one for segments — the evaluator's two external read
//! dependencies.

use crate::models::{FeatureFlag, Segment};
use crate::preprocessor::{preprocess_flag, preprocess_segment};
use crate::segment::SegmentLookup;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

pub trait FlagLookup {
    fn flag(&self, key: &str) -> Option<FeatureFlag>;
}

/// Controls whether [`MemoryStore::upsert_flag`]/[`upsert_segment`] run the
/// interning pass immediately. Disabling it is for tests exercising the
/// evaluator's on-demand fallback path, which must behave identically.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    pub disable_preprocessing: bool,
}

pub struct MemoryStore {
    flags: ArcSwap<HashMap<String, Arc<FeatureFlag>>>,
    segments: ArcSwap<HashMap<String, Arc<Segment>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_flag(&self, mut flag: FeatureFlag, options: LoadOptions) {
        if !options.disable_preprocessing {
            preprocess_flag(&mut flag);
        }
        let mut flags = self.flags.load().as_ref().clone();
        flags.insert(flag.key.clone(), Arc::new(flag));
        self.flags.store(Arc::new(flags));
    }

    pub fn upsert_segment(&self, mut segment: Segment, options: LoadOptions) {
        if !options.disable_preprocessing {
            preprocess_segment(&mut segment);
        }
        let mut segments = self.segments.load().as_ref().clone();
        segments.insert(segment.key.clone(), Arc::new(segment));
        self.segments.store(Arc::new(segments));
    }

    pub fn remove_flag(&self, key: &str) {
        let mut flags = self.flags.load().as_ref().clone();
        flags.remove(key);
        self.flags.store(Arc::new(flags));
    }

    pub fn remove_segment(&self, key: &str) {
        let mut segments = self.segments.load().as_ref().clone();
        segments.remove(key);
        self.segments.store(Arc::new(segments));
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            flags: ArcSwap::new(Arc::new(HashMap::new())),
            segments: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }
}

impl FlagLookup for MemoryStore {
    fn flag(&self, key: &str) -> Option<FeatureFlag> {
        self.flags.load().get(key).map(|f| f.as_ref().clone())
    }
}

impl SegmentLookup for MemoryStore {
    fn segment(&self, key: &str) -> Option<Segment> {
        self.segments.load().get(key).map(|s| s.as_ref().clone())
    }
}

impl<T: FlagLookup> FlagLookup for Arc<T> {
    fn flag(&self, key: &str) -> Option<FeatureFlag> {
        self.as_ref().flag(key)
    }
}

impl<T: SegmentLookup> SegmentLookup for Arc<T> {
    fn segment(&self, key: &str) -> Option<Segment> {
        self.as_ref().segment(key)
    }
}
