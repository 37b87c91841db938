use crate::pattern::{Matcher, PathPattern};
use std::sync::Arc;

/// Immutable snapshot of every whitelisted pattern from every source.
///
/// A ruleset is never modified after it is built; the synchronizer replaces
/// the published one wholesale.
#[derive(Debug, Default)]
pub struct Ruleset {
    patterns: Vec<Arc<PathPattern>>,
    generation: u64,
}

impl Ruleset {
    /// An empty ruleset: nothing bypasses authentication
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn new(mut patterns: Vec<Arc<PathPattern>>, generation: u64) -> Self {
        patterns.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        patterns.dedup_by(|a, b| a.as_str() == b.as_str());
        Self { patterns, generation }
    }

    /// First pattern covering `path`, if any
    pub fn find_match(&self, path: &str) -> Option<&PathPattern> {
        self.patterns
            .iter()
            .map(|pattern| &**pattern)
            .find(|pattern| pattern.matches(path))
    }

    /// Publication counter; strictly increases with every merge
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Specifications in this snapshot, sorted
    pub fn specifications(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|pattern| pattern.as_str())
    }
}

impl Matcher for Ruleset {
    fn matches(&self, path: &str) -> bool {
        self.find_match(path).is_some()
    }
}
