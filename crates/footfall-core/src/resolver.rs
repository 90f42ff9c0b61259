//! Identity resolution: fused vector × stored population → match decision.

use crate::config::ConfigError;
use crate::types::{FeatureVector, Identity};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// A match requires similarity strictly above this value.
    pub similarity_threshold: f32,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.45,
        }
    }
}

impl MatchConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::invalid(
                "matching.similarity_threshold",
                "must be within [-1, 1]",
            ));
        }
        Ok(())
    }
}

/// Strategy for finding the closest stored identity to a probe vector.
pub trait Matcher {
    /// Index and similarity of the best candidate, `None` for an empty population.
    fn best_match(&self, probe: &FeatureVector, population: &[Identity]) -> Option<(usize, f32)>;
}

/// Cosine similarity over the whole population.
///
/// Always visits every entry: any stored identity may be the best match, so
/// there is no early exit. Ties keep the first-encountered entry.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match(&self, probe: &FeatureVector, population: &[Identity]) -> Option<(usize, f32)> {
        let mut best: Option<(usize, f32)> = None;
        for (i, identity) in population.iter().enumerate() {
            let sim = probe.similarity(&identity.embedding);
            match best {
                Some((_, best_sim)) if sim <= best_sim => {}
                _ => best = Some((i, sim)),
            }
        }
        best
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolution {
    /// `index` points into the population slice that was resolved against.
    Returning { index: usize, similarity: f32 },
    New { best_similarity: Option<f32> },
}

pub struct IdentityResolver<M: Matcher = CosineMatcher> {
    matcher: M,
    threshold: f32,
}

impl IdentityResolver<CosineMatcher> {
    pub fn new(config: &MatchConfig) -> Self {
        Self::with_matcher(CosineMatcher, config)
    }
}

impl<M: Matcher> IdentityResolver<M> {
    pub fn with_matcher(matcher: M, config: &MatchConfig) -> Self {
        Self {
            matcher,
            threshold: config.similarity_threshold,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn resolve(&self, probe: &FeatureVector, population: &[Identity]) -> Resolution {
        match self.matcher.best_match(probe, population) {
            Some((index, similarity)) if similarity > self.threshold => {
                Resolution::Returning { index, similarity }
            }
            best => Resolution::New {
                best_similarity: best.map(|(_, sim)| sim),
            },
        }
    }
}
