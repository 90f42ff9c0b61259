//! Feature fusion: best-scored frames → one representative feature vector.

use crate::capture::ClosedSession;
use crate::config::ConfigError;
use crate::quality::MAX_SCORE;
use crate::types::{FeatureVector, Provenance, EMBEDDING_DIM};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Successful extractor response for one face region.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub vector: FeatureVector,
    /// The extractor's own detection confidence for this attempt.
    pub confidence: f32,
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("no face found in region")]
    NoFace,
    #[error("extraction failed: {0}")]
    Failed(String),
}

/// Opaque face feature extractor (e.g. an ArcFace model behind ONNX Runtime).
pub trait Extractor<H> {
    fn extract(&mut self, region: &H) -> Result<Extraction, ExtractError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Frames scoring below this never reach the extractor.
    pub min_quality: f32,
    /// How many of the best frames to extract from.
    pub top_n: usize,
    /// Weight exponent `p` in `score^p`, `0 < p < 1`.
    pub damping: f32,
    /// Extraction attempts below this confidence are discarded.
    pub extractor_floor: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            min_quality: 350.0,
            top_n: 3,
            damping: 0.3,
            extractor_floor: 0.70,
        }
    }
}

impl FusionConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=MAX_SCORE).contains(&self.min_quality) {
            return Err(ConfigError::invalid("fusion.min_quality", "must be within 0–1000"));
        }
        if self.top_n == 0 {
            return Err(ConfigError::invalid("fusion.top_n", "must be at least 1"));
        }
        if !(self.damping > 0.0 && self.damping < 1.0) {
            return Err(ConfigError::invalid("fusion.damping", "must be within (0, 1)"));
        }
        if !(0.0..=1.0).contains(&self.extractor_floor) {
            return Err(ConfigError::invalid("fusion.extractor_floor", "must be within 0–1"));
        }
        Ok(())
    }
}

/// Why a session produced no vector. Both are skips, not failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FusionError {
    #[error("no usable frame ({retained} retained, none at or above minimum quality)")]
    NoUsableFrame { retained: usize },
    #[error("extractor produced no usable vector for {attempted} selected frames")]
    ExtractionUnavailable { attempted: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Contributor {
    pub sequence: u64,
    pub score: f32,
    pub weight: f32,
    pub extractor_confidence: f32,
}

#[derive(Debug, Clone)]
pub struct FusedVector {
    pub vector: FeatureVector,
    pub contributors: Vec<Contributor>,
}

/// Fuse a closed session into one unit-norm vector.
///
/// Frames below `min_quality` are dropped, the `top_n` best are sent to the
/// extractor, low-confidence extractions are discarded, and the survivors are
/// averaged with weights `score^damping` before re-normalizing.
pub fn fuse<H, E>(
    session: ClosedSession<H>,
    extractor: &mut E,
    config: &FusionConfig,
) -> Result<FusedVector, FusionError>
where
    E: Extractor<H> + ?Sized,
{
    let retained = session.frames.len();
    let mut candidates: Vec<_> = session
        .frames
        .into_iter()
        .filter(|f| f.score() >= config.min_quality)
        .collect();
    if candidates.is_empty() {
        return Err(FusionError::NoUsableFrame { retained });
    }

    // Stable: equal scores keep capture order.
    candidates.sort_by(|a, b| b.score().total_cmp(&a.score()));
    candidates.truncate(config.top_n);
    let attempted = candidates.len();

    let mut sum = vec![0.0f32; EMBEDDING_DIM];
    let mut total_weight = 0.0f32;
    let mut contributors = Vec::with_capacity(attempted);

    for obs in &candidates {
        let extraction = match extractor.extract(&obs.region) {
            Ok(extraction) => extraction,
            Err(err) => {
                tracing::debug!(sequence = obs.sequence, score = obs.score(), error = %err, "extraction failed; frame discarded");
                continue;
            }
        };
        if extraction.confidence < config.extractor_floor {
            tracing::debug!(
                sequence = obs.sequence,
                score = obs.score(),
                confidence = extraction.confidence,
                floor = config.extractor_floor,
                "extractor confidence below floor; frame discarded"
            );
            continue;
        }

        let weight = obs.score().powf(config.damping);
        for (acc, v) in sum.iter_mut().zip(extraction.vector.values()) {
            *acc += weight * v;
        }
        total_weight += weight;
        contributors.push(Contributor {
            sequence: obs.sequence,
            score: obs.score(),
            weight,
            extractor_confidence: extraction.confidence,
        });
    }

    if contributors.is_empty() || total_weight <= 0.0 {
        return Err(FusionError::ExtractionUnavailable { attempted });
    }

    let mean: Vec<f32> = sum.into_iter().map(|v| v / total_weight).collect();
    let vector = FeatureVector::new(mean, Provenance::Fused)
        .map_err(|_| FusionError::ExtractionUnavailable { attempted })?;
    // Opposing per-frame vectors can cancel out entirely.
    if vector.norm() == 0.0 {
        return Err(FusionError::ExtractionUnavailable { attempted });
    }

    tracing::debug!(
        contributors = contributors.len(),
        attempted,
        best_score = contributors[0].score,
        "fused feature vector"
    );
    Ok(FusedVector {
        vector,
        contributors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CloseReason, FrameObservation};
    use crate::quality::{FrameMeasurements, QualityReport};
    use crate::types::tests::{basis, vector};
    use chrono::Utc;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Extractor returning canned results per region id and recording calls.
    struct FakeExtractor {
        results: HashMap<u32, (Vec<f32>, f32)>,
        calls: Vec<u32>,
    }

    impl FakeExtractor {
        fn new(results: impl IntoIterator<Item = (u32, (Vec<f32>, f32))>) -> Self {
            Self {
                results: results.into_iter().collect(),
                calls: Vec::new(),
            }
        }
    }

    impl Extractor<u32> for FakeExtractor {
        fn extract(&mut self, region: &u32) -> Result<Extraction, ExtractError> {
            self.calls.push(*region);
            let (values, confidence) = self.results.get(region).cloned().ok_or(ExtractError::NoFace)?;
            Ok(Extraction {
                vector: FeatureVector::new(values, Provenance::PerFrame).unwrap(),
                confidence,
            })
        }
    }

    /// Session whose frame `i` has region id `i` and the given score.
    fn session(scores: &[f32]) -> ClosedSession<u32> {
        let frames = scores
            .iter()
            .enumerate()
            .map(|(i, &total)| FrameObservation {
                region: i as u32,
                measurements: FrameMeasurements::default(),
                quality: QualityReport { total, factors: Vec::new() },
                sequence: (i as u64 + 1) * 3,
            })
            .collect();
        ClosedSession {
            frames,
            triggered_at: Utc::now(),
            elapsed: Duration::from_secs(5),
            ticks: scores.len() as u64 * 3,
            reason: CloseReason::Expired,
        }
    }

    fn config() -> FusionConfig {
        FusionConfig {
            min_quality: 350.0,
            top_n: 3,
            damping: 0.3,
            extractor_floor: 0.7,
        }
    }

    #[test]
    fn test_top_n_weighted_by_damped_score() {
        // Scores [200, 600, 900, 100, 750]: only 900, 750, 600 participate.
        let mut extractor = FakeExtractor::new((0..5).map(|i| (i, (basis(i as usize), 0.9))));
        let fused = fuse(session(&[200.0, 600.0, 900.0, 100.0, 750.0]), &mut extractor, &config()).unwrap();

        assert_eq!(extractor.calls, vec![2, 4, 1]);
        let scores: Vec<f32> = fused.contributors.iter().map(|c| c.score).collect();
        assert_eq!(scores, vec![900.0, 750.0, 600.0]);

        let w: Vec<f32> = [900.0f32, 750.0, 600.0].iter().map(|s| s.powf(0.3)).collect();
        let norm = w.iter().map(|x| x * x).sum::<f32>().sqrt();
        let v = fused.vector.values();
        assert!((v[2] - w[0] / norm).abs() < 1e-6);
        assert!((v[4] - w[1] / norm).abs() < 1e-6);
        assert!((v[1] - w[2] / norm).abs() < 1e-6);
        assert_eq!(v[0], 0.0);
        assert_eq!(v[3], 0.0);
        assert!((fused.vector.norm() - 1.0).abs() < 1e-5);
        assert_eq!(fused.vector.provenance(), Provenance::Fused);
    }

    #[test]
    fn test_identical_vectors_fuse_to_same_vector() {
        let mut raw = vec![0.0; EMBEDDING_DIM];
        raw[0] = 1.0;
        raw[10] = 2.0;
        raw[100] = -0.5;
        let expected = vector(raw.clone());

        let mut extractor = FakeExtractor::new((0..4).map(|i| (i, (raw.clone(), 0.99))));
        let fused = fuse(session(&[400.0, 999.0, 500.0, 700.0]), &mut extractor, &config()).unwrap();

        for (a, b) in fused.vector.values().iter().zip(expected.values()) {
            assert!((a - b).abs() < 1e-6);
        }
        assert!((fused.vector.similarity(&expected) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_fused_vector_is_unit_norm() {
        let vectors: Vec<Vec<f32>> = (0..3)
            .map(|k| (0..EMBEDDING_DIM).map(|i| ((i * (k + 2)) as f32 * 0.01).sin() * 5.0).collect())
            .collect();
        let mut extractor = FakeExtractor::new(vectors.into_iter().enumerate().map(|(i, v)| (i as u32, (v, 0.8))));
        let fused = fuse(session(&[500.0, 800.0, 1000.0]), &mut extractor, &config()).unwrap();
        assert!((fused.vector.norm() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_no_usable_frame() {
        let mut extractor = FakeExtractor::new([]);
        let err = fuse(session(&[100.0, 349.9]), &mut extractor, &config()).unwrap_err();
        assert_eq!(err, FusionError::NoUsableFrame { retained: 2 });
        assert!(extractor.calls.is_empty());

        let err = fuse(session(&[]), &mut extractor, &config()).unwrap_err();
        assert_eq!(err, FusionError::NoUsableFrame { retained: 0 });
    }

    #[test]
    fn test_min_quality_is_inclusive() {
        let mut extractor = FakeExtractor::new([(0, (basis(0), 0.9))]);
        let fused = fuse(session(&[350.0]), &mut extractor, &config()).unwrap();
        assert_eq!(fused.contributors.len(), 1);
    }

    #[test]
    fn test_extractor_floor_gates_high_scoring_frame() {
        // Best frame extracts with low confidence; the next one is used alone.
        let mut extractor = FakeExtractor::new([(0, (basis(0), 0.5)), (1, (basis(1), 0.9))]);
        let fused = fuse(session(&[1000.0, 400.0]), &mut extractor, &config()).unwrap();
        assert_eq!(extractor.calls, vec![0, 1]);
        assert_eq!(fused.contributors.len(), 1);
        assert_eq!(fused.contributors[0].score, 400.0);
        assert!((fused.vector.values()[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_extraction_unavailable() {
        // Region 0 has no face, region 1 is below the floor.
        let mut extractor = FakeExtractor::new([(1, (basis(1), 0.69))]);
        let err = fuse(session(&[800.0, 900.0]), &mut extractor, &config()).unwrap_err();
        assert_eq!(err, FusionError::ExtractionUnavailable { attempted: 2 });
    }

    #[test]
    fn test_cancelling_vectors_are_rejected() {
        let mut neg = basis(0);
        neg[0] = -1.0;
        let mut extractor = FakeExtractor::new([(0, (basis(0), 0.9)), (1, (neg, 0.9))]);
        let err = fuse(session(&[500.0, 500.0]), &mut extractor, &config()).unwrap_err();
        assert_eq!(err, FusionError::ExtractionUnavailable { attempted: 2 });
    }

    #[test]
    fn test_top_n_limits_extraction_attempts() {
        let mut extractor = FakeExtractor::new((0..6).map(|i| (i, (basis(i as usize), 0.9))));
        let cfg = FusionConfig { top_n: 2, ..config() };
        fuse(session(&[900.0, 800.0, 700.0, 600.0, 500.0, 400.0]), &mut extractor, &cfg).unwrap();
        assert_eq!(extractor.calls, vec![0, 1]);
    }

    #[test]
    fn test_config_validation() {
        FusionConfig::default().validate().unwrap();
        assert!(FusionConfig { damping: 0.0, ..Default::default() }.validate().is_err());
        assert!(FusionConfig { top_n: 0, ..Default::default() }.validate().is_err());
        assert!(FusionConfig { min_quality: 1200.0, ..Default::default() }.validate().is_err());
    }
}
