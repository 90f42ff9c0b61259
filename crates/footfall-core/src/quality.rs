//! Frame quality scoring.
//!
//! Multiplicative penalty model: every active factor contributes a
//! multiplier `m ∈ [0, 1]`, and
//!
//! ```text
//! score = 1000 × Π m_f ^ (importance_f / 5)
//! ```
//!
//! Importance 5 is a linear penalty, 10 quadratic, 0 removes the factor
//! from the product entirely. Thresholds and importances are data
//! ([`FactorRule`]), loaded from configuration.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};

/// Upper bound of the score scale.
pub const MAX_SCORE: f32 = 1000.0;

/// Importance at which a factor applies its multiplier linearly.
const LINEAR_IMPORTANCE: f32 = 5.0;
const MAX_IMPORTANCE: f32 = 10.0;
const DEFAULT_CRITICAL_MULTIPLIER: f32 = 0.3;

/// A measured property of a candidate face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Factor {
    /// Face width in pixels.
    FaceSize,
    /// Absolute left/right head rotation in degrees.
    Yaw,
    /// Absolute up/down head rotation in degrees.
    Pitch,
    /// Detector confidence, 0–1.
    DetectionConfidence,
    /// Laplacian variance of the face region.
    Sharpness,
    /// Mean luminance of the face region, 0–255.
    Brightness,
    /// Luminance standard deviation of the face region.
    Contrast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    HigherIsBetter,
    LowerIsBetter,
}

/// Thresholds and weight for one factor.
///
/// Moving from `good` towards `critical` interpolates linearly from 1 down to
/// `critical_multiplier`; past `critical` the multiplier decays quadratically
/// and reaches exactly 0 at `zero`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorRule {
    pub factor: Factor,
    pub importance: f32,
    pub direction: Direction,
    pub critical: f32,
    pub good: f32,
    #[serde(default)]
    pub zero: Option<f32>,
    #[serde(default = "default_critical_multiplier")]
    pub critical_multiplier: f32,
}

fn default_critical_multiplier() -> f32 {
    DEFAULT_CRITICAL_MULTIPLIER
}

impl FactorRule {
    pub fn is_active(&self) -> bool {
        self.importance > 0.0
    }

    /// Per-factor multiplier in [0, 1] for a measured value.
    pub fn multiplier(&self, value: f32) -> f32 {
        if !value.is_finite() {
            return 0.0;
        }
        let cm = self.critical_multiplier;

        match self.direction {
            Direction::HigherIsBetter => {
                if matches!(self.zero, Some(z) if value <= z) {
                    return 0.0;
                }
                if value >= self.good {
                    return 1.0;
                }
                if value >= self.critical {
                    return cm + (1.0 - cm) * (value - self.critical) / (self.good - self.critical);
                }
                let origin = self.zero.unwrap_or(0.0);
                let r = (value - origin) / (self.critical - origin);
                cm * r.clamp(0.0, 1.0).powi(2)
            }
            Direction::LowerIsBetter => {
                if matches!(self.zero, Some(z) if value >= z) {
                    return 0.0;
                }
                if value <= self.good {
                    return 1.0;
                }
                if value <= self.critical {
                    return cm + (1.0 - cm) * (self.critical - value) / (self.critical - self.good);
                }
                let r = match self.zero {
                    Some(z) => (z - value) / (z - self.critical),
                    None => self.critical / value,
                };
                cm * r.clamp(0.0, 1.0).powi(2)
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidRule {
            factor: self.factor,
            reason: reason.to_string(),
        };

        if !(0.0..=MAX_IMPORTANCE).contains(&self.importance) {
            return Err(invalid("importance must be within 0–10"));
        }
        if !(self.critical_multiplier > 0.0 && self.critical_multiplier <= 1.0) {
            return Err(invalid("critical_multiplier must be within (0, 1]"));
        }
        if !self.critical.is_finite() || !self.good.is_finite() {
            return Err(invalid("thresholds must be finite"));
        }
        if matches!(self.zero, Some(z) if !z.is_finite()) {
            return Err(invalid("zero floor must be finite"));
        }

        match self.direction {
            Direction::HigherIsBetter => {
                if self.critical > self.good {
                    return Err(invalid("critical must not exceed good"));
                }
                match self.zero {
                    Some(z) if z >= self.critical => {
                        return Err(invalid("zero must be below critical"))
                    }
                    None if self.critical <= 0.0 => {
                        return Err(invalid("critical must be positive when no zero floor is set"))
                    }
                    _ => {}
                }
            }
            Direction::LowerIsBetter => {
                if self.good > self.critical {
                    return Err(invalid("good must not exceed critical"));
                }
                match self.zero {
                    Some(z) if z <= self.critical => {
                        return Err(invalid("zero must be above critical"))
                    }
                    None if self.critical <= 0.0 => {
                        return Err(invalid("critical must be positive when no zero floor is set"))
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

/// Raw measurements for one frame, as reported by the frame source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameMeasurements {
    pub detection_confidence: f32,
    /// Degrees; sign ignored.
    pub yaw: f32,
    /// Degrees; sign ignored.
    pub pitch: f32,
    pub face_size_px: f32,
    #[serde(default)]
    pub sharpness: Option<f32>,
    #[serde(default)]
    pub brightness: Option<f32>,
    #[serde(default)]
    pub contrast: Option<f32>,
}

impl FrameMeasurements {
    pub fn value(&self, factor: Factor) -> Option<f32> {
        match factor {
            Factor::FaceSize => Some(self.face_size_px),
            Factor::Yaw => Some(self.yaw.abs()),
            Factor::Pitch => Some(self.pitch.abs()),
            Factor::DetectionConfidence => Some(self.detection_confidence),
            Factor::Sharpness => self.sharpness,
            Factor::Brightness => self.brightness,
            Factor::Contrast => self.contrast,
        }
    }
}

/// Multiplier contributed by one active rule; `None` when the frame source
/// did not measure that factor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FactorScore {
    pub factor: Factor,
    pub multiplier: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub total: f32,
    pub factors: Vec<FactorScore>,
}

/// Deterministic, side-effect free quality scorer.
#[derive(Debug, Clone)]
pub struct QualityScorer {
    rules: Vec<FactorRule>,
}

impl QualityScorer {
    pub fn new(rules: Vec<FactorRule>) -> Result<Self, ConfigError> {
        for rule in &rules {
            rule.validate()?;
        }
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[FactorRule] {
        &self.rules
    }

    pub fn score(&self, measurements: &FrameMeasurements) -> QualityReport {
        let mut total = MAX_SCORE;
        let mut factors = Vec::new();

        for rule in self.rules.iter().filter(|r| r.is_active()) {
            let Some(value) = measurements.value(rule.factor) else {
                factors.push(FactorScore { factor: rule.factor, multiplier: None });
                continue;
            };
            let multiplier = rule.multiplier(value);
            total *= multiplier.powf(rule.importance / LINEAR_IMPORTANCE);
            factors.push(FactorScore { factor: rule.factor, multiplier: Some(multiplier) });
        }

        QualityReport {
            total: total.clamp(0.0, MAX_SCORE),
            factors,
        }
    }
}

/// Default factor table: strict frontality and face size; image statistics
/// are measured but carry no weight. Face size has no linear band: full
/// marks from 100px, quadratic down to the 60px floor.
pub fn default_rules() -> Vec<FactorRule> {
    vec![
        FactorRule {
            factor: Factor::Yaw,
            importance: 5.0,
            direction: Direction::LowerIsBetter,
            critical: 10.0,
            good: 3.0,
            zero: Some(90.0),
            critical_multiplier: DEFAULT_CRITICAL_MULTIPLIER,
        },
        FactorRule {
            factor: Factor::Pitch,
            importance: 3.0,
            direction: Direction::LowerIsBetter,
            critical: 8.0,
            good: 2.0,
            zero: Some(90.0),
            critical_multiplier: DEFAULT_CRITICAL_MULTIPLIER,
        },
        FactorRule {
            factor: Factor::FaceSize,
            importance: 5.0,
            direction: Direction::HigherIsBetter,
            critical: 100.0,
            good: 100.0,
            zero: Some(60.0),
            critical_multiplier: 1.0,
        },
        FactorRule {
            factor: Factor::Sharpness,
            importance: 0.0,
            direction: Direction::HigherIsBetter,
            critical: 50.0,
            good: 300.0,
            zero: None,
            critical_multiplier: DEFAULT_CRITICAL_MULTIPLIER,
        },
        // Too dark.
        FactorRule {
            factor: Factor::Brightness,
            importance: 0.0,
            direction: Direction::HigherIsBetter,
            critical: 30.0,
            good: 80.0,
            zero: None,
            critical_multiplier: 0.4,
        },
        // Too bright.
        FactorRule {
            factor: Factor::Brightness,
            importance: 0.0,
            direction: Direction::LowerIsBetter,
            critical: 230.0,
            good: 180.0,
            zero: Some(255.0),
            critical_multiplier: 0.4,
        },
        FactorRule {
            factor: Factor::Contrast,
            importance: 0.0,
            direction: Direction::HigherIsBetter,
            critical: 15.0,
            good: 50.0,
            zero: None,
            critical_multiplier: DEFAULT_CRITICAL_MULTIPLIER,
        },
        FactorRule {
            factor: Factor::DetectionConfidence,
            importance: 0.0,
            direction: Direction::HigherIsBetter,
            critical: 0.5,
            good: 0.8,
            zero: None,
            critical_multiplier: DEFAULT_CRITICAL_MULTIPLIER,
        },
    ]
}
