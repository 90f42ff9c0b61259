//! Pipeline configuration: factor table, capture window, fusion and
//! matching parameters. Pure data, deserialized from TOML.

use crate::capture::CaptureConfig;
use crate::fusion::FusionConfig;
use crate::quality::{default_rules, Factor, FactorRule};
use crate::resolver::MatchConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid {factor:?} rule: {reason}")]
    InvalidRule { factor: Factor, reason: String },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse pipeline config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Every tunable of the capture → score → fuse → resolve pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub factors: Vec<FactorRule>,
    pub capture: CaptureConfig,
    pub fusion: FusionConfig,
    pub matching: MatchConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            factors: default_rules(),
            capture: CaptureConfig::default(),
            fusion: FusionConfig::default(),
            matching: MatchConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a TOML document. Missing sections keep their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&src)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // Rule validation lives with the scorer so both paths agree.
        crate::quality::QualityScorer::new(self.factors.clone())?;
        self.capture.validate()?;
        self.fusion.validate()?;
        self.matching.validate()?;
        Ok(())
    }
}
