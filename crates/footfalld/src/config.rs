use footfall_core::{ConfigError, PipelineConfig};
use std::path::PathBuf;
use std::time::Duration;

/// Well-known bus name and object path of the daemon.
pub const BUS_NAME: &str = "org.footfall.Footfall1";
pub const OBJECT_PATH: &str = "/org/footfall/Footfall1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    Session,
    System,
}

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Keep identities in an in-memory database instead of `db_path`.
    pub memory_store: bool,
    /// Upper bound on every store call and scope-lock wait.
    pub store_timeout_secs: u64,
    /// Which D-Bus bus to claim the service name on.
    pub bus: Bus,
    /// Optional TOML file with the pipeline table.
    pub pipeline_path: Option<PathBuf>,
    /// Overrides `matching.similarity_threshold` from the pipeline file.
    pub similarity_threshold: Option<f32>,
}

impl Config {
    /// Load configuration from `FOOTFALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("footfall");

        let db_path = std::env::var("FOOTFALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("identities.db"));

        Self {
            db_path,
            memory_store: std::env::var("FOOTFALL_MEMORY_STORE")
                .map(|v| v == "1")
                .unwrap_or(false),
            store_timeout_secs: env_u64("FOOTFALL_STORE_TIMEOUT_SECS", 5),
            bus: match std::env::var("FOOTFALL_BUS").as_deref() {
                Ok("system") => Bus::System,
                _ => Bus::Session,
            },
            pipeline_path: std::env::var("FOOTFALL_CONFIG").ok().map(PathBuf::from),
            similarity_threshold: env_f32("FOOTFALL_SIMILARITY_THRESHOLD"),
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs.max(1))
    }

    /// Pipeline table from `FOOTFALL_CONFIG` (or defaults), with env
    /// overrides applied and the result validated.
    pub fn pipeline(&self) -> Result<PipelineConfig, ConfigError> {
        let mut pipeline = match &self.pipeline_path {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(threshold) = self.similarity_threshold {
            pipeline.matching.similarity_threshold = threshold;
        }
        pipeline.validate()?;
        Ok(pipeline)
    }
}

fn env_f32(key: &str) -> Option<f32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
