//! footfall-core — visitor identity pipeline.
//!
//! Frames are scored as they arrive, a capture window collects the best of
//! them, fusion folds their feature vectors into one, and the resolver
//! decides whether that vector belongs to a known visitor of the same scope.
//! The gateway is the only component that writes identity records.

pub mod capture;
pub mod config;
pub mod fusion;
pub mod gateway;
pub mod pipeline;
pub mod quality;
pub mod resolver;
pub mod store;
pub mod types;

pub use capture::{CaptureConfig, CaptureCoordinator, Clock, FrameInput, SystemClock};
pub use config::{ConfigError, PipelineConfig};
pub use fusion::{Extraction, ExtractError, Extractor, FusionConfig};
pub use gateway::{IdentifyError, IdentityGateway, DEFAULT_STORE_TIMEOUT};
pub use pipeline::{CaptureWorker, DecisionSink, FrameSource, SessionOutcome, WorkerStats};
pub use quality::{FrameMeasurements, QualityScorer};
pub use resolver::{CosineMatcher, IdentityResolver, MatchConfig, Matcher};
pub use store::{IdentityStore, MemoryStore, NewIdentity, StoreError};
pub use types::{
    Classification, FeatureVector, IdentifyRequest, IdentifyResponse, Identity, IdentityId,
    IdentityRecord, MatchDecision, Provenance, ScopeId, VectorError, EMBEDDING_DIM,
};
