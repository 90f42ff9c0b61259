//! Capture worker: frame source → coordinator → fusion → decision sink.

use crate::capture::{
    CaptureCoordinator, Clock, ClosedSession, CoordinatorState, FrameInput, PresenceSignal,
    SystemClock, TriggerRejected,
};
use crate::config::{ConfigError, PipelineConfig};
use crate::fusion::{fuse, Extractor, FusionConfig, FusionError};
use crate::gateway::{IdentifyError, IdentityGateway};
use crate::quality::QualityScorer;
use crate::store::IdentityStore;
use crate::types::{IdentifyRequest, MatchDecision, ScopeId};
use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Supplier of frames, polled once per worker tick.
pub trait FrameSource<H> {
    /// `None` when no frame is available this tick.
    fn next_frame(&mut self) -> Option<FrameInput<H>>;
}

/// Receiver of fused vectors; the decision service.
pub trait DecisionSink: Send + Sync {
    fn identify(
        &self,
        request: IdentifyRequest,
    ) -> impl Future<Output = Result<MatchDecision, IdentifyError>> + Send;
}

impl<S: IdentityStore> DecisionSink for IdentityGateway<S> {
    fn identify(
        &self,
        request: IdentifyRequest,
    ) -> impl Future<Output = Result<MatchDecision, IdentifyError>> + Send {
        IdentityGateway::identify(self, request)
    }
}

impl<T: DecisionSink + ?Sized> DecisionSink for Arc<T> {
    fn identify(
        &self,
        request: IdentifyRequest,
    ) -> impl Future<Output = Result<MatchDecision, IdentifyError>> + Send {
        (**self).identify(request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No frame was retained during the window.
    EmptySession,
    NoUsableFrame { retained: usize },
    ExtractionUnavailable { attempted: usize },
}

impl From<FusionError> for SkipReason {
    fn from(err: FusionError) -> Self {
        match err {
            FusionError::NoUsableFrame { retained } => SkipReason::NoUsableFrame { retained },
            FusionError::ExtractionUnavailable { attempted } => {
                SkipReason::ExtractionUnavailable { attempted }
            }
        }
    }
}

#[derive(Debug)]
pub enum SessionOutcome {
    Decided(MatchDecision),
    Skipped(SkipReason),
    Failed(IdentifyError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub frames: u64,
    pub sessions: u64,
    pub new_visitors: u64,
    pub returning_visitors: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Drives one frame source through the whole pipeline.
pub struct CaptureWorker<H, F, E, K, C: Clock = SystemClock> {
    scope: ScopeId,
    source: F,
    extractor: E,
    sink: K,
    coordinator: CaptureCoordinator<H, C>,
    fusion: FusionConfig,
    idle_ticks: u64,
    stats: WorkerStats,
}

impl<H, F, E, K, C> CaptureWorker<H, F, E, K, C>
where
    F: FrameSource<H>,
    E: Extractor<H>,
    K: DecisionSink,
    C: Clock,
{
    pub fn new(
        config: &PipelineConfig,
        scope: ScopeId,
        source: F,
        extractor: E,
        sink: K,
        clock: C,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let scorer = QualityScorer::new(config.factors.clone())?;
        Ok(Self {
            scope,
            source,
            extractor,
            sink,
            coordinator: CaptureCoordinator::new(config.capture.clone(), scorer, clock),
            fusion: config.fusion.clone(),
            idle_ticks: 0,
            stats: WorkerStats::default(),
        })
    }

    pub fn state(&self) -> CoordinatorState {
        self.coordinator.state()
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Advance by one tick. Returns an outcome when a session finished.
    pub async fn step(&mut self) -> Option<SessionOutcome> {
        let frame = self.source.next_frame();
        if frame.is_some() {
            self.stats.frames += 1;
        }

        let closed = match self.coordinator.state() {
            CoordinatorState::Capturing => match frame {
                Some(frame) => self.coordinator.on_frame(frame),
                None => self.coordinator.poll(),
            },
            CoordinatorState::Idle => {
                if let Some(frame) = frame {
                    self.watch(&frame);
                }
                None
            }
            CoordinatorState::Resolving | CoordinatorState::CoolingDown => None,
        }?;

        Some(self.finish(closed).await)
    }

    /// Tick every `period` until `shutdown` resolves. Any open session is
    /// discarded.
    pub async fn run(mut self, period: Duration, shutdown: impl Future<Output = ()>) -> WorkerStats {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        tracing::info!(scope = %self.scope, period = ?period, "capture worker started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    self.step().await;
                }
            }
        }

        if let Some(open) = self.coordinator.force_close() {
            tracing::info!(retained = open.frames.len(), "discarding open capture session");
        }
        let stats = self.stats;
        tracing::info!(
            scope = %self.scope,
            frames = stats.frames,
            sessions = stats.sessions,
            new = stats.new_visitors,
            returning = stats.returning_visitors,
            skipped = stats.skipped,
            failed = stats.failed,
            "capture worker stopped"
        );
        stats
    }

    /// Idle presence check on every `idle_stride`-th frame.
    fn watch(&mut self, frame: &FrameInput<H>) {
        self.idle_ticks += 1;
        if self.idle_ticks % u64::from(self.coordinator.config().idle_stride) != 0 {
            return;
        }
        let signal = PresenceSignal {
            detection_confidence: frame.measurements.detection_confidence,
            timestamp: Utc::now(),
        };
        match self.coordinator.on_presence(&signal) {
            Ok(()) => {
                self.idle_ticks = 0;
                tracing::info!(
                    scope = %self.scope,
                    confidence = signal.detection_confidence,
                    "presence detected, capturing"
                );
            }
            Err(TriggerRejected::LowConfidence { .. }) => {}
            Err(rejected) => tracing::debug!(reason = %rejected, "presence ignored"),
        }
    }

    async fn finish(&mut self, closed: ClosedSession<H>) -> SessionOutcome {
        self.stats.sessions += 1;

        let outcome = if closed.is_empty() {
            SessionOutcome::Skipped(SkipReason::EmptySession)
        } else {
            match fuse(closed, &mut self.extractor, &self.fusion) {
                Ok(fused) => {
                    let request = IdentifyRequest {
                        vector: fused.vector,
                        scope: self.scope,
                        auxiliary_image: None,
                    };
                    match self.sink.identify(request).await {
                        Ok(decision) => SessionOutcome::Decided(decision),
                        Err(err) => SessionOutcome::Failed(err),
                    }
                }
                Err(err) => SessionOutcome::Skipped(err.into()),
            }
        };

        // Cooldown follows every closed session, decided or not.
        self.coordinator.mark_resolved();

        match &outcome {
            SessionOutcome::Decided(decision) => {
                if decision.is_new() {
                    self.stats.new_visitors += 1;
                } else {
                    self.stats.returning_visitors += 1;
                }
            }
            SessionOutcome::Skipped(reason) => {
                self.stats.skipped += 1;
                tracing::info!(scope = %self.scope, ?reason, "capture session skipped");
            }
            SessionOutcome::Failed(err) => {
                self.stats.failed += 1;
                tracing::error!(scope = %self.scope, error = %err, "identify failed");
            }
        }
        outcome
    }
}
