//! Capture session coordination.
//!
//! A detected presence opens a bounded-duration window. Every `stride`-th
//! frame inside the window is scored immediately and retained; when the
//! deadline passes the session closes and is handed, whole, to fusion.
//! After the caller reports the outcome, a cooldown suppresses new
//! triggers for the same presence.

use crate::config::ConfigError;
use crate::quality::{FrameMeasurements, QualityReport, QualityScorer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Time source for session deadlines and cooldowns.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Longest accepted capture window or cooldown, in seconds (one day).
pub const MAX_WINDOW_SECS: f64 = 86_400.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Wall-clock length of a capture window.
    pub duration_secs: f64,
    /// Keep every Kth frame while capturing.
    pub stride: u32,
    /// Trigger suppression after each resolved session.
    pub cooldown_secs: f64,
    /// While idle, only every Nth frame is checked for a presence.
    pub idle_stride: u32,
    /// Minimum detector confidence for a frame to count as a presence.
    pub presence_confidence: f32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            duration_secs: 5.0,
            stride: 3,
            cooldown_secs: 30.0,
            idle_stride: 5,
            presence_confidence: 0.5,
        }
    }
}

impl CaptureConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_secs)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if !(self.duration_secs > 0.0 && self.duration_secs <= MAX_WINDOW_SECS) {
            return Err(ConfigError::invalid(
                "capture.duration_secs",
                "must be positive and at most one day",
            ));
        }
        if self.stride == 0 {
            return Err(ConfigError::invalid("capture.stride", "must be at least 1"));
        }
        if !(self.cooldown_secs >= 0.0 && self.cooldown_secs <= MAX_WINDOW_SECS) {
            return Err(ConfigError::invalid(
                "capture.cooldown_secs",
                "must be within 0 and one day",
            ));
        }
        if self.idle_stride == 0 {
            return Err(ConfigError::invalid("capture.idle_stride", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.presence_confidence) {
            return Err(ConfigError::invalid("capture.presence_confidence", "must be within 0–1"));
        }
        Ok(())
    }
}

/// External "someone is there" signal that opens a capture window.
#[derive(Debug, Clone, Copy)]
pub struct PresenceSignal {
    pub detection_confidence: f32,
    pub timestamp: DateTime<Utc>,
}

/// One frame as delivered by the frame source. `region` is opaque here and
/// only handed back to the extractor.
#[derive(Debug, Clone)]
pub struct FrameInput<H> {
    pub region: H,
    pub measurements: FrameMeasurements,
}

/// A retained, scored frame.
#[derive(Debug, Clone)]
pub struct FrameObservation<H> {
    pub region: H,
    pub measurements: FrameMeasurements,
    pub quality: QualityReport,
    /// Frame tick within the session, strictly increasing.
    pub sequence: u64,
}

impl<H> FrameObservation<H> {
    pub fn score(&self) -> f32 {
        self.quality.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Expired,
    Forced,
}

#[derive(Debug)]
struct CaptureSession<H> {
    started_at: Instant,
    deadline: Instant,
    triggered_at: DateTime<Utc>,
    ticks: u64,
    frames: Vec<FrameObservation<H>>,
}

/// Immutable result of a capture window, consumed once by fusion.
#[derive(Debug)]
pub struct ClosedSession<H> {
    pub frames: Vec<FrameObservation<H>>,
    pub triggered_at: DateTime<Utc>,
    pub elapsed: Duration,
    /// Frames offered during the window, retained or not.
    pub ticks: u64,
    pub reason: CloseReason,
}

impl<H> ClosedSession<H> {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn best_score(&self) -> Option<f32> {
        self.frames.iter().map(FrameObservation::score).reduce(f32::max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Capturing,
    /// Session closed, outcome not yet reported.
    Resolving,
    CoolingDown,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TriggerRejected {
    #[error("detection confidence {confidence:.2} below presence threshold {threshold:.2}")]
    LowConfidence { confidence: f32, threshold: f32 },
    #[error("a capture session is already in progress")]
    Busy,
    #[error("cooling down for another {remaining:?}")]
    CoolingDown { remaining: Duration },
}

enum Phase<H> {
    Idle,
    Capturing(CaptureSession<H>),
    Resolving,
    Cooldown { until: Instant },
}

/// `idle → capturing → closed` state machine for one frame source.
pub struct CaptureCoordinator<H, C: Clock = SystemClock> {
    config: CaptureConfig,
    scorer: QualityScorer,
    clock: C,
    phase: Phase<H>,
}

impl<H, C: Clock> CaptureCoordinator<H, C> {
    pub fn new(config: CaptureConfig, scorer: QualityScorer, clock: C) -> Self {
        Self {
            config,
            scorer,
            clock,
            phase: Phase::Idle,
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn state(&self) -> CoordinatorState {
        match &self.phase {
            Phase::Idle => CoordinatorState::Idle,
            Phase::Capturing(_) => CoordinatorState::Capturing,
            Phase::Resolving => CoordinatorState::Resolving,
            Phase::Cooldown { until } if self.clock.now() >= *until => CoordinatorState::Idle,
            Phase::Cooldown { .. } => CoordinatorState::CoolingDown,
        }
    }

    /// Open a capture window.
    pub fn on_presence(&mut self, signal: &PresenceSignal) -> Result<(), TriggerRejected> {
        let now = self.clock.now();
        match &self.phase {
            Phase::Capturing(_) | Phase::Resolving => return Err(TriggerRejected::Busy),
            Phase::Cooldown { until } if now < *until => {
                return Err(TriggerRejected::CoolingDown {
                    remaining: *until - now,
                })
            }
            _ => {}
        }
        if signal.detection_confidence < self.config.presence_confidence {
            return Err(TriggerRejected::LowConfidence {
                confidence: signal.detection_confidence,
                threshold: self.config.presence_confidence,
            });
        }

        tracing::debug!(
            confidence = signal.detection_confidence,
            duration_secs = self.config.duration_secs,
            stride = self.config.stride,
            "capture session started"
        );
        self.phase = Phase::Capturing(CaptureSession {
            started_at: now,
            deadline: now + self.config.duration(),
            triggered_at: signal.timestamp,
            ticks: 0,
            frames: Vec::new(),
        });
        Ok(())
    }

    /// Offer a frame. Returns the closed session once the window has elapsed;
    /// a frame arriving at or after the deadline is not retained.
    pub fn on_frame(&mut self, frame: FrameInput<H>) -> Option<ClosedSession<H>> {
        if let Some(closed) = self.poll() {
            return Some(closed);
        }
        let Phase::Capturing(session) = &mut self.phase else {
            return None;
        };

        session.ticks += 1;
        if session.ticks % u64::from(self.config.stride) != 0 {
            return None;
        }

        let quality = self.scorer.score(&frame.measurements);
        tracing::trace!(sequence = session.ticks, score = quality.total, "frame retained");
        session.frames.push(FrameObservation {
            region: frame.region,
            measurements: frame.measurements,
            quality,
            sequence: session.ticks,
        });
        None
    }

    /// Close the session if its deadline has passed.
    pub fn poll(&mut self) -> Option<ClosedSession<H>> {
        let now = self.clock.now();
        if !matches!(&self.phase, Phase::Capturing(s) if now >= s.deadline) {
            return None;
        }
        self.take_session().map(|s| self.close(s, CloseReason::Expired))
    }

    /// Close the session early.
    pub fn force_close(&mut self) -> Option<ClosedSession<H>> {
        self.take_session().map(|s| self.close(s, CloseReason::Forced))
    }

    /// Report that the closed session's outcome has been handled; starts the cooldown.
    pub fn mark_resolved(&mut self) {
        if matches!(self.phase, Phase::Resolving) {
            self.phase = Phase::Cooldown {
                until: self.clock.now() + self.config.cooldown(),
            };
        }
    }

    /// Move a capturing session out, leaving the coordinator in `Resolving`.
    fn take_session(&mut self) -> Option<CaptureSession<H>> {
        match std::mem::replace(&mut self.phase, Phase::Resolving) {
            Phase::Capturing(session) => Some(session),
            other => {
                self.phase = other;
                None
            }
        }
    }

    fn close(&self, session: CaptureSession<H>, reason: CloseReason) -> ClosedSession<H> {
        let now = self.clock.now();
        let closed = ClosedSession {
            elapsed: now.saturating_duration_since(session.started_at),
            triggered_at: session.triggered_at,
            ticks: session.ticks,
            frames: session.frames,
            reason,
        };
        tracing::debug!(
            retained = closed.frames.len(),
            ticks = closed.ticks,
            ?reason,
            "capture session closed"
        );
        closed
    }
}
