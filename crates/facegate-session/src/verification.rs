//! Periodic detect → embed → classify loop.
//!
//! Each tick runs as its own task, so a slow embedding can overlap the next
//! tick. Ticks never change session state themselves: a decision goes back to
//! the owner through [`TickSink`], which serializes finalization.

use crate::camera_session::CameraSession;
use crate::error::SessionError;
use crate::state::AttemptToken;
use facegate_core::{EmbeddingProvider, MatchLabel, Matcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

/// What a single tick observed.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The attempt was no longer running; nothing was done.
    Inactive,
    NoFrame,
    DarkFrame,
    NoFace,
    Unknown { distance: f32 },
    Verified { label: String },
}

/// Receives the decisions of a verification loop.
pub(crate) trait TickSink: Send + Sync {
    /// Finalize a match. Returns false when another tick (or a stop) already
    /// ended the attempt.
    fn finalize(&self, attempt: &Arc<AttemptToken>, label: &str, distance: f32) -> Result<bool, SessionError>;

    fn unknown_face(&self, attempt: &Arc<AttemptToken>, distance: f32);

    /// End the attempt with an error. Returns false if it had already ended.
    fn fail(&self, attempt: &Arc<AttemptToken>, err: &SessionError) -> bool;
}

pub(crate) struct VerificationLoop {
    pub(crate) attempt: Arc<AttemptToken>,
    pub(crate) matcher: Arc<dyn Matcher>,
    pub(crate) camera: Arc<CameraSession>,
    pub(crate) provider: Arc<dyn EmbeddingProvider>,
    pub(crate) interval: Duration,
}

impl VerificationLoop {
    /// Fire a tick every `interval` until the attempt stops running.
    ///
    /// Tick errors and panics fail the attempt. Aborting this task drops the
    /// in-flight ticks with it.
    pub(crate) async fn run(self: Arc<Self>, sink: Arc<dyn TickSink>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight: JoinSet<Result<TickOutcome, SessionError>> = JoinSet::new();

        tracing::debug!(interval_ms = self.interval.as_millis() as u64, "verification loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.attempt.is_running() {
                        break;
                    }
                    let this = Arc::clone(&self);
                    let sink = Arc::clone(&sink);
                    in_flight.spawn(async move { this.tick(sink.as_ref()).await }.in_current_span());
                }
                Some(joined) = in_flight.join_next() => {
                    let err = match joined {
                        Ok(Ok(outcome)) => {
                            tracing::trace!(?outcome, "tick finished");
                            continue;
                        }
                        Ok(Err(err)) => err,
                        Err(e) if e.is_panic() => SessionError::Internal("verification tick panicked".into()),
                        Err(_) => continue,
                    };
                    sink.fail(&self.attempt, &err);
                }
            }
        }
        tracing::debug!("verification loop finished");
    }

    /// One poll: grab a frame, embed it, classify, and hand the decision on.
    ///
    /// The running flag is re-checked after every suspension point.
    pub(crate) async fn tick(&self, sink: &dyn TickSink) -> Result<TickOutcome, SessionError> {
        if !self.attempt.is_running() {
            return Ok(TickOutcome::Inactive);
        }

        let frame = self.camera.frame().await?;
        if !self.attempt.is_running() {
            return Ok(TickOutcome::Inactive);
        }
        let Some(frame) = frame else {
            return Ok(TickOutcome::NoFrame);
        };
        if frame.is_dark {
            tracing::debug!(seq = frame.sequence, "dark frame skipped");
            return Ok(TickOutcome::DarkFrame);
        }

        let embedding = self.provider.embed(&frame).await.map_err(SessionError::Provider)?;
        if !self.attempt.is_running() {
            return Ok(TickOutcome::Inactive);
        }
        let Some(embedding) = embedding else {
            return Ok(TickOutcome::NoFace);
        };

        let result = self.matcher.classify(&embedding);
        tracing::debug!(label = %result.label, distance = result.distance, "tick classified");

        match result.label {
            MatchLabel::Known(label) => {
                if sink.finalize(&self.attempt, &label, result.distance)? {
                    Ok(TickOutcome::Verified { label })
                } else {
                    Ok(TickOutcome::Inactive)
                }
            }
            MatchLabel::Unknown => {
                sink.unknown_face(&self.attempt, result.distance);
                Ok(TickOutcome::Unknown {
                    distance: result.distance,
                })
            }
        }
    }
}
