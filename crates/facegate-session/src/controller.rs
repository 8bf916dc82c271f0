//! Verification session controller.
//!
//! Owns the attempt lifecycle: model load, reference enrollment, camera
//! acquisition, the polling loop, and the transitions between them. Every
//! transition that ends an attempt (stop, failure, successful match) goes
//! through the attempt slot lock and the attempt token, so exactly one of
//! them wins for a given attempt.

use crate::camera_session::CameraSession;
use crate::config::SessionSettings;
use crate::error::{SessionError, Stage};
use crate::observer::SessionObserver;
use crate::state::{AttemptToken, SessionState};
use crate::storage::{LabelStore, VerifiedRecord};
use crate::verification::{TickSink, VerificationLoop};
use facegate_core::{DistanceMatcher, EmbeddingProvider, ImageFetcher, Matcher, ReferenceLoader};
use facegate_hw::CameraSource;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::Instrument;

/// How a call to [`SessionController::start`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The camera is live and the verification loop is running.
    Polling,
    /// The attempt was stopped before it reached polling.
    Cancelled,
}

/// Collaborators injected into a controller.
pub struct SessionDeps {
    pub provider: Arc<dyn EmbeddingProvider>,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub camera: Arc<dyn CameraSource>,
    pub store: Arc<dyn LabelStore>,
    pub observer: Arc<dyn SessionObserver>,
}

/// Handle to a verification session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

struct Shared {
    settings: SessionSettings,
    provider: Arc<dyn EmbeddingProvider>,
    fetcher: Arc<dyn ImageFetcher>,
    camera: Arc<CameraSession>,
    store: Arc<dyn LabelStore>,
    observer: Arc<dyn SessionObserver>,
    state: watch::Sender<SessionState>,
    /// Guards every state transition. Never held across an await.
    attempt: Mutex<AttemptSlot>,
}

#[derive(Default)]
struct AttemptSlot {
    token: Option<Arc<AttemptToken>>,
    /// Load, enrollment and camera acquisition; cleared once polling starts.
    pipeline: Option<AbortHandle>,
    verification: Option<JoinHandle<()>>,
}

impl AttemptSlot {
    fn is_current(&self, token: &Arc<AttemptToken>) -> bool {
        self.token.as_ref().is_some_and(|t| Arc::ptr_eq(t, token))
    }

    fn abort_tasks(&mut self) {
        if let Some(handle) = self.pipeline.take() {
            handle.abort();
        }
        if let Some(handle) = self.verification.take() {
            handle.abort();
        }
    }
}

type Pipeline = JoinHandle<Result<StartOutcome, SessionError>>;

/// Ends the attempt if the `start` call driving it is dropped before its
/// pipeline resolved.
struct AbandonOnDrop<'a> {
    shared: &'a Shared,
    token: &'a Arc<AttemptToken>,
    armed: bool,
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.abandon(self.token);
        }
    }
}

impl SessionController {
    pub fn new(settings: SessionSettings, deps: SessionDeps) -> Self {
        let camera = Arc::new(CameraSession::new(deps.camera, Arc::clone(&deps.observer)));
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            shared: Arc::new(Shared {
                settings,
                provider: deps.provider,
                fetcher: deps.fetcher,
                camera,
                store: deps.store,
                observer: deps.observer,
                state,
                attempt: Mutex::new(AttemptSlot::default()),
            }),
        }
    }

    /// Run a new attempt up to the point where the verification loop polls.
    ///
    /// Clears any previously verified label first. Returns
    /// [`StartOutcome::Cancelled`] if [`stop`](Self::stop) won the race
    /// against any of the stages; stage failures end the attempt in
    /// [`SessionState::Error`] and are returned.
    ///
    /// The stages run as a task owned by the session. Dropping the returned
    /// future before it resolves stops the attempt and releases the camera.
    pub async fn start(&self) -> Result<StartOutcome, SessionError> {
        let (token, pipeline) = self.shared.begin()?;
        let mut guard = AbandonOnDrop {
            shared: &self.shared,
            token: &token,
            armed: true,
        };
        let joined = pipeline.await;
        guard.armed = false;

        let err = match joined {
            Ok(Ok(outcome)) => return Ok(outcome),
            Ok(Err(err)) => err,
            Err(e) if e.is_panic() => SessionError::Internal("attempt pipeline panicked".into()),
            Err(_) => return Ok(StartOutcome::Cancelled),
        };
        if self.shared.fail_attempt(&token, &err) {
            return Err(err);
        }
        tracing::debug!(attempt = %token.id(), error = %err, "error after attempt ended; discarded");
        Ok(StartOutcome::Cancelled)
    }

    /// End the current attempt, release the camera and enter
    /// [`SessionState::Stopped`]. Safe to call in any state, any number of times.
    pub fn stop(&self, reason: &str) {
        self.shared.stop(reason);
    }

    /// Page teardown: same as [`stop`](Self::stop).
    pub fn unload(&self) {
        self.shared.stop("page unloaded");
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.shared.settings
    }

    /// Label verified by the last successful attempt, if it is still stored.
    pub fn verified(&self) -> Result<Option<VerifiedRecord>, SessionError> {
        Ok(self.shared.store.get()?)
    }
}

impl Shared {
    fn lock_attempt(&self) -> MutexGuard<'_, AttemptSlot> {
        self.attempt.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a transition. Called with the attempt lock held so observers
    /// see transitions in the order they happened.
    fn enter(&self, next: SessionState, status: &str) {
        self.state.send_replace(next);
        self.observer.state_changed(next);
        self.observer.controls(next.controls());
        self.observer.status(status);
    }

    /// Status line for a stage of `token`, dropped once the attempt ended.
    fn progress(&self, token: &Arc<AttemptToken>, status: &str) -> bool {
        let slot = self.lock_attempt();
        if !slot.is_current(token) || !token.is_running() {
            return false;
        }
        self.observer.status(status);
        true
    }

    /// Move `token`'s attempt to `next` unless it has ended.
    fn advance(&self, token: &Arc<AttemptToken>, next: SessionState, status: &str) -> bool {
        let slot = self.lock_attempt();
        if !slot.is_current(token) || !token.is_running() {
            return false;
        }
        self.enter(next, status);
        true
    }

    /// Claim the slot for a new attempt and spawn its pipeline. The task is
    /// spawned under the slot lock, so it cannot reach polling before its
    /// abort handle is recorded.
    fn begin(self: &Arc<Self>) -> Result<(Arc<AttemptToken>, Pipeline), SessionError> {
        let mut slot = self.lock_attempt();
        if self.state.borrow().is_in_progress() {
            return Err(SessionError::AlreadyRunning);
        }

        let token = AttemptToken::new();
        slot.abort_tasks();
        slot.token = Some(Arc::clone(&token));

        if let Err(err) = self.store.clear() {
            token.try_finish();
            let err = SessionError::from(err);
            self.enter(SessionState::Error, &format!("error: {err}"));
            tracing::error!(error = %err, "could not clear previous verification");
            return Err(err);
        }

        self.enter(SessionState::Loading, "loading model...");

        let span = tracing::info_span!("attempt", id = %token.id());
        let pipeline = {
            let shared = Arc::clone(self);
            let token = Arc::clone(&token);
            tokio::spawn(
                async move {
                    tracing::info!("verification attempt started");
                    shared.run_to_polling(&token).await
                }
                .instrument(span),
            )
        };
        slot.pipeline = Some(pipeline.abort_handle());
        Ok((token, pipeline))
    }

    async fn bounded<T>(
        &self,
        stage: Stage,
        work: impl Future<Output = Result<T, SessionError>>,
    ) -> Result<T, SessionError> {
        match self.settings.stage_timeout {
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .map_err(|_| SessionError::Timeout { stage })?,
            None => work.await,
        }
    }

    async fn run_to_polling(self: &Arc<Self>, token: &Arc<AttemptToken>) -> Result<StartOutcome, SessionError> {
        self.bounded(Stage::ModelLoad, async {
            self.provider.load().await.map_err(SessionError::ModelLoad)
        })
        .await?;
        tracing::info!("model ready");
        if !self.progress(token, "loading reference faces...") {
            return Ok(StartOutcome::Cancelled);
        }

        let loader = ReferenceLoader::new(Arc::clone(&self.provider), Arc::clone(&self.fetcher));
        let references = self
            .bounded(Stage::Enrollment, async {
                loader.load(&self.settings.references).await.map_err(SessionError::from)
            })
            .await?;
        let matcher: Arc<dyn Matcher> = Arc::new(DistanceMatcher::new(
            references,
            self.settings.match_threshold,
            self.settings.distance_metric,
        ));

        if !self.advance(token, SessionState::CameraActive, "requesting camera...") {
            return Ok(StartOutcome::Cancelled);
        }
        let bound = self
            .bounded(Stage::CameraAcquire, async {
                self.camera.acquire(token).await.map_err(SessionError::from_acquire)
            })
            .await?;
        if !bound {
            return Ok(StartOutcome::Cancelled);
        }

        let verification = Arc::new(VerificationLoop {
            attempt: Arc::clone(token),
            matcher,
            camera: Arc::clone(&self.camera),
            provider: Arc::clone(&self.provider),
            interval: self.settings.poll_interval,
        });
        if !self.start_polling(token, verification) {
            return Ok(StartOutcome::Cancelled);
        }
        Ok(StartOutcome::Polling)
    }

    fn start_polling(self: &Arc<Self>, token: &Arc<AttemptToken>, verification: Arc<VerificationLoop>) -> bool {
        let mut slot = self.lock_attempt();
        if !slot.is_current(token) || !token.is_running() {
            return false;
        }
        self.enter(SessionState::Polling, "look at the camera...");
        slot.pipeline = None;
        let sink: Arc<dyn TickSink> = Arc::clone(self) as Arc<dyn TickSink>;
        slot.verification = Some(tokio::spawn(verification.run(sink).in_current_span()));
        true
    }

    fn stop(&self, reason: &str) {
        let mut slot = self.lock_attempt();
        if let Some(token) = &slot.token {
            if token.try_finish() {
                tracing::info!(attempt = %token.id(), reason, "verification attempt stopped");
            }
        }
        slot.abort_tasks();
        self.camera.release();
        self.enter(SessionState::Stopped, reason);
    }

    /// Stop `token`'s attempt because nobody is waiting for it to start.
    fn abandon(&self, token: &Arc<AttemptToken>) {
        let mut slot = self.lock_attempt();
        if !slot.is_current(token) || !token.try_finish() {
            return;
        }
        slot.abort_tasks();
        self.camera.release();
        tracing::info!(attempt = %token.id(), "start abandoned; verification attempt stopped");
        self.enter(SessionState::Stopped, "verification abandoned");
    }

    fn fail_attempt(&self, token: &Arc<AttemptToken>, err: &SessionError) -> bool {
        let mut slot = self.lock_attempt();
        if !slot.is_current(token) || !token.try_finish() {
            return false;
        }
        slot.abort_tasks();
        self.camera.release();
        tracing::error!(attempt = %token.id(), error = %err, "verification attempt failed");
        self.enter(SessionState::Error, &format!("error: {err}"));
        true
    }
}

impl TickSink for Shared {
    fn finalize(&self, attempt: &Arc<AttemptToken>, label: &str, distance: f32) -> Result<bool, SessionError> {
        let mut slot = self.lock_attempt();
        if !slot.is_current(attempt) || !attempt.try_finish() {
            return Ok(false);
        }

        let persisted = self.store.set(&VerifiedRecord::now(label, distance));
        slot.abort_tasks();
        self.camera.release();

        if let Err(err) = persisted {
            let err = SessionError::from(err);
            tracing::error!(attempt = %attempt.id(), error = %err, "could not persist verified label");
            self.enter(SessionState::Error, &format!("error: {err}"));
            return Err(err);
        }

        tracing::info!(attempt = %attempt.id(), label, distance, "face verified");
        self.enter(SessionState::Verified, &format!("verified: {label}"));
        drop(slot);

        self.observer.navigate(&self.settings.destination);
        Ok(true)
    }

    fn unknown_face(&self, attempt: &Arc<AttemptToken>, distance: f32) {
        tracing::debug!(distance, "face not recognized");
        self.progress(attempt, "face not recognized");
    }

    fn fail(&self, attempt: &Arc<AttemptToken>, err: &SessionError) -> bool {
        self.fail_attempt(attempt, err)
    }
}
