//! facegate-session: Verification session for the face gate.
//!
//! Drives one attempt at a time from model load through reference
//! enrollment, camera acquisition and periodic matching to a verified label,
//! with stop and page teardown honored at every stage.

pub mod camera_session;
pub mod config;
pub mod controller;
pub mod error;
pub mod observer;
pub mod state;
pub mod storage;
pub mod verification;

#[cfg(test)]
mod testing;

pub use camera_session::CameraSession;
pub use config::{Config, ConfigError, SessionSettings};
pub use controller::{SessionController, SessionDeps, StartOutcome};
pub use error::{SessionError, Stage};
pub use observer::SessionObserver;
pub use state::{AttemptToken, ControlState, SessionState};
pub use storage::{FileLabelStore, LabelStore, MemoryLabelStore, StoreError, VerifiedRecord, VERIFIED_LABEL_KEY};
pub use verification::TickOutcome;
