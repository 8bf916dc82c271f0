use crate::storage::StoreError;
use facegate_core::{EnrollmentError, ProviderError};
use facegate_hw::CameraError;
use std::fmt;
use thiserror::Error;

/// Externally bounded stages of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ModelLoad,
    Enrollment,
    CameraAcquire,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::ModelLoad => "model load",
            Stage::Enrollment => "reference enrollment",
            Stage::CameraAcquire => "camera acquisition",
        })
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("a verification attempt is already in progress")]
    AlreadyRunning,
    #[error("model failed to load: {0}")]
    ModelLoad(#[source] ProviderError),
    #[error("no reference face could be read; check {} (close-up, well lit)", .sources.join(", "))]
    NoReferenceFaces { sources: Vec<String> },
    #[error("camera permission denied: {0}")]
    CameraPermission(String),
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("{stage} timed out")]
    Timeout { stage: Stage },
    #[error("embedding provider error: {0}")]
    Provider(#[source] ProviderError),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Map a camera acquisition failure onto the permission / availability split.
    pub fn from_acquire(err: CameraError) -> Self {
        match err {
            CameraError::PermissionDenied(msg) => SessionError::CameraPermission(msg),
            CameraError::Unavailable(msg) => SessionError::CameraUnavailable(msg),
            CameraError::Busy(device) => SessionError::CameraUnavailable(format!("{device} is busy")),
            other => SessionError::Camera(other),
        }
    }
}

impl From<EnrollmentError> for SessionError {
    fn from(err: EnrollmentError) -> Self {
        match err {
            EnrollmentError::NoReferenceFaces { sources } => SessionError::NoReferenceFaces { sources },
            EnrollmentError::Provider { error, .. } => SessionError::Provider(error),
        }
    }
}
