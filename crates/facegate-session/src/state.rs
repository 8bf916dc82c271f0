//! Session states and the per-attempt running flag.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Where the session controller is in a verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Loading,
    CameraActive,
    Polling,
    Verified,
    Stopped,
    Error,
}

impl SessionState {
    /// An attempt is between start and a terminal state.
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            SessionState::Loading | SessionState::CameraActive | SessionState::Polling
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Verified | SessionState::Stopped | SessionState::Error
        )
    }

    /// Start/stop availability while in this state.
    pub fn controls(self) -> ControlState {
        let busy = self.is_in_progress();
        ControlState {
            start_enabled: !busy,
            stop_enabled: busy,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Loading => "loading",
            SessionState::CameraActive => "camera_active",
            SessionState::Polling => "polling",
            SessionState::Verified => "verified",
            SessionState::Stopped => "stopped",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Which user triggers are currently available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlState {
    pub start_enabled: bool,
    pub stop_enabled: bool,
}

/// Identity and running flag of one verification attempt.
///
/// The flag is set at creation and cleared exactly once, by whichever of
/// stop, failure or finalization gets there first. Work that resumes after a
/// suspension point checks it before doing anything observable.
#[derive(Debug)]
pub struct AttemptToken {
    id: Uuid,
    running: AtomicBool,
}

impl AttemptToken {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            running: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Atomically clear the flag. Returns true only for the caller that
    /// observed it set.
    pub fn try_finish(&self) -> bool {
        self.running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
