//! Callbacks through which the session reaches its presentation layer.

use crate::state::{ControlState, SessionState};

/// Presentation hooks: status text, control availability, preview surface and
/// navigation.
///
/// Called synchronously from the controller. Implementations must not call
/// back into the controller from inside a callback.
pub trait SessionObserver: Send + Sync {
    /// Human-readable status line. Informational only.
    fn status(&self, text: &str);

    fn state_changed(&self, _state: SessionState) {}

    fn controls(&self, _controls: ControlState) {}

    /// Camera preview bound (`true`) or detached (`false`).
    fn surface(&self, _attached: bool) {}

    /// Leave for the protected destination after a successful verification.
    fn navigate(&self, destination: &str);
}
