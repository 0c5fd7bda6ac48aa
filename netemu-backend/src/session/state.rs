use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Lifecycle state of a session.
///
/// ```text
/// Built -> Validated -> Realizing -> Running -> Stopping -> Stopped
///   |          |             |                                ^
///   +----------+-------------+---> Stopping -> Failed         |
///                            +---- (cancelled) ---------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Built,
    Validated,
    Realizing,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    /// No further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }

    /// Graph and binding may still be edited.
    pub fn is_mutable(&self) -> bool {
        *self == SessionState::Built
    }

    /// `start` accepts sessions in these states.
    pub fn can_start(&self) -> bool {
        matches!(self, SessionState::Built | SessionState::Validated)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Built => "built",
            SessionState::Validated => "validated",
            SessionState::Realizing => "realizing",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Requests cancellation of a session that is being realized.
///
/// Cloned handles share the same flag, so one can be moved into a signal
/// handler or another task while the session manager drives the start.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
