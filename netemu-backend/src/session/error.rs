use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use netemu_shared::TopologyError;

use super::Session;
use super::state::SessionState;

/// Phase of the session lifecycle a backend call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Validate,
    CreateNodes,
    CreateLinks,
    ConnectControllers,
    StartSwitches,
    StopSwitches,
    DisconnectControllers,
    DestroyLinks,
    DestroyNodes,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validate => "validate",
            Stage::CreateNodes => "create-nodes",
            Stage::CreateLinks => "create-links",
            Stage::ConnectControllers => "connect-controllers",
            Stage::StartSwitches => "start-switches",
            Stage::StopSwitches => "stop-switches",
            Stage::DisconnectControllers => "disconnect-controllers",
            Stage::DestroyLinks => "destroy-links",
            Stage::DestroyNodes => "destroy-nodes",
        };
        write!(f, "{}", name)
    }
}

/// Errors raised while driving a session through its lifecycle
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("Session already started (state: {state})")]
    SessionAlreadyStarted { state: SessionState },

    #[error("Backend failure during {stage} on '{target}': {source:#}")]
    BackendFailure {
        stage: Stage,
        target: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Controller '{endpoint}' did not answer switch '{switch}' within {timeout:?}")]
    ConnectionTimeout {
        switch: String,
        endpoint: String,
        timeout: Duration,
    },

    #[error("Session start was cancelled")]
    Cancelled,
}

impl SessionError {
    /// Create a BackendFailure error for a call on `target`
    pub fn backend(stage: Stage, target: impl Into<String>, source: anyhow::Error) -> Self {
        SessionError::BackendFailure {
            stage,
            target: target.into(),
            source,
        }
    }
}

/// Why a session did not reach `Running`.
///
/// `cause` is the error that aborted the start; `teardown` lists the
/// failures met while unwinding what had already been created.
#[derive(Error, Debug)]
#[error("{}", display_start_error(.stage, .cause, .teardown))]
pub struct StartError {
    pub stage: Stage,
    #[source]
    pub cause: SessionError,
    pub teardown: Vec<SessionError>,
}

fn display_start_error(stage: &Stage, cause: &SessionError, teardown: &[SessionError]) -> String {
    if teardown.is_empty() {
        format!("Session start failed during {}: {}", stage, cause)
    } else {
        format!(
            "Session start failed during {}: {} ({} teardown errors)",
            stage,
            cause,
            teardown.len()
        )
    }
}

impl StartError {
    pub fn new(stage: Stage, cause: SessionError) -> Self {
        Self {
            stage,
            cause,
            teardown: Vec::new(),
        }
    }
}

/// A failed `start_session`, returning the session for inspection.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct StartFailure {
    pub session: Box<Session>,
    #[source]
    pub error: StartError,
}

/// Every failure met while tearing a session down.
#[derive(Error, Debug)]
#[error("{}", display_teardown(.errors))]
pub struct TeardownError {
    pub errors: Vec<SessionError>,
}

fn display_teardown(errors: &[SessionError]) -> String {
    let details: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    format!(
        "Teardown finished with {} error(s): {}",
        errors.len(),
        details.join("; ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_failure_display() {
        let err = SessionError::backend(
            Stage::CreateLinks,
            "h1<->s1",
            anyhow::anyhow!("veth exists"),
        );
        assert_eq!(
            err.to_string(),
            "Backend failure during create-links on 'h1<->s1': veth exists"
        );
    }

    #[test]
    fn test_topology_error_is_transparent() {
        let err: SessionError = TopologyError::UnknownSwitch {
            name: "s9".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "Unknown switch 's9'");
    }

    #[test]
    fn test_start_error_mentions_teardown() {
        let mut err = StartError::new(Stage::ConnectControllers, SessionError::Cancelled);
        assert_eq!(
            err.to_string(),
            "Session start failed during connect-controllers: Session start was cancelled"
        );

        err.teardown.push(SessionError::backend(
            Stage::DestroyNodes,
            "h1",
            anyhow::anyhow!("busy"),
        ));
        assert!(err.to_string().ends_with("(1 teardown errors)"));
    }

    #[test]
    fn test_teardown_error_lists_every_failure() {
        let err = TeardownError {
            errors: vec![
                SessionError::backend(Stage::DestroyLinks, "s1<->s2", anyhow::anyhow!("a")),
                SessionError::backend(Stage::DestroyNodes, "s1", anyhow::anyhow!("b")),
            ],
        };
        let text = err.to_string();
        assert!(text.starts_with("Teardown finished with 2 error(s)"));
        assert!(text.contains("s1<->s2"));
        assert!(text.contains("'s1'"));
    }
}
