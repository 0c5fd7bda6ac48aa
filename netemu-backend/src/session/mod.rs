//! Emulation sessions.
//!
//! A [`Session`] owns one topology, its controller binding and the backend
//! handles created while realizing it. Sessions are plain values: any number
//! of them can coexist, each driven by a [`SessionManager`].
//!
//! The graph and binding can be edited only while the session is `Built`;
//! afterwards every mutator fails with `SessionAlreadyStarted`.

use serde::Serialize;
use tracing::warn;

use netemu_shared::{
    ControllerBinding, ControllerEndpoint, ImpairmentProfile, Link, Node, NodeKind, Topology,
};

use crate::backend::{ConnectionHandle, LinkHandle, NodeHandle};

mod error;
mod manager;
mod state;

pub use error::{SessionError, Stage, StartError, StartFailure, TeardownError};
pub use manager::{SessionManager, SessionOptions};
pub use state::{SessionState, StopHandle};

/// A backend resource owned by a session, in creation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Node(NodeHandle),
    Link(LinkHandle),
    Connection(ConnectionHandle),
    /// A started switch; releasing it means stopping the switch
    SwitchStarted(NodeHandle),
}

impl Resource {
    pub fn label(&self) -> &str {
        match self {
            Resource::Node(h) | Resource::SwitchStarted(h) => h.label(),
            Resource::Link(h) => h.label(),
            Resource::Connection(h) => h.label(),
        }
    }

    /// Teardown stage that releases this resource
    pub fn release_stage(&self) -> Stage {
        match self {
            Resource::Node(_) => Stage::DestroyNodes,
            Resource::Link(_) => Stage::DestroyLinks,
            Resource::Connection(_) => Stage::DisconnectControllers,
            Resource::SwitchStarted(_) => Stage::StopSwitches,
        }
    }
}

/// Summary of a session, for logs and `netemu plan --json`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary<'a> {
    pub state: SessionState,
    pub topology: &'a Topology,
    pub binding: &'a ControllerBinding,
    pub resources: Vec<String>,
    pub residual: Vec<String>,
}

#[derive(Debug)]
pub struct Session {
    topology: Topology,
    binding: ControllerBinding,
    state: SessionState,
    resources: Vec<Resource>,
    residual: Vec<Resource>,
    stop: StopHandle,
}

impl Session {
    pub fn new(topology: Topology, binding: ControllerBinding) -> Self {
        Self {
            topology,
            binding,
            state: SessionState::Built,
            resources: Vec::new(),
            residual: Vec::new(),
            stop: StopHandle::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn binding(&self) -> &ControllerBinding {
        &self.binding
    }

    /// Live backend resources, in creation order.
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Resources whose release failed during the last teardown.
    pub fn residual(&self) -> &[Resource] {
        &self.residual
    }

    /// Handle that cancels an in-progress start from another task.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn summary(&self) -> SessionSummary<'_> {
        SessionSummary {
            state: self.state,
            topology: &self.topology,
            binding: &self.binding,
            resources: self.resources.iter().map(|r| r.label().to_string()).collect(),
            residual: self.residual.iter().map(|r| r.label().to_string()).collect(),
        }
    }

    fn ensure_mutable(&self) -> Result<(), SessionError> {
        if self.state.is_mutable() {
            Ok(())
        } else {
            Err(SessionError::SessionAlreadyStarted { state: self.state })
        }
    }

    pub fn add_host(&mut self, name: &str, address: Option<&str>) -> Result<&Node, SessionError> {
        self.ensure_mutable()?;
        Ok(self.topology.add_host(name, address)?)
    }

    pub fn add_switch(&mut self, name: &str) -> Result<&Node, SessionError> {
        self.ensure_mutable()?;
        Ok(self.topology.add_switch(name)?)
    }

    pub fn add_node(
        &mut self,
        name: &str,
        kind: NodeKind,
        address: Option<&str>,
        default_route: bool,
    ) -> Result<&Node, SessionError> {
        self.ensure_mutable()?;
        Ok(self.topology.add_node(name, kind, address, default_route)?)
    }

    pub fn add_link(
        &mut self,
        a: &str,
        b: &str,
        profile: ImpairmentProfile,
    ) -> Result<&Link, SessionError> {
        self.ensure_mutable()?;
        Ok(self.topology.add_link(a, b, profile)?)
    }

    pub fn add_endpoint(
        &mut self,
        name: &str,
        address: &str,
        port: u16,
    ) -> Result<&ControllerEndpoint, SessionError> {
        self.ensure_mutable()?;
        Ok(self.binding.add_endpoint(name, address, port)?)
    }

    pub fn add_endpoint_config(
        &mut self,
        endpoint: ControllerEndpoint,
    ) -> Result<&ControllerEndpoint, SessionError> {
        self.ensure_mutable()?;
        Ok(self.binding.add_endpoint_config(endpoint)?)
    }

    pub fn bind(&mut self, switch: &str, endpoints: &[&str]) -> Result<(), SessionError> {
        self.ensure_mutable()?;
        Ok(self.binding.bind(switch, endpoints)?)
    }

    /// Check the whole graph and binding: `Built -> Validated`, or `Failed`
    /// with the first violation.
    pub fn validate(&mut self) -> Result<(), SessionError> {
        self.ensure_mutable()?;

        let result = self
            .topology
            .validate()
            .and_then(|_| self.binding.validate(&self.topology));

        match result {
            Ok(()) => {
                self.state = SessionState::Validated;
                Ok(())
            }
            Err(e) => {
                warn!("Session validation failed: {}", e);
                self.state = SessionState::Failed;
                Err(e.into())
            }
        }
    }
}
