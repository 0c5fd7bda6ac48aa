//! Virtualization backends.
//!
//! The session manager never touches the kernel itself. It drives a
//! [`VirtualizationBackend`] through create / connect / start calls and the
//! matching destroy / disconnect / stop calls, and keeps only the opaque handles
//! the backend hands back.
//!
//! Two implementations ship with the crate:
//!
//! * [`linux::LinuxBackend`] - network namespaces, Open vSwitch bridges, veth pairs and `tc`
//! * [`recording::RecordingBackend`] - in-memory call log with fault injection, used by
//!   tests and by `netemu plan`

use anyhow::Result;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use netemu_shared::{ControllerEndpoint, Link, Node};

pub mod linux;
pub mod recording;

pub use linux::{CleanupReport, LinuxBackend, LinuxBackendConfig};
pub use recording::{BackendCall, Fault, RecordingBackend};

/// Handle to a realized host or switch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    id: u64,
    label: String,
}

/// Handle to a realized link
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkHandle {
    id: u64,
    label: String,
}

/// Handle to an established switch-to-controller connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    id: u64,
    label: String,
}

impl NodeHandle {
    pub fn new(id: u64, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl LinkHandle {
    pub fn new(id: u64, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl ConnectionHandle {
    pub fn new(id: u64, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.label, self.id)
    }
}

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.label, self.id)
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.label, self.id)
    }
}

/// Monotonic id source for backend handles.
#[derive(Debug)]
pub struct HandleIds(AtomicU64);

impl Default for HandleIds {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleIds {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Label used for connection handles, e.g. `s1->c0`.
pub fn connection_label(switch: &NodeHandle, endpoint: &ControllerEndpoint) -> String {
    format!("{}->{}", switch.label(), endpoint.name())
}

/// Realizes nodes, links and controller connections.
///
/// Implementations must make `destroy_node`, `destroy_link`, `disconnect` and
/// `stop_switch` idempotent: releasing a handle twice, or a handle the
/// backend no longer knows, succeeds without side effects. `create_link`
/// applies shaping as a unit and removes the half-built link itself when any
/// step fails.
pub trait VirtualizationBackend: Send + Sync {
    fn create_node(&self, node: &Node) -> impl Future<Output = Result<NodeHandle>> + Send;

    fn destroy_node(&self, handle: &NodeHandle) -> impl Future<Output = Result<()>> + Send;

    fn create_link(
        &self,
        a: &NodeHandle,
        b: &NodeHandle,
        link: &Link,
    ) -> impl Future<Output = Result<LinkHandle>> + Send;

    fn destroy_link(&self, handle: &LinkHandle) -> impl Future<Output = Result<()>> + Send;

    fn connect_controller(
        &self,
        switch: &NodeHandle,
        endpoint: &ControllerEndpoint,
    ) -> impl Future<Output = Result<ConnectionHandle>> + Send;

    fn disconnect(&self, handle: &ConnectionHandle) -> impl Future<Output = Result<()>> + Send;

    fn start_switch(&self, switch: &NodeHandle) -> impl Future<Output = Result<()>> + Send;

    fn stop_switch(&self, switch: &NodeHandle) -> impl Future<Output = Result<()>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_ids_are_unique_and_increasing() {
        let ids = HandleIds::new();
        let first = ids.next();
        let second = ids.next();
        assert_eq!(first, 1);
        assert!(second > first);
    }

    #[test]
    fn test_handle_display() {
        let handle = NodeHandle::new(7, "s1");
        assert_eq!(handle.to_string(), "s1#7");
        assert_eq!(handle.label(), "s1");
        assert_eq!(handle.id(), 7);
    }

    #[test]
    fn test_connection_label() {
        let switch = NodeHandle::new(1, "s3");
        let endpoint = ControllerEndpoint::local("c0");
        assert_eq!(connection_label(&switch, &endpoint), "s3->c0");
    }
}
