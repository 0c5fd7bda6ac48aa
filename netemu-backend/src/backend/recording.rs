//! In-memory backend that records every call it receives.
//!
//! `RecordingBackend` realizes nothing. It hands out handles, keeps track of
//! which ones are still live, and appends each call to a log that tests (and
//! `netemu plan`) can inspect. Faults can be injected per call to exercise the
//! unwind paths of the session manager.

use anyhow::{Result, bail};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use netemu_shared::{ControllerEndpoint, Link, Node};

use super::{
    ConnectionHandle, HandleIds, LinkHandle, NodeHandle, VirtualizationBackend, connection_label,
};

/// One backend call, identified by the label of its target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "call", content = "target", rename_all = "kebab-case")]
pub enum BackendCall {
    CreateNode(String),
    DestroyNode(String),
    CreateLink(String),
    DestroyLink(String),
    ConnectController(String),
    Disconnect(String),
    StartSwitch(String),
    StopSwitch(String),
}

impl BackendCall {
    pub fn target(&self) -> &str {
        match self {
            BackendCall::CreateNode(t)
            | BackendCall::DestroyNode(t)
            | BackendCall::CreateLink(t)
            | BackendCall::DestroyLink(t)
            | BackendCall::ConnectController(t)
            | BackendCall::Disconnect(t)
            | BackendCall::StartSwitch(t)
            | BackendCall::StopSwitch(t) => t,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            BackendCall::CreateNode(_) => "create-node",
            BackendCall::DestroyNode(_) => "destroy-node",
            BackendCall::CreateLink(_) => "create-link",
            BackendCall::DestroyLink(_) => "destroy-link",
            BackendCall::ConnectController(_) => "connect-controller",
            BackendCall::Disconnect(_) => "disconnect",
            BackendCall::StartSwitch(_) => "start-switch",
            BackendCall::StopSwitch(_) => "stop-switch",
        }
    }
}

impl fmt::Display for BackendCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.verb(), self.target())
    }
}

/// Misbehaviour injected into a specific call.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Fail every time
    Fail,
    /// Fail the next `n` times, then behave
    FailTimes(u32),
    /// Sleep before completing; the caller's timeout usually fires first
    Hang(Duration),
}

#[derive(Debug, Default)]
struct Recorder {
    calls: Vec<BackendCall>,
    live: BTreeMap<u64, String>,
    running: BTreeSet<String>,
    faults: HashMap<BackendCall, Fault>,
}

/// Backend double that logs calls instead of realizing anything.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    ids: HandleIds,
    recorder: Mutex<Recorder>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject `fault` into every future occurrence of `call`.
    pub fn with_fault(self, call: BackendCall, fault: Fault) -> Self {
        self.inject(call, fault);
        self
    }

    pub fn inject(&self, call: BackendCall, fault: Fault) {
        self.lock().faults.insert(call, fault);
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    /// Return and forget the call log.
    pub fn take_calls(&self) -> Vec<BackendCall> {
        std::mem::take(&mut self.lock().calls)
    }

    /// Labels of node, link and connection handles that were created and not yet released.
    pub fn live_handles(&self) -> Vec<String> {
        self.lock().live.values().cloned().collect()
    }

    /// Switches started and not yet stopped.
    pub fn running_switches(&self) -> Vec<String> {
        self.lock().running.iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Recorder> {
        self.recorder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enter(&self, call: BackendCall) -> Result<()> {
        let fault = {
            let mut recorder = self.lock();
            recorder.calls.push(call.clone());
            match recorder.faults.get_mut(&call) {
                Some(Fault::FailTimes(0)) => {
                    recorder.faults.remove(&call);
                    None
                }
                Some(Fault::FailTimes(n)) => {
                    *n -= 1;
                    Some(Fault::Fail)
                }
                other => other.cloned(),
            }
        };

        debug!("Recorded backend call: {}", call);

        match fault {
            Some(Fault::Fail) | Some(Fault::FailTimes(_)) => {
                bail!("injected failure on {}", call)
            }
            Some(Fault::Hang(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn allocate(&self, label: &str) -> u64 {
        let id = self.ids.next();
        self.lock().live.insert(id, label.to_string());
        id
    }

    fn release(&self, id: u64) {
        self.lock().live.remove(&id);
    }
}

impl VirtualizationBackend for RecordingBackend {
    async fn create_node(&self, node: &Node) -> Result<NodeHandle> {
        self.enter(BackendCall::CreateNode(node.name().to_string()))
            .await?;
        let id = self.allocate(node.name());
        Ok(NodeHandle::new(id, node.name()))
    }

    async fn destroy_node(&self, handle: &NodeHandle) -> Result<()> {
        self.enter(BackendCall::DestroyNode(handle.label().to_string()))
            .await?;
        self.release(handle.id());
        Ok(())
    }

    async fn create_link(&self, a: &NodeHandle, b: &NodeHandle, link: &Link) -> Result<LinkHandle> {
        let label = format!("{}<->{}", a.label(), b.label());
        self.enter(BackendCall::CreateLink(label.clone())).await?;
        debug!("Link {} shaped as {}", label, link.profile());
        let id = self.allocate(&label);
        Ok(LinkHandle::new(id, label))
    }

    async fn destroy_link(&self, handle: &LinkHandle) -> Result<()> {
        self.enter(BackendCall::DestroyLink(handle.label().to_string()))
            .await?;
        self.release(handle.id());
        Ok(())
    }

    async fn connect_controller(
        &self,
        switch: &NodeHandle,
        endpoint: &ControllerEndpoint,
    ) -> Result<ConnectionHandle> {
        let label = connection_label(switch, endpoint);
        self.enter(BackendCall::ConnectController(label.clone()))
            .await?;
        let id = self.allocate(&label);
        Ok(ConnectionHandle::new(id, label))
    }

    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<()> {
        self.enter(BackendCall::Disconnect(handle.label().to_string()))
            .await?;
        self.release(handle.id());
        Ok(())
    }

    async fn start_switch(&self, switch: &NodeHandle) -> Result<()> {
        self.enter(BackendCall::StartSwitch(switch.label().to_string()))
            .await?;
        self.lock().running.insert(switch.label().to_string());
        Ok(())
    }

    async fn stop_switch(&self, switch: &NodeHandle) -> Result<()> {
        self.enter(BackendCall::StopSwitch(switch.label().to_string()))
            .await?;
        self.lock().running.remove(switch.label());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netemu_shared::{ImpairmentProfile, Topology};

    fn small_topology() -> Topology {
        let mut topo = Topology::new("10.0.0.0/24").unwrap();
        topo.add_host("h1", None).unwrap();
        topo.add_switch("s1").unwrap();
        topo.add_link("h1", "s1", ImpairmentProfile::shaped(10.0))
            .unwrap();
        topo
    }

    #[tokio::test]
    async fn test_records_calls_and_tracks_handles() {
        let topo = small_topology();
        let backend = RecordingBackend::new();

        let h1 = backend.create_node(topo.node("h1").unwrap()).await.unwrap();
        let s1 = backend.create_node(topo.node("s1").unwrap()).await.unwrap();
        let link = backend
            .create_link(&h1, &s1, &topo.links()[0])
            .await
            .unwrap();

        assert_eq!(backend.live_handles(), vec!["h1", "s1", "h1<->s1"]);

        backend.destroy_link(&link).await.unwrap();
        backend.destroy_node(&s1).await.unwrap();
        backend.destroy_node(&h1).await.unwrap();
        assert!(backend.live_handles().is_empty());

        let log: Vec<String> = backend.calls().iter().map(|c| c.to_string()).collect();
        assert_eq!(
            log,
            vec![
                "create-node h1",
                "create-node s1",
                "create-link h1<->s1",
                "destroy-link h1<->s1",
                "destroy-node s1",
                "destroy-node h1",
            ]
        );
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let topo = small_topology();
        let backend = RecordingBackend::new();
        let s1 = backend.create_node(topo.node("s1").unwrap()).await.unwrap();

        backend.destroy_node(&s1).await.unwrap();
        backend.destroy_node(&s1).await.unwrap();
        backend.stop_switch(&s1).await.unwrap();
        assert!(backend.live_handles().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_allocates_nothing() {
        let topo = small_topology();
        let backend = RecordingBackend::new()
            .with_fault(BackendCall::CreateNode("s1".to_string()), Fault::Fail);

        assert!(backend.create_node(topo.node("h1").unwrap()).await.is_ok());
        let err = backend
            .create_node(topo.node("s1").unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("create-node s1"));
        assert_eq!(backend.live_handles(), vec!["h1"]);
        assert_eq!(backend.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_fail_times_recovers() {
        let topo = small_topology();
        let backend = RecordingBackend::new()
            .with_fault(BackendCall::CreateNode("h1".to_string()), Fault::FailTimes(2));
        let h1 = topo.node("h1").unwrap();

        assert!(backend.create_node(h1).await.is_err());
        assert!(backend.create_node(h1).await.is_err());
        assert!(backend.create_node(h1).await.is_ok());
        assert!(backend.create_node(h1).await.is_ok());
    }

    #[tokio::test]
    async fn test_hang_is_cut_by_timeout() {
        let backend = RecordingBackend::new().with_fault(
            BackendCall::ConnectController("s1->c0".to_string()),
            Fault::Hang(Duration::from_secs(30)),
        );
        let switch = NodeHandle::new(1, "s1");
        let endpoint = ControllerEndpoint::local("c0");

        let result = tokio::time::timeout(
            Duration::from_millis(20),
            backend.connect_controller(&switch, &endpoint),
        )
        .await;
        assert!(result.is_err());
        assert!(backend.live_handles().is_empty());
    }

    #[test]
    fn test_call_serializes_with_target() {
        let json = serde_json::to_string(&BackendCall::StartSwitch("s1".to_string())).unwrap();
        assert_eq!(json, r#"{"call":"start-switch","target":"s1"}"#);
    }
}
