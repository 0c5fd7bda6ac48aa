//! Session lifecycle driver.
//!
//! Realization runs in four stages, each a barrier for the next:
//!
//! 1. create nodes, in graph order
//! 2. create links, in graph order
//! 3. connect controllers, switch order x endpoint order
//! 4. start switches
//!
//! Every handle is recorded on the session as soon as the backend returns it.
//! On failure or cancellation the recorded handles are released in exact
//! reverse order, and the same reverse walk is used for an explicit stop.

use futures_util::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use tracing::{debug, error, info, instrument, warn};

use netemu_shared::{ControllerBinding, ControllerEndpoint, Link, Node, Topology, TopologyError};

use super::error::{SessionError, Stage, StartError, StartFailure, TeardownError};
use super::state::{SessionState, StopHandle};
use super::{Resource, Session};
use crate::backend::{ConnectionHandle, NodeHandle, VirtualizationBackend, connection_label};
use crate::utils::retry_async;

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Issue the calls of a stage concurrently. Results are still recorded
    /// in graph order and the stage completes before the next one begins.
    pub concurrent_stages: bool,
}

/// Drives sessions through a [`VirtualizationBackend`].
#[derive(Debug)]
pub struct SessionManager<B> {
    backend: B,
    options: SessionOptions,
}

impl<B: VirtualizationBackend> SessionManager<B> {
    pub fn new(backend: B) -> Self {
        Self::with_options(backend, SessionOptions::default())
    }

    pub fn with_options(backend: B, options: SessionOptions) -> Self {
        Self { backend, options }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Build a session from `topology` and `binding` and start it.
    ///
    /// On failure the session is handed back inside the error, already
    /// unwound, so its state and residual resources can be inspected.
    pub async fn start_session(
        &self,
        topology: Topology,
        binding: ControllerBinding,
    ) -> Result<Session, StartFailure> {
        let mut session = Session::new(topology, binding);
        match self.start(&mut session).await {
            Ok(()) => Ok(session),
            Err(error) => Err(StartFailure {
                session: Box::new(session),
                error,
            }),
        }
    }

    /// Validate (if still `Built`) and realize `session`.
    #[instrument(skip_all, fields(
        nodes = session.topology().nodes().len(),
        links = session.topology().links().len()
    ))]
    pub async fn start(&self, session: &mut Session) -> Result<(), StartError> {
        match session.state {
            SessionState::Built => session
                .validate()
                .map_err(|e| StartError::new(Stage::Validate, e))?,
            SessionState::Validated => {}
            state => {
                return Err(StartError::new(
                    Stage::Validate,
                    SessionError::SessionAlreadyStarted { state },
                ));
            }
        }

        session.state = SessionState::Realizing;
        info!(
            "Realizing session: {} nodes, {} links, {} controller endpoints",
            session.topology.nodes().len(),
            session.topology.links().len(),
            session.binding.endpoints().len()
        );

        let stop = session.stop.clone();
        let result = self
            .realize(
                &session.topology,
                &session.binding,
                &mut session.resources,
                &stop,
            )
            .await;

        match result {
            Ok(()) => {
                session.state = SessionState::Running;
                info!(
                    "Session running with {} backend resources",
                    session.resources.len()
                );
                Ok(())
            }
            Err((stage, cause)) => {
                let cancelled = matches!(cause, SessionError::Cancelled);
                if cancelled {
                    warn!("Start cancelled during {}, unwinding", stage);
                } else {
                    error!("Start aborted during {}: {}", stage, cause);
                }

                session.state = SessionState::Stopping;
                let teardown = self.unwind(session).await;
                session.state = if cancelled {
                    SessionState::Stopped
                } else {
                    SessionState::Failed
                };

                Err(StartError {
                    stage,
                    cause,
                    teardown,
                })
            }
        }
    }

    /// Tear a running session down in exact reverse creation order.
    ///
    /// Every release is attempted; all failures are returned together. On a
    /// session that is not running this is a no-op.
    #[instrument(skip_all, fields(state = %session.state()))]
    pub async fn stop_session(&self, session: &mut Session) -> Result<(), TeardownError> {
        match session.state {
            SessionState::Running | SessionState::Realizing | SessionState::Stopping => {}
            state => {
                debug!("Stop requested on {} session, nothing to do", state);
                return Ok(());
            }
        }

        info!(
            "Stopping session with {} backend resources",
            session.resources.len()
        );
        session.state = SessionState::Stopping;
        let errors = self.unwind(session).await;
        session.state = SessionState::Stopped;

        if errors.is_empty() {
            info!("Session stopped");
            Ok(())
        } else {
            warn!(
                "Session stopped with {} teardown errors, {} residual resources",
                errors.len(),
                session.residual.len()
            );
            Err(TeardownError { errors })
        }
    }

    async fn realize<'a>(
        &self,
        topology: &'a Topology,
        binding: &'a ControllerBinding,
        resources: &mut Vec<Resource>,
        stop: &StopHandle,
    ) -> Result<(), (Stage, SessionError)> {
        let backend = &self.backend;
        let mut handles: HashMap<&'a str, NodeHandle> = HashMap::new();

        self.run_stage(
            Stage::CreateNodes,
            topology.nodes(),
            stop,
            move |node: &'a Node| async move {
                backend
                    .create_node(node)
                    .await
                    .map_err(|e| SessionError::backend(Stage::CreateNodes, node.name(), e))
            },
            |node, handle: NodeHandle| {
                resources.push(Resource::Node(handle.clone()));
                handles.insert(node.name(), handle);
            },
        )
        .await
        .map_err(|e| (Stage::CreateNodes, e))?;

        let node_handles = &handles;
        self.run_stage(
            Stage::CreateLinks,
            topology.links(),
            stop,
            move |link: &'a Link| async move {
                let (a, b) = link.endpoints();
                let (Some(ha), Some(hb)) = (node_handles.get(a), node_handles.get(b)) else {
                    return Err(SessionError::Topology(TopologyError::UnknownNode {
                        name: (if node_handles.contains_key(a) { b } else { a }).to_string(),
                    }));
                };
                backend
                    .create_link(ha, hb, link)
                    .await
                    .map_err(|e| SessionError::backend(Stage::CreateLinks, link.to_string(), e))
            },
            |_, handle| resources.push(Resource::Link(handle)),
        )
        .await
        .map_err(|e| (Stage::CreateLinks, e))?;

        let mut connections: Vec<(NodeHandle, &'a ControllerEndpoint)> = Vec::new();
        let mut switches: Vec<NodeHandle> = Vec::new();
        for switch in topology.switches() {
            let handle = node_handles.get(switch.name()).cloned().ok_or_else(|| {
                (
                    Stage::ConnectControllers,
                    SessionError::Topology(TopologyError::UnknownSwitch {
                        name: switch.name().to_string(),
                    }),
                )
            })?;
            let endpoints = binding
                .endpoints_for(topology, switch.name())
                .map_err(|e| (Stage::ConnectControllers, e.into()))?;
            for endpoint in endpoints {
                connections.push((handle.clone(), endpoint));
            }
            switches.push(handle);
        }

        self.run_stage(
            Stage::ConnectControllers,
            &connections,
            stop,
            move |(switch, endpoint)| self.connect(switch, endpoint),
            |_, handle| resources.push(Resource::Connection(handle)),
        )
        .await
        .map_err(|e| (Stage::ConnectControllers, e))?;

        self.run_stage(
            Stage::StartSwitches,
            &switches,
            stop,
            move |switch| async move {
                backend
                    .start_switch(switch)
                    .await
                    .map_err(|e| SessionError::backend(Stage::StartSwitches, switch.label(), e))
            },
            |switch, ()| resources.push(Resource::SwitchStarted(switch.clone())),
        )
        .await
        .map_err(|e| (Stage::StartSwitches, e))?;

        Ok(())
    }

    /// Run one stage over `items`, recording each successful result in item order.
    ///
    /// Cancellation is checked before every call in sequential mode, and
    /// before and after the whole batch in concurrent mode.
    async fn run_stage<'a, I, T, F, Fut, R>(
        &self,
        stage: Stage,
        items: &'a [I],
        stop: &StopHandle,
        call: F,
        mut record: R,
    ) -> Result<(), SessionError>
    where
        F: Fn(&'a I) -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
        R: FnMut(&'a I, T),
    {
        debug!("Stage {} begins with {} calls", stage, items.len());

        if self.options.concurrent_stages {
            if stop.is_stop_requested() {
                return Err(SessionError::Cancelled);
            }

            let results = join_all(items.iter().map(&call)).await;
            let mut first_error = None;
            for (item, result) in items.iter().zip(results) {
                match result {
                    Ok(value) => record(item, value),
                    Err(e) if first_error.is_none() => first_error = Some(e),
                    Err(e) => warn!("Additional failure during {}: {}", stage, e),
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        } else {
            for item in items {
                if stop.is_stop_requested() {
                    return Err(SessionError::Cancelled);
                }
                let value = call(item).await?;
                record(item, value);
            }
        }

        if stop.is_stop_requested() {
            return Err(SessionError::Cancelled);
        }

        debug!("Stage {} complete", stage);
        Ok(())
    }

    /// Connect `switch` to `endpoint`, bounding each attempt by the endpoint
    /// timeout and retrying as its policy allows.
    async fn connect(
        &self,
        switch: &NodeHandle,
        endpoint: &ControllerEndpoint,
    ) -> Result<ConnectionHandle, SessionError> {
        let backend = &self.backend;
        let timeout = endpoint.connect_timeout;
        let target = connection_label(switch, endpoint);

        retry_async(
            move || async move {
                match tokio::time::timeout(timeout, backend.connect_controller(switch, endpoint))
                    .await
                {
                    Ok(Ok(handle)) => Ok(handle),
                    Ok(Err(e)) => Err(SessionError::backend(
                        Stage::ConnectControllers,
                        connection_label(switch, endpoint),
                        e,
                    )),
                    Err(_) => Err(SessionError::ConnectionTimeout {
                        switch: switch.label().to_string(),
                        endpoint: endpoint.name().to_string(),
                        timeout,
                    }),
                }
            },
            &endpoint.retry,
            &target,
        )
        .await
    }

    /// Release every recorded resource, newest first. Failures are collected
    /// and the failed resources moved to the residual list.
    async fn unwind(&self, session: &mut Session) -> Vec<SessionError> {
        let mut errors = Vec::new();

        while let Some(resource) = session.resources.pop() {
            let result = match &resource {
                Resource::SwitchStarted(handle) => self.backend.stop_switch(handle).await,
                Resource::Connection(handle) => self.backend.disconnect(handle).await,
                Resource::Link(handle) => self.backend.destroy_link(handle).await,
                Resource::Node(handle) => self.backend.destroy_node(handle).await,
            };

            let stage = resource.release_stage();
            match result {
                Ok(()) => debug!("Released {} ({})", resource.label(), stage),
                Err(e) => {
                    warn!("Failed to release {} during {}: {:#}", resource.label(), stage, e);
                    errors.push(SessionError::backend(stage, resource.label(), e));
                    session.residual.push(resource);
                }
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCall, Fault, RecordingBackend};
    use netemu_shared::ImpairmentProfile;

    fn pair() -> (Topology, ControllerBinding) {
        let mut topo = Topology::new("10.0.0.0/8").unwrap();
        topo.add_host("h1", None).unwrap();
        topo.add_switch("s1").unwrap();
        topo.add_link("h1", "s1", ImpairmentProfile::shaped(10.0)).unwrap();
        let mut binding = ControllerBinding::new();
        binding.add_endpoint("c0", "127.0.0.1", 6653).unwrap();
        (topo, binding)
    }

    fn log(backend: &RecordingBackend) -> Vec<String> {
        backend.calls().iter().map(|c| c.to_string()).collect()
    }

    #[tokio::test]
    async fn test_start_and_stop_pair() {
        let (topo, binding) = pair();
        let manager = SessionManager::new(RecordingBackend::new());

        let mut session = manager.start_session(topo, binding).await.unwrap();
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.resources().len(), 5);

        manager.stop_session(&mut session).await.unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.resources().is_empty());
        assert_eq!(
            log(manager.backend()),
            vec![
                "create-node h1",
                "create-node s1",
                "create-link h1<->s1",
                "connect-controller s1->c0",
                "start-switch s1",
                "stop-switch s1",
                "disconnect s1->c0",
                "destroy-link h1<->s1",
                "destroy-node s1",
                "destroy-node h1",
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_session_issues_no_backend_call() {
        let mut topo = Topology::new("10.0.0.0/8").unwrap();
        topo.add_switch("s1").unwrap();
        let manager = SessionManager::new(RecordingBackend::new());

        let failure = manager
            .start_session(topo, ControllerBinding::new())
            .await
            .unwrap_err();
        assert_eq!(failure.error.stage, Stage::Validate);
        assert!(matches!(
            failure.error.cause,
            SessionError::Topology(TopologyError::UnboundSwitch { .. })
        ));
        assert_eq!(failure.session.state(), SessionState::Failed);
        assert!(manager.backend().calls().is_empty());
    }

    #[tokio::test]
    async fn test_link_failure_unwinds_nodes() {
        let (topo, binding) = pair();
        let backend = RecordingBackend::new()
            .with_fault(BackendCall::CreateLink("h1<->s1".to_string()), Fault::Fail);
        let manager = SessionManager::new(backend);

        let failure = manager.start_session(topo, binding).await.unwrap_err();
        assert_eq!(failure.error.stage, Stage::CreateLinks);
        assert!(matches!(
            failure.error.cause,
            SessionError::BackendFailure {
                stage: Stage::CreateLinks,
                ..
            }
        ));
        assert!(failure.error.teardown.is_empty());
        assert_eq!(failure.session.state(), SessionState::Failed);
        assert!(manager.backend().live_handles().is_empty());
        assert_eq!(
            log(manager.backend())[3..],
            ["destroy-node s1", "destroy-node h1"]
        );
    }

    #[tokio::test]
    async fn test_teardown_failure_is_secondary_and_residual() {
        let (topo, binding) = pair();
        let backend = RecordingBackend::new()
            .with_fault(BackendCall::StartSwitch("s1".to_string()), Fault::Fail)
            .with_fault(BackendCall::DestroyNode("h1".to_string()), Fault::Fail);
        let manager = SessionManager::new(backend);

        let failure = manager.start_session(topo, binding).await.unwrap_err();
        assert_eq!(failure.error.stage, Stage::StartSwitches);
        assert_eq!(failure.error.teardown.len(), 1);
        assert_eq!(failure.session.residual().len(), 1);
        assert_eq!(failure.session.residual()[0].label(), "h1");
        assert_eq!(manager.backend().live_handles(), vec!["h1"]);
    }

    #[tokio::test]
    async fn test_retry_policy_is_honoured() {
        let (topo, _) = pair();
        let mut binding = ControllerBinding::new();
        binding
            .add_endpoint_config(
                ControllerEndpoint::new("c0", "127.0.0.1", 6653)
                    .unwrap()
                    .with_retry(netemu_shared::RetryPolicy::attempts(
                        3,
                        std::time::Duration::from_millis(1),
                    )),
            )
            .unwrap();
        let backend = RecordingBackend::new().with_fault(
            BackendCall::ConnectController("s1->c0".to_string()),
            Fault::FailTimes(2),
        );
        let manager = SessionManager::new(backend);

        let session = manager.start_session(topo, binding).await.unwrap();
        assert_eq!(session.state(), SessionState::Running);
        let connects = manager
            .backend()
            .calls()
            .into_iter()
            .filter(|c| matches!(c, BackendCall::ConnectController(_)))
            .count();
        assert_eq!(connects, 3);
    }

    #[tokio::test]
    async fn test_steep_backoff_is_capped() {
        let (topo, _) = pair();
        let mut retry =
            netemu_shared::RetryPolicy::attempts(2, std::time::Duration::from_millis(1));
        retry.backoff_multiplier = 1e30;
        let mut binding = ControllerBinding::new();
        binding
            .add_endpoint_config(
                ControllerEndpoint::new("c0", "127.0.0.1", 6653)
                    .unwrap()
                    .with_retry(retry),
            )
            .unwrap();
        let backend = RecordingBackend::new().with_fault(
            BackendCall::ConnectController("s1->c0".to_string()),
            Fault::FailTimes(1),
        );
        let manager = SessionManager::new(backend);

        let session = manager.start_session(topo, binding).await.unwrap();
        assert_eq!(session.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (topo, binding) = pair();
        let manager = SessionManager::new(RecordingBackend::new());
        let mut session = manager.start_session(topo, binding).await.unwrap();
        let calls_before = manager.backend().calls().len();

        let err = manager.start(&mut session).await.unwrap_err();
        assert!(matches!(
            err.cause,
            SessionError::SessionAlreadyStarted {
                state: SessionState::Running
            }
        ));
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(manager.backend().calls().len(), calls_before);
    }

    #[tokio::test]
    async fn test_stop_on_unstarted_session_is_noop() {
        let (topo, binding) = pair();
        let manager = SessionManager::new(RecordingBackend::new());
        let mut session = Session::new(topo, binding);

        manager.stop_session(&mut session).await.unwrap();
        assert_eq!(session.state(), SessionState::Built);

        session.validate().unwrap();
        manager.stop_session(&mut session).await.unwrap();
        assert_eq!(session.state(), SessionState::Validated);
        assert!(manager.backend().calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_start_lands_in_stopped() {
        let (topo, binding) = pair();
        let manager = SessionManager::new(RecordingBackend::new());
        let mut session = Session::new(topo, binding);
        session.stop_handle().request_stop();

        let err = manager.start(&mut session).await.unwrap_err();
        assert!(matches!(err.cause, SessionError::Cancelled));
        assert_eq!(err.stage, Stage::CreateNodes);
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(manager.backend().calls().is_empty());
    }
}
