//! Linux backend: namespaces, Open vSwitch bridges, veth pairs and `tc`.
//!
//! Each host becomes a named network namespace `<prefix><host>` and each switch
//! an OVS bridge `<prefix><switch>`. A link is a veth pair whose ends are named
//! `<prefix><node>-eth<N>`; host ports count from 0 and switch ports from 1. The
//! first host port carries the host address and, when requested, the default route.
//!
//! Every step shells out to `ip`, `ovs-vsctl` or `tc` through
//! `tokio::process`, prefixed with `sudo` when not running as root.

use anyhow::{Context, Result, anyhow, bail};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::process::Output;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use netemu_shared::{
    ControllerAddress, ControllerEndpoint, ImpairmentProfile, LOCAL_CONTROLLER, Link, Node,
    NodeKind,
};

use super::{
    ConnectionHandle, HandleIds, LinkHandle, NodeHandle, VirtualizationBackend, connection_label,
};
use crate::netns;
use crate::tc;

/// Linux interface names are limited to 15 bytes
const MAX_IFNAME_LEN: usize = 15;

/// Command output fragments that mean "already gone"
const MISSING_MARKERS: &[&str] = &[
    "Cannot find device",
    "No such file or directory",
    "does not exist",
    "no bridge named",
    "no port named",
];

#[derive(Debug, Clone)]
pub struct LinuxBackendConfig {
    /// Prefix for namespaces and bridges, e.g. `nemu-`
    pub namespace_prefix: String,
    /// Run every command through `sudo`
    pub use_sudo: bool,
    /// Prefix length of the topology address space, used for host addresses
    pub address_prefix_len: u8,
}

impl Default for LinuxBackendConfig {
    fn default() -> Self {
        Self {
            namespace_prefix: "nemu-".to_string(),
            use_sudo: !nix::unistd::geteuid().is_root(),
            address_prefix_len: 8,
        }
    }
}

impl LinuxBackendConfig {
    pub fn new(namespace_prefix: &str, force_sudo: bool, address_prefix_len: u8) -> Self {
        Self {
            namespace_prefix: namespace_prefix.to_string(),
            use_sudo: force_sudo || !nix::unistd::geteuid().is_root(),
            address_prefix_len,
        }
    }
}

/// Resources removed by [`LinuxBackend::cleanup`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    pub namespaces: Vec<String>,
    pub bridges: Vec<String>,
    /// veth ends left in the root namespace
    pub links: Vec<String>,
}

#[derive(Debug, Clone)]
struct RealizedNode {
    kind: NodeKind,
    /// Namespace for hosts, bridge for switches
    device: String,
    address: Option<Ipv4Addr>,
    default_route: bool,
    next_port: u32,
}

#[derive(Debug, Clone)]
struct HostAddressing {
    address: Ipv4Addr,
    default_route: bool,
}

#[derive(Debug, Clone)]
struct LinkEnd {
    iface: String,
    /// Set for host ends
    namespace: Option<String>,
    /// Set for switch ends
    bridge: Option<String>,
    addressing: Option<HostAddressing>,
}

#[derive(Debug, Clone)]
struct RealizedConnection {
    bridge: String,
    /// `local` or an OVS target such as `tcp:127.0.0.1:6653`
    target: String,
}

#[derive(Debug, Default)]
struct LinuxState {
    nodes: HashMap<u64, RealizedNode>,
    links: HashMap<u64, [LinkEnd; 2]>,
    connections: HashMap<u64, RealizedConnection>,
}

impl LinuxState {
    fn allocate_end(&mut self, handle: &NodeHandle) -> Result<LinkEnd> {
        let node = self
            .nodes
            .get_mut(&handle.id())
            .ok_or_else(|| anyhow!("unknown node handle {}", handle))?;

        let port = node.next_port;
        node.next_port += 1;

        let iface = format!("{}-eth{}", node.device, port);
        check_ifname(&iface)?;

        Ok(match node.kind {
            NodeKind::Host => LinkEnd {
                iface,
                namespace: Some(node.device.clone()),
                bridge: None,
                addressing: match (port, node.address) {
                    (0, Some(address)) => Some(HostAddressing {
                        address,
                        default_route: node.default_route,
                    }),
                    _ => None,
                },
            },
            NodeKind::Switch => LinkEnd {
                iface,
                namespace: None,
                bridge: Some(node.device.clone()),
                addressing: None,
            },
        })
    }

    /// Remote targets and local flag of `bridge`, with `pending` counted as
    /// the newest connection.
    fn controllers_of(
        &self,
        bridge: &str,
        pending: Option<&RealizedConnection>,
    ) -> (Vec<String>, bool) {
        let mut ids: Vec<(&u64, &RealizedConnection)> = self
            .connections
            .iter()
            .filter(|(_, c)| c.bridge == bridge)
            .collect();
        ids.sort_by_key(|(id, _)| **id);

        let connections = ids
            .into_iter()
            .map(|(_, c)| c)
            .chain(pending.filter(|c| c.bridge == bridge));

        let mut remote = Vec::new();
        let mut local = false;
        for connection in connections {
            if connection.target == LOCAL_CONTROLLER {
                local = true;
            } else {
                remote.push(connection.target.clone());
            }
        }
        (remote, local)
    }
}

fn check_ifname(name: &str) -> Result<()> {
    if name.len() > MAX_IFNAME_LEN {
        bail!(
            "interface name '{}' exceeds {} characters, use shorter node names or prefix",
            name,
            MAX_IFNAME_LEN
        );
    }
    Ok(())
}

fn is_missing(output: &Output) -> bool {
    let stderr = String::from_utf8_lossy(&output.stderr);
    MISSING_MARKERS.iter().any(|m| stderr.contains(m))
}

/// Realizes topologies on the local Linux kernel.
#[derive(Debug)]
pub struct LinuxBackend {
    config: LinuxBackendConfig,
    ids: HandleIds,
    state: Mutex<LinuxState>,
}

impl LinuxBackend {
    pub fn new(config: LinuxBackendConfig) -> Self {
        if config.use_sudo {
            debug!("Commands will run through sudo");
        }
        Self {
            config,
            ids: HandleIds::new(),
            state: Mutex::new(LinuxState::default()),
        }
    }

    pub fn config(&self) -> &LinuxBackendConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, LinuxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn output(&self, program: &str, args: &[String]) -> Result<Output> {
        debug!("Running: {} {}", program, args.join(" "));
        let mut cmd = if self.config.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(program);
            cmd
        } else {
            Command::new(program)
        };
        cmd.args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to spawn {}", program))
    }

    /// Run a command, bailing with stderr on a non-zero exit.
    async fn run(&self, program: &str, args: &[String], ctx: &str) -> Result<String> {
        let output = self.output(program, args).await?;
        if !output.status.success() {
            bail!(
                "{}: {} {}\n{}",
                ctx,
                program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Like `run`, but an already-removed target counts as success.
    async fn run_release(&self, program: &str, args: &[String], ctx: &str) -> Result<()> {
        let output = self.output(program, args).await?;
        if output.status.success() || is_missing(&output) {
            return Ok(());
        }
        bail!(
            "{}: {} {}\n{}",
            ctx,
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )
    }

    async fn attach_end(&self, end: &LinkEnd) -> Result<()> {
        let iface = end.iface.clone();
        match (&end.namespace, &end.bridge) {
            (Some(ns), _) => {
                self.run(
                    "ip",
                    &args(["link", "set", &iface, "netns", ns]),
                    "move veth into host namespace",
                )
                .await?;
                self.run(
                    "ip",
                    &args(["-n", ns, "link", "set", &iface, "up"]),
                    "bring host port up",
                )
                .await?;
                if let Some(addressing) = &end.addressing {
                    let cidr = format!(
                        "{}/{}",
                        addressing.address, self.config.address_prefix_len
                    );
                    self.run(
                        "ip",
                        &args(["-n", ns, "addr", "add", &cidr, "dev", &iface]),
                        "assign host address",
                    )
                    .await?;
                    if addressing.default_route {
                        self.run(
                            "ip",
                            &args(["-n", ns, "route", "add", "default", "dev", &iface]),
                            "add default route",
                        )
                        .await?;
                    }
                }
            }
            (None, Some(bridge)) => {
                self.run(
                    "ovs-vsctl",
                    &args(["add-port", bridge, &iface]),
                    "attach port to bridge",
                )
                .await?;
                self.run("ip", &args(["link", "set", &iface, "up"]), "bring switch port up")
                    .await?;
            }
            (None, None) => bail!("link end {} has no owner", iface),
        }
        Ok(())
    }

    async fn shape_end(&self, end: &LinkEnd, profile: &ImpairmentProfile) -> Result<()> {
        for command in tc::shaping_commands(&end.iface, end.namespace.as_deref(), profile) {
            self.run("tc", &command.args(), "apply shaping").await?;
        }
        Ok(())
    }

    async fn build_link(&self, ends: &[LinkEnd; 2], profile: &ImpairmentProfile) -> Result<()> {
        self.run(
            "ip",
            &args([
                "link",
                "add",
                &ends[0].iface,
                "type",
                "veth",
                "peer",
                "name",
                &ends[1].iface,
            ]),
            "create veth pair",
        )
        .await?;

        for end in ends {
            self.attach_end(end).await?;
        }
        for end in ends {
            self.shape_end(end, profile).await?;
        }
        Ok(())
    }

    /// Remove both ends of a veth pair wherever they currently live.
    async fn remove_link(&self, ends: &[LinkEnd; 2]) -> Result<()> {
        let mut first_error = None;

        for end in ends {
            let mut steps = Vec::new();
            if let Some(bridge) = &end.bridge {
                steps.push((
                    "ovs-vsctl",
                    args(["--if-exists", "del-port", bridge, &end.iface]),
                ));
            }
            if let Some(ns) = &end.namespace {
                steps.push(("ip", args(["-n", ns, "link", "del", &end.iface])));
            }
            steps.push(("ip", args(["link", "del", &end.iface])));

            for (program, step) in steps {
                if let Err(e) = self.run_release(program, &step, "remove veth").await {
                    warn!("{}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Push the controller list of `bridge`, plus `pending`, to OVS.
    async fn apply_controllers(
        &self,
        bridge: &str,
        pending: Option<&RealizedConnection>,
    ) -> Result<()> {
        let (remote, local) = self.lock().controllers_of(bridge, pending);

        if remote.is_empty() {
            self.run_release(
                "ovs-vsctl",
                &args(["del-controller", bridge]),
                "clear controllers",
            )
            .await?;
        } else {
            let mut cmd = args(["set-controller", bridge]);
            cmd.extend(remote);
            self.run("ovs-vsctl", &cmd, "set controllers").await?;
        }

        if local {
            self.run(
                "ovs-vsctl",
                &args(["set-fail-mode", bridge, "standalone"]),
                "enable local controller",
            )
            .await?;
        }
        Ok(())
    }

    fn bridge_of(&self, switch: &NodeHandle) -> Result<String> {
        match self.lock().nodes.get(&switch.id()) {
            Some(node) if node.kind == NodeKind::Switch => Ok(node.device.clone()),
            Some(_) => bail!("{} is not a switch", switch),
            None => bail!("unknown switch handle {}", switch),
        }
    }

    /// Remove namespaces and bridges left behind by an earlier run.
    #[instrument(skip(self), fields(prefix = %self.config.namespace_prefix))]
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let prefix = &self.config.namespace_prefix;
        let mut report = CleanupReport::default();

        for ns in netns::discover_namespaces_with_prefix(prefix) {
            match self
                .run_release("ip", &args(["netns", "del", &ns]), "delete namespace")
                .await
            {
                Ok(()) => report.namespaces.push(ns),
                Err(e) => warn!("Failed to remove namespace {}: {}", ns, e),
            }
        }

        match self.run("ovs-vsctl", &args(["list-br"]), "list bridges").await {
            Ok(stdout) => {
                let bridges = stdout
                    .lines()
                    .map(str::trim)
                    .filter(|b| b.starts_with(prefix.as_str()));
                for bridge in bridges {
                    match self
                        .run(
                            "ovs-vsctl",
                            &args(["--if-exists", "del-br", bridge]),
                            "delete bridge",
                        )
                        .await
                    {
                        Ok(_) => report.bridges.push(bridge.to_string()),
                        Err(e) => warn!("Failed to remove bridge {}: {}", bridge, e),
                    }
                }
            }
            Err(e) => warn!("Skipping bridge cleanup: {}", e),
        }

        // Switch-to-switch veths stay in the root namespace
        match self.run("ip", &args(["-o", "link", "show"]), "list links").await {
            Ok(stdout) => {
                for iface in leftover_veths(&stdout, prefix) {
                    match self
                        .run_release("ip", &args(["link", "del", &iface]), "delete veth")
                        .await
                    {
                        Ok(()) => report.links.push(iface),
                        Err(e) => warn!("Failed to remove veth {}: {}", iface, e),
                    }
                }
            }
            Err(e) => warn!("Skipping veth cleanup: {}", e),
        }

        info!(
            "Cleanup removed {} namespaces, {} bridges and {} veths",
            report.namespaces.len(),
            report.bridges.len(),
            report.links.len()
        );
        Ok(report)
    }
}

/// Interface names from `ip -o link show` output that look like our veth ends.
///
/// Lines read `12: nemu-s1-eth1@nemu-s2-eth1: <BROADCAST,...> ...`. Deleting
/// one end removes its peer too, so peers of an already listed end are skipped.
fn leftover_veths(ip_output: &str, prefix: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for line in ip_output.lines() {
        let Some(name) = line.split(": ").nth(1) else {
            continue;
        };
        let (iface, peer) = match name.split_once('@') {
            Some((iface, peer)) => (iface, Some(peer)),
            None => (name, None),
        };
        if !iface.starts_with(prefix) || !iface.contains("-eth") {
            continue;
        }
        if peer.is_some_and(|p| found.iter().any(|f| f == p)) {
            continue;
        }
        found.push(iface.to_string());
    }
    found
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

impl VirtualizationBackend for LinuxBackend {
    #[instrument(skip_all, fields(node = %node.name()))]
    async fn create_node(&self, node: &Node) -> Result<NodeHandle> {
        let device = format!("{}{}", self.config.namespace_prefix, node.name());

        match node.kind() {
            NodeKind::Host => {
                if netns::namespace_exists(&device) {
                    bail!(
                        "namespace '{}' already exists, run `netemu cleanup` first",
                        device
                    );
                }
                self.run("ip", &args(["netns", "add", &device]), "create namespace")
                    .await?;
                if let Err(e) = self
                    .run(
                        "ip",
                        &args(["-n", &device, "link", "set", "lo", "up"]),
                        "bring loopback up",
                    )
                    .await
                {
                    if let Err(rollback) = self
                        .run_release("ip", &args(["netns", "del", &device]), "delete namespace")
                        .await
                    {
                        warn!("Rollback of namespace {} incomplete: {}", device, rollback);
                    }
                    return Err(e);
                }
            }
            NodeKind::Switch => {
                check_ifname(&device)?;
                self.run("ovs-vsctl", &args(["add-br", &device]), "create bridge")
                    .await?;
            }
        }

        let id = self.ids.next();
        self.lock().nodes.insert(
            id,
            RealizedNode {
                kind: node.kind(),
                device: device.clone(),
                address: node.address(),
                default_route: node.default_route(),
                next_port: match node.kind() {
                    NodeKind::Host => 0,
                    NodeKind::Switch => 1,
                },
            },
        );
        debug!("Created {} {} as {}", node.kind(), node.name(), device);
        Ok(NodeHandle::new(id, node.name()))
    }

    #[instrument(skip_all, fields(node = %handle))]
    async fn destroy_node(&self, handle: &NodeHandle) -> Result<()> {
        let Some(node) = self.lock().nodes.remove(&handle.id()) else {
            return Ok(());
        };

        let result = match node.kind {
            NodeKind::Host => {
                self.run_release("ip", &args(["netns", "del", &node.device]), "delete namespace")
                    .await
            }
            NodeKind::Switch => self
                .run(
                    "ovs-vsctl",
                    &args(["--if-exists", "del-br", &node.device]),
                    "delete bridge",
                )
                .await
                .map(|_| ()),
        };

        if result.is_err() {
            self.lock().nodes.insert(handle.id(), node);
        }
        result
    }

    #[instrument(skip_all, fields(a = %a, b = %b))]
    async fn create_link(&self, a: &NodeHandle, b: &NodeHandle, link: &Link) -> Result<LinkHandle> {
        let ends = {
            let mut state = self.lock();
            [state.allocate_end(a)?, state.allocate_end(b)?]
        };

        if let Err(e) = self.build_link(&ends, link.profile()).await {
            warn!("Link {} failed, rolling back: {}", link, e);
            if let Err(rollback) = self.remove_link(&ends).await {
                warn!("Rollback of {} incomplete: {}", link, rollback);
            }
            return Err(e);
        }

        let id = self.ids.next();
        let label = format!("{}<->{}", a.label(), b.label());
        self.lock().links.insert(id, ends);
        debug!("Created link {} ({})", label, link.profile());
        Ok(LinkHandle::new(id, label))
    }

    #[instrument(skip_all, fields(link = %handle))]
    async fn destroy_link(&self, handle: &LinkHandle) -> Result<()> {
        let Some(ends) = self.lock().links.remove(&handle.id()) else {
            return Ok(());
        };

        let result = self.remove_link(&ends).await;
        if result.is_err() {
            self.lock().links.insert(handle.id(), ends);
        }
        result
    }

    #[instrument(skip_all, fields(switch = %switch, endpoint = %endpoint))]
    async fn connect_controller(
        &self,
        switch: &NodeHandle,
        endpoint: &ControllerEndpoint,
    ) -> Result<ConnectionHandle> {
        let bridge = self.bridge_of(switch)?;

        let target = match endpoint.address() {
            ControllerAddress::Local => LOCAL_CONTROLLER.to_string(),
            ControllerAddress::Remote { host, port } => {
                TcpStream::connect((host.as_str(), *port))
                    .await
                    .with_context(|| format!("controller {} is unreachable", endpoint))?;
                endpoint.address().to_string()
            }
        };

        // Not recorded until OVS accepted it
        let pending = RealizedConnection { bridge, target };
        self.apply_controllers(&pending.bridge, Some(&pending)).await?;

        let id = self.ids.next();
        self.lock().connections.insert(id, pending);
        Ok(ConnectionHandle::new(id, connection_label(switch, endpoint)))
    }

    #[instrument(skip_all, fields(connection = %handle))]
    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<()> {
        let Some(connection) = self.lock().connections.remove(&handle.id()) else {
            return Ok(());
        };

        if connection.target == LOCAL_CONTROLLER {
            self.run_release(
                "ovs-vsctl",
                &args(["del-fail-mode", &connection.bridge]),
                "disable local controller",
            )
            .await?;
        }

        let result = self.apply_controllers(&connection.bridge, None).await;
        if result.is_err() {
            self.lock().connections.insert(handle.id(), connection);
        }
        result
    }

    #[instrument(skip_all, fields(switch = %switch))]
    async fn start_switch(&self, switch: &NodeHandle) -> Result<()> {
        let bridge = self.bridge_of(switch)?;
        let (remote, local) = self.lock().controllers_of(&bridge, None);

        let fail_mode = if local || remote.is_empty() {
            "standalone"
        } else {
            "secure"
        };
        self.run(
            "ovs-vsctl",
            &args(["set-fail-mode", &bridge, fail_mode]),
            "set fail mode",
        )
        .await?;
        self.run("ip", &args(["link", "set", &bridge, "up"]), "bring bridge up")
            .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(switch = %switch))]
    async fn stop_switch(&self, switch: &NodeHandle) -> Result<()> {
        let bridge = match self.lock().nodes.get(&switch.id()) {
            Some(node) if node.kind == NodeKind::Switch => node.device.clone(),
            _ => return Ok(()),
        };
        self.run_release("ip", &args(["link", "set", &bridge, "down"]), "bring bridge down")
            .await
    }
}
