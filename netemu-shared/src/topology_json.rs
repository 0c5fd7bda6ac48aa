//! JSON5 topology files.
//!
//! A topology file declares the address space, the controller endpoints, the
//! hosts and switches, the links with their impairment, and optional explicit
//! controller bindings. Hosts are always inserted before switches, each group in
//! file order, so a file maps onto a deterministic construction sequence.
//!
//! Durations use the `duration-string` format: "1ms", "250us", "5s", "1m30s".

use duration_string::DurationString;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::controller::{ControllerBinding, ControllerEndpoint, RetryPolicy};
use crate::errors::{TopologyError, TopologyResult};
use crate::impairment::ImpairmentProfile;
use crate::topology::{NodeKind, Topology};
use crate::{DEFAULT_ADDRESS_SPACE, DEFAULT_CONTROLLER_ADDRESS, DEFAULT_CONTROLLER_PORT};

/// Parse a duration string like "10ms", "5s" or "1m30s".
pub fn parse_duration_string(s: &str) -> Result<Duration, String> {
    let duration: DurationString = s
        .trim()
        .parse()
        .map_err(|e| format!("Invalid duration '{}': {}", s, e))?;
    Ok(duration.into())
}

/// Top-level layout of a topology file
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologyFile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_address_space")]
    pub address_space: String,
    #[serde(default)]
    pub controllers: Vec<ControllerJson>,
    #[serde(default)]
    pub hosts: Vec<HostJson>,
    #[serde(default)]
    pub switches: Vec<String>,
    #[serde(default)]
    pub links: Vec<LinkJson>,
    #[serde(default)]
    pub bindings: BTreeMap<String, Vec<String>>,
}

fn default_address_space() -> String {
    DEFAULT_ADDRESS_SPACE.to_string()
}

fn default_controller_address() -> String {
    DEFAULT_CONTROLLER_ADDRESS.to_string()
}

fn default_controller_port() -> u16 {
    DEFAULT_CONTROLLER_PORT
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerJson {
    pub name: String,
    #[serde(default = "default_controller_address")]
    pub address: String,
    #[serde(default = "default_controller_port")]
    pub port: u16,
    /// Per-attempt connection timeout, e.g. "5s"
    pub timeout: Option<String>,
    /// Total connection attempts
    pub attempts: Option<u32>,
    /// Delay before the first retry, doubled after each attempt
    pub retry_delay: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostJson {
    pub name: String,
    pub ip: Option<String>,
    #[serde(default)]
    pub default_route: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkJson {
    pub a: String,
    pub b: String,
    pub bandwidth_mbps: Option<f64>,
    pub delay: Option<String>,
    pub jitter: Option<String>,
    pub loss_percent: Option<f64>,
    pub max_queue: Option<u32>,
}

/// A parsed and fully validated topology file.
#[derive(Debug, Clone)]
pub struct TopologyDefinition {
    pub name: String,
    pub description: String,
    pub topology: Topology,
    pub binding: ControllerBinding,
}

fn file_duration(value: &str, context: &str) -> TopologyResult<Duration> {
    parse_duration_string(value).map_err(|e| TopologyError::InvalidTopologyFile {
        message: format!("{}: {}", context, e),
    })
}

impl LinkJson {
    fn to_profile(&self) -> TopologyResult<ImpairmentProfile> {
        let context = format!("link {}<->{}", self.a, self.b);
        Ok(ImpairmentProfile {
            bandwidth_mbps: self.bandwidth_mbps,
            delay: self
                .delay
                .as_deref()
                .map(|d| file_duration(d, &context))
                .transpose()?,
            jitter: self
                .jitter
                .as_deref()
                .map(|d| file_duration(d, &context))
                .transpose()?,
            loss_percent: self.loss_percent,
            max_queue: self.max_queue,
        })
    }
}

impl ControllerJson {
    fn to_endpoint(&self, default_timeout: Duration) -> TopologyResult<ControllerEndpoint> {
        let context = format!("controller {}", self.name);
        let timeout = match &self.timeout {
            Some(t) => file_duration(t, &context)?,
            None => default_timeout,
        };

        let mut retry = RetryPolicy::none();
        if let Some(attempts) = self.attempts {
            retry.max_attempts = attempts;
        }
        if let Some(delay) = &self.retry_delay {
            retry.initial_delay = file_duration(delay, &context)?;
        }

        Ok(ControllerEndpoint::new(&self.name, &self.address, self.port)?
            .with_timeout(timeout)
            .with_retry(retry))
    }
}

impl TopologyFile {
    /// Build the topology graph and controller binding described by this file.
    ///
    /// `default_timeout` applies to controllers that do not set `timeout`.
    pub fn into_definition(self, default_timeout: Duration) -> TopologyResult<TopologyDefinition> {
        let mut topology = Topology::new(&self.address_space)?;
        let mut binding = ControllerBinding::new();

        for controller in &self.controllers {
            binding.add_endpoint_config(controller.to_endpoint(default_timeout)?)?;
        }

        for host in &self.hosts {
            topology.add_node(
                &host.name,
                NodeKind::Host,
                host.ip.as_deref(),
                host.default_route,
            )?;
        }

        for switch in &self.switches {
            topology.add_switch(switch)?;
        }

        for link in &self.links {
            topology.add_link(&link.a, &link.b, link.to_profile()?)?;
        }

        for (switch, endpoints) in &self.bindings {
            let names: Vec<&str> = endpoints.iter().map(String::as_str).collect();
            binding.bind(switch, &names)?;
        }

        topology.validate()?;
        binding.validate(&topology)?;

        Ok(TopologyDefinition {
            name: self.name,
            description: self.description,
            topology,
            binding,
        })
    }
}

/// Parse the raw file structure from JSON5 text
pub fn parse_topology_json5(json5_content: &str) -> TopologyResult<TopologyFile> {
    json5::from_str(json5_content).map_err(|e| TopologyError::InvalidTopologyFile {
        message: e.to_string(),
    })
}

/// Parse and build a topology from JSON5 text
pub fn parse_topology(
    json5_content: &str,
    default_timeout: Duration,
) -> TopologyResult<TopologyDefinition> {
    parse_topology_json5(json5_content)?.into_definition(default_timeout)
}

/// Parse and build a topology from a file path
pub fn parse_topology_file(
    path: &Path,
    default_timeout: Duration,
) -> TopologyResult<TopologyDefinition> {
    let content = std::fs::read_to_string(path).map_err(|e| TopologyError::InvalidTopologyFile {
        message: format!("{}: {}", path.display(), e),
    })?;
    parse_topology(&content, default_timeout)
}
