//! Controller endpoints and switch-to-controller bindings.
//!
//! A [`ControllerBinding`] keeps the ordered list of control-plane endpoints a
//! session can reach and, optionally, which subset of them each switch should
//! attach to. Switches without an explicit binding attach to every endpoint.
//!
//! Switch names are resolved lazily against a [`Topology`], so a binding may be
//! declared before the switches it mentions exist.

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::Duration;

use crate::errors::{TopologyError, TopologyResult};
use crate::topology::Topology;
use crate::{DEFAULT_CONNECT_TIMEOUT, LOCAL_CONTROLLER};

static HOSTNAME_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$")
        .expect("hostname label pattern is valid")
});

/// Where a controller lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ControllerAddress {
    /// Controller provided by the virtualization backend itself
    Local,
    /// External controller reachable over TCP
    Remote { host: String, port: u16 },
}

impl fmt::Display for ControllerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerAddress::Local => write!(f, "{}", LOCAL_CONTROLLER),
            ControllerAddress::Remote { host, port } => {
                if host.contains(':') {
                    write!(f, "tcp:[{}]:{}", host, port)
                } else {
                    write!(f, "tcp:{}:{}", host, port)
                }
            }
        }
    }
}

/// Explicit retry policy for controller connection attempts.
///
/// The default is a single attempt: connections are never retried unless the
/// caller asks for it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// Try exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        }
    }

    /// Try up to `max_attempts` times with exponential backoff starting at `initial_delay`.
    pub fn attempts(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            backoff_multiplier: 2.0,
        }
    }
}

/// A control-plane endpoint switches can connect to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerEndpoint {
    name: String,
    address: ControllerAddress,
    /// Upper bound for a single connection attempt
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ControllerEndpoint {
    /// Create an endpoint from an address string and a port.
    ///
    /// `address` is an IP literal, a hostname, or `local` (the port is then ignored).
    pub fn new(name: &str, address: &str, port: u16) -> TopologyResult<Self> {
        let address = if address.trim().eq_ignore_ascii_case(LOCAL_CONTROLLER) {
            ControllerAddress::Local
        } else {
            ControllerAddress::Remote {
                host: normalize_host(address),
                port,
            }
        };

        let endpoint = Self {
            name: name.to_string(),
            address,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry: RetryPolicy::none(),
        };
        endpoint.validate()?;
        Ok(endpoint)
    }

    /// Endpoint served by the backend's built-in controller.
    pub fn local(name: &str) -> Self {
        Self {
            name: name.to_string(),
            address: ControllerAddress::Local,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry: RetryPolicy::none(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &ControllerAddress {
        &self.address
    }

    pub fn is_local(&self) -> bool {
        self.address == ControllerAddress::Local
    }

    /// Validate the address syntax, port range and connection policy.
    pub fn validate(&self) -> TopologyResult<()> {
        if self.name.is_empty() {
            return Err(TopologyError::invalid_address(
                &self.name,
                "endpoint name cannot be empty",
            ));
        }

        if let ControllerAddress::Remote { host, port } = &self.address {
            if *port == 0 {
                return Err(TopologyError::invalid_address(
                    format!("{}:{}", host, port),
                    "Port 0 is reserved and not allowed",
                ));
            }
            validate_host(host)?;
        }

        if self.connect_timeout.is_zero() {
            return Err(TopologyError::invalid_address(
                self.address.to_string(),
                "connect timeout cannot be 0",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(TopologyError::invalid_address(
                self.address.to_string(),
                "retry policy needs at least one attempt",
            ));
        }
        let multiplier = self.retry.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(TopologyError::invalid_address(
                self.address.to_string(),
                format!("backoff multiplier must be at least 1.0, got {}", multiplier),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ControllerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

fn normalize_host(address: &str) -> String {
    let trimmed = address.trim();
    trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed)
        .to_string()
}

fn validate_host(host: &str) -> TopologyResult<()> {
    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    if host.is_empty() || host.len() > 253 {
        return Err(TopologyError::invalid_address(
            host,
            "expected an IP address or a hostname of 1-253 characters",
        ));
    }
    // A purely numeric dotted name that failed IP parsing is a broken IPv4 literal
    if host.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(TopologyError::invalid_address(host, "malformed IPv4 address"));
    }
    let host = host.strip_suffix('.').unwrap_or(host);
    if let Some(label) = host.split('.').find(|l| !HOSTNAME_LABEL.is_match(l)) {
        return Err(TopologyError::invalid_address(
            host,
            format!("invalid hostname label '{}'", label),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
struct SwitchBinding {
    switch: String,
    endpoints: Vec<String>,
}

/// Endpoints of a session and the switches attached to them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ControllerBinding {
    endpoints: Vec<ControllerEndpoint>,
    bindings: Vec<SwitchBinding>,
}

impl ControllerBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a remote (or `local`) endpoint with default timeout and no retry.
    pub fn add_endpoint(
        &mut self,
        name: &str,
        address: &str,
        port: u16,
    ) -> TopologyResult<&ControllerEndpoint> {
        let endpoint = ControllerEndpoint::new(name, address, port)?;
        self.add_endpoint_config(endpoint)
    }

    /// Declare a fully configured endpoint.
    pub fn add_endpoint_config(
        &mut self,
        endpoint: ControllerEndpoint,
    ) -> TopologyResult<&ControllerEndpoint> {
        if self.endpoint(endpoint.name()).is_some() {
            return Err(TopologyError::DuplicateEndpoint {
                name: endpoint.name().to_string(),
            });
        }
        endpoint.validate()?;
        self.endpoints.push(endpoint);
        Ok(&self.endpoints[self.endpoints.len() - 1])
    }

    /// Attach `switch` to exactly `endpoints`. An empty list restores the default
    /// (attach to every endpoint). The switch itself is resolved at session start.
    pub fn bind(&mut self, switch: &str, endpoints: &[&str]) -> TopologyResult<()> {
        if let Some(unknown) = endpoints.iter().find(|e| self.endpoint(e).is_none()) {
            return Err(TopologyError::UnknownEndpoint {
                name: unknown.to_string(),
            });
        }

        let mut names: Vec<String> = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            if !names.iter().any(|n| n == endpoint) {
                names.push(endpoint.to_string());
            }
        }

        let existing = self.bindings.iter().position(|b| b.switch == switch);
        match (existing, names.is_empty()) {
            (Some(i), true) => {
                self.bindings.remove(i);
            }
            (Some(i), false) => self.bindings[i].endpoints = names,
            (None, true) => {}
            (None, false) => self.bindings.push(SwitchBinding {
                switch: switch.to_string(),
                endpoints: names,
            }),
        }
        Ok(())
    }

    /// Endpoints in declaration order.
    pub fn endpoints(&self) -> &[ControllerEndpoint] {
        &self.endpoints
    }

    pub fn endpoint(&self, name: &str) -> Option<&ControllerEndpoint> {
        self.endpoints.iter().find(|e| e.name() == name)
    }

    /// Explicit endpoint list of `switch`, if one was declared.
    pub fn explicit_binding(&self, switch: &str) -> Option<&[String]> {
        self.bindings
            .iter()
            .find(|b| b.switch == switch)
            .map(|b| b.endpoints.as_slice())
    }

    /// Endpoints `switch` must connect to, resolved against `topology`.
    ///
    /// The result follows endpoint declaration order and may be empty when no
    /// endpoint has been declared.
    pub fn endpoints_for(
        &self,
        topology: &Topology,
        switch: &str,
    ) -> TopologyResult<Vec<&ControllerEndpoint>> {
        if !topology.node(switch).is_some_and(|n| n.is_switch()) {
            return Err(TopologyError::UnknownSwitch {
                name: switch.to_string(),
            });
        }

        match self.explicit_binding(switch) {
            Some(names) => Ok(self
                .endpoints
                .iter()
                .filter(|e| names.iter().any(|n| n == e.name()))
                .collect()),
            None => Ok(self.endpoints.iter().collect()),
        }
    }

    /// Check that every binding names a switch of `topology` and that every
    /// switch resolves to at least one endpoint.
    pub fn validate(&self, topology: &Topology) -> TopologyResult<()> {
        for endpoint in &self.endpoints {
            endpoint.validate()?;
        }

        for binding in &self.bindings {
            if !topology.node(&binding.switch).is_some_and(|n| n.is_switch()) {
                return Err(TopologyError::UnknownSwitch {
                    name: binding.switch.clone(),
                });
            }
            if let Some(unknown) = binding
                .endpoints
                .iter()
                .find(|e| self.endpoint(e).is_none())
            {
                return Err(TopologyError::UnknownEndpoint {
                    name: unknown.clone(),
                });
            }
        }

        for switch in topology.switches() {
            if self.endpoints_for(topology, switch.name())?.is_empty() {
                return Err(TopologyError::UnboundSwitch {
                    name: switch.name().to_string(),
                });
            }
        }

        Ok(())
    }
}
