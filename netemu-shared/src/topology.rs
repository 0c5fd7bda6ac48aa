//! In-memory topology graph.
//!
//! A [`Topology`] holds the hosts, switches and links of an emulated network
//! together with the IPv4 address space that bounds host addressing. It is a
//! pure data structure: it never touches the system, and every mutator either
//! succeeds completely or leaves the graph untouched.
//!
//! Nodes and links are kept in insertion order so that realization order is
//! reproducible between runs.

use ipnetwork::Ipv4Network;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::errors::{TopologyError, TopologyResult};
use crate::impairment::ImpairmentProfile;

/// Kind of a topology node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Host,
    Switch,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Host => write!(f, "host"),
            NodeKind::Switch => write!(f, "switch"),
        }
    }
}

/// A host or a switch of the emulated network.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    name: String,
    kind: NodeKind,
    address: Option<Ipv4Addr>,
    default_route: bool,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Host address; always `None` for switches
    pub fn address(&self) -> Option<Ipv4Addr> {
        self.address
    }

    /// Whether the host should route everything through its first interface
    pub fn default_route(&self) -> bool {
        self.default_route
    }

    pub fn is_switch(&self) -> bool {
        self.kind == NodeKind::Switch
    }

    pub fn is_host(&self) -> bool {
        self.kind == NodeKind::Host
    }
}

/// Undirected link between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Link {
    a: String,
    b: String,
    profile: ImpairmentProfile,
}

impl Link {
    /// Endpoints in declaration order
    pub fn endpoints(&self) -> (&str, &str) {
        (&self.a, &self.b)
    }

    pub fn profile(&self) -> &ImpairmentProfile {
        &self.profile
    }

    /// True if this link attaches `node`
    pub fn touches(&self, node: &str) -> bool {
        self.a == node || self.b == node
    }

    /// True if this link connects `x` and `y`, in either direction
    pub fn connects(&self, x: &str, y: &str) -> bool {
        (self.a == x && self.b == y) || (self.a == y && self.b == x)
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.a, self.b)
    }
}

/// Nodes, links and the address space of an emulated network.
#[derive(Debug, Clone, Serialize)]
pub struct Topology {
    address_space: Ipv4Network,
    nodes: Vec<Node>,
    links: Vec<Link>,
    #[serde(skip)]
    index: HashMap<String, usize>,
    #[serde(skip)]
    link_pairs: HashSet<(String, String)>,
    #[serde(skip)]
    used_addresses: HashSet<Ipv4Addr>,
}

impl Topology {
    /// Create an empty topology bounded by `address_space` (e.g. `10.0.0.0/8`).
    pub fn new(address_space: &str) -> TopologyResult<Self> {
        let parsed = Ipv4Network::from_str(address_space.trim())
            .map_err(|e| TopologyError::invalid_address(address_space, e.to_string()))?;
        // Normalise "10.1.2.3/8" to "10.0.0.0/8"
        let address_space = Ipv4Network::new(parsed.network(), parsed.prefix())
            .map_err(|e| TopologyError::invalid_address(address_space, e.to_string()))?;

        Ok(Self {
            address_space,
            nodes: Vec::new(),
            links: Vec::new(),
            index: HashMap::new(),
            link_pairs: HashSet::new(),
            used_addresses: HashSet::new(),
        })
    }

    pub fn address_space(&self) -> Ipv4Network {
        self.address_space
    }

    /// Add a host. Without an address, the next free address of the space is assigned.
    pub fn add_host(&mut self, name: &str, address: Option<&str>) -> TopologyResult<&Node> {
        self.add_node(name, NodeKind::Host, address, false)
    }

    pub fn add_switch(&mut self, name: &str) -> TopologyResult<&Node> {
        self.add_node(name, NodeKind::Switch, None, false)
    }

    /// Add a node to the graph.
    pub fn add_node(
        &mut self,
        name: &str,
        kind: NodeKind,
        address: Option<&str>,
        default_route: bool,
    ) -> TopologyResult<&Node> {
        validate_node_name(name)?;

        if self.index.contains_key(name) {
            return Err(TopologyError::DuplicateNode {
                name: name.to_string(),
            });
        }

        let address = match (kind, address) {
            (NodeKind::Switch, Some(_)) => {
                return Err(TopologyError::AddressOnSwitch {
                    name: name.to_string(),
                });
            }
            (NodeKind::Switch, None) => None,
            (NodeKind::Host, Some(raw)) => {
                let ip = self.parse_host_address(raw)?;
                if self.used_addresses.contains(&ip) {
                    return Err(TopologyError::invalid_address(
                        raw,
                        "address is already assigned to another host",
                    ));
                }
                Some(ip)
            }
            (NodeKind::Host, None) => Some(self.next_free_address()?),
        };

        if let Some(ip) = address {
            self.used_addresses.insert(ip);
        }
        self.index.insert(name.to_string(), self.nodes.len());
        self.nodes.push(Node {
            name: name.to_string(),
            kind,
            address,
            default_route,
        });

        Ok(&self.nodes[self.nodes.len() - 1])
    }

    /// Add an undirected link between two existing nodes.
    pub fn add_link(
        &mut self,
        a: &str,
        b: &str,
        profile: ImpairmentProfile,
    ) -> TopologyResult<&Link> {
        for name in [a, b] {
            if !self.index.contains_key(name) {
                return Err(TopologyError::UnknownNode {
                    name: name.to_string(),
                });
            }
        }

        if a == b {
            return Err(TopologyError::SelfLink {
                name: a.to_string(),
            });
        }

        let key = pair_key(a, b);
        if self.link_pairs.contains(&key) {
            return Err(TopologyError::DuplicateLink {
                a: a.to_string(),
                b: b.to_string(),
            });
        }

        profile.validate()?;

        self.link_pairs.insert(key);
        self.links.push(Link {
            a: a.to_string(),
            b: b.to_string(),
            profile,
        });

        Ok(&self.links[self.links.len() - 1])
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Links in insertion order.
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_host())
    }

    pub fn switches(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_switch())
    }

    /// Links attached to `node`, in insertion order.
    pub fn links_of<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Link> + 'a {
        self.links.iter().filter(move |l| l.touches(node))
    }

    /// Re-check every invariant over the whole graph.
    pub fn validate(&self) -> TopologyResult<()> {
        let mut names = HashSet::new();
        let mut addresses = HashSet::new();

        for node in &self.nodes {
            validate_node_name(&node.name)?;
            if !names.insert(node.name.as_str()) {
                return Err(TopologyError::DuplicateNode {
                    name: node.name.clone(),
                });
            }
            match (node.kind, node.address) {
                (NodeKind::Switch, Some(_)) => {
                    return Err(TopologyError::AddressOnSwitch {
                        name: node.name.clone(),
                    });
                }
                (NodeKind::Host, Some(ip)) => {
                    self.check_in_space(ip, &ip.to_string())?;
                    if !addresses.insert(ip) {
                        return Err(TopologyError::invalid_address(
                            ip.to_string(),
                            "address is already assigned to another host",
                        ));
                    }
                }
                _ => {}
            }
        }

        let mut pairs = HashSet::new();
        for link in &self.links {
            for name in [&link.a, &link.b] {
                if !names.contains(name.as_str()) {
                    return Err(TopologyError::UnknownNode { name: name.clone() });
                }
            }
            if link.a == link.b {
                return Err(TopologyError::SelfLink {
                    name: link.a.clone(),
                });
            }
            if !pairs.insert(pair_key(&link.a, &link.b)) {
                return Err(TopologyError::DuplicateLink {
                    a: link.a.clone(),
                    b: link.b.clone(),
                });
            }
            link.profile.validate()?;
        }

        Ok(())
    }

    fn parse_host_address(&self, raw: &str) -> TopologyResult<Ipv4Addr> {
        let ip = Ipv4Addr::from_str(raw.trim())
            .map_err(|_| TopologyError::invalid_address(raw, "expected an address like a.b.c.d"))?;
        self.check_in_space(ip, raw)?;
        Ok(ip)
    }

    fn check_in_space(&self, ip: Ipv4Addr, raw: &str) -> TopologyResult<()> {
        if !self.address_space.contains(ip) {
            return Err(TopologyError::invalid_address(
                raw,
                format!("outside of address space {}", self.address_space),
            ));
        }
        if self.address_space.prefix() <= 30
            && (ip == self.address_space.network() || ip == self.address_space.broadcast())
        {
            return Err(TopologyError::invalid_address(
                raw,
                format!(
                    "network and broadcast addresses of {} are reserved",
                    self.address_space
                ),
            ));
        }
        Ok(())
    }

    /// Lowest unused host address of the space, counting from `.1`.
    fn next_free_address(&self) -> TopologyResult<Ipv4Addr> {
        // u64 so that a /0 space does not overflow
        let size = 1u64 << (32 - u32::from(self.address_space.prefix()));
        let (first, last) = if self.address_space.prefix() <= 30 {
            (1, size - 2)
        } else {
            (0, size - 1)
        };

        (first..=last)
            .filter_map(|n| u32::try_from(n).ok())
            .filter_map(|n| self.address_space.nth(n))
            .find(|ip| !self.used_addresses.contains(ip))
            .ok_or_else(|| {
                TopologyError::invalid_address(
                    self.address_space.to_string(),
                    "address space exhausted",
                )
            })
    }
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

fn validate_node_name(name: &str) -> TopologyResult<()> {
    if name.is_empty() {
        return Err(TopologyError::InvalidNodeName {
            name: name.to_string(),
            reason: "name cannot be empty".to_string(),
        });
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(TopologyError::InvalidNodeName {
            name: name.to_string(),
            reason: "only alphanumeric characters, hyphens and underscores are allowed"
                .to_string(),
        });
    }
    Ok(())
}
