//! Topology model for netemu.
//!
//! This crate holds the pure, side-effect free part of the emulator: the graph
//! of hosts, switches and impaired links, the controller endpoints switches are
//! attached to, and the JSON5 file format used to declare both. Nothing here
//! touches the kernel; realizing a topology is the backend crate's job.
//!
//! # Key Components
//!
//! * [`Topology`] - Named nodes, undirected links and host address assignment
//! * [`ImpairmentProfile`] - Bandwidth, delay, jitter, loss and queue limits of a link
//! * [`ControllerBinding`] - Controller endpoints and which switches use them
//! * [`topology_json`] - Declarative topology files
//!
//! ```text
//!   h1 ── s1 ── s2 ── s3 ── s4 ── s5 ── h3
//!                │
//!               h2            c0 (tcp:127.0.0.1:6653)
//! ```

use std::time::Duration;

pub mod controller;
pub mod errors;
pub mod impairment;
pub mod topology;
pub mod topology_json;

pub use controller::{ControllerAddress, ControllerBinding, ControllerEndpoint, RetryPolicy};
pub use errors::{TopologyError, TopologyResult};
pub use impairment::ImpairmentProfile;
pub use topology::{Link, Node, NodeKind, Topology};
pub use topology_json::TopologyDefinition;

/// Address space used when a topology does not declare one
pub const DEFAULT_ADDRESS_SPACE: &str = "10.0.0.0/8";

/// Controller address used when an endpoint declaration omits it
pub const DEFAULT_CONTROLLER_ADDRESS: &str = "127.0.0.1";

/// IANA-assigned OpenFlow port
pub const DEFAULT_CONTROLLER_PORT: u16 = 6653;

/// Per-attempt controller connection timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Address keyword selecting the backend's built-in controller
pub const LOCAL_CONTROLLER: &str = "local";
