//! Realization side of netemu.
//!
//! [`session::SessionManager`] drives a topology through its lifecycle against
//! a [`backend::VirtualizationBackend`]. Two backends ship with the crate: the
//! Linux one (namespaces, Open vSwitch, veth pairs and `tc`) and an in-memory
//! recording one used for dry runs and tests.

pub mod backend;
pub mod config;
pub mod netns;
pub mod session;
pub mod tc;
pub mod topology_loader;
pub mod utils;
