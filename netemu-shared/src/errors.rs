use thiserror::Error;

/// Errors raised while building or validating a topology and its controller binding.
///
/// Every mutator that returns one of these leaves the graph (or binding)
/// exactly as it was before the call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TopologyError {
    #[error("Node '{name}' already exists")]
    DuplicateNode { name: String },

    #[error("Unknown node '{name}'")]
    UnknownNode { name: String },

    #[error("Invalid node name '{name}': {reason}")]
    InvalidNodeName { name: String, reason: String },

    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Switch '{name}' cannot carry an address")]
    AddressOnSwitch { name: String },

    #[error("A link between '{a}' and '{b}' already exists")]
    DuplicateLink { a: String, b: String },

    #[error("Node '{name}' cannot be linked to itself")]
    SelfLink { name: String },

    #[error("Invalid impairment profile field '{field}': {reason}")]
    InvalidProfile { field: String, reason: String },

    #[error("Controller endpoint '{name}' already exists")]
    DuplicateEndpoint { name: String },

    #[error("Unknown switch '{name}'")]
    UnknownSwitch { name: String },

    #[error("Unknown controller endpoint '{name}'")]
    UnknownEndpoint { name: String },

    #[error("Switch '{name}' does not resolve to any controller endpoint")]
    UnboundSwitch { name: String },

    #[error("Invalid topology file: {message}")]
    InvalidTopologyFile { message: String },
}

impl TopologyError {
    /// Create an InvalidAddress error from an address and a human readable reason
    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        TopologyError::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidProfile error for a single field
    pub fn invalid_profile(field: &str, reason: impl Into<String>) -> Self {
        TopologyError::InvalidProfile {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for topology construction
pub type TopologyResult<T> = Result<T, TopologyError>;
