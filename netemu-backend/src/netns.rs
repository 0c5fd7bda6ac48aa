//! Named network namespace helpers.
//!
//! Hosts are realized as named namespaces (`ip netns add`), which show up as
//! files under `/var/run/netns`. Reading that directory directly is enough to
//! tell whether a namespace exists and to find the ones a crashed run left
//! behind, without spawning `ip netns list`.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Directory where iproute2 pins named namespaces
pub const NETNS_DIR: &str = "/var/run/netns";

/// Errors that can occur while resolving namespaces.
#[derive(Error, Debug)]
pub enum NamespaceError {
    /// Named namespace not found
    #[error("Network namespace '{0}' not found in /var/run/netns/")]
    NotFound(String),

    /// Name cannot be used as a namespace
    #[error("Invalid namespace name '{0}'")]
    InvalidName(String),
}

/// Path of the pinned namespace file for `name`.
pub fn namespace_path(name: &str) -> Result<PathBuf, NamespaceError> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(NamespaceError::InvalidName(name.to_string()));
    }
    Ok(Path::new(NETNS_DIR).join(name))
}

/// Resolve `name` to its pinned file, failing if the namespace does not exist.
pub fn resolve_namespace(name: &str) -> Result<PathBuf, NamespaceError> {
    let path = namespace_path(name)?;
    if path.exists() {
        Ok(path)
    } else {
        Err(NamespaceError::NotFound(name.to_string()))
    }
}

pub fn namespace_exists(name: &str) -> bool {
    resolve_namespace(name).is_ok()
}

/// Discovers all named network namespaces from /var/run/netns/.
pub fn discover_named_namespaces() -> Vec<String> {
    discover_in(Path::new(NETNS_DIR))
}

/// Named namespaces whose name starts with `prefix`, sorted.
pub fn discover_namespaces_with_prefix(prefix: &str) -> Vec<String> {
    let mut namespaces: Vec<String> = discover_named_namespaces()
        .into_iter()
        .filter(|name| name.starts_with(prefix))
        .collect();
    namespaces.sort();
    debug!(
        "Found {} namespaces with prefix '{}'",
        namespaces.len(),
        prefix
    );
    namespaces
}

fn discover_in(dir: &Path) -> Vec<String> {
    if !dir.exists() {
        return Vec::new();
    }

    let mut namespaces = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                namespaces.push(name.to_string());
            }
        }
    }

    namespaces
}
