//! Topology Loader - File-based topology loading from directories.
//!
//! Scans directories for `.json5` topology files. Directories are searched in
//! priority order, so a user topology can override a system one of the same
//! name.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use netemu_shared::topology_json::parse_topology_file;
use netemu_shared::{DEFAULT_CONNECT_TIMEOUT, TopologyDefinition};

/// Default system topology directory (installed via package)
pub const SYSTEM_TOPOLOGY_DIR: &str = "/usr/share/netemu/topologies";

/// Default user topology directory, relative to the home directory
pub const USER_TOPOLOGY_DIR: &str = ".config/netemu/topologies";

/// Local topology directory, relative to the working directory
pub const LOCAL_TOPOLOGY_DIR: &str = "./topologies";

#[derive(Debug, Clone)]
pub struct TopologyLoader {
    /// Directories to scan, in priority order (later overrides earlier)
    directories: Vec<PathBuf>,
    /// Connect timeout for controllers that do not set one
    default_timeout: Duration,
}

impl Default for TopologyLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyLoader {
    /// Create a loader over the system, user and local directories.
    pub fn new() -> Self {
        let mut directories = vec![PathBuf::from(SYSTEM_TOPOLOGY_DIR)];
        if let Some(home) = dirs::home_dir() {
            directories.push(home.join(USER_TOPOLOGY_DIR));
        }
        directories.push(PathBuf::from(LOCAL_TOPOLOGY_DIR));

        Self::with_directories(directories)
    }

    /// Create a loader with custom directories only.
    pub fn with_directories(directories: Vec<PathBuf>) -> Self {
        Self {
            directories,
            default_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Add directories with the highest priority.
    pub fn add_directories(&mut self, dirs: impl IntoIterator<Item = PathBuf>) {
        self.directories.extend(dirs);
    }

    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }

    /// Load every topology, keyed and sorted by name.
    ///
    /// Files that fail to parse are logged and skipped.
    pub fn load_all(&self) -> BTreeMap<String, TopologyDefinition> {
        let mut topologies = BTreeMap::new();

        for dir in &self.directories {
            if !dir.exists() {
                debug!("Topology directory does not exist, skipping: {:?}", dir);
                continue;
            }

            match self.load_from_directory(dir) {
                Ok(loaded) => {
                    let count = loaded.len();
                    for definition in loaded {
                        if topologies.contains_key(&definition.name) {
                            debug!(
                                "Topology '{}' from {:?} overrides previous definition",
                                definition.name, dir
                            );
                        }
                        topologies.insert(definition.name.clone(), definition);
                    }
                    if count > 0 {
                        info!("Loaded {} topologies from {:?}", count, dir);
                    }
                }
                Err(e) => warn!("Failed to load topologies from {:?}: {}", dir, e),
            }
        }

        topologies
    }

    fn load_from_directory(&self, dir: &Path) -> Result<Vec<TopologyDefinition>> {
        let mut paths = Vec::new();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read directory: {:?}", dir))?;
        for entry in entries {
            let entry =
                entry.with_context(|| format!("Failed to read directory entry in {:?}", dir))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json5") {
                paths.push(path);
            }
        }
        // read_dir order is unspecified
        paths.sort();

        let mut definitions = Vec::new();
        for path in paths {
            match self.load_file(&path) {
                Ok(definition) => definitions.push(definition),
                Err(e) => warn!("Failed to load topology from {:?}: {:#}", path, e),
            }
        }
        Ok(definitions)
    }

    /// Load a single topology file.
    pub fn load_file(&self, path: &Path) -> Result<TopologyDefinition> {
        debug!("Loading topology from {:?}", path);
        parse_topology_file(path, self.default_timeout)
            .with_context(|| format!("Failed to load topology file: {:?}", path))
    }

    /// Find a topology by name in the configured directories.
    pub fn get(&self, name: &str) -> Option<TopologyDefinition> {
        self.load_all().remove(name)
    }

    /// Resolve a command-line argument: an existing path is loaded directly,
    /// anything else is looked up by name.
    pub fn resolve(&self, name_or_path: &str) -> Result<TopologyDefinition> {
        let path = Path::new(name_or_path);
        if path.is_file() {
            return self.load_file(path);
        }

        match self.get(name_or_path) {
            Some(definition) => Ok(definition),
            None => {
                let known: Vec<String> = self.load_all().into_keys().collect();
                if known.is_empty() {
                    bail!(
                        "Topology '{}' not found (no topologies in {:?})",
                        name_or_path,
                        self.directories
                    );
                }
                bail!(
                    "Topology '{}' not found; available: {}",
                    name_or_path,
                    known.join(", ")
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn topology_file(name: &str, switches: &[&str]) -> String {
        let switches: Vec<String> = switches.iter().map(|s| format!("\"{}\"", s)).collect();
        format!(
            r#"{{
    name: "{}",
    controllers: [{{ name: "c0" }}],
    switches: [{}],
}}"#,
            name,
            switches.join(", ")
        )
    }

    #[test]
    fn test_loader_creation() {
        let loader = TopologyLoader::new();
        assert!(loader.directories().len() >= 2);
        assert_eq!(
            loader.directories()[0],
            PathBuf::from(SYSTEM_TOPOLOGY_DIR)
        );
    }

    #[test]
    fn test_load_from_directory() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("pair.json5"),
            topology_file("pair", &["s1"]),
        )
        .unwrap();
        fs::write(temp_dir.path().join("notes.txt"), "not a topology").unwrap();

        let loader = TopologyLoader::with_directories(vec![temp_dir.path().to_path_buf()]);
        let topologies = loader.load_all();

        assert_eq!(topologies.len(), 1);
        assert_eq!(topologies["pair"].topology.nodes().len(), 1);
    }

    #[test]
    fn test_later_directory_overrides() {
        let system = TempDir::new().unwrap();
        let user = TempDir::new().unwrap();
        fs::write(system.path().join("a.json5"), topology_file("lab", &["s1"])).unwrap();
        fs::write(
            user.path().join("b.json5"),
            topology_file("lab", &["s1", "s2"]),
        )
        .unwrap();

        let loader = TopologyLoader::with_directories(vec![
            system.path().to_path_buf(),
            user.path().to_path_buf(),
        ]);
        let lab = loader.get("lab").unwrap();
        assert_eq!(lab.topology.switches().count(), 2);
    }

    #[test]
    fn test_invalid_file_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("bad.json5"), "{ name: ").unwrap();
        fs::write(
            temp_dir.path().join("good.json5"),
            topology_file("good", &["s1"]),
        )
        .unwrap();

        let loader = TopologyLoader::with_directories(vec![temp_dir.path().to_path_buf()]);
        let topologies = loader.load_all();
        assert_eq!(topologies.keys().collect::<Vec<_>>(), vec!["good"]);
    }

    #[test]
    fn test_resolve_by_path_and_name() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("pair.json5");
        fs::write(&path, topology_file("pair", &["s1"])).unwrap();
        let loader = TopologyLoader::with_directories(vec![temp_dir.path().to_path_buf()]);

        assert_eq!(loader.resolve(path.to_str().unwrap()).unwrap().name, "pair");
        assert_eq!(loader.resolve("pair").unwrap().name, "pair");

        let err = loader.resolve("missing").unwrap_err();
        assert!(err.to_string().contains("available: pair"));
    }

    #[test]
    fn test_default_timeout_applies() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("pair.json5");
        fs::write(&path, topology_file("pair", &["s1"])).unwrap();

        let loader = TopologyLoader::with_directories(vec![])
            .with_default_timeout(Duration::from_millis(250));
        let definition = loader.load_file(&path).unwrap();
        assert_eq!(
            definition.binding.endpoints()[0].connect_timeout,
            Duration::from_millis(250)
        );
    }
}
