//! Configuration management for the `netemu` binary.
//!
//! CLI arguments and the environment are merged into an [`AppConfig`], from
//! which the topology loader, the Linux backend and the session manager are
//! configured.

pub mod app_config;
pub mod cli;

pub use app_config::{AppConfig, AppConfigBuilder, LogLevel};
pub use cli::{CliCommand, CliConfig};

use anyhow::Result;
use std::path::PathBuf;

use crate::backend::LinuxBackendConfig;
use crate::session::SessionOptions;
use crate::topology_loader::TopologyLoader;

/// Main configuration manager that combines all configuration sources
#[derive(Debug, Clone)]
pub struct ConfigManager {
    pub app: AppConfig,
}

impl ConfigManager {
    /// Creates a new configuration manager from CLI arguments and environment
    pub fn from_cli_and_env() -> Result<Self> {
        let cli_config = CliConfig::from_args()?;
        Ok(Self {
            app: AppConfig::from_cli(&cli_config)?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.app.validate()
    }

    pub fn init_logging(&self) -> Result<()> {
        self.app.init_logging()
    }

    /// Topology loader over the default directories (unless disabled) and
    /// every `--topology-dir`.
    pub fn topology_loader(&self) -> TopologyLoader {
        let extra = self.app.topology_dirs.iter().map(PathBuf::from);
        let mut loader = if self.app.no_default_topologies {
            TopologyLoader::with_directories(extra.collect())
        } else {
            let mut loader = TopologyLoader::new();
            loader.add_directories(extra);
            loader
        };
        if let Some(timeout) = self.app.controller_timeout {
            loader = loader.with_default_timeout(timeout);
        }
        loader
    }

    /// Linux backend settings for a topology with the given address prefix length.
    pub fn backend_config(&self, address_prefix_len: u8) -> LinuxBackendConfig {
        LinuxBackendConfig::new(
            &self.app.namespace_prefix,
            self.app.use_sudo,
            address_prefix_len,
        )
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            concurrent_stages: self.app.concurrent_stages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager(no_defaults: bool) -> ConfigManager {
        let app = AppConfigBuilder::new()
            .topology_dirs(vec!["/tmp/a".to_string(), "/tmp/b".to_string()])
            .no_default_topologies(no_defaults)
            .namespace_prefix("lab-")
            .concurrent_stages(true)
            .controller_timeout(Duration::from_secs(1))
            .command(CliCommand::Cleanup)
            .build()
            .unwrap();
        ConfigManager { app }
    }

    #[test]
    fn test_topology_loader_without_defaults() {
        let loader = manager(true).topology_loader();
        assert_eq!(
            loader.directories(),
            &[PathBuf::from("/tmp/a"), PathBuf::from("/tmp/b")]
        );
    }

    #[test]
    fn test_extra_directories_take_priority() {
        let loader = manager(false).topology_loader();
        let dirs = loader.directories();
        assert!(dirs.len() > 2);
        assert_eq!(dirs[dirs.len() - 1], PathBuf::from("/tmp/b"));
    }

    #[test]
    fn test_backend_and_session_settings() {
        let config = manager(true);
        let backend = config.backend_config(24);
        assert_eq!(backend.namespace_prefix, "lab-");
        assert_eq!(backend.address_prefix_len, 24);
        assert!(config.session_options().concurrent_stages);
        assert!(config.validate().is_ok());
    }
}
