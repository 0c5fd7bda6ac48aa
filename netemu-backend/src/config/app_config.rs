//! Application configuration for the `netemu` binary.
//!
//! Covers logging, where topologies are found and how the Linux backend and
//! session manager behave.

use anyhow::Result;
use std::env;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use super::cli::{CliCommand, CliConfig};

/// Linux interface names are limited to 15 bytes and bridge names carry the
/// prefix in front of the switch name.
pub const MAX_NAMESPACE_PREFIX_LEN: usize = 8;

/// Log level enumeration
#[derive(Debug, Clone, PartialEq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to tracing level filter string
    pub fn to_filter_string(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Application configuration structure
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub log_level: LogLevel,
    pub topology_dirs: Vec<String>,
    pub no_default_topologies: bool,
    pub namespace_prefix: String,
    pub use_sudo: bool,
    pub concurrent_stages: bool,
    pub controller_timeout: Option<Duration>,
    pub command: CliCommand,
}

impl AppConfig {
    /// Create application configuration from CLI config
    pub fn from_cli(cli_config: &CliConfig) -> Result<Self> {
        let log_level = if cli_config.verbose {
            LogLevel::Debug
        } else {
            match env::var("RUST_LOG") {
                Ok(level_str) => Self::parse_log_level(&level_str),
                Err(_) => LogLevel::Info,
            }
        };

        Ok(Self {
            log_level,
            topology_dirs: cli_config.topology_dirs.clone(),
            no_default_topologies: cli_config.no_default_topologies,
            namespace_prefix: cli_config.namespace_prefix.clone(),
            use_sudo: cli_config.use_sudo,
            concurrent_stages: cli_config.concurrent_stages,
            controller_timeout: cli_config.controller_timeout,
            command: cli_config.command.clone(),
        })
    }

    /// Parse log level from string
    fn parse_log_level(level_str: &str) -> LogLevel {
        // Extract the main log level from complex RUST_LOG format
        let main_level = level_str
            .split(',')
            .next()
            .unwrap_or(level_str)
            .split('=')
            .next()
            .unwrap_or(level_str)
            .to_lowercase();

        match main_level.as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    /// Filter directives for the subscriber.
    ///
    /// A non-empty `RUST_LOG` wins unless verbose logging was requested.
    pub fn log_filter(&self) -> String {
        match env::var("RUST_LOG") {
            Ok(existing) if !existing.is_empty() && self.log_level != LogLevel::Debug => existing,
            _ => self.log_level.to_filter_string().to_string(),
        }
    }

    /// Initialize logging based on configuration
    pub fn init_logging(&self) -> Result<()> {
        let filter = EnvFilter::try_new(self.log_filter())
            .or_else(|_| EnvFilter::try_new(self.log_level.to_filter_string()))?;

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))?;

        tracing::debug!("Logging initialized with level: {:?}", self.log_level);
        Ok(())
    }

    /// Validate application configuration
    pub fn validate(&self) -> Result<()> {
        if self.namespace_prefix.is_empty() {
            return Err(anyhow::anyhow!("Namespace prefix cannot be empty"));
        }

        if self.namespace_prefix.len() > MAX_NAMESPACE_PREFIX_LEN {
            return Err(anyhow::anyhow!(
                "Namespace prefix '{}' is longer than {} characters",
                self.namespace_prefix,
                MAX_NAMESPACE_PREFIX_LEN
            ));
        }

        if !self
            .namespace_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(anyhow::anyhow!(
                "Namespace prefix can only contain alphanumeric characters, hyphens, and underscores"
            ));
        }

        if self.controller_timeout == Some(Duration::ZERO) {
            return Err(anyhow::anyhow!(
                "Controller timeout must be greater than 0"
            ));
        }

        Ok(())
    }
}

/// Builder pattern for AppConfig
pub struct AppConfigBuilder {
    log_level: Option<LogLevel>,
    topology_dirs: Option<Vec<String>>,
    no_default_topologies: Option<bool>,
    namespace_prefix: Option<String>,
    use_sudo: Option<bool>,
    concurrent_stages: Option<bool>,
    controller_timeout: Option<Duration>,
    command: Option<CliCommand>,
}

impl AppConfigBuilder {
    pub fn new() -> Self {
        Self {
            log_level: None,
            topology_dirs: None,
            no_default_topologies: None,
            namespace_prefix: None,
            use_sudo: None,
            concurrent_stages: None,
            controller_timeout: None,
            command: None,
        }
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = Some(level);
        self
    }

    pub fn topology_dirs(mut self, dirs: Vec<String>) -> Self {
        self.topology_dirs = Some(dirs);
        self
    }

    pub fn no_default_topologies(mut self, no_defaults: bool) -> Self {
        self.no_default_topologies = Some(no_defaults);
        self
    }

    pub fn namespace_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.namespace_prefix = Some(prefix.into());
        self
    }

    pub fn use_sudo(mut self, use_sudo: bool) -> Self {
        self.use_sudo = Some(use_sudo);
        self
    }

    pub fn concurrent_stages(mut self, concurrent: bool) -> Self {
        self.concurrent_stages = Some(concurrent);
        self
    }

    pub fn controller_timeout(mut self, timeout: Duration) -> Self {
        self.controller_timeout = Some(timeout);
        self
    }

    pub fn command(mut self, command: CliCommand) -> Self {
        self.command = Some(command);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<AppConfig> {
        let config = AppConfig {
            log_level: self.log_level.unwrap_or(LogLevel::Info),
            topology_dirs: self.topology_dirs.unwrap_or_default(),
            no_default_topologies: self.no_default_topologies.unwrap_or(false),
            namespace_prefix: self.namespace_prefix.unwrap_or_else(|| "nemu-".to_string()),
            use_sudo: self.use_sudo.unwrap_or(false),
            concurrent_stages: self.concurrent_stages.unwrap_or(false),
            controller_timeout: self.controller_timeout,
            command: self
                .command
                .ok_or_else(|| anyhow::anyhow!("Command is required"))?,
        };

        config.validate()?;
        Ok(config)
    }
}

impl Default for AppConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
