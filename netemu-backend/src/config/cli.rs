//! CLI argument parsing for the `netemu` binary.
//!
//! Arguments are parsed with the clap builder API into a [`CliConfig`] that
//! the rest of the configuration layer consumes.

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::time::Duration;

use netemu_shared::topology_json::parse_duration_string;

/// Subcommand selected on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    /// Realize a topology and keep it running until interrupted
    Run { topology: String },
    /// Load and validate a topology without touching the system
    Validate { topology: String },
    /// Dry run against the recording backend
    Plan { topology: String, json: bool },
    /// Remove namespaces left behind by an earlier run
    Cleanup,
}

impl CliCommand {
    /// Topology argument of the command, if it takes one.
    pub fn topology(&self) -> Option<&str> {
        match self {
            CliCommand::Run { topology }
            | CliCommand::Validate { topology }
            | CliCommand::Plan { topology, .. } => Some(topology),
            CliCommand::Cleanup => None,
        }
    }
}

/// CLI configuration structure containing all parsed command line arguments
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub verbose: bool,
    pub topology_dirs: Vec<String>,
    pub no_default_topologies: bool,
    pub namespace_prefix: String,
    pub use_sudo: bool,
    pub concurrent_stages: bool,
    pub controller_timeout: Option<Duration>,
    pub command: CliCommand,
}

fn topology_arg() -> Arg {
    Arg::new("topology")
        .value_name("TOPOLOGY")
        .required(true)
        .help("Topology name or path to a .json5 topology file")
}

impl CliConfig {
    /// Parse CLI arguments and create CliConfig
    pub fn from_args() -> Result<Self> {
        let matches = Self::build_cli().get_matches();
        Self::from_matches(&matches)
    }

    /// Create CliConfig from pre-parsed ArgMatches (useful for testing)
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let namespace_prefix = matches
            .get_one::<String>("namespace-prefix")
            .ok_or_else(|| anyhow::anyhow!("Namespace prefix is required"))?
            .clone();

        let topology_dirs: Vec<String> = matches
            .get_many::<String>("topology-dir")
            .map(|vals| vals.cloned().collect())
            .unwrap_or_default();

        let controller_timeout = matches
            .get_one::<String>("controller-timeout")
            .map(|value| {
                parse_duration_string(value)
                    .map_err(|e| anyhow::anyhow!(e))
                    .with_context(|| format!("Invalid --controller-timeout '{}'", value))
            })
            .transpose()?;

        let command = match matches.subcommand() {
            Some(("run", sub)) => CliCommand::Run {
                topology: Self::topology_of(sub)?,
            },
            Some(("validate", sub)) => CliCommand::Validate {
                topology: Self::topology_of(sub)?,
            },
            Some(("plan", sub)) => CliCommand::Plan {
                topology: Self::topology_of(sub)?,
                json: sub.get_flag("json"),
            },
            Some(("cleanup", _)) => CliCommand::Cleanup,
            Some((other, _)) => anyhow::bail!("Unknown subcommand '{}'", other),
            None => anyhow::bail!("A subcommand is required"),
        };

        Ok(Self {
            verbose: matches.get_flag("verbose"),
            topology_dirs,
            no_default_topologies: matches.get_flag("no-default-topologies"),
            namespace_prefix,
            use_sudo: matches.get_flag("sudo"),
            concurrent_stages: matches.get_flag("concurrent-stages"),
            controller_timeout,
            command,
        })
    }

    fn topology_of(matches: &ArgMatches) -> Result<String> {
        matches
            .get_one::<String>("topology")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Topology argument is required"))
    }

    /// Build the clap Command structure
    pub fn build_cli() -> Command {
        Command::new("netemu")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Emulated packet networks on a single Linux host")
            .long_about("Builds virtual networks of hosts, switches and impaired links from a \
                       declarative topology, attaches the switches to SDN controllers and \
                       tears everything down again in reverse order.")
            .subcommand_required(true)
            .arg_required_else_help(true)
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .global(true)
                    .action(ArgAction::SetTrue)
                    .help("Enable verbose logging")
                    .long_help("Enable debug logging, including every backend call and every \
                              command run against the system."),
            )
            .arg(
                Arg::new("topology-dir")
                    .long("topology-dir")
                    .value_name("DIRECTORY")
                    .global(true)
                    .action(ArgAction::Append)
                    .help("Additional directory to load topology files from")
                    .long_help("Additional directory to scan for .json5 topology files. \
                              Can be specified multiple times. Later directories take priority. \
                              Default directories: /usr/share/netemu/topologies, \
                              ~/.config/netemu/topologies, ./topologies"),
            )
            .arg(
                Arg::new("no-default-topologies")
                    .long("no-default-topologies")
                    .global(true)
                    .action(ArgAction::SetTrue)
                    .help("Disable loading topologies from default directories"),
            )
            .arg(
                Arg::new("namespace-prefix")
                    .long("namespace-prefix")
                    .value_name("PREFIX")
                    .global(true)
                    .default_value("nemu-")
                    .help("Prefix for network namespaces and bridges created by netemu"),
            )
            .arg(
                Arg::new("sudo")
                    .long("sudo")
                    .global(true)
                    .action(ArgAction::SetTrue)
                    .help("Always run system commands through sudo")
                    .long_help("Run ip, tc and ovs-vsctl through sudo even when running as root. \
                              Without this flag sudo is used only for non-root users."),
            )
            .arg(
                Arg::new("concurrent-stages")
                    .long("concurrent-stages")
                    .global(true)
                    .action(ArgAction::SetTrue)
                    .help("Issue the backend calls of each stage concurrently"),
            )
            .arg(
                Arg::new("controller-timeout")
                    .long("controller-timeout")
                    .value_name("DURATION")
                    .global(true)
                    .help("Connect timeout for controllers without an explicit one (e.g. 5s, 500ms)"),
            )
            .subcommand(
                Command::new("run")
                    .about("Realize a topology and run it until interrupted")
                    .arg(topology_arg()),
            )
            .subcommand(
                Command::new("validate")
                    .about("Load and validate a topology")
                    .arg(topology_arg()),
            )
            .subcommand(
                Command::new("plan")
                    .about("Show the backend calls a run would make, without making them")
                    .arg(topology_arg())
                    .arg(
                        Arg::new("json")
                            .long("json")
                            .action(ArgAction::SetTrue)
                            .help("Print the resolved topology and binding as JSON"),
                    ),
            )
            .subcommand(
                Command::new("cleanup")
                    .about("Remove namespaces and bridges left behind by a crashed run"),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliConfig> {
        let matches = CliConfig::build_cli().try_get_matches_from(args)?;
        CliConfig::from_matches(&matches)
    }

    #[test]
    fn test_cli_config_default_values() {
        let config = parse(&["netemu", "validate", "dns-chain"]).unwrap();

        assert!(!config.verbose);
        assert!(!config.no_default_topologies);
        assert!(!config.use_sudo);
        assert!(!config.concurrent_stages);
        assert_eq!(config.namespace_prefix, "nemu-");
        assert!(config.topology_dirs.is_empty());
        assert!(config.controller_timeout.is_none());
        assert_eq!(
            config.command,
            CliCommand::Validate {
                topology: "dns-chain".to_string()
            }
        );
    }

    #[test]
    fn test_cli_config_custom_values() {
        let config = parse(&[
            "netemu",
            "--verbose",
            "--topology-dir",
            "/custom/topologies",
            "--topology-dir",
            "/another/dir",
            "--no-default-topologies",
            "--namespace-prefix",
            "lab-",
            "--sudo",
            "--concurrent-stages",
            "--controller-timeout",
            "250ms",
            "plan",
            "--json",
            "lab.json5",
        ])
        .unwrap();

        assert!(config.verbose);
        assert!(config.no_default_topologies);
        assert!(config.use_sudo);
        assert!(config.concurrent_stages);
        assert_eq!(config.namespace_prefix, "lab-");
        assert_eq!(
            config.topology_dirs,
            vec!["/custom/topologies", "/another/dir"]
        );
        assert_eq!(config.controller_timeout, Some(Duration::from_millis(250)));
        assert_eq!(
            config.command,
            CliCommand::Plan {
                topology: "lab.json5".to_string(),
                json: true
            }
        );
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let config = parse(&["netemu", "run", "dns-chain", "-v", "--sudo"]).unwrap();
        assert!(config.verbose);
        assert!(config.use_sudo);
        assert_eq!(config.command.topology(), Some("dns-chain"));
    }

    #[test]
    fn test_cleanup_takes_no_topology() {
        let config = parse(&["netemu", "cleanup"]).unwrap();
        assert_eq!(config.command, CliCommand::Cleanup);
        assert!(config.command.topology().is_none());
    }

    #[test]
    fn test_subcommand_required() {
        assert!(parse(&["netemu", "--verbose"]).is_err());
        assert!(parse(&["netemu", "run"]).is_err());
    }

    #[test]
    fn test_invalid_controller_timeout() {
        let err = parse(&["netemu", "--controller-timeout", "soon", "cleanup"]).unwrap_err();
        assert!(err.to_string().contains("--controller-timeout"));
    }
}
