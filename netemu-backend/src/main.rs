use anyhow::{Context, Result};
use tracing::{error, info, warn};

use netemu_backend::backend::{LinuxBackend, RecordingBackend};
use netemu_backend::config::{CliCommand, ConfigManager};
use netemu_backend::session::{Session, SessionError, SessionManager};
use netemu_shared::TopologyDefinition;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from CLI and environment
    let config_manager = ConfigManager::from_cli_and_env()?;
    config_manager.validate()?;
    config_manager.init_logging()?;

    match config_manager.app.command.clone() {
        CliCommand::Run { topology } => run(&config_manager, &topology).await,
        CliCommand::Validate { topology } => validate(&config_manager, &topology),
        CliCommand::Plan { topology, json } => plan(&config_manager, &topology, json).await,
        CliCommand::Cleanup => cleanup(&config_manager).await,
    }
}

fn load(config: &ConfigManager, name_or_path: &str) -> Result<TopologyDefinition> {
    let definition = config.topology_loader().resolve(name_or_path)?;
    info!(
        "Loaded topology '{}': {} nodes, {} links, {} controllers",
        definition.name,
        definition.topology.nodes().len(),
        definition.topology.links().len(),
        definition.binding.endpoints().len()
    );
    Ok(definition)
}

async fn run(config: &ConfigManager, name_or_path: &str) -> Result<()> {
    let definition = load(config, name_or_path)?;
    let prefix_len = definition.topology.address_space().prefix();
    let backend = LinuxBackend::new(config.backend_config(prefix_len));
    let manager = SessionManager::with_options(backend, config.session_options());

    let mut session = Session::new(definition.topology, definition.binding);
    let stop = session.stop_handle();
    let interrupt = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => stop.request_stop(),
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    info!("Starting topology '{}'", definition.name);
    if let Err(e) = manager.start(&mut session).await {
        interrupt.abort();
        if matches!(e.cause, SessionError::Cancelled) && e.teardown.is_empty() {
            info!("Start interrupted, everything created so far was removed");
            return Ok(());
        }
        error!("{}", e);
        for failure in &e.teardown {
            warn!("Teardown: {}", failure);
        }
        return Err(e.into());
    }

    println!(
        "Topology '{}' is running ({} backend resources). Press Ctrl-C to stop.",
        definition.name,
        session.resources().len()
    );
    interrupt.await.context("Signal listener failed")?;

    info!("Interrupted, tearing down '{}'", definition.name);
    manager.stop_session(&mut session).await?;
    println!("Topology '{}' stopped", definition.name);
    Ok(())
}

fn validate(config: &ConfigManager, name_or_path: &str) -> Result<()> {
    let definition = load(config, name_or_path)?;
    let topology = &definition.topology;

    println!("{}: valid", definition.name);
    if !definition.description.is_empty() {
        println!("  {}", definition.description);
    }
    println!("  address space {}", topology.address_space());
    for node in topology.nodes() {
        match node.address() {
            Some(address) => println!("  {} {} {}", node.kind(), node.name(), address),
            None => println!("  {} {}", node.kind(), node.name()),
        }
    }
    for link in topology.links() {
        println!("  link {} {}", link, link.profile());
    }
    for switch in topology.switches() {
        let endpoints = definition.binding.endpoints_for(topology, switch.name())?;
        let names: Vec<String> = endpoints.iter().map(|e| e.to_string()).collect();
        println!("  {} -> {}", switch.name(), names.join(", "));
    }
    Ok(())
}

async fn plan(config: &ConfigManager, name_or_path: &str, json: bool) -> Result<()> {
    let definition = load(config, name_or_path)?;
    let manager = SessionManager::with_options(RecordingBackend::new(), config.session_options());

    let mut session = manager
        .start_session(definition.topology, definition.binding)
        .await
        .context("Dry run failed")?;
    let started = manager.backend().take_calls();

    if json {
        let document = serde_json::json!({
            "name": definition.name,
            "description": definition.description,
            "session": session.summary(),
            "calls": started,
        });
        println!("{}", serde_json::to_string_pretty(&document)?);
    } else {
        println!("# start");
        for call in &started {
            println!("{}", call);
        }
    }

    manager.stop_session(&mut session).await?;
    if !json {
        println!("# stop");
        for call in manager.backend().take_calls() {
            println!("{}", call);
        }
    }
    Ok(())
}

async fn cleanup(config: &ConfigManager) -> Result<()> {
    let backend = LinuxBackend::new(config.backend_config(8));
    let report = backend.cleanup().await?;
    println!(
        "Removed {} namespaces, {} bridges and {} veths",
        report.namespaces.len(),
        report.bridges.len(),
        report.links.len()
    );
    for name in report
        .namespaces
        .iter()
        .chain(&report.bridges)
        .chain(&report.links)
    {
        println!("  {}", name);
    }
    Ok(())
}
