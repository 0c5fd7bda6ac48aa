//! Topology file loading and discovery.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use netemu_backend::backend::{BackendCall, RecordingBackend};
use netemu_backend::session::{SessionManager, SessionState};
use netemu_backend::topology_loader::TopologyLoader;
use netemu_shared::topology_json::{parse_topology, parse_topology_file};
use netemu_shared::{DEFAULT_CONNECT_TIMEOUT, TopologyDefinition, TopologyError};

fn shipped_topologies() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("topologies")
}

async fn plan(definition: TopologyDefinition) -> Vec<BackendCall> {
    let manager = SessionManager::new(RecordingBackend::new());
    let mut session = manager
        .start_session(definition.topology, definition.binding)
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Running);
    manager.stop_session(&mut session).await.unwrap();
    manager.backend().take_calls()
}

#[tokio::test]
async fn test_shipped_dns_chain_plans_reference_sequence() {
    let loader = TopologyLoader::with_directories(vec![shipped_topologies()]);
    let definition = loader.resolve("dns-chain").unwrap();

    assert_eq!(definition.topology.hosts().count(), 3);
    assert_eq!(definition.topology.switches().count(), 5);
    assert_eq!(definition.topology.links().len(), 7);
    assert_eq!(
        definition.binding.endpoint("c0").unwrap().to_string(),
        "c0 (tcp:127.0.0.1:6653)"
    );

    let calls = plan(definition).await;
    let count = |verb: &str| calls.iter().filter(|c| c.verb() == verb).count();
    assert_eq!(count("create-node"), 8);
    assert_eq!(count("create-link"), 7);
    assert_eq!(count("connect-controller"), 5);
    assert_eq!(count("start-switch"), 5);
    assert_eq!(count("destroy-node"), 8);
    assert_eq!(calls.len(), 50);
}

#[test]
fn test_user_directory_overrides_shipped_topology() {
    let user = TempDir::new().unwrap();
    fs::write(
        user.path().join("dns-chain.json5"),
        r#"{ name: "dns-chain", controllers: [{ name: "c0", address: "local" }], switches: ["s1"] }"#,
    )
    .unwrap();

    let loader = TopologyLoader::with_directories(vec![
        shipped_topologies(),
        user.path().to_path_buf(),
    ]);
    let definition = loader.resolve("dns-chain").unwrap();

    assert_eq!(definition.topology.nodes().len(), 1);
    assert!(definition.binding.endpoint("c0").unwrap().is_local());
}

#[test]
fn test_file_errors_keep_their_kind() {
    let dir = TempDir::new().unwrap();

    let unknown_field = dir.path().join("typo.json5");
    fs::write(&unknown_field, r#"{ name: "typo", swiches: ["s1"] }"#).unwrap();
    assert!(matches!(
        parse_topology_file(&unknown_field, DEFAULT_CONNECT_TIMEOUT),
        Err(TopologyError::InvalidTopologyFile { .. })
    ));

    let dangling = dir.path().join("dangling.json5");
    fs::write(
        &dangling,
        r#"{ name: "dangling", controllers: [{ name: "c0" }], switches: ["s1"], links: [{ a: "s1", b: "h9" }] }"#,
    )
    .unwrap();
    assert!(matches!(
        parse_topology_file(&dangling, DEFAULT_CONNECT_TIMEOUT),
        Err(TopologyError::UnknownNode { .. })
    ));

    let missing = dir.path().join("missing.json5");
    assert!(matches!(
        parse_topology_file(&missing, DEFAULT_CONNECT_TIMEOUT),
        Err(TopologyError::InvalidTopologyFile { .. })
    ));
}

#[test]
fn test_resolve_reports_available_topologies() {
    let loader = TopologyLoader::with_directories(vec![shipped_topologies()]);
    let err = loader.resolve("no-such-topology").unwrap_err();
    assert!(err.to_string().contains("dns-chain"));
}

/// Random chain of switches with hosts hanging off random switches.
/// Binding entries are written in shuffled order.
fn random_topology_file(rng: &mut StdRng) -> String {
    let switches = rng.gen_range(1..=6);
    let hosts = rng.gen_range(0..=6);

    let switch_names: Vec<String> = (1..=switches).map(|i| format!("\"s{}\"", i)).collect();
    let host_entries: Vec<String> = (1..=hosts)
        .map(|i| format!("{{ name: \"h{}\" }}", i))
        .collect();

    let mut links = Vec::new();
    for h in 1..=hosts {
        let s = rng.gen_range(1..=switches);
        let delay = rng.gen_range(0..20);
        links.push(format!(
            "{{ a: \"h{}\", b: \"s{}\", bandwidth_mbps: 15, delay: \"{}ms\" }}",
            h, s, delay
        ));
    }
    for s in 1..switches {
        let loss = rng.gen_range(0..5);
        links.push(format!(
            "{{ a: \"s{}\", b: \"s{}\", bandwidth_mbps: 15, loss_percent: {} }}",
            s,
            s + 1,
            loss
        ));
    }

    let mut bindings: Vec<String> = (1..=switches)
        .map(|s| {
            if s % 2 == 0 {
                format!("s{}: [\"c1\", \"c0\"]", s)
            } else {
                format!("s{}: [\"c0\"]", s)
            }
        })
        .collect();
    bindings.shuffle(rng);

    format!(
        r#"{{
    name: "random",
    controllers: [{{ name: "c0" }}, {{ name: "c1", address: "10.255.0.1", port: 6633 }}],
    hosts: [{}],
    switches: [{}],
    links: [{}],
    bindings: {{ {} }},
}}"#,
        host_entries.join(", "),
        switch_names.join(", "),
        links.join(", "),
        bindings.join(", ")
    )
}

#[tokio::test]
async fn test_random_files_plan_deterministically() {
    let mut rng = StdRng::seed_from_u64(0x6e65_6d75);

    for _ in 0..20 {
        let content = random_topology_file(&mut rng);

        let first = parse_topology(&content, Duration::from_secs(1)).unwrap();
        let second = parse_topology(&content, Duration::from_secs(1)).unwrap();
        assert_eq!(first.topology.nodes(), second.topology.nodes());
        assert_eq!(first.topology.links(), second.topology.links());

        let first_calls = plan(first).await;
        let second_calls = plan(second).await;
        assert_eq!(first_calls, second_calls, "topology:\n{}", content);
    }
}

#[tokio::test]
async fn test_binding_order_in_file_does_not_matter() {
    let forward = r#"{
        name: "order",
        controllers: [{ name: "c0" }, { name: "c1", port: 6633 }],
        switches: ["s1", "s2"],
        links: [{ a: "s1", b: "s2" }],
        bindings: { s1: ["c1", "c0"], s2: ["c1"] },
    }"#;
    let backward = r#"{
        name: "order",
        controllers: [{ name: "c0" }, { name: "c1", port: 6633 }],
        switches: ["s1", "s2"],
        links: [{ a: "s1", b: "s2" }],
        bindings: { s2: ["c1"], s1: ["c0", "c1"] },
    }"#;

    let a = plan(parse_topology(forward, DEFAULT_CONNECT_TIMEOUT).unwrap()).await;
    let b = plan(parse_topology(backward, DEFAULT_CONNECT_TIMEOUT).unwrap()).await;
    assert_eq!(a, b);

    let connects: Vec<String> = a
        .iter()
        .filter(|c| matches!(c, BackendCall::ConnectController(_)))
        .map(|c| c.target().to_string())
        .collect();
    // endpoint declaration order, not binding order
    assert_eq!(connects, vec!["s1->c0", "s1->c1", "s2->c1"]);
}
