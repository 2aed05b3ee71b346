//! StateMesh CLI — secure distributed state transfer
//!
//! Commands:
//!   statemesh transfer  — distribute a file across an in-process swarm
//!   statemesh store     — persist a file as a new state
//!   statemesh load      — read a persisted state back to a file
//!   statemesh list      — list persisted states
//!   statemesh compress  — gzip a persisted state in place
//!   statemesh replicate — converge a state to N storage replicas
//!   statemesh delete    — remove a state and its replicas
//!   statemesh merge     — merge persisted states under a conflict strategy
//!   statemesh demo      — full demo against an in-process swarm

use std::env;
use std::sync::Arc;

use statemesh_core::persist::PersistenceManager;
use statemesh_core::state::State;
use statemesh_core::swarm::{LoopbackNode, NodeEndpoint, Swarm};
use statemesh_core::transfer::{TransferOptions, TransferProtocol};
use statemesh_core::transform::{ConflictStrategy, TransformationEngine};
use statemesh_core::CoreConfig;

const STORE_DIR: &str = "statemesh-store";

fn print_usage() {
    println!(
        r#"
StateMesh — secure distributed state transfer

Usage: statemesh <command> [options]

Commands:
  transfer  <file> [nodes] [rf]              Distribute a file across a swarm
  store     <file> [state-id]                Persist a file as a new state
  load      <id-prefix> <out-file>           Read a state back to a file
  list                                       List persisted states
  compress  <id-prefix>                      Gzip a persisted state in place
  replicate <id-prefix> <count>              Converge to <count> replicas
  delete    <id-prefix>                      Remove a state and its replicas
  merge     <strategy> <id-prefix>...        Merge states (consensus|latest|manual)
  demo                                       Full demo against an in-process swarm

Examples:
  statemesh transfer weights.bin 5 3
  statemesh store weights.bin
  statemesh compress 3f2a
  statemesh replicate 3f2a 2
  statemesh merge consensus 3f2a 9c1b
  statemesh demo
"#
    );
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    match args[1].as_str() {
        "transfer" => cmd_transfer(&args[2..]).await,
        "store" => cmd_store(&args[2..]),
        "load" => cmd_load(&args[2..]),
        "list" => cmd_list(),
        "compress" => cmd_compress(&args[2..]),
        "replicate" => cmd_replicate(&args[2..]),
        "delete" => cmd_delete(&args[2..]),
        "merge" => cmd_merge(&args[2..]),
        "demo" => cmd_demo().await,
        "help" | "--help" | "-h" => print_usage(),
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
        }
    }
}

fn open_persistence() -> Option<PersistenceManager> {
    match PersistenceManager::open_dir(STORE_DIR) {
        Ok(mgr) => Some(mgr),
        Err(e) => {
            eprintln!("  Failed to open store at {}: {}", STORE_DIR, e);
            None
        }
    }
}

/// Resolve a state-id prefix against the store
fn find_state(mgr: &PersistenceManager, prefix: &str) -> Option<String> {
    let matching: Vec<String> = mgr
        .list_states()
        .into_iter()
        .filter(|id| id.starts_with(prefix))
        .collect();
    match matching.len() {
        0 => {
            eprintln!("  No state matching '{}'", prefix);
            None
        }
        1 => Some(matching.into_iter().next().unwrap()),
        n => {
            eprintln!("  Prefix '{}' is ambiguous ({} matches)", prefix, n);
            None
        }
    }
}

async fn cmd_transfer(args: &[String]) {
    let Some(path) = args.first() else {
        eprintln!("Usage: statemesh transfer <file> [nodes] [rf]");
        return;
    };
    let node_count: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(5);
    let rf: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(3);

    let payload = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("  Failed to read '{}': {}", path, e);
            return;
        }
    };
    let state = State::new(payload);
    println!("\n  {}", state.summary());

    let nodes: Vec<Arc<dyn NodeEndpoint>> = (0..node_count)
        .map(|i| Arc::new(LoopbackNode::new(format!("node-{}", i))) as Arc<dyn NodeEndpoint>)
        .collect();
    let swarm = Swarm::new(nodes);

    let Some(mgr) = open_persistence() else { return };
    let config = CoreConfig {
        replication_factor: rf,
        ..CoreConfig::default()
    };
    let protocol = match TransferProtocol::with_persistence(config, Arc::new(mgr)) {
        Ok(protocol) => protocol,
        Err(e) => {
            eprintln!("  Failed to initialize channel: {}", e);
            return;
        }
    };

    match protocol
        .transfer(&state, &swarm, &TransferOptions::default())
        .await
    {
        Ok(result) => {
            println!("  Transfer {} completed", &result.transfer_id[..8]);
            println!("  {}", result.record.summary());
            println!("  Integrity hash: {}...", &result.integrity_hash[..16]);
        }
        Err(e) => eprintln!("  Transfer failed: {}", e),
    }
}

fn cmd_store(args: &[String]) {
    let Some(path) = args.first() else {
        eprintln!("Usage: statemesh store <file> [state-id]");
        return;
    };
    let payload = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("  Failed to read '{}': {}", path, e);
            return;
        }
    };

    let state = match args.get(1) {
        Some(id) => {
            let shape = statemesh_core::state::StateShape::opaque(payload.len() as u64);
            State::with_shape(id.clone(), payload, shape)
        }
        None => State::new(payload),
    };

    let Some(mgr) = open_persistence() else { return };
    match mgr.persist(&state, None) {
        Ok(location) => {
            println!("\n  Stored: {}", state.summary());
            println!("  Location: {}", location);
        }
        Err(e) => eprintln!("  Store failed: {}", e),
    }
}

fn cmd_load(args: &[String]) {
    if args.len() < 2 {
        eprintln!("Usage: statemesh load <id-prefix> <out-file>");
        return;
    }
    let Some(mgr) = open_persistence() else { return };
    let Some(state_id) = find_state(&mgr, &args[0]) else { return };

    match mgr.load(&state_id, true) {
        Ok(state) => {
            if let Err(e) = std::fs::write(&args[1], &state.payload) {
                eprintln!("  Failed to write '{}': {}", args[1], e);
            } else {
                println!("  Loaded {} -> {}", state.summary(), args[1]);
            }
        }
        Err(e) => eprintln!("  Load failed: {}", e),
    }
}

fn cmd_list() {
    let Some(mgr) = open_persistence() else { return };
    let ids = mgr.list_states();
    if ids.is_empty() {
        println!("\n  No states. Use 'statemesh store' or 'statemesh demo' to get started.");
        return;
    }
    println!("\n  States ({}):", ids.len());
    println!("  {}", "-".repeat(80));
    for id in ids {
        if let Some(entry) = mgr.get_entry(&id) {
            let compression = match (entry.compressed, entry.compressed_size) {
                (true, Some(size)) => format!("{} bytes gzip", size),
                _ => "uncompressed".to_string(),
            };
            println!(
                "  [{}] {} bytes | v{} | {} | {} replicas",
                &id[..8.min(id.len())],
                entry.size_bytes,
                entry.format_version,
                compression,
                entry.replica_locations.len(),
            );
        }
    }
    println!("  {}", mgr.summary());
}

fn cmd_compress(args: &[String]) {
    let Some(prefix) = args.first() else {
        eprintln!("Usage: statemesh compress <id-prefix>");
        return;
    };
    let Some(mgr) = open_persistence() else { return };
    let Some(state_id) = find_state(&mgr, prefix) else { return };

    match mgr.compress(&state_id) {
        Ok((original, compressed)) => println!(
            "  Compressed [{}]: {} -> {} bytes ({:.1}x)",
            &state_id[..8],
            original,
            compressed,
            original as f64 / compressed.max(1) as f64
        ),
        Err(e) => eprintln!("  Compress failed: {}", e),
    }
}

fn cmd_replicate(args: &[String]) {
    if args.len() < 2 {
        eprintln!("Usage: statemesh replicate <id-prefix> <count>");
        return;
    }
    let Some(count) = args[1].parse::<usize>().ok() else {
        eprintln!("  Replica count must be a number");
        return;
    };
    let Some(mgr) = open_persistence() else { return };
    let Some(state_id) = find_state(&mgr, &args[0]) else { return };

    match mgr.replicate(&state_id, count) {
        Ok(locations) => {
            println!("  State [{}] now has {} replicas:", &state_id[..8], locations.len());
            for loc in locations {
                println!("    {}", loc);
            }
        }
        Err(e) => eprintln!("  Replicate failed: {}", e),
    }
}

fn cmd_delete(args: &[String]) {
    let Some(prefix) = args.first() else {
        eprintln!("Usage: statemesh delete <id-prefix>");
        return;
    };
    let Some(mgr) = open_persistence() else { return };
    let Some(state_id) = find_state(&mgr, prefix) else { return };

    match mgr.delete(&state_id) {
        Ok(freed) => println!("  Deleted [{}] ({} bytes freed)", &state_id[..8], freed),
        Err(e) => eprintln!("  Delete failed: {}", e),
    }
}

fn cmd_merge(args: &[String]) {
    if args.len() < 3 {
        eprintln!("Usage: statemesh merge <consensus|latest|manual> <id-prefix> <id-prefix>...");
        return;
    }
    let strategy = match args[0].as_str() {
        "consensus" => ConflictStrategy::Consensus,
        "latest" => ConflictStrategy::Latest,
        "manual" => ConflictStrategy::Manual,
        other => {
            eprintln!("  Unknown strategy: {}", other);
            return;
        }
    };

    let Some(mgr) = open_persistence() else { return };
    let mut state_ids = Vec::new();
    for prefix in &args[1..] {
        let Some(id) = find_state(&mgr, prefix) else { return };
        state_ids.push(id);
    }

    let persistence = Arc::new(mgr);
    let engine = TransformationEngine::new(persistence.clone());
    match engine.merge(&state_ids, strategy) {
        Ok(outcome) => {
            println!(
                "\n  Merge: {} conflicts, {} resolved",
                outcome.report.conflicts, outcome.report.conflicts_resolved
            );
            for conflict in &outcome.report.unresolved {
                println!("    unresolved '{}': {:?}", conflict.key, conflict.values);
            }
            if let Some(merged) = outcome.merged {
                match persistence.persist(&merged, None) {
                    Ok(_) => println!("  Merged state: {}", merged.summary()),
                    Err(e) => eprintln!("  Failed to persist merged state: {}", e),
                }
            } else {
                println!("  No merged state produced (manual conflicts remain).");
            }
        }
        Err(e) => eprintln!("  Merge failed: {}", e),
    }
}

async fn cmd_demo() {
    println!("\nStateMesh demo — transfer, persist, compress, merge");
    println!("{}", "=".repeat(60));

    // Step 1: a destination swarm of in-process nodes.
    println!("\nStep 1: Spinning up a 5-node swarm...");
    println!("{}", "-".repeat(60));
    let nodes: Vec<Arc<LoopbackNode>> = (0..5)
        .map(|i| Arc::new(LoopbackNode::new(format!("node-{}", i))))
        .collect();
    let endpoints: Vec<Arc<dyn NodeEndpoint>> = nodes
        .iter()
        .map(|n| n.clone() as Arc<dyn NodeEndpoint>)
        .collect();
    let swarm = Swarm::new(endpoints);
    println!("  Nodes: {:?}", swarm.node_ids());

    // Step 2: secure transfer with replication.
    println!("\nStep 2: Transferring a state (rf=3)...");
    println!("{}", "-".repeat(60));
    let config = CoreConfig {
        fragment_size: 4 * 1024,
        replication_factor: 3,
        ..CoreConfig::default()
    };
    let persistence = Arc::new(PersistenceManager::in_memory(None));
    let protocol = match TransferProtocol::with_persistence(config, persistence.clone()) {
        Ok(protocol) => protocol,
        Err(e) => {
            eprintln!("  Failed to initialize channel: {}", e);
            return;
        }
    };

    let payload: Vec<u8> = (0..100 * 1024).map(|i| (i / 512 % 11) as u8).collect();
    let state = State::new(payload);
    println!("  {}", state.summary());

    match protocol
        .transfer(&state, &swarm, &TransferOptions::default())
        .await
    {
        Ok(result) => {
            println!("  {}", result.record.summary());
            println!("  Integrity hash: {}...", &result.integrity_hash[..16]);
            let held: usize = nodes.iter().map(|n| n.fragment_count()).sum();
            println!("  Fragment copies held across swarm: {}", held);
        }
        Err(e) => {
            eprintln!("  Transfer failed: {}", e);
            return;
        }
    }

    // Step 3: rerouting around an unresponsive node.
    println!("\nStep 3: Transfer with node-2 silent (reroute)...");
    println!("{}", "-".repeat(60));
    nodes[2].set_silent(true);
    let reroute_config = CoreConfig {
        fragment_size: 4 * 1024,
        replication_factor: 3,
        ack_timeout_ms: 200,
        ..CoreConfig::default()
    };
    let reroute_protocol = match TransferProtocol::new(reroute_config) {
        Ok(protocol) => protocol,
        Err(e) => {
            eprintln!("  Failed to initialize channel: {}", e);
            return;
        }
    };
    let second = State::new(vec![7u8; 32 * 1024]);
    match reroute_protocol
        .transfer(&second, &swarm, &TransferOptions::default())
        .await
    {
        Ok(result) => {
            println!("  {}", result.record.summary());
            println!(
                "  Fragments on silent node-2: {} (rerouted elsewhere)",
                result
                    .record
                    .assignments
                    .get("node-2")
                    .map(|s| s.len())
                    .unwrap_or(0)
            );
        }
        Err(e) => eprintln!("  Transfer failed: {}", e),
    }
    nodes[2].set_silent(false);

    // Step 4: compression and storage replication.
    println!("\nStep 4: Compressing and replicating the persisted state...");
    println!("{}", "-".repeat(60));
    match persistence.compress(&state.state_id) {
        Ok((original, compressed)) => println!(
            "  Compressed: {} -> {} bytes ({:.1}x)",
            original,
            compressed,
            original as f64 / compressed.max(1) as f64
        ),
        Err(e) => eprintln!("  Compress failed: {}", e),
    }
    match persistence.replicate(&state.state_id, 2) {
        Ok(locations) => println!("  Replicas: {:?}", locations),
        Err(e) => eprintln!("  Replicate failed: {}", e),
    }
    let loaded = persistence.load(&state.state_id, true);
    println!(
        "  Load-back with verification: {}",
        if loaded.is_ok() { "OK" } else { "FAILED" }
    );

    // Step 5: merging structured states.
    println!("\nStep 5: Merging structured states (consensus)...");
    println!("{}", "-".repeat(60));
    let a = State::new(br#"{"epoch": 12, "lr": 0.01, "owner": "alpha"}"#.to_vec());
    let b = State::new(br#"{"epoch": 12, "lr": 0.02, "owner": "alpha"}"#.to_vec());
    let c = State::new(br#"{"epoch": 12, "lr": 0.02, "bias": true}"#.to_vec());
    for s in [&a, &b, &c] {
        if let Err(e) = persistence.persist(s, None) {
            eprintln!("  Persist failed: {}", e);
            return;
        }
    }

    let engine = TransformationEngine::new(persistence.clone());
    match engine.merge(
        &[a.state_id.clone(), b.state_id.clone(), c.state_id.clone()],
        ConflictStrategy::Consensus,
    ) {
        Ok(outcome) => {
            println!(
                "  Conflicts: {} | resolved: {}",
                outcome.report.conflicts, outcome.report.conflicts_resolved
            );
            if let Some(merged) = outcome.merged {
                println!(
                    "  Merged payload: {}",
                    String::from_utf8_lossy(&merged.payload)
                );
            }
        }
        Err(e) => eprintln!("  Merge failed: {}", e),
    }

    println!("\nStep 6: Final store summary");
    println!("{}", "-".repeat(60));
    println!("  {}", persistence.summary());
    println!("\nDemo complete.");
}
