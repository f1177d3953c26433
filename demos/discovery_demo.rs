//! # Peer Discovery Demo
//!
//! This example demonstrates the presence layer on top of the messaging
//! core:
//! 1. Full stack wiring with auto-connect
//! 2. Typed listeners for peer lifecycle events
//! 3. Discovery rounds that populate the directory
//! 4. Presence pings, latency samples, and quality bands
//! 5. Timeout eviction, network stats, and the event ring
//!
//! ## Run
//!
//! ```bash
//! cargo run --example discovery_demo
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use aphelion_core::discovery::EVENT_RING_CAPACITY;
use aphelion_core::{
    Clock, ConnectionQuality, CryptoProvider, DhKemProvider, DiscoveryConfig, MemoryHub,
    MemoryTransport, MessagingConfig, PeerDirectory, PeerDiscovery, SecureMessaging,
};

#[tokio::main]
async fn main() {
    println!("=================================================");
    println!("         APHELION PEER DISCOVERY DEMO");
    println!("=================================================\n");

    // =========================================================================
    // STEP 1: Wire the full stack
    // =========================================================================
    println!("1. Wiring the stack (hub -> core -> discovery)...\n");

    let hub = MemoryHub::new();
    let provider: Arc<dyn CryptoProvider> = Arc::new(DhKemProvider::new());
    let clock = Clock::system();

    let alice_directory = Arc::new(PeerDirectory::new());
    let alice_core = SecureMessaging::new(
        MessagingConfig::default(),
        Arc::clone(&provider),
        MemoryTransport::new(Arc::clone(&hub), "alice"),
        Arc::clone(&alice_directory),
        clock.clone(),
    );

    // Short intervals so the demo shows a full presence cycle in seconds.
    // Production defaults are 30s pings and a 10 minute timeout.
    let config = DiscoveryConfig {
        ping_interval: Duration::from_secs(1),
        peer_timeout: Duration::from_secs(4),
        auto_connect: true,
        ..Default::default()
    };
    let discovery = PeerDiscovery::new(
        config,
        Arc::clone(&alice_core),
        Arc::clone(&alice_directory),
        clock.clone(),
    );

    // A real second node so at least one peer actually answers probes.
    let bob_directory = Arc::new(PeerDirectory::new());
    let bob = SecureMessaging::new(
        MessagingConfig::default(),
        Arc::clone(&provider),
        MemoryTransport::new(Arc::clone(&hub), "bob"),
        Arc::clone(&bob_directory),
        clock.clone(),
    );
    bob.initialize().await.expect("Failed to initialize Bob");
    bob.connect().await.expect("Bob failed to connect");

    // Mint Alice's keys up front so the two records can be swapped.
    alice_core.initialize().await.expect("Failed to initialize Alice");
    alice_directory.upsert(bob.local_peer_info().expect("Bob has no record"));
    bob_directory.upsert(alice_core.local_peer_info().expect("Alice has no record"));

    println!("   Alice runs discovery; Bob is a plain messaging node.");
    println!();

    // =========================================================================
    // STEP 2: Register lifecycle listeners
    // =========================================================================
    println!("2. Registering lifecycle listeners...\n");

    discovery.on_peer_connected(|peer| {
        println!(
            "   [connected] {} ({:?})",
            &peer.peer_id[..12.min(peer.peer_id.len())],
            peer.capabilities
        );
    });

    let updates: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&updates);
    discovery.on_peer_updated(move |peer| {
        log.lock().unwrap().push(format!(
            "{} -> {}ms ({})",
            peer.peer_id,
            peer.latency_ms,
            peer.quality.as_str()
        ));
    });

    let drops: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&drops);
    discovery.on_peer_disconnected(move |peer| {
        log.lock().unwrap().push(peer.peer_id.clone());
    });

    println!("   connected / updated / disconnected listeners in place.");
    println!();

    // =========================================================================
    // STEP 3: Initialize with auto-connect
    // =========================================================================
    println!("3. Initializing discovery (auto-connect on)...\n");

    discovery.initialize().await.expect("Failed to initialize discovery");

    println!("   Connection state: {}", discovery.connection_state());
    println!("   Presence loop running: {}", discovery.is_running());
    println!();

    // Let the first ping cycle reach Bob.
    tokio::time::sleep(Duration::from_millis(1300)).await;

    println!("   Probe results so far:");
    for line in updates.lock().unwrap().iter() {
        println!("   - {}", line);
    }
    println!();

    // =========================================================================
    // STEP 4: Discovery rounds
    // =========================================================================
    println!("4. Running discovery rounds...\n");

    let first = discovery.discover_peers().await.expect("Discovery failed");
    let second = discovery.discover_peers().await.expect("Discovery failed");

    println!();
    println!("   Round one found {} peers, round two {}.", first, second);
    println!("   Directory now holds {} peers:", discovery.peers().len());
    for peer in discovery.peers() {
        let latency = if peer.latency_ms == 0 {
            "no sample yet".to_string()
        } else {
            format!("{}ms, {}", peer.latency_ms, peer.quality.as_str())
        };
        println!(
            "   - {:<17} v{:<6} {}",
            &peer.peer_id[..12.min(peer.peer_id.len())],
            peer.protocol_version,
            latency
        );
    }
    println!();
    println!("   Discovered peers answer no probes, so they never earn a");
    println!("   latency sample and will age out below.");
    println!();

    // =========================================================================
    // STEP 5: Network stats
    // =========================================================================
    println!("5. Network stats snapshot...\n");

    let stats = discovery.network_stats();
    println!("   Peers:            {}", stats.peer_count);
    println!("   Average latency:  {}ms", stats.average_latency_ms);
    println!(
        "   Latency range:    {}ms - {}ms",
        stats.min_latency_ms, stats.max_latency_ms
    );
    match stats.quality {
        Some(quality) => println!("   Overall quality:  {}", quality),
        None => println!("   Overall quality:  n/a (no samples)"),
    }
    println!("   Uptime:           {}s", stats.uptime_secs);
    println!(
        "   Traffic:          {} sent / {} received",
        stats.messages_sent, stats.messages_received
    );
    println!();
    println!("   Only pinged peers contribute latency samples; discovered");
    println!("   peers sit at 0 and are excluded from the average.");
    println!();

    // =========================================================================
    // STEP 6: Timeout eviction
    // =========================================================================
    println!("6. Waiting for silent peers to time out...\n");

    // The discovered peers' last activity was their insertion. Once the
    // 4s timeout lapses the next presence cycle evicts them; Bob keeps
    // answering pings and stays.
    tokio::time::sleep(Duration::from_millis(5500)).await;

    let dropped = drops.lock().unwrap().clone();
    println!("   Evicted {} peers (exactly one event each):", dropped.len());
    for peer_id in &dropped {
        println!("   - {}", &peer_id[..12.min(peer_id.len())]);
    }
    println!();
    let remaining: Vec<String> = discovery.peers().iter().map(|p| p.peer_id.clone()).collect();
    println!("   Remaining peers: {:?}", remaining);
    println!("   Eviction also drops the peer's session keys, so a returning");
    println!("   peer starts a fresh key exchange.");
    println!();

    // =========================================================================
    // STEP 7: The connection event ring
    // =========================================================================
    println!("7. Connection event ring...\n");

    let events = discovery.recent_events();
    println!(
        "   {} events recorded (ring keeps the last {}):",
        events.len(),
        EVENT_RING_CAPACITY
    );
    for event in events.iter().take(6) {
        println!(
            "   - {:<12} {}",
            event.kind,
            &event.peer_id[..12.min(event.peer_id.len())]
        );
    }
    if events.len() > 6 {
        println!("   - ... {} more", events.len() - 6);
    }
    println!();

    // =========================================================================
    // STEP 8: Quality bands
    // =========================================================================
    println!("8. Latency quality bands...\n");

    for sample in [50u32, 150, 350, 800] {
        println!(
            "   {:>4}ms -> {}",
            sample,
            ConnectionQuality::from_latency(sample).as_str()
        );
    }
    println!();

    // =========================================================================
    // STEP 9: Configuration
    // =========================================================================
    println!("9. Discovery configuration...\n");

    let defaults = DiscoveryConfig::default();
    println!("   Default configuration:");
    println!("   - Ping interval:    {:?}", defaults.ping_interval);
    println!("   - Peer timeout:     {:?}", defaults.peer_timeout);
    println!("   - Max peers:        {}", defaults.max_peers);
    println!("   - Auto-connect:     {}", defaults.auto_connect);
    println!("   - Protocol version: {}", defaults.protocol_version);
    println!();
    println!("   This demo ran with 1s pings and a 4s timeout so a full");
    println!("   presence cycle fits in a few seconds.");
    println!();

    discovery.shutdown().await;
    alice_core.shutdown().await;
    bob.shutdown().await;

    // =========================================================================
    // Summary
    // =========================================================================
    println!("=================================================");
    println!("                    SUMMARY");
    println!("=================================================\n");
    println!("  Presence:");
    println!("  - Periodic encrypted pings measure hand-off latency");
    println!("  - Quality bands: <100ms / <200ms / <500ms / above");
    println!("  - Silent peers are evicted after the timeout, once");
    println!();
    println!("  Discovery:");
    println!("  - Each round yields 1-5 peers up to the cap");
    println!("  - Records carry keys, capabilities, protocol version");
    println!();
    println!("  Observability:");
    println!("  - Typed listeners: connected / disconnected / updated");
    println!("  - Ring of recent connection events for diagnostics");
    println!("  - Aggregate stats: latency spread, uptime, traffic");
    println!();
}
