//! # Discovery Module
//!
//! Peer discovery and presence management on top of the messaging core.
//!
//! ## Presence Loop
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       PRESENCE CYCLE (every 30s)                        │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  1. Evict the silent                                                    │
//! │  ┌─────────────────────────────────────────────────────────────┐        │
//! │  │  last_seen older than the timeout (10 min)                  │        │
//! │  │  → remove from the directory                                │        │
//! │  │  → drop the peer's session keys                             │        │
//! │  │  → one Timeout event + one peer_disconnected callback       │        │
//! │  └─────────────────────────────────────────────────────────────┘        │
//! │                                                                         │
//! │  2. Ping the living                                                     │
//! │  ┌─────────────────────────────────────────────────────────────┐        │
//! │  │  sealed liveness probe through the messaging core           │        │
//! │  │  → hand-off time becomes the latency sample                 │        │
//! │  │  → quality: <100ms excellent, <200ms good, <500ms fair      │        │
//! │  │  → peer_updated callback with the refreshed entry           │        │
//! │  └─────────────────────────────────────────────────────────────┘        │
//! │                                                                         │
//! │  Probes are fire-and-forget: a failed ping is logged and the peer       │
//! │  simply drifts toward eviction.                                         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Events
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       DISCOVERY EVENTS                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Listener registries (register / remove by id):                         │
//! │  • peer_connected            - a new peer entered the directory         │
//! │  • peer_disconnected         - a peer timed out and was evicted         │
//! │  • peer_updated              - a ping refreshed latency / quality       │
//! │  • connection_state_changed  - forwarded from the messaging core        │
//! │                                                                         │
//! │  The last 256 connection events (connected / disconnected / timeout)    │
//! │  are retained in a ring for diagnostics.                                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::crypto::{CryptoProvider, KemStrength, SignatureLevel};
use crate::error::{Error, Result};
use crate::events::{ListenerId, Listeners};
use crate::messaging::envelope::PING_PAYLOAD;
use crate::messaging::{SecureMessaging, SendOptions};
use crate::peers::{Capability, ConnectionQuality, PeerDirectory, PeerInfo};
use crate::time::Clock;
use crate::transport::ConnectionState;

/// How many connection events the diagnostics ring retains.
pub const EVENT_RING_CAPACITY: usize = 256;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Tuning knobs for peer discovery.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Interval between presence cycles
    pub ping_interval: Duration,
    /// Silence threshold after which a peer is evicted
    pub peer_timeout: Duration,
    /// Directory capacity; discovery stops adding peers beyond this
    pub max_peers: usize,
    /// Connect as part of initialization
    pub auto_connect: bool,
    /// Protocol version advertised for discovered peers
    pub protocol_version: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            peer_timeout: Duration::from_secs(10 * 60),
            max_peers: 50,
            auto_connect: true,
            protocol_version: "1.0.0".to_string(),
        }
    }
}

// ============================================================================
// EVENTS AND STATS
// ============================================================================

/// What happened to a peer, as recorded in the diagnostics ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionEventKind {
    /// The peer entered the directory
    Connected,
    /// The peer left cleanly
    Disconnected,
    /// The peer went silent past the timeout and was evicted
    Timeout,
}

impl ConnectionEventKind {
    /// Lowercase label, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ConnectionEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the diagnostics ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionEvent {
    /// The peer involved
    pub peer_id: String,
    /// What happened
    pub kind: ConnectionEventKind,
    /// When it happened (Unix milliseconds)
    pub at: i64,
}

/// Aggregate view of the network as this node sees it.
///
/// Latency figures cover peers with at least one ping sample; `quality` is
/// `None` until a sample exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetworkStats {
    /// Peers currently in the directory
    pub peer_count: usize,
    /// Mean ping latency across sampled peers
    pub average_latency_ms: u32,
    /// Best sampled latency
    pub min_latency_ms: u32,
    /// Worst sampled latency
    pub max_latency_ms: u32,
    /// Band the average falls in, if any peer has a sample
    pub quality: Option<ConnectionQuality>,
    /// Seconds since [`PeerDiscovery::initialize`] completed
    pub uptime_secs: u64,
    /// Messages the core has sent since startup
    pub messages_sent: u64,
    /// Messages the core has received since startup
    pub messages_received: u64,
}

// ============================================================================
// PEER DISCOVERY SERVICE
// ============================================================================

/// Discovery service: finds peers, tracks their liveness, and reports
/// network health.
///
/// Sits on top of a [`SecureMessaging`] core and shares its peer directory.
/// All probe traffic goes through the core, so pings are sealed and signed
/// like any other message.
pub struct PeerDiscovery {
    config: DiscoveryConfig,
    core: Arc<SecureMessaging>,
    directory: Arc<PeerDirectory>,
    clock: Clock,
    started_at: RwLock<Option<i64>>,
    peer_connected: Listeners<PeerInfo>,
    peer_disconnected: Listeners<PeerInfo>,
    peer_updated: Listeners<PeerInfo>,
    state_listeners: Listeners<ConnectionState>,
    events: Mutex<VecDeque<ConnectionEvent>>,
    core_listener: Mutex<Option<ListenerId>>,
    initialized: AtomicBool,
    running: AtomicBool,
    init_lock: tokio::sync::Mutex<()>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerDiscovery {
    /// Wire up a discovery service over an existing messaging core.
    /// Nothing runs until [`initialize`](Self::initialize).
    pub fn new(
        config: DiscoveryConfig,
        core: Arc<SecureMessaging>,
        directory: Arc<PeerDirectory>,
        clock: Clock,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            core,
            directory,
            clock,
            started_at: RwLock::new(None),
            peer_connected: Listeners::new(),
            peer_disconnected: Listeners::new(),
            peer_updated: Listeners::new(),
            state_listeners: Listeners::new(),
            events: Mutex::new(VecDeque::with_capacity(EVENT_RING_CAPACITY)),
            core_listener: Mutex::new(None),
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
            init_lock: tokio::sync::Mutex::new(()),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Initialize the underlying core, hook its state events, and start the
    /// uptime clock. Connects right away when `auto_connect` is set. Safe to
    /// call more than once.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::SeqCst) {
            tracing::debug!("Peer discovery already initialized");
            return Ok(());
        }

        self.core.initialize().await?;

        let weak = Arc::downgrade(self);
        let id = self.core.on_state_change(move |state| {
            if let Some(discovery) = weak.upgrade() {
                discovery.state_listeners.emit(state);
            }
        });
        *self.core_listener.lock() = Some(id);
        *self.started_at.write() = Some(self.clock.now_millis());
        self.initialized.store(true, Ordering::SeqCst);

        if self.config.auto_connect {
            self.connect().await?;
        }

        tracing::info!(peer_id = %self.core.local_peer_id(), "Peer discovery initialized");
        Ok(())
    }

    /// Bring the core online and start the presence loop. No-op when
    /// already running.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.ensure_initialized()?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.core.connect().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let (tx, rx) = watch::channel(false);
        self.tasks
            .lock()
            .push(tokio::spawn(run_presence(Arc::clone(self), rx)));
        *self.shutdown.lock() = Some(tx);

        tracing::info!("Peer discovery connected");
        Ok(())
    }

    /// Stop the presence loop and take the core offline. No-op when not
    /// running.
    pub async fn disconnect(&self) -> Result<()> {
        self.ensure_initialized()?;
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(true);
        }
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        self.core.disconnect().await?;
        tracing::info!("Peer discovery disconnected");
        Ok(())
    }

    /// Disconnect and unhook from the core.
    pub async fn shutdown(&self) {
        if self.running.load(Ordering::SeqCst) {
            let _ = self.disconnect().await;
        }
        if let Some(id) = self.core_listener.lock().take() {
            self.core.off_state_change(id);
        }
        self.initialized.store(false, Ordering::SeqCst);
        tracing::info!("Peer discovery shut down");
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// Run one discovery round. Returns how many peers were added.
    ///
    /// There is no tracker to query yet, so a round synthesizes one to five
    /// peers with freshly generated key material, honoring `max_peers`.
    /// Synthetic peers answer no probes and age out through the presence
    /// loop like any silent peer.
    pub async fn discover_peers(&self) -> Result<usize> {
        self.ensure_initialized()?;
        let provider = self.core.provider();
        let target = {
            let mut rng = rand::thread_rng();
            rng.gen_range(1..=5)
        };

        let mut added = 0;
        for _ in 0..target {
            if self.directory.len() >= self.config.max_peers {
                tracing::debug!(max_peers = self.config.max_peers, "Peer capacity reached");
                break;
            }

            let (takes_dtn, relays) = {
                let mut rng = rand::thread_rng();
                (rng.gen_bool(0.5), rng.gen_bool(0.25))
            };
            let kem = provider.generate_kem_keypair(KemStrength::Bits768).await?;
            let signing = provider
                .generate_signing_keypair(SignatureLevel::Level3)
                .await?;

            let peer_id = format!("peer-{}", Uuid::new_v4());
            let mut capabilities = vec![Capability::Messaging, Capability::Broadcast];
            if takes_dtn {
                capabilities.push(Capability::Dtn);
            }
            if relays {
                capabilities.push(Capability::Relay);
            }

            let mut info = PeerInfo::new(
                peer_id.clone(),
                kem.public.clone(),
                signing.public.clone(),
                self.clock.now_millis(),
            )
            .with_capabilities(capabilities);
            info.protocol_version = self.config.protocol_version.clone();

            if self.directory.upsert(info.clone()) {
                self.record_event(&peer_id, ConnectionEventKind::Connected);
                self.peer_connected.emit(&info);
                added += 1;
            }
        }

        tracing::info!(added, known = self.directory.len(), "Discovery round finished");
        Ok(added)
    }

    // ------------------------------------------------------------------
    // Listeners and introspection
    // ------------------------------------------------------------------

    /// Register a listener for peers entering the directory.
    pub fn on_peer_connected(
        &self,
        listener: impl Fn(&PeerInfo) + Send + Sync + 'static,
    ) -> ListenerId {
        self.peer_connected.add(listener)
    }

    /// Remove a peer-connected listener.
    pub fn off_peer_connected(&self, id: ListenerId) -> bool {
        self.peer_connected.remove(id)
    }

    /// Register a listener for peers leaving, cleanly or by timeout.
    pub fn on_peer_disconnected(
        &self,
        listener: impl Fn(&PeerInfo) + Send + Sync + 'static,
    ) -> ListenerId {
        self.peer_disconnected.add(listener)
    }

    /// Remove a peer-disconnected listener.
    pub fn off_peer_disconnected(&self, id: ListenerId) -> bool {
        self.peer_disconnected.remove(id)
    }

    /// Register a listener for liveness or latency updates to known peers.
    pub fn on_peer_updated(
        &self,
        listener: impl Fn(&PeerInfo) + Send + Sync + 'static,
    ) -> ListenerId {
        self.peer_updated.add(listener)
    }

    /// Remove a peer-updated listener.
    pub fn off_peer_updated(&self, id: ListenerId) -> bool {
        self.peer_updated.remove(id)
    }

    /// Register a listener for transport state transitions, relayed from
    /// the messaging core.
    pub fn on_connection_state_changed(
        &self,
        listener: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> ListenerId {
        self.state_listeners.add(listener)
    }

    /// Remove a connection-state listener.
    pub fn off_connection_state_changed(&self, id: ListenerId) -> bool {
        self.state_listeners.remove(id)
    }

    /// Snapshot of every known peer.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.directory.all()
    }

    /// A single peer's entry, if known.
    pub fn peer(&self, peer_id: &str) -> Option<PeerInfo> {
        self.directory.get(peer_id)
    }

    /// The messaging core's view of the connection.
    pub fn connection_state(&self) -> ConnectionState {
        self.core.connection_state()
    }

    /// The diagnostics ring, oldest first.
    pub fn recent_events(&self) -> Vec<ConnectionEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Aggregate network health: peer count, latency spread, quality,
    /// uptime, and traffic counters.
    pub fn network_stats(&self) -> NetworkStats {
        let peers = self.directory.all();
        let samples: Vec<u32> = peers
            .iter()
            .map(|p| p.latency_ms)
            .filter(|l| *l > 0)
            .collect();

        let (average, min, max) = if samples.is_empty() {
            (0, 0, 0)
        } else {
            let sum: u64 = samples.iter().map(|l| u64::from(*l)).sum();
            (
                (sum / samples.len() as u64) as u32,
                samples.iter().copied().min().unwrap_or_default(),
                samples.iter().copied().max().unwrap_or_default(),
            )
        };

        let uptime_secs = self.started_at.read().map_or(0, |started| {
            ((self.clock.now_millis() - started).max(0) / 1000) as u64
        });
        let counters = self.core.message_counters();

        NetworkStats {
            peer_count: peers.len(),
            average_latency_ms: average,
            min_latency_ms: min,
            max_latency_ms: max,
            quality: (!samples.is_empty()).then(|| ConnectionQuality::from_latency(average)),
            uptime_secs,
            messages_sent: counters.sent,
            messages_received: counters.received,
        }
    }

    /// Whether [`initialize`](Self::initialize) has completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Whether the background loops are live.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The configuration in effect.
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    fn record_event(&self, peer_id: &str, kind: ConnectionEventKind) {
        let mut events = self.events.lock();
        if events.len() == EVENT_RING_CAPACITY {
            events.pop_front();
        }
        events.push_back(ConnectionEvent {
            peer_id: peer_id.to_string(),
            kind,
            at: self.clock.now_millis(),
        });
    }

    /// One pass of the presence loop: evict, then probe.
    async fn presence_cycle(&self) {
        self.evict_timed_out();
        if self.core.connection_state().is_connected() {
            self.ping_peers().await;
        }
    }

    /// Evict peers that have been silent past the timeout. Each evicted
    /// peer produces exactly one Timeout event and one `peer_disconnected`
    /// callback; its session keys are dropped with it.
    fn evict_timed_out(&self) {
        let now = self.clock.now_millis();
        let timeout = self.config.peer_timeout.as_millis() as i64;
        for peer in self.directory.evict_stale(now, timeout) {
            tracing::info!(peer_id = %peer.peer_id, "Peer timed out");
            self.core.forget_peer(&peer.peer_id);
            self.record_event(&peer.peer_id, ConnectionEventKind::Timeout);
            self.peer_disconnected.emit(&peer);
        }
    }

    /// Probe every known peer and fold the hand-off time into its latency.
    async fn ping_peers(&self) {
        for peer in self.directory.all() {
            let started = Instant::now();
            match self
                .core
                .send_message(&peer.peer_id, PING_PAYLOAD, SendOptions::default())
                .await
            {
                Ok(_) => {
                    let latency = started.elapsed().as_millis() as u32;
                    let now = self.clock.now_millis();
                    if let Some(updated) = self.directory.record_ping(&peer.peer_id, now, latency)
                    {
                        tracing::debug!(
                            peer_id = %peer.peer_id,
                            latency_ms = updated.latency_ms,
                            quality = %updated.quality,
                            "Pinged peer"
                        );
                        self.peer_updated.emit(&updated);
                    }
                }
                Err(e) => {
                    tracing::debug!(peer_id = %peer.peer_id, error = %e, "Ping failed");
                }
            }
        }
    }
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Runs the presence cycle until told to stop.
async fn run_presence(discovery: Arc<PeerDiscovery>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(discovery.config.ping_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                discovery.presence_cycle().await;
            }
        }
    }
    tracing::debug!("Presence task stopped");
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DhKemProvider;
    use crate::messaging::{MessagingConfig, ReceivedMessage};
    use crate::transport::memory::{MemoryHub, MemoryTransport};
    use crate::transport::Transport;

    struct Scene {
        discovery: Arc<PeerDiscovery>,
        core: Arc<SecureMessaging>,
        directory: Arc<PeerDirectory>,
        hub: Arc<MemoryHub>,
        clock: Clock,
    }

    fn fast_config() -> DiscoveryConfig {
        DiscoveryConfig {
            ping_interval: Duration::from_millis(50),
            auto_connect: false,
            ..DiscoveryConfig::default()
        }
    }

    fn scene_with(config: DiscoveryConfig) -> Scene {
        let hub = MemoryHub::new();
        let clock = Clock::manual(1_000_000);
        let transport = MemoryTransport::new(Arc::clone(&hub), "local");
        let directory = Arc::new(PeerDirectory::new());
        let core = SecureMessaging::new(
            MessagingConfig::default(),
            Arc::new(DhKemProvider::new()),
            transport as Arc<dyn Transport>,
            Arc::clone(&directory),
            clock.clone(),
        );
        let discovery = PeerDiscovery::new(
            config,
            Arc::clone(&core),
            Arc::clone(&directory),
            clock.clone(),
        );
        Scene {
            discovery,
            core,
            directory,
            hub,
            clock,
        }
    }

    fn peer_sink(
        register: impl FnOnce(Box<dyn Fn(&PeerInfo) + Send + Sync>) -> ListenerId,
    ) -> Arc<Mutex<Vec<PeerInfo>>> {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&sink);
        register(Box::new(move |peer| captured.lock().push(peer.clone())));
        sink
    }

    async fn synthesized_peer(clock: &Clock, peer_id: &str) -> PeerInfo {
        let provider = DhKemProvider::new();
        let kem = provider
            .generate_kem_keypair(KemStrength::Bits768)
            .await
            .unwrap();
        let signing = provider
            .generate_signing_keypair(SignatureLevel::Level3)
            .await
            .unwrap();
        PeerInfo::new(
            peer_id,
            kem.public.clone(),
            signing.public.clone(),
            clock.now_millis(),
        )
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent_and_starts_core() {
        let scene = scene_with(fast_config());
        scene.discovery.initialize().await.unwrap();
        scene.discovery.initialize().await.unwrap();
        assert!(scene.discovery.is_initialized());
        assert!(scene.core.is_initialized());
        assert!(!scene.discovery.is_running());
    }

    #[tokio::test]
    async fn test_auto_connect_brings_link_up() {
        let scene = scene_with(DiscoveryConfig {
            auto_connect: true,
            ..fast_config()
        });
        let states = {
            let sink = Arc::new(Mutex::new(Vec::new()));
            let captured = Arc::clone(&sink);
            scene
                .discovery
                .on_connection_state_changed(move |state| captured.lock().push(*state));
            sink
        };

        scene.discovery.initialize().await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(scene.discovery.is_running());
        assert_eq!(scene.discovery.connection_state(), ConnectionState::Connected);
        assert_eq!(
            *states.lock(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }

    #[tokio::test]
    async fn test_discover_peers_synthesizes_some() {
        let scene = scene_with(fast_config());
        scene.discovery.initialize().await.unwrap();
        let connected = peer_sink(|l| scene.discovery.on_peer_connected(l));

        let added = scene.discovery.discover_peers().await.unwrap();

        assert!((1..=5).contains(&added));
        assert_eq!(scene.directory.len(), added);
        assert_eq!(connected.lock().len(), added);
        let events = scene.discovery.recent_events();
        assert_eq!(events.len(), added);
        assert!(events
            .iter()
            .all(|e| e.kind == ConnectionEventKind::Connected));
    }

    #[tokio::test]
    async fn test_discover_respects_capacity() {
        let scene = scene_with(DiscoveryConfig {
            max_peers: 3,
            ..fast_config()
        });
        scene.discovery.initialize().await.unwrap();

        for _ in 0..5 {
            scene.discovery.discover_peers().await.unwrap();
        }
        assert_eq!(scene.directory.len(), 3);

        let added = scene.discovery.discover_peers().await.unwrap();
        assert_eq!(added, 0);
    }

    #[tokio::test]
    async fn test_timeout_evicts_exactly_once() {
        let scene = scene_with(fast_config());
        scene.discovery.initialize().await.unwrap();
        let disconnected = peer_sink(|l| scene.discovery.on_peer_disconnected(l));

        let peer = synthesized_peer(&scene.clock, "quiet-peer").await;
        scene.directory.upsert(peer);

        scene.clock.advance(Duration::from_secs(601));
        scene.discovery.evict_timed_out();

        assert!(scene.directory.is_empty());
        assert_eq!(disconnected.lock().len(), 1);
        assert_eq!(disconnected.lock()[0].peer_id, "quiet-peer");
        let events = scene.discovery.recent_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ConnectionEventKind::Timeout);

        // A second sweep finds nothing; no duplicate callbacks or events.
        scene.discovery.evict_timed_out();
        assert_eq!(disconnected.lock().len(), 1);
        assert_eq!(scene.discovery.recent_events().len(), 1);
    }

    #[tokio::test]
    async fn test_presence_loop_measures_latency() {
        let scene = scene_with(fast_config());
        scene.discovery.initialize().await.unwrap();

        // A real peer on the same hub that can receive probes.
        let bob_transport = MemoryTransport::new(Arc::clone(&scene.hub), "bob");
        let bob_directory = Arc::new(PeerDirectory::new());
        let bob_core = SecureMessaging::new(
            MessagingConfig::default(),
            Arc::new(DhKemProvider::new()),
            Arc::clone(&bob_transport) as Arc<dyn Transport>,
            Arc::clone(&bob_directory),
            scene.clock.clone(),
        );
        bob_core.initialize().await.unwrap();
        bob_core.connect().await.unwrap();
        bob_directory.upsert(scene.core.local_peer_info().unwrap());
        scene.directory.upsert(bob_core.local_peer_info().unwrap());

        let bob_inbox: Arc<Mutex<Vec<ReceivedMessage>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&bob_inbox);
        bob_core.on_message(move |message| captured.lock().push(message.clone()));
        let updated = peer_sink(|l| scene.discovery.on_peer_updated(l));

        scene.discovery.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let bob = scene.discovery.peer("bob").unwrap();
        assert!(bob.latency_ms >= 1);
        assert_eq!(bob.quality, ConnectionQuality::Excellent);
        assert!(!updated.lock().is_empty());

        // Probes arrive as ordinary sealed messages.
        let inbox = bob_inbox.lock();
        assert!(!inbox.is_empty());
        assert_eq!(inbox[0].payload, PING_PAYLOAD);
        assert!(inbox[0].encrypted);

        drop(inbox);
        scene.discovery.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_network_stats_aggregates_latency() {
        let scene = scene_with(fast_config());
        scene.discovery.initialize().await.unwrap();

        let fast = synthesized_peer(&scene.clock, "fast").await;
        let slow = synthesized_peer(&scene.clock, "slow").await;
        scene.directory.upsert(fast);
        scene.directory.upsert(slow);
        let now = scene.clock.now_millis();
        scene.directory.record_ping("fast", now, 50);
        scene.directory.record_ping("slow", now, 150);

        scene.clock.advance(Duration::from_secs(5));
        let stats = scene.discovery.network_stats();

        assert_eq!(stats.peer_count, 2);
        assert_eq!(stats.average_latency_ms, 100);
        assert_eq!(stats.min_latency_ms, 50);
        assert_eq!(stats.max_latency_ms, 150);
        assert_eq!(stats.quality, Some(ConnectionQuality::Good));
        assert_eq!(stats.uptime_secs, 5);
        assert_eq!(stats.messages_sent, 0);
        assert_eq!(stats.messages_received, 0);
    }

    #[tokio::test]
    async fn test_stats_without_samples_have_no_quality() {
        let scene = scene_with(fast_config());
        scene.discovery.initialize().await.unwrap();
        let stats = scene.discovery.network_stats();
        assert_eq!(stats.peer_count, 0);
        assert_eq!(stats.average_latency_ms, 0);
        assert_eq!(stats.quality, None);
    }

    #[tokio::test]
    async fn test_event_ring_is_capped() {
        let scene = scene_with(fast_config());
        for i in 0..300 {
            scene
                .discovery
                .record_event(&format!("peer-{}", i), ConnectionEventKind::Connected);
        }
        let events = scene.discovery.recent_events();
        assert_eq!(events.len(), EVENT_RING_CAPACITY);
        assert_eq!(events[0].peer_id, "peer-44");
        assert_eq!(events.last().unwrap().peer_id, "peer-299");
    }

    #[tokio::test]
    async fn test_removed_listener_stops_firing() {
        let scene = scene_with(fast_config());
        scene.discovery.initialize().await.unwrap();

        let sink = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&sink);
        let id = scene
            .discovery
            .on_peer_connected(move |peer: &PeerInfo| captured.lock().push(peer.peer_id.clone()));
        assert!(scene.discovery.off_peer_connected(id));

        scene.discovery.discover_peers().await.unwrap();
        assert!(sink.lock().is_empty());
    }
}
