//! # Secure Messaging Demo
//!
//! This example demonstrates the end-to-end messaging core:
//! 1. Two nodes wired onto a shared in-memory hub
//! 2. Peer records exchanged out of band
//! 3. An encrypted + signed message with delivery confirmation
//! 4. What an envelope actually looks like on the wire
//! 5. Security tiers, broadcast, and store-and-forward delivery
//!
//! ## Run
//!
//! ```bash
//! cargo run --example messaging_demo
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use aphelion_core::crypto::{KemStrength, SignatureLevel};
use aphelion_core::messaging::{MessagePriority, SecureMessage};
use aphelion_core::transport::TransportEvent;
use aphelion_core::{
    Clock, CryptoProvider, DhKemProvider, MemoryHub, MemoryTransport, MessagingConfig,
    PeerDirectory, PeerInfo, ReceivedMessage, SecureMessaging, SecurityLevel, SendOptions,
    Transport,
};

#[tokio::main]
async fn main() {
    println!("=================================================");
    println!("        APHELION SECURE MESSAGING DEMO");
    println!("=================================================\n");

    // =========================================================================
    // STEP 1: Wire two nodes onto a shared in-memory hub
    // =========================================================================
    println!("1. Wiring Alice and Bob onto an in-memory hub...\n");

    let hub = MemoryHub::new();
    let provider: Arc<dyn CryptoProvider> = Arc::new(DhKemProvider::new());
    let clock = Clock::system();

    let alice_transport = MemoryTransport::new(Arc::clone(&hub), "alice");
    let alice_directory = Arc::new(PeerDirectory::new());
    let alice = SecureMessaging::new(
        MessagingConfig::default(),
        Arc::clone(&provider),
        alice_transport,
        Arc::clone(&alice_directory),
        clock.clone(),
    );

    let bob_transport = MemoryTransport::new(Arc::clone(&hub), "bob");
    let bob_directory = Arc::new(PeerDirectory::new());
    let bob = SecureMessaging::new(
        MessagingConfig::default(),
        Arc::clone(&provider),
        bob_transport,
        Arc::clone(&bob_directory),
        clock.clone(),
    );

    println!("   Alice's peer ID: {}", alice.local_peer_id());
    println!("   Bob's peer ID:   {}", bob.local_peer_id());
    println!();

    // =========================================================================
    // STEP 2: Initialize both cores and exchange peer records
    // =========================================================================
    println!("2. Initializing cores and exchanging peer records...\n");

    alice.initialize().await.expect("Failed to initialize Alice");
    bob.initialize().await.expect("Failed to initialize Bob");
    alice.connect().await.expect("Alice failed to connect");
    bob.connect().await.expect("Bob failed to connect");

    // In production the records would arrive through discovery or an
    // out-of-band exchange. Here we hand them across directly.
    let alice_record = alice.local_peer_info().expect("Alice has no record");
    let bob_record = bob.local_peer_info().expect("Bob has no record");

    println!("   Alice publishes:");
    println!(
        "   - KEM key ({}): {}...",
        alice_record.kem_public_key.strength().tag(),
        hex::encode(&alice_record.kem_public_key.as_bytes()[..8])
    );
    println!(
        "   - Signing key ({}): {}...",
        alice_record.signing_public_key.level().tag(),
        hex::encode(&alice_record.signing_public_key.as_bytes()[..8])
    );
    println!("   Bob publishes:");
    println!(
        "   - KEM key ({}): {}...",
        bob_record.kem_public_key.strength().tag(),
        hex::encode(&bob_record.kem_public_key.as_bytes()[..8])
    );
    println!(
        "   - Signing key ({}): {}...",
        bob_record.signing_public_key.level().tag(),
        hex::encode(&bob_record.signing_public_key.as_bytes()[..8])
    );

    alice_directory.upsert(bob_record);
    bob_directory.upsert(alice_record);

    println!();
    println!("   Each side now knows the other's public keys.");
    println!();

    // =========================================================================
    // STEP 3: Bob listens for decrypted messages
    // =========================================================================
    println!("3. Bob registers a message listener...\n");

    let bob_inbox: Arc<Mutex<Vec<ReceivedMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let inbox = Arc::clone(&bob_inbox);
    bob.on_message(move |message| {
        inbox.lock().unwrap().push(message.clone());
    });

    println!("   Listener registered. Messages arrive already decrypted");
    println!("   and verified; the listener never sees ciphertext.");
    println!();

    // =========================================================================
    // STEP 4: Alice sends an encrypted, signed message
    // =========================================================================
    println!("4. Alice sends an encrypted message to Bob...\n");

    let message_id = alice
        .send_message(
            "bob",
            "Hello Bob! This line never crosses the wire in the clear.",
            SendOptions::default(),
        )
        .await
        .expect("Send failed");

    println!("   Message ID: {}", message_id);

    // Give the hub a moment to deliver and the ack to come back.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let received = bob_inbox.lock().unwrap().pop().expect("Bob received nothing");
    println!("   Bob received:");
    println!("   - Payload: \"{}\"", received.payload);
    println!("   - Encrypted on the wire: {}", received.encrypted);
    println!("   - Signature verified: {}", received.signed);
    println!("   - Algorithm: {}", received.algorithm);
    println!();

    let status = alice.message_status(&message_id).expect("No ledger entry");
    println!("   Alice's ledger: {:?}", status);
    println!("   (Bob's ack flipped the record from Sent to Delivered.)");
    println!();

    // =========================================================================
    // STEP 5: What the envelope looks like on the wire
    // =========================================================================
    println!("5. Capturing a wire envelope...\n");

    // A bare endpoint with no messaging core on top: whatever lands here
    // stays exactly as it crossed the hub.
    let tap_transport = MemoryTransport::new(Arc::clone(&hub), "wire-tap");
    let mut tap_events = tap_transport.events().expect("Tap events already taken");
    tap_transport.connect().await.expect("Tap failed to connect");

    // The tap never generated keys, so mint a record for it by hand.
    let tap_kem = provider
        .generate_kem_keypair(KemStrength::Bits1024)
        .await
        .expect("Keygen failed");
    let tap_signing = provider
        .generate_signing_keypair(SignatureLevel::Level5)
        .await
        .expect("Keygen failed");
    alice_directory.upsert(PeerInfo::new(
        "wire-tap".to_string(),
        tap_kem.public.clone(),
        tap_signing.public.clone(),
        clock.now_millis(),
    ));

    alice
        .send_message(
            "wire-tap",
            "Maximum-tier secret",
            SendOptions {
                level: SecurityLevel::Maximum,
                ..Default::default()
            },
        )
        .await
        .expect("Send failed");

    let frame = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match tap_events.recv().await {
                Some(TransportEvent::Inbound { payload, .. }) => break payload,
                Some(_) => continue,
                None => panic!("Tap stream closed"),
            }
        }
    })
    .await
    .expect("No frame reached the tap");

    let envelope = SecureMessage::from_bytes(&frame).expect("Frame is not an envelope");
    println!("   Raw envelope as Bob's transport would see it:");
    println!("{}", envelope.to_json().expect("Failed to serialize"));
    println!();
    println!("   - `payload` is base64 AES-256-GCM ciphertext");
    println!("   - `signature` covers the plaintext, so it verifies only");
    println!("     after a successful decrypt");
    println!("   - `encapsulation` rides along on first contact so the");
    println!("     receiver can derive the same session key");
    println!("   - the tap has no core, so nothing acks this message and");
    println!("     the ledger entry fails once the delivery window lapses");
    println!();

    // =========================================================================
    // STEP 6: Security tiers
    // =========================================================================
    println!("6. Security tiers...\n");

    for level in [
        SecurityLevel::Standard,
        SecurityLevel::High,
        SecurityLevel::Maximum,
    ] {
        println!("   {:<10} -> {}", level.to_string(), level.algorithm_tag());
    }
    println!();
    println!("   Per-message choice; sessions at different tiers coexist.");
    println!();

    // =========================================================================
    // STEP 7: Broadcast
    // =========================================================================
    println!("7. Alice broadcasts to every connected peer...\n");

    let broadcast_id = alice
        .broadcast_message("Status update for everyone", SendOptions::default())
        .await
        .expect("Broadcast failed");

    tokio::time::sleep(Duration::from_millis(200)).await;

    let received = bob_inbox.lock().unwrap().pop().expect("Broadcast missed Bob");
    println!("   Bob received: \"{}\"", received.payload);
    println!("   - Recipient field: \"{}\"", received.recipient_id);
    println!("   - Encrypted: {} (no per-peer session for broadcasts)", received.encrypted);
    println!("   - Signed: {}", received.signed);
    println!(
        "   Alice's ledger: {:?} (broadcasts are never confirmed)",
        alice.message_status(&broadcast_id).expect("No ledger entry")
    );
    println!();

    // =========================================================================
    // STEP 8: Store-and-forward while Bob is offline
    // =========================================================================
    println!("8. Store-and-forward delivery...\n");

    bob.disconnect().await.expect("Bob failed to disconnect");
    println!("   Bob went offline.");

    let dtn_id = alice
        .send_message(
            "bob",
            "Queued while you were away",
            SendOptions {
                dtn: true,
                priority: MessagePriority::High,
                ..Default::default()
            },
        )
        .await
        .expect("DTN submit failed");

    println!("   Alice queued message {} for later delivery.", dtn_id);
    println!("   Queue depth: {}", alice.dtn_pending());
    println!("   Ledger: {:?}", alice.message_status(&dtn_id).expect("No ledger entry"));
    println!();

    bob.connect().await.expect("Bob failed to reconnect");
    println!("   Bob is back online. Waiting for the drain cycle...");

    // Drain ticks every 500ms and each message carries 50-250ms of
    // simulated propagation delay.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let received = bob_inbox.lock().unwrap().pop().expect("DTN message missed Bob");
    println!("   Bob received: \"{}\"", received.payload);
    println!("   - Store-and-forward: {}", received.dtn);
    println!("   - Hop count: {}", received.hop_count);
    println!("   - Encrypted: {} (queued clear, signed end-to-end)", received.encrypted);
    println!("   - Signed: {}", received.signed);
    println!(
        "   Alice's ledger: {:?}",
        alice.message_status(&dtn_id).expect("No ledger entry")
    );
    println!();

    // =========================================================================
    // STEP 9: Counters and the sent-message ledger
    // =========================================================================
    println!("9. Counters and the ledger...\n");

    let counters = alice.message_counters();
    println!(
        "   Alice: {} sent / {} received",
        counters.sent, counters.received
    );
    let counters = bob.message_counters();
    println!(
        "   Bob:   {} sent / {} received",
        counters.sent, counters.received
    );
    println!();
    println!("   Alice's full ledger:");
    for record in alice.sent_messages() {
        println!(
            "   - {:<12} -> {:<10} {:?}",
            &record.id[..12.min(record.id.len())],
            record.recipient_id,
            record.status
        );
    }
    println!();

    alice.shutdown().await;
    bob.shutdown().await;

    // =========================================================================
    // Summary
    // =========================================================================
    println!("=================================================");
    println!("                    SUMMARY");
    println!("=================================================\n");
    println!("  Message Protection:");
    println!("  - Sessions: X25519 encapsulation + HKDF-SHA256");
    println!("  - Encryption: AES-256-GCM with AAD binding");
    println!("  - Signatures: Ed25519 over the plaintext");
    println!("  - Rotation: sessions retire after one hour");
    println!();
    println!("  Delivery Lifecycle:");
    println!("  - Pending -> Sent -> Delivered on ack");
    println!("  - Failed when the confirmation window lapses");
    println!("  - Expired when a queued message outlives its TTL");
    println!();
    println!("  Store-and-forward:");
    println!("  - Priority-ordered queue survives peer downtime");
    println!("  - Drained automatically once the link returns");
    println!();
}
