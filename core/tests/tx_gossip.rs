//! Transaction gossip: announcements, requests and pooling across nodes.

use std::time::{Duration, Instant};

use tessera_core::crypto::Hash;
use tessera_core::p2p::{CandidateTop, Message, MessageHandler};
use tessera_core::testkit::{keypair_for, LocalNetwork};
use tessera_core::tx::Transaction;

fn transfer(nonce: u64) -> Transaction {
    Transaction::transfer(&keypair_for("alice"), nonce, keypair_for("bob").address(), 10, 1)
}

// ═══════════════════════════════════════════════════════════════════════════
// 1. Spreading transactions
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn submitted_tx_reaches_a_neighbour_pool() {
    let net = LocalNetwork::new();
    let a = net.spawn_node("a");
    let b = net.spawn_node("b");
    net.connect("a", "b");
    let tx = transfer(1);

    a.submit_transaction(tx.clone()).unwrap();
    assert!(!b.pool.contains(&tx.hash));

    assert_eq!(a.tx_syncer.notify_txs(), 1);
    net.pump();
    assert_eq!(b.tx_syncer.pending_keys(&a.peer_id()), 1);

    assert_eq!(b.tx_syncer.request_txs(), 1);
    net.pump();
    assert!(b.pool.contains(&tx.hash));
    assert_eq!(b.tx_syncer.pending_keys(&a.peer_id()), 0);
}

#[test]
fn periodic_rounds_carry_txs_over_two_hops() {
    let net = LocalNetwork::new();
    let a = net.spawn_node("a");
    let b = net.spawn_node("b");
    let c = net.spawn_node("c");
    net.connect("a", "b");
    net.connect("b", "c");
    for n in [&a, &b, &c] {
        n.start();
    }
    let tx = transfer(1);
    a.submit_transaction(tx.clone()).unwrap();

    for _ in 0..30 {
        for n in [&a, &b, &c] {
            n.ticker().tick();
        }
        net.pump();
    }
    assert!(b.pool.contains(&tx.hash));
    assert!(c.pool.contains(&tx.hash));
}

#[test]
fn each_hash_is_asked_of_one_peer() {
    let net = LocalNetwork::new();
    let a = net.spawn_node("a");
    let b = net.spawn_node("b");
    let c = net.spawn_node("c");
    net.connect("a", "b");
    net.connect("a", "c");
    let tx = transfer(1);
    b.submit_transaction(tx.clone()).unwrap();
    c.submit_transaction(tx.clone()).unwrap();

    b.tx_syncer.notify_txs();
    c.tx_syncer.notify_txs();
    net.pump();

    assert_eq!(a.tx_syncer.request_txs(), 1);
    assert_eq!(net.queued_messages(), 1);
    net.pump();
    assert!(a.pool.contains(&tx.hash));
}

// ═══════════════════════════════════════════════════════════════════════════
// 2. What is not announced or requested
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn known_txs_are_not_requested() {
    let net = LocalNetwork::new();
    let a = net.spawn_node("a");
    let b = net.spawn_node("b");
    net.connect("a", "b");
    // mined on b, so only its receipt remains there
    let mined = transfer(1);
    a.submit_transaction(mined.clone()).unwrap();
    b.submit_transaction(mined.clone()).unwrap();
    b.extend(1);
    assert!(!b.pool.contains(&mined.hash));
    assert!(b.chain.receipt(&mined.hash).is_some());

    let pooled = transfer(2);
    a.submit_transaction(pooled.clone()).unwrap();
    b.submit_transaction(pooled).unwrap();

    a.tx_syncer.notify_txs();
    net.pump();
    assert_eq!(b.tx_syncer.pending_keys(&a.peer_id()), 0);
    assert_eq!(b.tx_syncer.request_txs(), 0);
}

#[test]
fn announced_tx_waits_out_the_gap() {
    let net = LocalNetwork::new();
    let a = net.spawn_node("a");
    a.submit_transaction(transfer(1)).unwrap();
    let gap = Duration::from_secs(a.config().txs.notify_gap_secs);
    let now = Instant::now();

    assert_eq!(a.tx_syncer.notify_txs_at(now), 1);
    assert_eq!(a.tx_syncer.notify_txs_at(now + gap / 2), 0);

    a.submit_transaction(transfer(2)).unwrap();
    assert_eq!(a.tx_syncer.notify_txs_at(now + gap / 2), 1);
    assert_eq!(a.tx_syncer.notify_txs_at(now + gap), 1);
}

#[test]
fn requests_pause_while_catching_up() {
    let net = LocalNetwork::new();
    let a = net.spawn_node("a");
    let b = net.spawn_node("b");
    let r = net.spawn_node("remote");
    net.connect("a", "b");
    r.extend(55);
    // b's genesis top is stale and every candidate is far ahead
    b.syncer.add_candidate(r.peer_id(), CandidateTop::new(r.chain.top()));
    assert!(b.syncer.is_syncing());

    a.submit_transaction(transfer(1)).unwrap();
    a.tx_syncer.notify_txs();
    net.pump();

    assert_eq!(b.tx_syncer.request_txs(), 0);
    assert_eq!(b.tx_syncer.pending_keys(&a.peer_id()), 1);
}

// ═══════════════════════════════════════════════════════════════════════════
// 3. Misbehaving peers
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn banned_peer_announcements_are_ignored() {
    let net = LocalNetwork::new();
    let a = net.spawn_node("a");
    let b = net.spawn_node("b");
    b.peers.add_evil_count(&a.peer_id());

    b.router.handle(a.peer_id(), Message::TxAnnounce { hashes: vec![transfer(1).hash] });
    assert_eq!(b.tx_syncer.pending_keys(&a.peer_id()), 0);
}

#[test]
fn oversized_announcement_is_refused() {
    let net = LocalNetwork::new();
    let a = net.spawn_node("a");
    let b = net.spawn_node("b");
    let max = b.config().txs.max_notify_per_round;
    let hashes: Vec<Hash> = (0..=max as u64).map(|n| Hash::digest(&n.to_be_bytes())).collect();

    b.router.handle(a.peer_id(), Message::TxAnnounce { hashes });
    assert_eq!(b.tx_syncer.pending_keys(&a.peer_id()), 0);
}

#[test]
fn forged_tx_bans_the_sender() {
    let net = LocalNetwork::new();
    let a = net.spawn_node("a");
    let b = net.spawn_node("b");
    let mut forged = transfer(1);
    forged.sign[0] ^= 0xff;

    b.router.handle(a.peer_id(), Message::TxResponse { txs: vec![forged.clone()] });
    assert!(!b.pool.contains(&forged.hash));
    assert!(b.peers.is_banned(&a.peer_id()));
}
