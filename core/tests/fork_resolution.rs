//! Fork resolution: finding the common ancestor with a peer, fetching its
//! branch and adopting it only when it outweighs the local head.

use std::sync::Arc;

use tessera_core::config::NodeConfig;
use tessera_core::p2p::{Message, MessageHandler, ProtocolError};
use tessera_core::testkit::{LocalNetwork, TestNode};

const CHECKPOINT_DEPTH: u64 = 20;

fn node(net: &Arc<LocalNetwork>, id: &str) -> TestNode {
    node_with(net, id, |_| {})
}

fn node_with(net: &Arc<LocalNetwork>, id: &str, tweak: impl FnOnce(&mut NodeConfig)) -> TestNode {
    net.spawn_node_with(id, |cfg| {
        cfg.chain.checkpoint_depth = CHECKPOINT_DEPTH;
        tweak(cfg);
    })
}

/// `a` at `local` blocks; `b` shares the first `shared` and extends its own
/// branch to `remote`.
fn diverged(net: &Arc<LocalNetwork>, a: &TestNode, b: &TestNode, local: u64, shared: u64, remote: u64) {
    a.extend(local);
    b.copy_from(a, 1..=shared);
    b.extend(remote - shared);
    net.connect("a", "b");
}

// ═══════════════════════════════════════════════════════════════════════════
// 1. Adopting a heavier branch
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn heavier_branch_with_recent_ancestor_is_adopted() {
    let net = LocalNetwork::new();
    let a = node(&net, "a");
    let b = node(&net, "b");
    diverged(&net, &a, &b, 60, 56, 70);
    let old_head = a.chain.top();

    assert!(a.fork.try_to_process_fork(&b.peer_id(), b.top_block()));
    assert!(a.fork.is_processing());
    net.pump();

    assert!(!a.fork.is_processing());
    assert_eq!(a.chain.top(), b.chain.top());
    assert_eq!(a.chain.header_by_height(56), b.chain.header_by_height(56));
    assert!(!a.chain.has_block(&old_head.hash));
}

#[test]
fn gossiped_fork_block_resolves_through_sync() {
    let net = LocalNetwork::new();
    let a = node(&net, "a");
    let b = node(&net, "b");
    diverged(&net, &a, &b, 60, 56, 70);

    let (block, _) = b.cast_and_broadcast().expect("not syncing");
    net.pump();

    assert_eq!(a.chain.top().hash, block.hash());
    assert_eq!(a.chain.height(), 71);
}

#[test]
fn fork_block_at_our_height_is_resolved() {
    let net = LocalNetwork::new();
    let a = node(&net, "a");
    let b = node(&net, "b");
    diverged(&net, &a, &b, 30, 25, 31);

    // the parent of b's tip sits at our height, so this is a fork, not a gap
    a.router.handle(b.peer_id(), Message::NewBlock { block: b.top_block() });
    net.pump();

    assert_eq!(a.chain.top(), b.chain.top());
}

#[test]
fn capped_fetch_is_finished_by_sync() {
    let net = LocalNetwork::new();
    let a = node_with(&net, "a", |cfg| cfg.fork.max_fork_blocks = 5);
    let b = node(&net, "b");
    diverged(&net, &a, &b, 60, 56, 70);

    assert!(a.fork.try_to_process_fork(&b.peer_id(), b.top_block()));
    net.pump();

    assert_eq!(a.chain.top(), b.chain.top());
}

// ═══════════════════════════════════════════════════════════════════════════
// 2. Branches we refuse
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn lighter_branch_is_not_processed() {
    let net = LocalNetwork::new();
    let a = node(&net, "a");
    let b = node(&net, "b");
    diverged(&net, &a, &b, 40, 30, 35);
    let head = a.chain.top();

    assert!(!a.fork.try_to_process_fork(&b.peer_id(), b.top_block()));
    assert!(!a.fork.is_processing());
    assert_eq!(net.queued_messages(), 0);
    assert_eq!(a.chain.top(), head);
}

#[test]
fn ancestor_below_checkpoint_is_not_followed() {
    let net = LocalNetwork::new();
    let a = node(&net, "a");
    let b = node(&net, "b");
    diverged(&net, &a, &b, 60, 30, 100);
    let head = a.chain.top();
    assert_eq!(a.chain.checkpoint_height(), 40);

    assert!(a.fork.try_to_process_fork(&b.peer_id(), b.top_block()));
    net.pump();

    assert!(!a.fork.is_processing());
    assert_eq!(a.chain.top(), head);
    assert!(!a.chain.has_block(&b.chain.top().hash));
    assert_ne!(a.chain.header_by_height(31), b.chain.header_by_height(31));
}

#[test]
fn only_one_session_at_a_time() {
    let net = LocalNetwork::new();
    let a = node(&net, "a");
    let b = node(&net, "b");
    let c = node(&net, "c");
    diverged(&net, &a, &b, 60, 56, 70);
    c.copy_from(&b, 1..=70);
    c.extend(2);

    assert!(a.fork.try_to_process_fork(&b.peer_id(), b.top_block()));
    assert!(!a.fork.try_to_process_fork(&c.peer_id(), c.top_block()));
}

// ═══════════════════════════════════════════════════════════════════════════
// 3. Serving and timeouts
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn piece_and_slice_requests_are_validated() {
    let net = LocalNetwork::new();
    let a = node(&net, "a");
    a.extend(10);
    let x = "x".to_string();

    assert!(matches!(a.fork.on_piece_request(&x, Vec::new(), 4), Err(ProtocolError::EmptyPiece)));
    assert!(matches!(a.fork.on_slice_request(&x, 5, 5), Err(ProtocolError::InvalidSlice { .. })));
    assert!(matches!(a.fork.on_slice_request(&x, 11, 12), Err(ProtocolError::InvalidSlice { .. })));
    assert!(matches!(a.fork.on_slice_request(&x, 1, 30), Err(ProtocolError::InvalidSlice { .. })));
    assert!(a.fork.on_slice_request(&x, 3, 7).is_ok());
    assert!(a.fork.on_piece_request(&x, vec![a.chain.top().hash], 4).is_ok());
    assert_eq!(net.queued_messages(), 2);
}

#[test]
fn silent_target_times_out() {
    let net = LocalNetwork::new();
    let a = node(&net, "a");
    let b = node(&net, "b");
    diverged(&net, &a, &b, 60, 56, 70);
    let head = a.chain.top();

    assert!(a.fork.try_to_process_fork(&b.peer_id(), b.top_block()));
    assert_eq!(net.drop_messages(), 1);

    a.ticker().advance(a.config().fork.timeout_ticks);
    assert!(!a.fork.is_processing());
    assert_eq!(a.peers.timeout_count(&b.peer_id()), 1);
    assert_eq!(a.chain.top(), head);

    // the session is free again
    assert!(a.fork.try_to_process_fork(&b.peer_id(), b.top_block()));
    net.pump();
    assert_eq!(a.chain.top(), b.chain.top());
}
