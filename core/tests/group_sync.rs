//! Group chain sync and replay of groups waiting on their creating block.

use tessera_core::crypto::Hash;
use tessera_core::groups::Group;
use tessera_core::p2p::{Message, MessageHandler};
use tessera_core::testkit::{LocalNetwork, TestNode};

/// Appends a group created by the block at `height` on `node`'s chain.
fn add_group_at(node: &TestNode, height: u64) -> Group {
    let block = node.chain.header_by_height(height).expect("creating block");
    let group = Group::new(&node.groups.top(), block.hash, height, Vec::new());
    node.groups
        .add_group(group.clone(), |h| node.chain.has_block(h))
        .expect("group appends");
    group
}

// ═══════════════════════════════════════════════════════════════════════════
// 1. Fetching groups
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn groups_follow_the_announced_height() {
    let net = LocalNetwork::new();
    let a = net.spawn_node("a");
    let b = net.spawn_node("b");
    net.connect("a", "b");
    a.extend(6);
    b.copy_from(&a, 1..=6);
    let g1 = add_group_at(&a, 2);
    let g2 = add_group_at(&a, 4);

    a.group_syncer.announce_height();
    net.pump();
    assert!(b.group_syncer.try_sync());
    net.pump();

    assert_eq!(b.groups.height(), 2);
    assert_eq!(b.groups.get_by_height(1), Some(g1));
    assert_eq!(b.groups.get_by_height(2), Some(g2));
}

#[test]
fn groups_beyond_one_request_continue() {
    let net = LocalNetwork::new();
    let a = net.spawn_node_with("a", |cfg| cfg.groups.max_request_groups = 2);
    let b = net.spawn_node_with("b", |cfg| cfg.groups.max_request_groups = 2);
    net.connect("a", "b");
    a.extend(8);
    b.copy_from(&a, 1..=8);
    for h in 1..=5 {
        add_group_at(&a, h);
    }

    a.group_syncer.announce_height();
    net.pump();
    b.group_syncer.try_sync();
    net.pump();

    assert_eq!(b.groups.height(), 5);
    assert_eq!(b.groups.top(), a.groups.top());
}

#[test]
fn lower_announcement_is_not_a_candidate() {
    let net = LocalNetwork::new();
    let a = net.spawn_node("a");
    let b = net.spawn_node("b");
    a.extend(3);
    add_group_at(&a, 1);

    b.router.handle(a.peer_id(), Message::GroupHeightAnnounce { height: 0 });
    assert!(!b.group_syncer.try_sync());
}

// ═══════════════════════════════════════════════════════════════════════════
// 2. Groups waiting on blocks
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn parked_groups_replay_when_their_block_arrives() {
    let net = LocalNetwork::new();
    let a = net.spawn_node("a");
    let b = net.spawn_node("b");
    net.connect("a", "b");
    a.extend(5);
    add_group_at(&a, 5);
    // blocks 6.. are cast by the new group
    a.extend(5);
    assert_eq!(a.chain.top().group_id, a.groups.top().id);

    a.group_syncer.announce_height();
    net.pump();
    b.group_syncer.try_sync();
    net.pump();
    assert_eq!(b.groups.height(), 0);
    assert_eq!(b.group_syncer.pending_len(), 1);

    a.syncer.announce_top();
    net.pump();
    b.syncer.try_sync();
    net.pump();

    assert_eq!(b.group_syncer.pending_len(), 0);
    assert_eq!(b.groups.top(), a.groups.top());
    assert_eq!(b.chain.top(), a.chain.top());
}

#[test]
fn block_from_unknown_group_starts_group_sync() {
    let net = LocalNetwork::new();
    let a = net.spawn_node("a");
    let b = net.spawn_node("b");
    net.connect("a", "b");
    a.extend(3);
    b.copy_from(&a, 1..=3);
    add_group_at(&a, 3);
    a.group_syncer.announce_height();
    net.pump();

    let (block, _) = a.cast_and_broadcast().expect("not syncing");
    net.pump();

    // the block was refused, but the group it needed was fetched
    assert_eq!(b.groups.top(), a.groups.top());
    assert_eq!(b.chain.height(), 3);
    assert_eq!(b.chain.add_block(None, block.clone()), tessera_core::blockchain::AddBlockResult::Success);
}

#[test]
fn forged_group_is_refused() {
    let net = LocalNetwork::new();
    let a = net.spawn_node("a");
    let b = net.spawn_node("b");
    a.extend(2);
    let mut forged = Group::new(&a.groups.top(), a.chain.top().hash, 2, Vec::new());
    forged.create_block = Hash::digest(b"elsewhere");

    b.router.handle(a.peer_id(), Message::GroupHeightAnnounce { height: 1 });
    assert!(b.group_syncer.try_sync());
    net.drop_messages();
    b.router.handle(a.peer_id(), Message::GroupRangeResponse { groups: vec![forged] });

    assert_eq!(b.groups.height(), 0);
    assert_eq!(b.group_syncer.pending_len(), 0);
    assert!(b.peers.is_banned(&a.peer_id()));
}

// ═══════════════════════════════════════════════════════════════════════════
// 3. Timeouts
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn silent_group_peer_shrinks_request_size() {
    let net = LocalNetwork::new();
    let a = net.spawn_node("a");
    let b = net.spawn_node("b");
    net.connect("a", "b");
    a.extend(4);
    b.copy_from(&a, 1..=4);
    for h in 1..=3 {
        add_group_at(&a, h);
    }
    let max = b.config().groups.max_request_groups;
    assert_eq!(b.group_syncer.request_size(&a.peer_id()), max);

    a.group_syncer.announce_height();
    net.pump();
    assert!(b.group_syncer.try_sync());
    assert_eq!(net.drop_messages(), 1);

    b.ticker().advance(b.config().groups.timeout_ticks);
    assert_eq!(b.group_syncer.request_size(&a.peer_id()), (max / 2).max(1));
    assert_eq!(b.peers.timeout_count(&a.peer_id()), 1);

    // the next answered request grows it back by one
    assert!(b.group_syncer.try_sync());
    net.pump();
    assert_eq!(b.groups.height(), 3);
    assert_eq!(b.group_syncer.request_size(&a.peer_id()), ((max / 2).max(1) + 1).min(max));
}
