//! In-process network and node builders for integration tests.
//!
//! `LocalNetwork` queues every message and every detached job; nothing runs
//! until the test calls [`LocalNetwork::pump`], which delivers messages and
//! runs jobs one at a time until both queues are empty. Each node gets its
//! own ticker, so timeouts only fire when a test advances it.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, RangeInclusive};
use std::sync::{Arc, Weak};

use log::trace;
use parking_lot::{Mutex, RwLock};
use tempfile::TempDir;

use crate::blockchain::block::Block;
use crate::blockchain::AddBlockResult;
use crate::common::{Job, Spawner, Ticker};
use crate::config::{Allocation, NodeConfig};
use crate::crypto::Keypair;
use crate::node::Node;
use crate::p2p::{Message, MessageHandler, PeerId, Transport};

/// Upper bound on work items in one `pump`, so a message loop fails the
/// test instead of hanging it.
pub const MAX_PUMP_STEPS: usize = 200_000;

/// Balance given to every named test account in genesis.
pub const TEST_BALANCE: u64 = 1_000_000_000;

/// Accounts funded in the test genesis.
pub const TEST_ACCOUNTS: [&str; 3] = ["alice", "bob", "carol"];

pub fn keypair_for(name: &str) -> Keypair {
    Keypair::from_passphrase(name)
}

/// Config for a test node: no fsync, small map, fixed genesis shared by
/// every node built with it.
pub fn test_config(id: &str, dir: &std::path::Path) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node.node_id = id.to_string();
    config.node.data_dir = dir.to_path_buf();
    config.store.no_sync = true;
    config.store.map_size_mb = 512;
    config.genesis.seed = "tessera-testnet".to_string();
    config.genesis.timestamp = 1_700_000_000_000;
    config.genesis.allocations = TEST_ACCOUNTS
        .iter()
        .map(|name| Allocation {
            address: keypair_for(name).address().to_hex(),
            balance: TEST_BALANCE,
        })
        .collect();
    config
}

/// Queues jobs until the network pumps them.
#[derive(Default)]
pub struct QueuedSpawner {
    jobs: Mutex<VecDeque<(&'static str, Job)>>,
}

impl QueuedSpawner {
    pub fn pop(&self) -> Option<(&'static str, Job)> {
        self.jobs.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Spawner for QueuedSpawner {
    fn spawn(&self, name: &'static str, job: Job) {
        self.jobs.lock().push_back((name, job));
    }
}

struct Envelope {
    from: PeerId,
    to: PeerId,
    msg: Message,
}

#[derive(Default)]
pub struct LocalNetwork {
    queue: Mutex<VecDeque<Envelope>>,
    handlers: RwLock<HashMap<PeerId, Arc<dyn MessageHandler>>>,
    links: RwLock<HashMap<PeerId, Vec<PeerId>>>,
    spawner: Arc<QueuedSpawner>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spawner(&self) -> Arc<QueuedSpawner> {
        self.spawner.clone()
    }

    pub fn transport(self: &Arc<Self>, id: &str) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            id: id.to_string(),
            net: Arc::downgrade(self),
        })
    }

    pub fn register(&self, id: &str, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().insert(id.to_string(), handler);
    }

    /// Makes `a` and `b` neighbours of each other.
    pub fn connect(&self, a: &str, b: &str) {
        let mut links = self.links.write();
        for (x, y) in [(a, b), (b, a)] {
            let list = links.entry(x.to_string()).or_default();
            if !list.iter().any(|p| p == y) {
                list.push(y.to_string());
            }
        }
    }

    pub fn disconnect(&self, a: &str, b: &str) {
        let mut links = self.links.write();
        for (x, y) in [(a, b), (b, a)] {
            if let Some(list) = links.get_mut(x) {
                list.retain(|p| p != y);
            }
        }
    }

    fn enqueue(&self, from: &str, to: &str, msg: Message) {
        self.queue.lock().push_back(Envelope {
            from: from.to_string(),
            to: to.to_string(),
            msg,
        });
    }

    fn neighbours(&self, id: &str) -> Vec<PeerId> {
        self.links.read().get(id).cloned().unwrap_or_default()
    }

    pub fn queued_messages(&self) -> usize {
        self.queue.lock().len()
    }

    /// Drops every queued message without delivering it.
    pub fn drop_messages(&self) -> usize {
        let mut q = self.queue.lock();
        let n = q.len();
        q.clear();
        n
    }

    /// Delivers messages and runs jobs until both queues drain. Returns the
    /// number of work items processed.
    pub fn pump(&self) -> usize {
        for step in 0..MAX_PUMP_STEPS {
            let next = self.queue.lock().pop_front();
            if let Some(env) = next {
                let handler = self.handlers.read().get(&env.to).cloned();
                match handler {
                    Some(h) => {
                        trace!("[p2p] {} -> {}: {}", env.from, env.to, env.msg.kind());
                        h.handle(env.from, env.msg);
                    }
                    None => trace!("[p2p] no node {}, dropping {}", env.to, env.msg.kind()),
                }
                continue;
            }
            match self.spawner.pop() {
                Some((name, job)) => {
                    trace!("[spawn] running {}", name);
                    job();
                }
                None => return step,
            }
        }
        panic!("network did not settle within {MAX_PUMP_STEPS} steps");
    }

    /// Builds a node on a fresh temp dir and registers it on the network.
    pub fn spawn_node(self: &Arc<Self>, id: &str) -> TestNode {
        self.spawn_node_with(id, |_| {})
    }

    pub fn spawn_node_with(self: &Arc<Self>, id: &str, tweak: impl FnOnce(&mut NodeConfig)) -> TestNode {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut config = test_config(id, dir.path());
        tweak(&mut config);
        let node = Node::build(config, self.transport(id), Ticker::new(), self.spawner.clone()).expect("node builds");
        self.register(id, node.router.clone());
        TestNode { node, _dir: dir }
    }
}

pub struct LocalTransport {
    id: PeerId,
    net: Weak<LocalNetwork>,
}

impl Transport for LocalTransport {
    fn send(&self, peer: &PeerId, msg: Message) {
        if let Some(net) = self.net.upgrade() {
            net.enqueue(&self.id, peer, msg);
        }
    }

    fn transmit_to_neighbors(&self, msg: Message) {
        if let Some(net) = self.net.upgrade() {
            for peer in net.neighbours(&self.id) {
                net.enqueue(&self.id, &peer, msg.clone());
            }
        }
    }
}

/// A node plus the temp dir holding its store.
pub struct TestNode {
    pub node: Arc<Node>,
    _dir: TempDir,
}

impl Deref for TestNode {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.node
    }
}

impl TestNode {
    pub fn peer_id(&self) -> PeerId {
        self.id().to_string()
    }

    /// Casts and admits `n` blocks locally without gossiping them.
    pub fn extend(&self, n: u64) -> Vec<Block> {
        let mut out = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let group = self.groups.castable_at(self.chain.height() + 1);
            let block = self.chain.cast_block(self.keypair(), group.id);
            let result = self.chain.add_block(None, block.clone());
            assert_eq!(result, AddBlockResult::Success, "casting at {}", block.height());
            out.push(block);
        }
        out
    }

    /// Admits `from`'s canonical blocks at `heights`.
    pub fn copy_from(&self, from: &Node, heights: RangeInclusive<u64>) {
        for h in heights {
            let block = from.chain.block_by_height(h).expect("source block");
            let result = self.chain.add_block(None, block);
            assert!(result.is_ok(), "copying height {h}: {result:?}");
        }
    }

    pub fn top_block(&self) -> Block {
        let top = self.chain.top();
        self.chain.block_by_hash(&top.hash).expect("head block")
    }
}
