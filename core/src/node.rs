//! Application context.
//!
//! `Node` owns one instance of every component and wires them together.
//! Nothing is global, so tests run several nodes in one process.

use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use log::{debug, info};

use crate::blockchain::block::{Block, BlockHeader};
use crate::blockchain::{AddBlockResult, BasicConsensus, BlockChain, ChainListener, Genesis, OrphanHandler};
use crate::common::{Spawner, Ticker};
use crate::config::NodeConfig;
use crate::crypto::Keypair;
use crate::groups::GroupChain;
use crate::mempool::{Mempool, PoolError, TransactionPool};
use crate::p2p::{
    BlockSyncer, CandidateTop, ForkProcessor, GroupSyncer, Message, PeerId, PeerManager, Router, Transport, TxSyncer,
};
use crate::tx::Transaction;
use crate::state::BasicProcessor;
use crate::storage::ChainStore;

pub struct Node {
    config: NodeConfig,
    keypair: Keypair,
    transport: Arc<dyn Transport>,
    ticker: Arc<Ticker>,
    pub chain: Arc<BlockChain>,
    pub pool: Arc<Mempool>,
    pub groups: Arc<GroupChain>,
    pub peers: Arc<PeerManager>,
    pub syncer: Arc<BlockSyncer>,
    pub fork: Arc<ForkProcessor>,
    pub group_syncer: Arc<GroupSyncer>,
    pub tx_syncer: Arc<TxSyncer>,
    pub router: Arc<Router>,
}

impl Node {
    /// Opens the store under the configured data dir and wires every
    /// component. Routines are not registered until [`Node::start`].
    pub fn build(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        ticker: Arc<Ticker>,
        spawner: Arc<dyn Spawner>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let keypair = match &config.node.key_seed {
            Some(seed) => Keypair::from_hex_seed(seed).context("node.key_seed is not a 32-byte hex seed")?,
            None => Keypair::from_passphrase(&config.node.node_id),
        };

        let genesis = Genesis::from_config(&config.genesis).context("building genesis")?;
        let groups = Arc::new(GroupChain::new(genesis.group.clone()));
        let pool = Arc::new(Mempool::new());
        let consensus = Arc::new(BasicConsensus::new(groups.clone()));

        let chain_dir = config.node.data_dir.join("chain");
        std::fs::create_dir_all(&chain_dir).with_context(|| format!("creating {}", chain_dir.display()))?;
        let store = ChainStore::open(&chain_dir, &config.store).context("opening chain store")?;
        let chain = BlockChain::open(
            config.chain.clone(),
            store,
            &genesis,
            consensus,
            Arc::new(BasicProcessor),
            pool.clone(),
        )
        .context("opening chain")?;

        let peers = Arc::new(PeerManager::new(config.peers.clone()));
        let syncer = BlockSyncer::new(
            config.sync.clone(),
            chain.clone(),
            peers.clone(),
            transport.clone(),
            ticker.clone(),
            spawner.clone(),
        );
        let fork = ForkProcessor::new(
            config.fork.clone(),
            config.sync.max_request_blocks,
            chain.clone(),
            peers.clone(),
            syncer.clone(),
            transport.clone(),
            ticker.clone(),
        );
        let group_syncer = GroupSyncer::new(
            config.groups.clone(),
            groups.clone(),
            chain.clone(),
            peers.clone(),
            transport.clone(),
            ticker.clone(),
            spawner.clone(),
        );
        let tx_syncer = TxSyncer::new(
            config.txs.clone(),
            pool.clone(),
            chain.clone(),
            syncer.clone(),
            peers.clone(),
            transport.clone(),
            ticker.clone(),
        );
        let hooks = Arc::new(Hooks {
            fork: Arc::downgrade(&fork),
            syncer: Arc::downgrade(&syncer),
            group_syncer: Arc::downgrade(&group_syncer),
            spawner,
        });
        chain.add_listener(hooks.clone());
        chain.set_orphan_handler(hooks);
        let router = Arc::new(Router::new(
            chain.clone(),
            peers.clone(),
            syncer.clone(),
            fork.clone(),
            group_syncer.clone(),
            tx_syncer.clone(),
        ));

        info!(
            "[node] {} ready at height {}, castor {}",
            config.node.node_id,
            chain.height(),
            keypair.address().short()
        );
        Ok(Arc::new(Self {
            config,
            keypair,
            transport,
            ticker,
            chain,
            pool,
            groups,
            peers,
            syncer,
            fork,
            group_syncer,
            tx_syncer,
            router,
        }))
    }

    /// Registers the periodic sync routines on the ticker.
    pub fn start(&self) {
        self.syncer.start();
        self.group_syncer.start();
        self.tx_syncer.start();
    }

    pub fn id(&self) -> &str {
        &self.config.node.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn ticker(&self) -> &Arc<Ticker> {
        &self.ticker
    }

    /// Pools a locally submitted transaction. Neighbours learn of it on the
    /// next gossip round.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<(), PoolError> {
        let hash = tx.hash;
        self.pool.add_transaction(tx)?;
        debug!("[node] pooled tx {}", hash.short());
        Ok(())
    }

    /// Casts a block on the head with the newest eligible group, admits it
    /// and gossips it. Returns `None` without casting while the node is
    /// catching up.
    pub fn cast_and_broadcast(&self) -> Option<(Block, AddBlockResult)> {
        if self.syncer.is_syncing() {
            debug!("[node] behind the network at {}, not casting", self.chain.height());
            return None;
        }
        let group = self.groups.castable_at(self.chain.height() + 1);
        let block = self.chain.cast_block(&self.keypair, group.id);
        let result = self.chain.add_block(None, block.clone());
        if result == AddBlockResult::Success {
            self.transport.transmit_to_neighbors(Message::NewBlock { block: block.clone() });
        }
        Some((block, result))
    }
}

/// Orphan handling and group replay for the chain. Holds weak references:
/// the chain owns the hooks and the processors own the chain.
struct Hooks {
    fork: Weak<ForkProcessor>,
    syncer: Weak<BlockSyncer>,
    group_syncer: Weak<GroupSyncer>,
    spawner: Arc<dyn Spawner>,
}

impl OrphanHandler for Hooks {
    fn on_fork_suspected(&self, source: PeerId, block: Block) {
        let fork = self.fork.clone();
        self.spawner.spawn(
            "fork_process",
            Box::new(move || {
                if let Some(f) = fork.upgrade() {
                    f.try_to_process_fork(&source, block);
                }
            }),
        );
    }

    fn on_behind(&self, source: PeerId, top: BlockHeader) {
        let syncer = self.syncer.clone();
        self.spawner.spawn(
            "sync_kick",
            Box::new(move || {
                if let Some(s) = syncer.upgrade() {
                    let known = s.candidate_top(&source).map(|c| c.height()).unwrap_or(0);
                    if top.height > known {
                        s.add_candidate(source.clone(), CandidateTop::new(top));
                    }
                    if !s.sync_from(&source) {
                        s.try_sync();
                    }
                }
            }),
        );
    }

    fn on_group_missing(&self, source: Option<PeerId>) {
        debug!("[node] group missing, block from {:?}", source);
        let groups = self.group_syncer.clone();
        self.spawner.spawn(
            "group_sync_kick",
            Box::new(move || {
                if let Some(g) = groups.upgrade() {
                    g.try_sync();
                }
            }),
        );
    }
}

impl ChainListener for Hooks {
    fn on_block_added(&self, block: &Block) {
        if let Some(g) = self.group_syncer.upgrade() {
            g.on_block_added(block);
        }
    }
}
