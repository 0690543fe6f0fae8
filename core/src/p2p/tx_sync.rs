//! Transaction gossip.
//!
//! Every few ticks a node announces the hashes of pooled transactions it has
//! not announced recently. Receivers remember, per peer, the hashes they do
//! not know yet; on their own schedule they ask each peer for its share, with
//! no hash asked of two peers in the same round. Requests pause while the
//! node is catching up on blocks.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::Mutex;

use super::messages::Message;
use super::peers::PeerManager;
use super::sync::BlockSyncer;
use super::{PeerId, ProtocolError, Transport};
use crate::blockchain::BlockChain;
use crate::common::{BoundedMap, EvictionOrder, Ticker};
use crate::config::TxSyncConfig;
use crate::crypto::Hash;
use crate::mempool::{Mempool, PoolError, TransactionPool};
use crate::tx::Transaction;

const NOTIFY_ROUTINE: &str = "tx_notify";
const REQUEST_ROUTINE: &str = "tx_request";

pub struct TxSyncer {
    me: Weak<TxSyncer>,
    config: TxSyncConfig,
    pool: Arc<Mempool>,
    chain: Arc<BlockChain>,
    syncer: Arc<BlockSyncer>,
    peers: Arc<PeerManager>,
    transport: Arc<dyn Transport>,
    ticker: Arc<Ticker>,

    /// Tx hash → when it was last announced.
    recent_notified: Mutex<BoundedMap<Hash, Instant>>,
    /// Peer → announced hashes not known here yet.
    candidate_keys: Mutex<BoundedMap<PeerId, BoundedMap<Hash, ()>>>,
}

impl TxSyncer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TxSyncConfig,
        pool: Arc<Mempool>,
        chain: Arc<BlockChain>,
        syncer: Arc<BlockSyncer>,
        peers: Arc<PeerManager>,
        transport: Arc<dyn Transport>,
        ticker: Arc<Ticker>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            recent_notified: Mutex::new(BoundedMap::lru(config.recent_notified_cache)),
            candidate_keys: Mutex::new(BoundedMap::lru(config.candidate_peers)),
            config,
            pool,
            chain,
            syncer,
            peers,
            transport,
            ticker,
        })
    }

    pub fn start(&self) {
        let me = self.me.clone();
        self.ticker
            .register_periodic(NOTIFY_ROUTINE, self.config.notify_interval_ticks, false, move || {
                if let Some(s) = me.upgrade() {
                    s.notify_txs();
                }
            });
        let me = self.me.clone();
        self.ticker
            .register_periodic(REQUEST_ROUTINE, self.config.request_interval_ticks, false, move || {
                if let Some(s) = me.upgrade() {
                    s.request_txs();
                }
            });
    }

    /// Pooled or already on chain.
    fn is_known(&self, hash: &Hash) -> bool {
        self.pool.contains(hash) || self.chain.receipt(hash).is_some()
    }

    pub fn notify_txs(&self) -> usize {
        self.notify_txs_at(Instant::now())
    }

    /// Announces up to a round's worth of pooled transactions not announced
    /// within the notify gap. Returns how many hashes went out.
    pub fn notify_txs_at(&self, now: Instant) -> usize {
        let gap = Duration::from_secs(self.config.notify_gap_secs);
        let mut recent = self.recent_notified.lock();
        let expired: Vec<Hash> = recent
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) >= gap)
            .map(|(h, _)| *h)
            .collect();
        for h in &expired {
            recent.remove(h);
        }

        let txs = self
            .pool
            .pending_where(self.config.max_notify_per_round, |tx| !recent.contains(&tx.hash));
        if txs.is_empty() {
            return 0;
        }
        let hashes: Vec<Hash> = txs.iter().map(|tx| tx.hash).collect();
        for h in &hashes {
            recent.insert(*h, now);
        }
        drop(recent);

        debug!("[txs] announcing {} txs", hashes.len());
        let n = hashes.len();
        self.transport.transmit_to_neighbors(Message::TxAnnounce { hashes });
        n
    }

    pub fn on_tx_announce(&self, source: &PeerId, hashes: Vec<Hash>) -> Result<(), ProtocolError> {
        if self.peers.is_banned(source) {
            return Err(ProtocolError::Banned(source.clone()));
        }
        self.check_len(hashes.len())?;
        self.peers.heard_from_peer(source);

        let fresh: Vec<Hash> = hashes.into_iter().filter(|h| !self.is_known(h)).collect();
        if fresh.is_empty() {
            return Ok(());
        }
        let mut candidates = self.candidate_keys.lock();
        if !candidates.contains(source) {
            candidates.insert(
                source.clone(),
                BoundedMap::new(self.config.max_keys_per_peer, EvictionOrder::InsertionOrder),
            );
        }
        // refresh LRU position
        candidates.get(source);
        if let Some(keys) = candidates.peek_mut(source) {
            for h in &fresh {
                keys.insert(*h, ());
            }
            debug!("[txs] {} announced {} new txs, {} pending", source, fresh.len(), keys.len());
        }
        Ok(())
    }

    /// Asks every candidate peer for the announced transactions still
    /// unknown here. Returns the number of requests sent.
    pub fn request_txs(&self) -> usize {
        if self.syncer.is_syncing() {
            debug!("[txs] block syncing, not requesting txs");
            return 0;
        }
        let drained: Vec<(PeerId, Vec<Hash>)> = {
            let mut candidates = self.candidate_keys.lock();
            let peers: Vec<PeerId> = candidates.keys_by_age().cloned().collect();
            peers
                .into_iter()
                .filter_map(|p| {
                    let keys = candidates.peek_mut(&p)?;
                    let hashes: Vec<Hash> = keys.keys_by_age().copied().collect();
                    keys.clear();
                    Some((p, hashes))
                })
                .collect()
        };

        let mut claimed = HashSet::new();
        let mut sent = 0;
        for (peer, hashes) in drained {
            if self.peers.is_evil(&peer) {
                continue;
            }
            let wanted: Vec<Hash> = hashes
                .into_iter()
                .filter(|h| !self.is_known(h) && claimed.insert(*h))
                .take(self.config.max_notify_per_round)
                .collect();
            if wanted.is_empty() {
                continue;
            }
            debug!("[txs] requesting {} txs from {}", wanted.len(), peer);
            self.transport.send(&peer, Message::TxRequest { hashes: wanted });
            sent += 1;
        }
        sent
    }

    pub fn on_tx_request(&self, source: &PeerId, hashes: Vec<Hash>) -> Result<(), ProtocolError> {
        if self.peers.is_banned(source) {
            return Err(ProtocolError::Banned(source.clone()));
        }
        self.check_len(hashes.len())?;
        let txs: Vec<Transaction> = hashes
            .iter()
            .filter_map(|h| self.pool.get_transaction(false, h))
            .collect();
        if txs.is_empty() {
            return Ok(());
        }
        debug!("[txs] serving {} txs to {}", txs.len(), source);
        self.transport.send(source, Message::TxResponse { txs });
        Ok(())
    }

    /// Pools received transactions. A forged one marks the sender evil and
    /// drops the rest of the batch.
    pub fn on_tx_response(&self, source: &PeerId, txs: Vec<Transaction>) -> Result<(), ProtocolError> {
        if self.peers.is_banned(source) {
            return Err(ProtocolError::Banned(source.clone()));
        }
        self.check_len(txs.len())?;
        self.peers.heard_from_peer(source);

        let mut added = 0usize;
        for mut tx in txs {
            if self.is_known(&tx.hash) {
                continue;
            }
            if let Err(e) = tx.recover_source() {
                warn!("[txs] forged tx {} from {}: {}", tx.hash.short(), source, e);
                self.peers.add_evil_count(source);
                break;
            }
            match self.pool.add_transaction(tx) {
                Ok(()) => added += 1,
                Err(PoolError::Duplicate(_)) => {}
                Err(e) => {
                    warn!("[txs] tx from {} refused: {}", source, e);
                    self.peers.add_evil_count(source);
                    break;
                }
            }
        }
        debug!("[txs] pooled {} txs from {}", added, source);
        Ok(())
    }

    fn check_len(&self, count: usize) -> Result<(), ProtocolError> {
        let max = self.config.max_notify_per_round;
        if count > max {
            return Err(ProtocolError::TooManyHashes { count, max });
        }
        Ok(())
    }

    pub fn pending_keys(&self, peer: &PeerId) -> usize {
        self.candidate_keys.lock().peek(peer).map(|k| k.len()).unwrap_or(0)
    }
}
