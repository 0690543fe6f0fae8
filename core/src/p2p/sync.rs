//! Block sync.
//!
//! Peers announce their top header every few ticks. The syncer keeps the
//! announcements in a bounded candidate pool and, on its own schedule, pulls
//! a range of blocks from the heaviest candidate. Responses are batch
//! admitted; while the peer stays heavier the next range is requested right
//! away.
//!
//! At most one request per peer is in flight, and two peers are never asked
//! for the same start height at once.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::Mutex;

use super::candidates::{CandidatePool, CandidateTop};
use super::messages::Message;
use super::peers::PeerManager;
use super::{PeerId, ProtocolError, Transport};
use crate::blockchain::block::{Block, BlockHeader, BlockWeight};
use crate::blockchain::{AddBlockResult, BlockChain};
use crate::common::{Spawner, Ticker};
use crate::config::SyncConfig;

const ANNOUNCE_ROUTINE: &str = "block_announce";
const TRY_SYNC_ROUTINE: &str = "block_try_sync";

fn timeout_routine(peer: &PeerId) -> String {
    format!("block_sync_timeout_{peer}")
}

pub struct BlockSyncer {
    me: Weak<BlockSyncer>,
    config: SyncConfig,
    chain: Arc<BlockChain>,
    peers: Arc<PeerManager>,
    transport: Arc<dyn Transport>,
    ticker: Arc<Ticker>,
    spawner: Arc<dyn Spawner>,

    candidates: Mutex<CandidatePool>,
    /// Peer → start height of the in-flight range request.
    syncing: Mutex<HashMap<PeerId, u64>>,
}

impl BlockSyncer {
    pub fn new(
        config: SyncConfig,
        chain: Arc<BlockChain>,
        peers: Arc<PeerManager>,
        transport: Arc<dyn Transport>,
        ticker: Arc<Ticker>,
        spawner: Arc<dyn Spawner>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            candidates: Mutex::new(CandidatePool::new(config.candidate_pool_size)),
            syncing: Mutex::new(HashMap::new()),
            config,
            chain,
            peers,
            transport,
            ticker,
            spawner,
        })
    }

    /// Registers the announce and try-sync routines.
    pub fn start(&self) {
        let me = self.me.clone();
        self.ticker
            .register_periodic(ANNOUNCE_ROUTINE, self.config.announce_interval_ticks, true, move || {
                if let Some(s) = me.upgrade() {
                    s.announce_top();
                }
            });
        let me = self.me.clone();
        self.ticker
            .register_periodic(TRY_SYNC_ROUTINE, self.config.try_sync_interval_ticks, false, move || {
                if let Some(s) = me.upgrade() {
                    s.try_sync();
                }
            });
        info!(
            "[sync] started, announce every {} ticks, try-sync every {} ticks",
            self.config.announce_interval_ticks, self.config.try_sync_interval_ticks
        );
    }

    pub fn announce_top(&self) {
        let top = self.chain.top();
        if top.height == 0 {
            return;
        }
        debug!("[sync] announcing top {} at {}", top.hash.short(), top.height);
        self.transport.transmit_to_neighbors(Message::TopBlockAnnounce { header: top });
    }

    /// Requests blocks from the heaviest candidate. Returns whether a request
    /// went out.
    pub fn try_sync(&self) -> bool {
        self.sync_with(None)
    }

    /// `try_sync` restricted to one peer's announced top.
    pub fn sync_from(&self, peer: &PeerId) -> bool {
        self.sync_with(Some(peer))
    }

    fn sync_with(&self, only: Option<&PeerId>) -> bool {
        if self.chain.is_adjusting() {
            debug!("[sync] chain adjusting, skipping");
            return false;
        }
        let Some((peer, candidate)) = self.pick_candidate(only) else {
            return false;
        };

        let local = self.chain.top();
        if local.weight() >= candidate.weight {
            debug!(
                "[sync] local top {} not lighter than {}'s {}",
                local.height,
                peer,
                candidate.height()
            );
            return false;
        }
        if self.chain.has_block(&candidate.header.hash) {
            return false;
        }

        let start = (local.height + 1).min(candidate.height());
        {
            let mut syncing = self.syncing.lock();
            if syncing.contains_key(&peer) || syncing.values().any(|&h| h == start) {
                debug!("[sync] height {} already requested", start);
                return false;
            }
            syncing.insert(peer.clone(), start);
        }

        let count = self.peers.get_peer_req_block_count(&peer);
        info!(
            "[sync] requesting {} blocks from {} at {} (peer top {})",
            count,
            peer,
            start,
            candidate.height()
        );
        self.arm_timeout(&peer);
        self.transport.send(
            &peer,
            Message::BlockRangeRequest {
                start_height: start,
                max_count: count,
            },
        );
        true
    }

    /// Drops evil peers, then picks a candidate whose header signature holds.
    /// Candidates with forged signatures are penalised and skipped.
    fn pick_candidate(&self, only: Option<&PeerId>) -> Option<(PeerId, CandidateTop)> {
        let consensus = self.chain.consensus().clone();
        loop {
            let picked = {
                let mut pool = self.candidates.lock();
                pool.retain(|p, _| !self.peers.is_evil(p));
                match only {
                    Some(p) => pool.get(p).map(|t| (p.clone(), t.clone())),
                    None => pool.heaviest(&mut rand::thread_rng()),
                }
            };
            let (peer, top) = picked?;
            if consensus.verify_header_sign(&top.header) {
                return Some((peer, top));
            }
            warn!("[sync] candidate top from {} has a bad signature", peer);
            self.peers.add_evil_count(&peer);
            self.candidates.lock().remove(&peer);
        }
    }

    fn arm_timeout(&self, peer: &PeerId) {
        let me = self.me.clone();
        let target = peer.clone();
        self.ticker
            .register_one_time(&timeout_routine(peer), self.config.timeout_ticks, move || {
                if let Some(s) = me.upgrade() {
                    s.on_timeout(&target);
                }
            });
    }

    pub fn on_top_announce(&self, source: &PeerId, header: BlockHeader) -> Result<(), ProtocolError> {
        if self.peers.is_banned(source) {
            return Err(ProtocolError::Banned(source.clone()));
        }
        if !header.hash_matches() {
            return Err(ProtocolError::BadHeader(header.hash));
        }
        self.peers.heard_from_peer(source);
        debug!("[sync] {} announced top {} at {}", source, header.hash.short(), header.height);
        self.add_candidate(source.clone(), CandidateTop::new(header));
        Ok(())
    }

    pub fn add_candidate(&self, peer: PeerId, top: CandidateTop) -> bool {
        self.candidates.lock().insert(peer, top)
    }

    pub fn candidate_top(&self, peer: &PeerId) -> Option<CandidateTop> {
        self.candidates.lock().get(peer).cloned()
    }

    pub fn on_range_request(&self, source: &PeerId, start: u64, count: u64) -> Result<(), ProtocolError> {
        let local = self.chain.height();
        if start == 0 || start > local || count == 0 || count > self.config.max_request_blocks {
            return Err(ProtocolError::InvalidRange { start, count, local });
        }
        let blocks = self.chain.blocks_after_height(start, count as usize);
        debug!("[sync] serving {} blocks from {} to {}", blocks.len(), start, source);
        self.transport.send(source, Message::BlockRangeResponse { blocks });
        Ok(())
    }

    pub fn on_range_response(&self, source: &PeerId, mut blocks: Vec<Block>) -> Result<(), ProtocolError> {
        let Some(requested) = self.syncing.lock().get(source).copied() else {
            debug!("[sync] unsolicited range response from {}", source);
            return Ok(());
        };
        blocks.retain(|b| b.height() >= requested);

        let peer_weight: Option<BlockWeight> = self
            .candidate_top(source)
            .map(|t| t.weight)
            .or_else(|| blocks.last().map(|b| b.header.weight()));

        let mut all_ok = !blocks.is_empty();
        let mut admitted = 0usize;
        let mut consensus_failed = false;
        let outcome = match &peer_weight {
            Some(w) if self.chain.top_weight() > *w => {
                debug!("[sync] local already heavier than {}, discarding response", source);
                all_ok = false;
                Ok(())
            }
            _ if blocks.is_empty() => Ok(()),
            _ => self.chain.batch_add(Some(source), "sync", blocks, |block, result| {
                if result.is_ok() {
                    admitted += 1;
                    return true;
                }
                debug!("[sync] block {} from {}: {:?}", block.height(), source, result);
                all_ok = false;
                if result == AddBlockResult::ConsensusFailed {
                    consensus_failed = true;
                }
                false
            }),
        };

        if consensus_failed {
            self.peers.add_evil_count(source);
        }
        self.complete(source);

        if let Err(e) = outcome {
            return Err(e.into());
        }
        let still_heavier = peer_weight.map(|w| w > self.chain.top_weight()).unwrap_or(false);
        // a batch handed to fork processing admits nothing
        if all_ok && admitted > 0 && still_heavier {
            let me = self.me.clone();
            let peer = source.clone();
            self.spawner.spawn(
                "block_sync_continue",
                Box::new(move || {
                    if let Some(s) = me.upgrade() {
                        s.sync_from(&peer);
                    }
                }),
            );
        }
        Ok(())
    }

    fn complete(&self, peer: &PeerId) {
        self.peers.heard_from_peer(peer);
        self.peers.update_req_block_count(peer, true);
        self.ticker.remove(&timeout_routine(peer));
        self.syncing.lock().remove(peer);
    }

    pub fn on_timeout(&self, peer: &PeerId) {
        if self.syncing.lock().remove(peer).is_none() {
            return;
        }
        warn!("[sync] range request to {} timed out", peer);
        self.peers.timeout_peer(peer);
        self.peers.update_req_block_count(peer, false);
    }

    pub fn is_requesting(&self, peer: &PeerId) -> bool {
        self.syncing.lock().contains_key(peer)
    }

    /// The local top is stale and most live candidates are well ahead.
    pub fn is_syncing(&self) -> bool {
        let top = self.chain.top();
        let age_ms = chrono::Utc::now().timestamp_millis() - top.cur_time;
        if age_ms <= (self.config.stale_top_secs * 1000) as i64 {
            return false;
        }
        let pool = self.candidates.lock();
        let (mut live, mut ahead) = (0usize, 0usize);
        for (peer, candidate) in pool.iter() {
            if self.peers.is_evil(peer) {
                continue;
            }
            live += 1;
            if candidate.height() > top.height + self.config.behind_threshold_blocks {
                ahead += 1;
            }
        }
        live > 0 && ahead * 100 >= live * 51
    }
}
