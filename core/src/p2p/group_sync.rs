//! Group chain sync.
//!
//! Same shape as block sync but simpler: peers announce their group height,
//! one peer at a time is asked for the groups above ours. A group created by
//! a block we have not admitted yet waits, together with the rest of its
//! batch, until that block lands.

use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::Mutex;

use super::messages::Message;
use super::peers::PeerManager;
use super::{PeerId, ProtocolError, Transport};
use crate::blockchain::block::Block;
use crate::blockchain::{BlockChain, ChainListener};
use crate::common::{BoundedMap, Prque, Spawner, Ticker};
use crate::config::GroupSyncConfig;
use crate::crypto::Hash;
use crate::groups::{Group, GroupChain, GroupError};

const ANNOUNCE_ROUTINE: &str = "group_announce";
const TRY_SYNC_ROUTINE: &str = "group_try_sync";
const TIMEOUT_ROUTINE: &str = "group_sync_timeout";

pub struct GroupSyncer {
    me: Weak<GroupSyncer>,
    config: GroupSyncConfig,
    groups: Arc<GroupChain>,
    chain: Arc<BlockChain>,
    peers: Arc<PeerManager>,
    transport: Arc<dyn Transport>,
    ticker: Arc<Ticker>,
    spawner: Arc<dyn Spawner>,

    /// Peer → announced group height.
    candidates: Mutex<Prque<PeerId>>,
    syncing_peer: Mutex<Option<PeerId>>,
    /// Peer → groups asked for per request.
    request_sizes: Mutex<BoundedMap<PeerId, u64>>,
    /// Creating block hash → groups from that one onward.
    pending: Mutex<BoundedMap<Hash, Vec<Group>>>,
}

impl GroupSyncer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: GroupSyncConfig,
        groups: Arc<GroupChain>,
        chain: Arc<BlockChain>,
        peers: Arc<PeerManager>,
        transport: Arc<dyn Transport>,
        ticker: Arc<Ticker>,
        spawner: Arc<dyn Spawner>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            candidates: Mutex::new(Prque::new()),
            syncing_peer: Mutex::new(None),
            request_sizes: Mutex::new(BoundedMap::lru(config.candidate_pool_size.max(1))),
            pending: Mutex::new(BoundedMap::lru(config.pending_cache)),
            config,
            groups,
            chain,
            peers,
            transport,
            ticker,
            spawner,
        })
    }

    pub fn start(&self) {
        let me = self.me.clone();
        self.ticker
            .register_periodic(ANNOUNCE_ROUTINE, self.config.announce_interval_ticks, true, move || {
                if let Some(s) = me.upgrade() {
                    s.announce_height();
                }
            });
        let me = self.me.clone();
        self.ticker
            .register_periodic(TRY_SYNC_ROUTINE, self.config.try_sync_interval_ticks, false, move || {
                if let Some(s) = me.upgrade() {
                    s.try_sync();
                }
            });
    }

    pub fn announce_height(&self) {
        let height = self.groups.height();
        if height == 0 {
            return;
        }
        self.transport
            .transmit_to_neighbors(Message::GroupHeightAnnounce { height });
    }

    pub fn on_height_announce(&self, source: &PeerId, height: u64) -> Result<(), ProtocolError> {
        if self.peers.is_banned(source) {
            return Err(ProtocolError::Banned(source.clone()));
        }
        self.peers.heard_from_peer(source);
        let mut candidates = self.candidates.lock();
        if height <= self.groups.height() {
            candidates.remove(source);
            return Ok(());
        }
        let priority = height as i64;
        if !candidates.contains(source) && candidates.len() >= self.config.candidate_pool_size {
            let lowest = candidates.min().map(|(p, h)| (p.clone(), h));
            match lowest {
                Some((p, h)) if h < priority => {
                    candidates.remove(&p);
                }
                _ => return Ok(()),
            }
        }
        candidates.push(source.clone(), priority);
        Ok(())
    }

    /// Asks the highest live candidate for the groups above ours.
    pub fn try_sync(&self) -> bool {
        if self.syncing_peer.lock().is_some() {
            return false;
        }
        let local = self.groups.height();
        let picked = {
            let mut candidates = self.candidates.lock();
            let evil: Vec<PeerId> = candidates
                .iter()
                .filter(|(p, _)| self.peers.is_evil(p))
                .map(|(p, _)| p.clone())
                .collect();
            for p in &evil {
                candidates.remove(p);
            }
            let best = candidates.peek().map(|(p, h)| (p.clone(), h as u64));
            match best {
                Some((p, h)) if h > local => Some((p, h)),
                Some(_) => {
                    candidates.clear();
                    None
                }
                None => None,
            }
        };
        let Some((peer, height)) = picked else {
            return false;
        };
        {
            let mut syncing = self.syncing_peer.lock();
            if syncing.is_some() {
                return false;
            }
            *syncing = Some(peer.clone());
        }

        let count = self.request_size(&peer);
        info!(
            "[groups] requesting {} groups from {} at {} (peer at {})",
            count,
            peer,
            local + 1,
            height
        );
        let me = self.me.clone();
        let target = peer.clone();
        self.ticker
            .register_one_time(TIMEOUT_ROUTINE, self.config.timeout_ticks, move || {
                if let Some(s) = me.upgrade() {
                    s.on_timeout(&target);
                }
            });
        self.transport.send(
            &peer,
            Message::GroupRangeRequest {
                start_height: local + 1,
                max_count: count,
            },
        );
        true
    }

    pub fn on_range_request(&self, source: &PeerId, start: u64, count: u64) -> Result<(), ProtocolError> {
        let local = self.groups.height();
        if start == 0 || count == 0 || count > self.config.max_request_groups {
            return Err(ProtocolError::InvalidRange { start, count, local });
        }
        let groups = self.groups.groups_from(start, count as usize);
        debug!("[groups] serving {} groups from {} to {}", groups.len(), start, source);
        self.transport.send(source, Message::GroupRangeResponse { groups });
        Ok(())
    }

    pub fn on_range_response(&self, source: &PeerId, groups: Vec<Group>) {
        {
            let mut syncing = self.syncing_peer.lock();
            if syncing.as_ref() != Some(source) {
                debug!("[groups] unsolicited group response from {}", source);
                return;
            }
            *syncing = None;
        }
        self.ticker.remove(TIMEOUT_ROUTINE);
        self.peers.heard_from_peer(source);
        self.update_request_size(source, true);

        if !self.add_batch(Some(source), groups) {
            return;
        }
        let behind = self
            .candidates
            .lock()
            .priority_of(source)
            .map(|h| h as u64 > self.groups.height())
            .unwrap_or(false);
        if behind {
            let me = self.me.clone();
            self.spawner.spawn(
                "group_sync_continue",
                Box::new(move || {
                    if let Some(s) = me.upgrade() {
                        s.try_sync();
                    }
                }),
            );
        }
    }

    /// Appends groups in order. Stops at the first group whose creating
    /// block is missing and parks it with everything after it. Returns
    /// whether every group was taken.
    fn add_batch(&self, source: Option<&PeerId>, groups: Vec<Group>) -> bool {
        for (i, group) in groups.iter().enumerate() {
            match self.groups.add_group(group.clone(), |h| self.chain.has_block(h)) {
                Ok(()) | Err(GroupError::AlreadyExists(_)) => {}
                Err(GroupError::CreateBlockMissing(block)) => {
                    debug!(
                        "[groups] group {} waits for block {}, parking {} groups",
                        group.height,
                        block.short(),
                        groups.len() - i
                    );
                    self.pending.lock().insert(block, groups[i..].to_vec());
                    return false;
                }
                Err(e) => {
                    warn!("[groups] rejecting group {}: {}", group.height, e);
                    if let (Some(peer), GroupError::BadId(_)) = (source, &e) {
                        self.peers.add_evil_count(peer);
                    }
                    return false;
                }
            }
        }
        true
    }

    pub fn on_timeout(&self, peer: &PeerId) {
        let mut syncing = self.syncing_peer.lock();
        if syncing.as_ref() != Some(peer) {
            return;
        }
        *syncing = None;
        drop(syncing);
        warn!("[groups] group request to {} timed out", peer);
        self.peers.timeout_peer(peer);
        self.update_request_size(peer, false);
    }

    pub fn request_size(&self, peer: &PeerId) -> u64 {
        self.request_sizes
            .lock()
            .peek(peer)
            .copied()
            .unwrap_or(self.config.max_request_groups)
    }

    /// Grows by one on a response, halves on a timeout.
    fn update_request_size(&self, peer: &PeerId, success: bool) {
        let max = self.config.max_request_groups;
        let mut sizes = self.request_sizes.lock();
        let current = sizes.peek(peer).copied().unwrap_or(max);
        let next = if success { (current + 1).min(max) } else { (current / 2).max(1) };
        sizes.insert(peer.clone(), next);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

impl ChainListener for GroupSyncer {
    fn on_block_added(&self, block: &Block) {
        let waiting = self.pending.lock().remove(&block.hash());
        if let Some(groups) = waiting {
            info!("[groups] block {} arrived, replaying {} groups", block.height(), groups.len());
            self.add_batch(None, groups);
        }
    }
}
