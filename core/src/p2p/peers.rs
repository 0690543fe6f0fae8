//! Per-peer scoring.
//!
//! Each peer gets a meter tracking consecutive timeouts, when it was last
//! heard, its adaptive request batch size and its ban state. Bans grow
//! exponentially with every strike and expire on their own.

use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::Mutex;

use super::PeerId;
use crate::common::BoundedMap;
use crate::config::PeerConfig;

/// Batch size change on a failed request.
const REQ_SHRINK: u64 = 4;

#[derive(Debug, Clone)]
struct PeerMeter {
    timeouts: u32,
    last_heard: Option<Instant>,
    req_block_count: u64,
    strikes: u32,
    evil_until: Option<Instant>,
}

impl PeerMeter {
    fn new(max_req: u64) -> Self {
        Self {
            timeouts: 0,
            last_heard: None,
            req_block_count: max_req,
            strikes: 0,
            evil_until: None,
        }
    }

    fn banned(&self, now: Instant) -> bool {
        self.evil_until.map(|t| t > now).unwrap_or(false)
    }
}

pub struct PeerManager {
    config: PeerConfig,
    meters: Mutex<BoundedMap<PeerId, PeerMeter>>,
}

impl PeerManager {
    pub fn new(config: PeerConfig) -> Self {
        Self {
            meters: Mutex::new(BoundedMap::lru(config.capacity)),
            config,
        }
    }

    fn with_meter<R>(&self, peer: &PeerId, f: impl FnOnce(&mut PeerMeter) -> R) -> R {
        let mut meters = self.meters.lock();
        if !meters.contains(peer) {
            meters.insert(peer.clone(), PeerMeter::new(self.config.max_req_block_count));
        }
        // refresh LRU position
        meters.get(peer);
        match meters.peek_mut(peer) {
            Some(meter) => f(meter),
            None => f(&mut PeerMeter::new(self.config.max_req_block_count)),
        }
    }

    pub fn heard_from_peer(&self, peer: &PeerId) {
        self.heard_from_peer_at(peer, Instant::now())
    }

    pub fn heard_from_peer_at(&self, peer: &PeerId, now: Instant) {
        self.with_meter(peer, |m| {
            m.last_heard = Some(now);
            m.timeouts = 0;
        })
    }

    pub fn timeout_peer(&self, peer: &PeerId) {
        self.timeout_peer_at(peer, Instant::now())
    }

    /// Counts a timeout; the threshold-th consecutive one bans the peer.
    pub fn timeout_peer_at(&self, peer: &PeerId, now: Instant) {
        let banned = self.with_meter(peer, |m| {
            m.timeouts += 1;
            if m.timeouts >= self.config.evil_threshold {
                m.timeouts = 0;
                Some(self.strike(m, now))
            } else {
                None
            }
        });
        match banned {
            Some(d) => warn!("[p2p] peer {} timed out repeatedly, banned for {:?}", peer, d),
            None => debug!("[p2p] peer {} timed out", peer),
        }
    }

    pub fn add_evil_count(&self, peer: &PeerId) {
        self.add_evil_count_at(peer, Instant::now())
    }

    pub fn add_evil_count_at(&self, peer: &PeerId, now: Instant) {
        let d = self.with_meter(peer, |m| self.strike(m, now));
        warn!("[p2p] peer {} misbehaved, banned for {:?}", peer, d);
    }

    fn strike(&self, meter: &mut PeerMeter, now: Instant) -> Duration {
        let factor = 1u64.checked_shl(meter.strikes).unwrap_or(u64::MAX);
        let secs = self
            .config
            .ban_base_secs
            .saturating_mul(factor)
            .min(self.config.ban_max_secs);
        meter.strikes = meter.strikes.saturating_add(1);
        let d = Duration::from_secs(secs);
        meter.evil_until = Some(now + d);
        d
    }

    pub fn is_evil(&self, peer: &PeerId) -> bool {
        self.is_evil_at(peer, Instant::now())
    }

    /// Banned, or heard from before and silent past the silence window.
    /// Unknown peers are not evil.
    pub fn is_evil_at(&self, peer: &PeerId, now: Instant) -> bool {
        let meters = self.meters.lock();
        let Some(m) = meters.peek(peer) else {
            return false;
        };
        if m.banned(now) {
            return true;
        }
        match m.last_heard {
            Some(t) => now.saturating_duration_since(t) > Duration::from_secs(self.config.silence_secs),
            None => false,
        }
    }

    pub fn is_banned(&self, peer: &PeerId) -> bool {
        self.is_banned_at(peer, Instant::now())
    }

    pub fn is_banned_at(&self, peer: &PeerId, now: Instant) -> bool {
        self.meters.lock().peek(peer).map(|m| m.banned(now)).unwrap_or(false)
    }

    /// Grows the batch size by one on success, shrinks it on failure.
    pub fn update_req_block_count(&self, peer: &PeerId, success: bool) {
        let max = self.config.max_req_block_count;
        self.with_meter(peer, |m| {
            m.req_block_count = if success {
                (m.req_block_count + 1).min(max)
            } else {
                m.req_block_count.saturating_sub(REQ_SHRINK).max(1)
            };
        })
    }

    pub fn get_peer_req_block_count(&self, peer: &PeerId) -> u64 {
        self.meters
            .lock()
            .peek(peer)
            .map(|m| m.req_block_count)
            .unwrap_or(self.config.max_req_block_count)
    }

    pub fn is_peer_exists(&self, peer: &PeerId) -> bool {
        self.meters.lock().contains(peer)
    }

    pub fn timeout_count(&self, peer: &PeerId) -> u32 {
        self.meters.lock().peek(peer).map(|m| m.timeouts).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.meters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PeerManager {
        PeerManager::new(PeerConfig::default())
    }

    #[test]
    fn consecutive_timeouts_ban_then_decay() {
        let pm = manager();
        let peer = "p1".to_string();
        let t0 = Instant::now();
        for _ in 0..3 {
            pm.timeout_peer_at(&peer, t0);
        }
        assert!(!pm.is_evil_at(&peer, t0));
        pm.timeout_peer_at(&peer, t0);
        assert!(pm.is_evil_at(&peer, t0));
        assert_eq!(pm.timeout_count(&peer), 0);

        // heard resets the counter but not the ban
        pm.heard_from_peer_at(&peer, t0);
        assert!(pm.is_banned_at(&peer, t0));
        assert!(!pm.is_banned_at(&peer, t0 + Duration::from_secs(31)));
    }

    #[test]
    fn success_resets_timeout_counter() {
        let pm = manager();
        let peer = "p2".to_string();
        let t0 = Instant::now();
        for _ in 0..3 {
            pm.timeout_peer_at(&peer, t0);
        }
        pm.heard_from_peer_at(&peer, t0);
        assert_eq!(pm.timeout_count(&peer), 0);
        for _ in 0..3 {
            pm.timeout_peer_at(&peer, t0);
        }
        assert!(!pm.is_evil_at(&peer, t0));
    }

    #[test]
    fn ban_doubles_and_caps() {
        let pm = manager();
        let peer = "p3".to_string();
        let t0 = Instant::now();
        pm.add_evil_count_at(&peer, t0);
        assert!(pm.is_banned_at(&peer, t0 + Duration::from_secs(29)));
        assert!(!pm.is_banned_at(&peer, t0 + Duration::from_secs(31)));

        pm.add_evil_count_at(&peer, t0);
        assert!(pm.is_banned_at(&peer, t0 + Duration::from_secs(59)));
        assert!(!pm.is_banned_at(&peer, t0 + Duration::from_secs(61)));

        for _ in 0..40 {
            pm.add_evil_count_at(&peer, t0);
        }
        assert!(pm.is_banned_at(&peer, t0 + Duration::from_secs(599)));
        assert!(!pm.is_banned_at(&peer, t0 + Duration::from_secs(601)));
    }

    #[test]
    fn silence_only_counts_after_first_contact() {
        let pm = manager();
        let peer = "p4".to_string();
        let t0 = Instant::now();
        pm.update_req_block_count(&peer, true);
        assert!(!pm.is_evil_at(&peer, t0 + Duration::from_secs(3600)));

        pm.heard_from_peer_at(&peer, t0);
        assert!(!pm.is_evil_at(&peer, t0 + Duration::from_secs(30)));
        assert!(pm.is_evil_at(&peer, t0 + Duration::from_secs(31)));
    }

    #[test]
    fn batch_size_adapts() {
        let pm = manager();
        let peer = "p5".to_string();
        assert_eq!(pm.get_peer_req_block_count(&peer), 16);
        assert!(!pm.is_peer_exists(&peer));
        pm.update_req_block_count(&peer, true);
        assert_eq!(pm.get_peer_req_block_count(&peer), 16);
        pm.update_req_block_count(&peer, false);
        assert_eq!(pm.get_peer_req_block_count(&peer), 12);
        for _ in 0..5 {
            pm.update_req_block_count(&peer, false);
        }
        assert_eq!(pm.get_peer_req_block_count(&peer), 1);
        pm.update_req_block_count(&peer, true);
        assert_eq!(pm.get_peer_req_block_count(&peer), 2);
        assert!(pm.is_peer_exists(&peer));
    }

    #[test]
    fn meters_are_bounded() {
        let pm = PeerManager::new(PeerConfig {
            capacity: 3,
            ..PeerConfig::default()
        });
        for i in 0..10 {
            pm.heard_from_peer(&format!("peer-{i}"));
        }
        assert_eq!(pm.len(), 3);
        assert!(pm.is_peer_exists(&"peer-9".to_string()));
        assert!(!pm.is_peer_exists(&"peer-0".to_string()));
    }
}
