//! Announced peer tops awaiting sync.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::Rng;

use super::PeerId;
use crate::blockchain::block::{BlockHeader, BlockWeight};

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateTop {
    pub header: BlockHeader,
    pub weight: BlockWeight,
}

impl CandidateTop {
    pub fn new(header: BlockHeader) -> Self {
        let weight = header.weight();
        Self { header, weight }
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }
}

/// Bounded map of peer tops. When full, a new peer only gets in by pushing
/// out the lightest entry, and only if it is heavier than that entry.
pub struct CandidatePool {
    capacity: usize,
    entries: HashMap<PeerId, CandidateTop>,
}

impl CandidatePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
        }
    }

    /// Returns whether the top is now in the pool.
    pub fn insert(&mut self, peer: PeerId, top: CandidateTop) -> bool {
        if let Some(existing) = self.entries.get_mut(&peer) {
            *existing = top;
            return true;
        }
        if self.entries.len() >= self.capacity {
            let lightest = self
                .entries
                .iter()
                .min_by(|a, b| a.1.weight.cmp(&b.1.weight))
                .map(|(p, t)| (p.clone(), t.weight.clone()));
            match lightest {
                Some((p, w)) if top.weight > w => {
                    self.entries.remove(&p);
                }
                _ => return false,
            }
        }
        self.entries.insert(peer, top);
        true
    }

    pub fn get(&self, peer: &PeerId) -> Option<&CandidateTop> {
        self.entries.get(peer)
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<CandidateTop> {
        self.entries.remove(peer)
    }

    pub fn retain<F: FnMut(&PeerId, &CandidateTop) -> bool>(&mut self, mut keep: F) {
        self.entries.retain(|p, t| keep(p, t));
    }

    /// Heaviest entry, picking at random among equal weights.
    pub fn heaviest<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<(PeerId, CandidateTop)> {
        let max = self.entries.values().map(|t| &t.weight).max()?;
        let best: Vec<_> = self.entries.iter().filter(|(_, t)| &t.weight == max).collect();
        best.choose(rng).map(|(p, t)| ((*p).clone(), (*t).clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &CandidateTop)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Hash;

    fn top(qn: u64, tag: &str) -> CandidateTop {
        let mut h = BlockHeader {
            height: qn,
            hash: Hash::ZERO,
            pre_hash: Hash::digest(tag.as_bytes()),
            state_tree: Hash::ZERO,
            tx_tree: Hash::ZERO,
            receipt_tree: Hash::ZERO,
            gas_fee: 0,
            total_qn: qn,
            prove_value: vec![1],
            group_id: Hash::ZERO,
            castor: Vec::new(),
            cur_time: 0,
            signature: Vec::new(),
        };
        h.hash = h.compute_hash();
        CandidateTop::new(h)
    }

    #[test]
    fn full_pool_keeps_heaviest() {
        let mut pool = CandidatePool::new(3);
        for qn in [5, 9, 7] {
            assert!(pool.insert(format!("p{qn}"), top(qn, "a")));
        }
        assert!(!pool.insert("light".into(), top(4, "b")));
        assert!(pool.insert("heavy".into(), top(12, "c")));
        assert_eq!(pool.len(), 3);
        assert!(pool.get(&"p5".into()).is_none());

        let min_kept = pool.iter().map(|(_, t)| t.weight.clone()).min().unwrap();
        assert!(min_kept > top(5, "a").weight);
    }

    #[test]
    fn update_in_place_when_full() {
        let mut pool = CandidatePool::new(2);
        pool.insert("a".into(), top(5, "a"));
        pool.insert("b".into(), top(6, "b"));
        assert!(pool.insert("a".into(), top(3, "a")));
        assert_eq!(pool.get(&"a".into()).unwrap().height(), 3);
    }

    #[test]
    fn heaviest_breaks_ties_among_equals() {
        let mut pool = CandidatePool::new(10);
        let shared = top(20, "same");
        pool.insert("x".into(), shared.clone());
        pool.insert("y".into(), shared.clone());
        pool.insert("z".into(), top(3, "z"));
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let (peer, t) = pool.heaviest(&mut rng).unwrap();
            assert!(peer == "x" || peer == "y");
            assert_eq!(t, shared);
        }
        pool.retain(|p, _| p == "z");
        assert_eq!(pool.heaviest(&mut rng).unwrap().0, "z");
    }
}
