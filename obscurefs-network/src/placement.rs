//! Shard placement policy

use libp2p::PeerId;
use obscurefs_core::ContentId;
use rand::seq::SliceRandom;

/// Chooses which peers a shard is sent to.
///
/// Returns up to `k` distinct peers from `candidates`, in the order they
/// should be tried.
pub trait PeerSelector: Send + Sync {
    fn select_peers(&self, shard_id: &ContentId, candidates: &[PeerId], k: usize) -> Vec<PeerId>;
}

/// Uniform random choice without replacement
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSelector;

impl PeerSelector for RandomSelector {
    fn select_peers(&self, _shard_id: &ContentId, candidates: &[PeerId], k: usize) -> Vec<PeerId> {
        candidates
            .choose_multiple(&mut rand::thread_rng(), k)
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    #[test]
    fn test_distinct_and_bounded() {
        let candidates: Vec<PeerId> = (0..5).map(|_| PeerId::random()).collect();
        let shard = ContentId::from_data(b"s");

        let picked = RandomSelector.select_peers(&shard, &candidates, 3);
        assert_eq!(picked.len(), 3);
        assert_eq!(picked.iter().collect::<HashSet<_>>().len(), 3);
        assert!(picked.iter().all(|p| candidates.contains(p)));

        assert_eq!(RandomSelector.select_peers(&shard, &candidates, 10).len(), 5);
        assert!(RandomSelector.select_peers(&shard, &[], 2).is_empty());
    }

    #[test]
    fn test_roughly_uniform() {
        let candidates: Vec<PeerId> = (0..4).map(|_| PeerId::random()).collect();
        let shard = ContentId::from_data(b"s");
        let mut counts: HashMap<PeerId, usize> = HashMap::new();

        for _ in 0..4000 {
            let first = RandomSelector.select_peers(&shard, &candidates, 1)[0];
            *counts.entry(first).or_default() += 1;
        }
        // expected 1000 each
        assert!(counts.values().all(|c| (700..1300).contains(c)));
    }
}
