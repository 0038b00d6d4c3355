//! Key routing logic for sharding
//!
//! Routes keys to shards with xxh64. Optionally only the `{hashtag}` part of a
//! key is hashed, so related keys can be forced onto the same shard.

use super::ShardId;
use bytes::Bytes;
use xxhash_rust::xxh64::xxh64;

const ROUTING_SEED: u64 = 120_577_240_643;

/// Maps keys to shard indices; stateless and fixed for the process lifetime
#[derive(Debug, Clone, Copy)]
pub struct KeyRouter {
    num_shards: usize,
    hashtags: bool,
}

impl KeyRouter {
    /// Create a new key router
    pub fn new(num_shards: usize, hashtags: bool) -> Self {
        assert!(num_shards > 0, "Number of shards must be > 0");
        KeyRouter { num_shards, hashtags }
    }

    /// Route a key to its shard
    pub fn shard_for(&self, key: &[u8]) -> ShardId {
        if self.num_shards == 1 {
            return 0;
        }
        let routed = if self.hashtags { hashtag(key) } else { key };
        (xxh64(routed, ROUTING_SEED) % self.num_shards as u64) as ShardId
    }

    /// Route a key-set: distinct shard indices in ascending order
    pub fn shards_for<'a, I>(&self, keys: I) -> Vec<ShardId>
    where
        I: IntoIterator<Item = &'a Bytes>,
    {
        let mut shards: Vec<ShardId> = keys.into_iter().map(|k| self.shard_for(k)).collect();
        shards.sort_unstable();
        shards.dedup();
        shards
    }

    /// Get the number of shards
    pub fn num_shards(&self) -> usize {
        self.num_shards
    }
}

/// The part of `key` between the first `{` and the following `}`, if non-empty
fn hashtag(key: &[u8]) -> &[u8] {
    let open = match key.iter().position(|&b| b == b'{') {
        Some(pos) => pos,
        None => return key,
    };
    match key[open + 1..].iter().position(|&b| b == b'}') {
        Some(0) | None => key,
        Some(len) => &key[open + 1..open + 1 + len],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_deterministic() {
        let router = KeyRouter::new(4, false);
        assert_eq!(router.shard_for(b"test_key"), router.shard_for(b"test_key"));
    }

    #[test]
    fn test_routing_distribution() {
        let router = KeyRouter::new(4, false);
        let mut shard_counts = vec![0; 4];

        for i in 0..1000 {
            let key = format!("key_{}", i);
            shard_counts[router.shard_for(key.as_bytes())] += 1;
        }

        for count in shard_counts {
            assert!(count > 180 && count < 320, "Uneven distribution: {}", count);
        }
    }

    #[test]
    fn test_single_shard() {
        let router = KeyRouter::new(1, false);
        assert_eq!(router.shard_for(b"any_key"), 0);
    }

    #[test]
    fn test_shards_for_sorted_and_unique() {
        let router = KeyRouter::new(8, false);
        let keys: Vec<Bytes> = (0..64).map(|i| Bytes::from(format!("k{}", i))).collect();
        let shards = router.shards_for(&keys);

        assert!(shards.windows(2).all(|w| w[0] < w[1]));
        for key in &keys {
            assert!(shards.contains(&router.shard_for(key)));
        }
    }

    #[test]
    fn test_hashtags() {
        assert_eq!(hashtag(b"{user1}:name"), b"user1");
        assert_eq!(hashtag(b"plain"), b"plain");
        assert_eq!(hashtag(b"{}empty"), b"{}empty");
        assert_eq!(hashtag(b"open{only"), b"open{only");

        let router = KeyRouter::new(16, true);
        assert_eq!(router.shard_for(b"{acct}:a"), router.shard_for(b"{acct}:b"));
    }
}
