//! Stable bucketing used by the gradual rollout strategies.
use std::io::Cursor;

/// Maps an input string to one of `total_shards` buckets, the same way on every call.
pub trait Sharder {
    /// Bucket of `input`, in `0..total_shards`.
    fn get_shard(&self, input: &str, total_shards: u32) -> u32;
}

/// Buckets inputs with 32-bit MurmurHash3 (x86 variant, seed 0).
///
/// Rollout membership must agree with every other Unleash client, so the hash function is part
/// of the protocol and must not change.
#[derive(Debug, Clone, Copy, Default)]
pub struct Murmur3Sharder;

impl Sharder for Murmur3Sharder {
    fn get_shard(&self, input: &str, total_shards: u32) -> u32 {
        let hash = murmur3::murmur3_32(&mut Cursor::new(input.as_bytes()), 0)
            .expect("reading from an in-memory buffer cannot fail");
        hash % total_shards
    }
}

/// Map `"{target}:{group_id}"` into `1..=100`.
pub(crate) fn normalized_value(sharder: &impl Sharder, target: &str, group_id: &str) -> u32 {
    sharder.get_shard(&format!("{target}:{group_id}"), 100) + 1
}

#[cfg(test)]
pub struct DeterministicSharder(pub std::collections::HashMap<String, u32>);

#[cfg(test)]
impl Sharder for DeterministicSharder {
    fn get_shard(&self, input: &str, total_shards: u32) -> u32 {
        self.0.get(input).copied().unwrap_or(0) % total_shards
    }
}
