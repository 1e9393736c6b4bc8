//! Deterministic key to partition assignment.
use serde::Serialize;
use sha2::{digest::Update as _, Digest as _};
use std::fmt;

/// Index of a partition of the store's keyspace, in `[0, partition_count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Computes the partition of `key`: the first byte of the SHA-256 digest of
/// the key, modulo `partition_count`. This is the assignment the store uses,
/// so it tells which physical leader a write to `key` goes through.
///
/// Panics if `partition_count` is 0; use [`PartitionMapper`] to validate it once.
pub fn partition_of(key: &str, partition_count: u32) -> PartitionId {
    let digest: [u8; 32] = sha2::Sha256::new().chain(key.as_bytes()).finalize().into();
    PartitionId(u32::from(digest[0]) % partition_count)
}

/// Partition assignment for a fixed partition count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionMapper {
    count: u32,
}

impl PartitionMapper {
    /// Constructs a mapper. The partition count is fixed for the lifetime of a run.
    pub fn new(count: u32) -> anyhow::Result<Self> {
        anyhow::ensure!(count > 0, "partition count must be positive");
        Ok(Self { count })
    }

    /// Number of partitions.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Partition of `key`.
    pub fn of(&self, key: &str) -> PartitionId {
        partition_of(key, self.count)
    }

    /// All partition ids.
    pub fn all(&self) -> impl Iterator<Item = PartitionId> {
        (0..self.count).map(PartitionId)
    }
}
