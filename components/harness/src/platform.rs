//! Interface of the cluster platform hosting the store replicas.
use crate::partition::PartitionId;
use async_trait::async_trait;
use failover_concurrency::ctx;
use serde::Serialize;
use std::{fmt, str::FromStr};

/// Platform name of a replica process, following the `<prefix>-<ordinal>`
/// naming convention.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ReplicaId(pub String);

impl ReplicaId {
    /// Zero-based index of the replica: the last dash-separated segment of the name.
    pub fn ordinal(&self) -> Option<usize> {
        self.0.rsplit_once('-')?.1.parse().ok()
    }

    /// Name prefix: everything before the last dash.
    pub fn prefix(&self) -> Option<&str> {
        Some(self.0.rsplit_once('-')?.0)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Leadership state of a partition as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderState {
    /// No leader is known.
    NoLeader,
    /// A leader is known but the group is not serving yet.
    Electing,
    /// A leader is elected and the group serves requests.
    Ready,
}

impl FromStr for LeaderState {
    type Err = std::convert::Infallible;

    /// The platform only distinguishes `Ready` from everything else;
    /// an empty state means no leader.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Ready" => Self::Ready,
            "" => Self::NoLeader,
            _ => Self::Electing,
        })
    }
}

/// Status of a single partition returned by [`Platform::leaders`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionStatus {
    /// Status was decoded.
    Known {
        /// Partition.
        partition: PartitionId,
        /// Current leader, if any.
        leader: Option<ReplicaId>,
        /// Leadership term.
        term: u64,
        /// Leadership state.
        state: LeaderState,
    },
    /// The platform returned an entry for the partition which could not be decoded.
    Unavailable {
        /// Partition.
        partition: PartitionId,
        /// What went wrong.
        reason: String,
    },
}

impl PartitionStatus {
    /// Partition this status is about.
    pub fn partition(&self) -> PartitionId {
        match self {
            Self::Known { partition, .. } | Self::Unavailable { partition, .. } => *partition,
        }
    }
}

/// Platform errors.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// Call was canceled.
    #[error(transparent)]
    Canceled(#[from] ctx::Canceled),
    /// Platform API call failed.
    #[error("platform api: {0:#}")]
    Api(#[from] anyhow::Error),
}

/// Cluster platform: reports per-partition leadership and terminates replicas.
#[async_trait]
pub trait Platform: fmt::Debug + Send + Sync {
    /// Queries the leadership status of all partitions in one batched call.
    async fn leaders(&self, ctx: &ctx::Ctx) -> Result<Vec<PartitionStatus>, PlatformError>;

    /// Forcefully (with zero grace period) terminates the replica process.
    async fn terminate(&self, ctx: &ctx::Ctx, replica: &ReplicaId) -> Result<(), PlatformError>;
}
