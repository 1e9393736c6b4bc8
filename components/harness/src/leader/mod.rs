//! Cached view of per-partition leadership.
use crate::{
    metrics::METRICS,
    partition::PartitionId,
    platform::{LeaderState, PartitionStatus, Platform, PlatformError, ReplicaId},
    recovery::RecoveryError,
};
use failover_concurrency::{ctx, time};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};
use tokio::sync::{watch, Mutex};

#[cfg(test)]
mod tests;

/// Leadership of a partition, as observed at `observed_at`.
/// Snapshots are never mutated: every refresh produces new ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderInfo {
    /// Partition.
    pub partition: PartitionId,
    /// Leader replica, if known.
    pub replica: Option<ReplicaId>,
    /// Leadership term.
    pub term: u64,
    /// Leadership state.
    pub state: LeaderState,
    /// When the snapshot was taken.
    #[serde(with = "::time::serde::rfc3339")]
    pub observed_at: time::Utc,
    /// Set if the platform entry for the partition could not be decoded,
    /// in which case the snapshot carries no leader.
    pub stale: bool,
}

impl LeaderInfo {
    /// Whether both snapshots describe the same leadership: same replica in the same term.
    pub fn same_leadership(&self, other: &LeaderInfo) -> bool {
        self.replica == other.replica && self.term == other.term
    }

    /// Whether the partition has a known leader which serves requests.
    pub fn is_ready(&self) -> bool {
        self.state == LeaderState::Ready && self.replica.is_some()
    }
}

/// Leadership transition detected by [`LeaderTracker::refresh`].
#[derive(Debug, Clone)]
pub struct LeaderChange {
    /// Partition.
    pub partition: PartitionId,
    /// Previous snapshot. `None` if the partition was seen for the first time.
    pub before: Option<Arc<LeaderInfo>>,
    /// New snapshot.
    pub after: Arc<LeaderInfo>,
}

impl LeaderChange {
    /// Whether this is the first observation of the partition rather than a transition.
    pub fn is_initial(&self) -> bool {
        self.before.is_none()
    }
}

/// Maintains the most recent leadership snapshot of every partition.
#[derive(Debug)]
pub struct LeaderTracker {
    platform: Arc<dyn Platform>,
    cache: RwLock<BTreeMap<PartitionId, Arc<LeaderInfo>>>,
    generation: watch::Sender<u64>,
    /// Serializes refreshes, so that a slow query never overwrites the
    /// result of a later one.
    refresh_lock: Mutex<()>,
    ready_poll_interval: time::Duration,
}

impl LeaderTracker {
    /// Constructs a tracker with an empty cache.
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            cache: RwLock::default(),
            generation: watch::channel(0).0,
            refresh_lock: Mutex::default(),
            ready_poll_interval: time::Duration::from_secs(1),
        }
    }

    /// Sets the poll interval of [`LeaderTracker::wait_for_ready`].
    pub fn with_ready_poll_interval(mut self, interval: time::Duration) -> Self {
        self.ready_poll_interval = interval;
        self
    }

    /// Platform this tracker queries.
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Queries the platform once and replaces the cached snapshots.
    /// Returns the partitions whose leadership changed. Concurrent refreshes
    /// are applied one at a time, in the order they acquired the lock.
    pub async fn refresh(&self, ctx: &ctx::Ctx) -> Result<Vec<LeaderChange>, PlatformError> {
        let _guard = ctx.wait(self.refresh_lock.lock()).await?;
        let statuses = self.platform.leaders(ctx).await.map_err(|err| {
            if let PlatformError::Api(_) = &err {
                METRICS.leader_refresh_failures.inc();
            }
            err
        })?;
        let observed_at = ctx.now_utc();
        let old = self.snapshot();
        let mut new = BTreeMap::new();
        for status in statuses {
            let info = match status {
                PartitionStatus::Known {
                    partition,
                    leader,
                    term,
                    state,
                } => LeaderInfo {
                    partition,
                    replica: leader,
                    term,
                    state,
                    observed_at,
                    stale: false,
                },
                PartitionStatus::Unavailable { partition, reason } => {
                    tracing::warn!(%partition, %reason, "leadership status unavailable");
                    LeaderInfo {
                        partition,
                        replica: None,
                        // Keeps the last known term, so that terms never go backwards.
                        term: old.get(&partition).map_or(0, |l| l.term),
                        state: LeaderState::NoLeader,
                        observed_at,
                        stale: true,
                    }
                }
            };
            new.insert(info.partition, Arc::new(info));
        }
        let changes: Vec<_> = new
            .values()
            .filter_map(|after| {
                let before = old.get(&after.partition).cloned();
                let changed = before
                    .as_ref()
                    .map_or(true, |b| !b.same_leadership(after) || b.state != after.state);
                changed.then(|| LeaderChange {
                    partition: after.partition,
                    before,
                    after: after.clone(),
                })
            })
            .collect();
        *self.cache.write().unwrap() = new;
        self.generation.send_modify(|g| *g += 1);
        Ok(changes)
    }

    /// Most recent snapshot of `partition`. Never blocks on I/O.
    pub fn current_leader(&self, partition: PartitionId) -> Option<Arc<LeaderInfo>> {
        self.cache.read().unwrap().get(&partition).cloned()
    }

    /// Most recent snapshots of all partitions.
    pub fn snapshot(&self) -> BTreeMap<PartitionId, Arc<LeaderInfo>> {
        self.cache.read().unwrap().clone()
    }

    /// Subscribes to the refresh generation counter, bumped after every successful refresh.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Refreshes the cache every `interval` until `ctx` is canceled.
    /// Failed queries are logged and retried on the next tick.
    pub async fn run(&self, ctx: &ctx::Ctx, interval: time::Duration) -> ctx::OrCanceled<()> {
        loop {
            match self.refresh(ctx).await {
                Ok(changes) => log_changes(&changes),
                Err(PlatformError::Canceled(err)) => return Err(err),
                Err(err) => tracing::warn!("leadership refresh failed: {err:#}"),
            }
            ctx.sleep(interval).await?;
        }
    }

    /// Waits until `partition` has a ready leader, refreshing the cache
    /// until one appears or `timeout` elapses.
    pub async fn wait_for_ready(
        &self,
        ctx: &ctx::Ctx,
        partition: PartitionId,
        timeout: time::Duration,
    ) -> Result<Arc<LeaderInfo>, RecoveryError> {
        let start = ctx.now();
        let ctx_timeout = &ctx.with_timeout(timeout);
        let res: ctx::OrCanceled<Arc<LeaderInfo>> = async {
            loop {
                match self.refresh(ctx_timeout).await {
                    Ok(changes) => log_changes(&changes),
                    Err(PlatformError::Canceled(err)) => return Err(err),
                    Err(err) => tracing::warn!("leadership refresh failed: {err:#}"),
                }
                if let Some(leader) = self.current_leader(partition) {
                    if leader.is_ready() {
                        return Ok(leader);
                    }
                }
                ctx_timeout.sleep(self.ready_poll_interval).await?;
            }
        }
        .await;
        match res {
            Ok(leader) => Ok(leader),
            Err(err) if !ctx.is_active() => Err(err.into()),
            Err(_) => Err(RecoveryError::Timeout {
                partition,
                elapsed: ctx.now() - start,
            }),
        }
    }
}

/// Logs leadership transitions and counts them.
pub(crate) fn log_changes(changes: &[LeaderChange]) {
    for change in changes {
        let after = &change.after;
        let replica = after.replica.as_ref().map(|r| r.0.as_str());
        match &change.before {
            None => tracing::debug!(
                partition = %change.partition,
                replica,
                term = after.term,
                state = ?after.state,
                "leadership observed"
            ),
            Some(before) => {
                METRICS.leader_changes.inc();
                tracing::info!(
                    partition = %change.partition,
                    replica,
                    term = after.term,
                    state = ?after.state,
                    previous_term = before.term,
                    "leadership changed"
                );
            }
        }
    }
}
