//! Forceful termination of partition leaders.
use crate::{
    leader::{LeaderInfo, LeaderTracker},
    platform::{Platform, PlatformError, ReplicaId},
};
use failover_concurrency::ctx;
use std::sync::Arc;

/// Failure injection errors.
#[derive(Debug, thiserror::Error)]
pub enum InjectError {
    /// The snapshot has no leader to terminate.
    #[error("partition has no known leader")]
    NoLeader,
    /// Leadership moved since the snapshot was taken.
    #[error("leadership changed since the snapshot (now {current:?})")]
    LeadershipChanged {
        /// Current leader, if any.
        current: Option<ReplicaId>,
    },
    /// The platform failed to terminate the replica.
    #[error("terminating {replica}: {error:#}")]
    TerminationFailed {
        /// Replica which was supposed to be terminated.
        replica: ReplicaId,
        /// Cause.
        error: anyhow::Error,
    },
    /// Call was canceled.
    #[error(transparent)]
    Canceled(#[from] ctx::Canceled),
}

/// Maps the replica name reported as leader to the name of the process
/// to terminate.
///
/// The leadership resource may count replicas differently from the
/// platform (e.g. including a proxy), in which case leader ordinal `n`
/// corresponds to process `<prefix>-<n - ordinal_offset>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaMapping {
    /// Process name prefix. If `None`, the prefix of the leader name is kept.
    pub process_prefix: Option<String>,
    /// Difference between the leader ordinal and the process ordinal.
    pub ordinal_offset: usize,
}

impl ReplicaMapping {
    /// Name of the process hosting `leader`.
    pub fn process_of(&self, leader: &ReplicaId) -> anyhow::Result<ReplicaId> {
        if self.process_prefix.is_none() && self.ordinal_offset == 0 {
            return Ok(leader.clone());
        }
        let (Some(prefix), Some(ordinal)) = (leader.prefix(), leader.ordinal()) else {
            anyhow::bail!("replica name {leader} doesn't end with an ordinal");
        };
        let Some(ordinal) = ordinal.checked_sub(self.ordinal_offset) else {
            anyhow::bail!(
                "replica {leader} has ordinal lower than the offset {}",
                self.ordinal_offset
            );
        };
        let prefix = self.process_prefix.as_deref().unwrap_or(prefix);
        Ok(ReplicaId(format!("{prefix}-{ordinal}")))
    }
}

/// Terminates the leader captured in a snapshot.
#[derive(Debug)]
pub struct FailureInjector {
    platform: Arc<dyn Platform>,
    mapping: ReplicaMapping,
}

impl FailureInjector {
    /// Constructs an injector.
    pub fn new(platform: Arc<dyn Platform>, mapping: ReplicaMapping) -> Self {
        Self { platform, mapping }
    }

    /// Checks against the tracker's cache that `snapshot` still describes the
    /// current leadership of its partition. Doesn't perform I/O, so that it can
    /// be called right before [`FailureInjector::terminate_leader`].
    pub fn confirm_current(
        &self,
        tracker: &LeaderTracker,
        snapshot: &LeaderInfo,
    ) -> Result<(), InjectError> {
        let current = tracker.current_leader(snapshot.partition);
        match current {
            Some(current) if current.same_leadership(snapshot) => Ok(()),
            current => Err(InjectError::LeadershipChanged {
                current: current.and_then(|c| c.replica.clone()),
            }),
        }
    }

    /// Forcefully terminates the leader captured in `snapshot`.
    /// Returns the terminated process.
    pub async fn terminate_leader(
        &self,
        ctx: &ctx::Ctx,
        snapshot: &LeaderInfo,
    ) -> Result<ReplicaId, InjectError> {
        let leader = snapshot.replica.as_ref().ok_or(InjectError::NoLeader)?;
        let process =
            self.mapping
                .process_of(leader)
                .map_err(|error| InjectError::TerminationFailed {
                    replica: leader.clone(),
                    error,
                })?;
        tracing::info!(
            partition = %snapshot.partition,
            term = snapshot.term,
            %leader,
            %process,
            "terminating leader"
        );
        match self.platform.terminate(ctx, &process).await {
            Ok(()) => Ok(process),
            Err(PlatformError::Canceled(err)) => Err(err.into()),
            Err(PlatformError::Api(error)) => Err(InjectError::TerminationFailed {
                replica: process,
                error,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        partition::PartitionId,
        testonly::{electing, ready, FakePlatform},
    };
    use assert_matches::assert_matches;
    use failover_concurrency::testonly::abort_on_panic;

    fn mapping(prefix: Option<&str>, offset: usize) -> ReplicaMapping {
        ReplicaMapping {
            process_prefix: prefix.map(str::to_owned),
            ordinal_offset: offset,
        }
    }

    #[test]
    fn replica_mapping() {
        let leader = ReplicaId::from("raft-consensus-store-2");
        assert_eq!(leader, mapping(None, 0).process_of(&leader).unwrap());
        assert_eq!(
            ReplicaId::from("consensus-store-1"),
            mapping(Some("consensus-store"), 1)
                .process_of(&leader)
                .unwrap()
        );
        assert_eq!(
            ReplicaId::from("raft-consensus-store-0"),
            mapping(None, 2).process_of(&leader).unwrap()
        );
        assert!(mapping(None, 3).process_of(&leader).is_err());
        assert!(mapping(None, 1)
            .process_of(&ReplicaId::from("leader"))
            .is_err());
    }

    async fn setup(
        statuses: Vec<crate::platform::PartitionStatus>,
    ) -> (Arc<FakePlatform>, LeaderTracker, FailureInjector) {
        let platform = Arc::new(FakePlatform::new(statuses));
        let tracker = LeaderTracker::new(platform.clone());
        tracker.refresh(&ctx::root()).await.unwrap();
        let injector = FailureInjector::new(platform.clone(), mapping(Some("consensus-store"), 1));
        (platform, tracker, injector)
    }

    #[tokio::test]
    async fn terminates_mapped_process() {
        abort_on_panic();
        let ctx = &ctx::root();
        let (platform, tracker, injector) = setup(vec![ready(0, "store-2", 4)]).await;
        let snapshot = tracker.current_leader(PartitionId(0)).unwrap();
        injector.confirm_current(&tracker, &snapshot).unwrap();
        let process = injector.terminate_leader(ctx, &snapshot).await.unwrap();
        assert_eq!(ReplicaId::from("consensus-store-1"), process);
        assert_eq!(vec![process], platform.terminated());
    }

    #[tokio::test]
    async fn no_leader() {
        abort_on_panic();
        let ctx = &ctx::root();
        let (platform, tracker, injector) = setup(vec![electing(0, None, 4)]).await;
        let snapshot = tracker.current_leader(PartitionId(0)).unwrap();
        assert_matches!(
            injector.terminate_leader(ctx, &snapshot).await,
            Err(InjectError::NoLeader)
        );
        assert!(platform.terminated().is_empty());
    }

    #[tokio::test]
    async fn leadership_changed() {
        abort_on_panic();
        let ctx = &ctx::root();
        let (platform, tracker, injector) = setup(vec![ready(0, "store-2", 4)]).await;
        let snapshot = tracker.current_leader(PartitionId(0)).unwrap();
        platform.push([Ok(vec![ready(0, "store-3", 5)])]);
        tracker.refresh(ctx).await.unwrap();
        assert_matches!(
            injector.confirm_current(&tracker, &snapshot),
            Err(InjectError::LeadershipChanged { current: Some(r) }) => {
                assert_eq!(ReplicaId::from("store-3"), r);
            }
        );
    }

    #[tokio::test]
    async fn termination_failed() {
        abort_on_panic();
        let ctx = &ctx::root();
        let (platform, tracker, injector) = setup(vec![ready(0, "store-2", 4)]).await;
        platform.set_fail_terminations(true);
        let snapshot = tracker.current_leader(PartitionId(0)).unwrap();
        assert_matches!(
            injector.terminate_leader(ctx, &snapshot).await,
            Err(InjectError::TerminationFailed { replica, .. }) => {
                assert_eq!(ReplicaId::from("consensus-store-1"), replica);
            }
        );

        // Ordinal below the offset can't be mapped to a process.
        let (platform, tracker, injector) = setup(vec![ready(0, "store-0", 4)]).await;
        let snapshot = tracker.current_leader(PartitionId(0)).unwrap();
        assert_matches!(
            injector.terminate_leader(ctx, &snapshot).await,
            Err(InjectError::TerminationFailed { .. })
        );
        assert!(platform.terminated().is_empty());
    }

    #[tokio::test]
    async fn canceled() {
        abort_on_panic();
        let ctx = &ctx::root();
        let (_, tracker, injector) = setup(vec![ready(0, "store-2", 4)]).await;
        let snapshot = tracker.current_leader(PartitionId(0)).unwrap();
        ctx.cancel();
        assert_matches!(
            injector.terminate_leader(ctx, &snapshot).await,
            Err(InjectError::Canceled(_))
        );
    }
}
