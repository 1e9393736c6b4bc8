//! Detection of leader re-election after a failure.
//!
//! Recovery is complete once the partition has a ready leader in a term
//! strictly greater than the term in which the old leader was terminated,
//! and the same leader is still observed after a settle interval.
//!
//! ```text
//!                     ready, term > original
//!  WaitingForNewTerm ────────────────────────► WaitingForStability
//!         ▲                                            │
//!         └──── changed leadership / failed query ─────┤
//!                                                      │ same leadership
//!  (deadline exceeded) ──► TimedOut                    ▼
//!                                                  Recovered
//! ```
use crate::{
    leader::{self, LeaderInfo, LeaderTracker},
    metrics::METRICS,
    partition::PartitionId,
    platform::PlatformError,
};
use failover_concurrency::{ctx, time};
use std::sync::Arc;
use tokio::sync::mpsc;


/// Recovery errors.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// No stable leader in a newer term appeared before the deadline.
    #[error("no stable leader of partition {partition} after {elapsed:?}")]
    Timeout {
        /// Partition.
        partition: PartitionId,
        /// Time spent waiting.
        elapsed: time::Duration,
    },
    /// Waiting was canceled.
    #[error(transparent)]
    Canceled(#[from] ctx::Canceled),
}

/// Timings of the recovery detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryConfig {
    /// Interval between leadership queries while waiting for a new term.
    pub poll_interval: time::Duration,
    /// Time a candidate leader has to stay unchanged.
    pub settle_interval: time::Duration,
    /// Upper bound on the whole detection.
    pub deadline: time::Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval: time::Duration::from_secs(1),
            settle_interval: time::Duration::from_secs(2),
            deadline: time::Duration::from_secs(60),
        }
    }
}

/// State of the recovery detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryState {
    /// Waiting for a ready leader in a newer term.
    WaitingForNewTerm,
    /// A candidate leader was observed; waiting to see it again.
    WaitingForStability {
        /// The candidate.
        candidate: Arc<LeaderInfo>,
    },
    /// A stable leader in a newer term was observed. Terminal.
    Recovered(Arc<LeaderInfo>),
    /// The deadline passed. Terminal.
    TimedOut,
}

impl RecoveryState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Recovered(_) | Self::TimedOut)
    }
}

/// Input of the recovery state machine.
#[derive(Debug, Clone)]
pub enum Observation {
    /// Leadership snapshot of the partition, after a successful query.
    Snapshot(Option<Arc<LeaderInfo>>),
    /// The leadership query failed.
    RefreshFailed,
    /// The detection deadline passed.
    DeadlineExceeded,
}

/// Computes the next state of the recovery detection.
pub fn step(state: RecoveryState, original_term: u64, obs: Observation) -> RecoveryState {
    use RecoveryState as S;
    if state.is_terminal() {
        return state;
    }
    let leader = match obs {
        Observation::DeadlineExceeded => return S::TimedOut,
        Observation::RefreshFailed => return S::WaitingForNewTerm,
        Observation::Snapshot(leader) => leader.filter(|l| l.is_ready()),
    };
    match (state, leader) {
        (S::WaitingForNewTerm, Some(l)) if l.term > original_term => {
            S::WaitingForStability { candidate: l }
        }
        (S::WaitingForStability { candidate }, Some(l)) if l.same_leadership(&candidate) => {
            S::Recovered(l)
        }
        _ => S::WaitingForNewTerm,
    }
}

/// Transition of the recovery detection, published to observers.
#[derive(Debug, Clone)]
pub struct RecoveryEvent {
    /// Partition.
    pub partition: PartitionId,
    /// Time since the reference instant of the detection.
    pub elapsed: time::Duration,
    /// State entered.
    pub state: RecoveryState,
}

/// Successful recovery.
#[derive(Debug, Clone)]
pub struct Recovery {
    /// The new stable leader.
    pub leader: Arc<LeaderInfo>,
    /// Time from the reference instant until stability was confirmed.
    pub elapsed: time::Duration,
}

/// Waits for a partition to elect a new stable leader.
#[derive(Debug)]
pub struct RecoveryDetector {
    tracker: Arc<LeaderTracker>,
    config: RecoveryConfig,
    events: Option<mpsc::UnboundedSender<RecoveryEvent>>,
}

impl RecoveryDetector {
    /// Constructs a detector.
    pub fn new(tracker: Arc<LeaderTracker>, config: RecoveryConfig) -> Self {
        Self {
            tracker,
            config,
            events: None,
        }
    }

    /// Publishes state transitions to `events`.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<RecoveryEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Detector timings.
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    fn transition(
        &self,
        partition: PartitionId,
        elapsed: time::Duration,
        state: &mut RecoveryState,
        next: RecoveryState,
    ) {
        if *state == next {
            return;
        }
        if let Some(events) = &self.events {
            // The observer may be gone already, which is fine.
            let _ = events.send(RecoveryEvent {
                partition,
                elapsed,
                state: next.clone(),
            });
        }
        *state = next;
    }

    /// Waits until `partition` has a stable ready leader in a term greater
    /// than `original_term`. Elapsed times are measured from now.
    pub async fn await_recovery(
        &self,
        ctx: &ctx::Ctx,
        partition: PartitionId,
        original_term: u64,
    ) -> Result<Recovery, RecoveryError> {
        self.await_recovery_since(ctx, partition, original_term, ctx.now())
            .await
    }

    /// Like [`Self::await_recovery`], but elapsed times and the deadline
    /// are measured from `start`, typically the moment the leader was
    /// terminated.
    pub async fn await_recovery_since(
        &self,
        ctx: &ctx::Ctx,
        partition: PartitionId,
        original_term: u64,
        start: time::Instant,
    ) -> Result<Recovery, RecoveryError> {
        let ctx_deadline = &ctx.with_deadline((start + self.config.deadline).into());
        let mut state = RecoveryState::WaitingForNewTerm;
        loop {
            let obs = match self.tracker.refresh(ctx_deadline).await {
                Ok(changes) => {
                    leader::log_changes(&changes);
                    Observation::Snapshot(self.tracker.current_leader(partition))
                }
                Err(PlatformError::Canceled(_)) => Observation::DeadlineExceeded,
                Err(err) => {
                    tracing::debug!(%partition, "leadership query failed: {err:#}");
                    Observation::RefreshFailed
                }
            };
            let next = step(state.clone(), original_term, obs);
            self.transition(partition, ctx.now() - start, &mut state, next);
            let pause = match &state {
                RecoveryState::WaitingForNewTerm => self.config.poll_interval,
                RecoveryState::WaitingForStability { .. } => self.config.settle_interval,
                RecoveryState::Recovered(leader) => {
                    let elapsed = ctx.now() - start;
                    METRICS.recovery_latency.observe(elapsed);
                    return Ok(Recovery {
                        leader: leader.clone(),
                        elapsed,
                    });
                }
                RecoveryState::TimedOut => break,
            };
            if ctx_deadline.sleep(pause).await.is_err() {
                let next = step(state.clone(), original_term, Observation::DeadlineExceeded);
                self.transition(partition, ctx.now() - start, &mut state, next);
                break;
            }
        }
        if !ctx.is_active() {
            return Err(ctx::Canceled.into());
        }
        Err(RecoveryError::Timeout {
            partition,
            elapsed: ctx.now() - start,
        })
    }
}
