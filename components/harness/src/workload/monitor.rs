//! Continuous write/read/leadership monitor.
use super::{SequenceCounter, WorkloadDriver};
use crate::{
    leader::{self, LeaderTracker},
    partition::PartitionId,
    platform::{PlatformError, ReplicaId},
    record::{ClientId, OperationRecord},
};
use failover_concurrency::{ctx, time};
use serde::Serialize;
use std::sync::Mutex;

/// Timings of the continuous monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSpec {
    /// Interval between writes.
    pub write_interval: time::Duration,
    /// Interval between reads.
    pub read_interval: time::Duration,
    /// Interval between leadership queries.
    pub leader_interval: time::Duration,
    /// Total duration of the run.
    pub duration: time::Duration,
}

/// How a monitor read compared to the write it re-read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadOutcome {
    /// Returned the acknowledged value.
    Consistent,
    /// Returned a different value.
    Inconsistent,
    /// Failed or didn't find the key.
    Failed,
}

/// Read of the most recently acknowledged key.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorRead {
    /// The read.
    pub record: OperationRecord,
    /// Value acknowledged for the key.
    pub expected: String,
    /// Classification.
    pub outcome: ReadOutcome,
}

/// Leadership transition observed during the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderChangeRecord {
    /// Partition.
    pub partition: PartitionId,
    /// Previous leader.
    pub from: Option<ReplicaId>,
    /// New leader.
    pub to: Option<ReplicaId>,
    /// New term.
    pub term: u64,
    /// When the transition was observed.
    #[serde(with = "::time::serde::rfc3339")]
    pub observed_at: time::Utc,
}

/// Everything the monitor recorded.
#[derive(Debug, Clone, Default)]
pub struct MonitorRun {
    /// Writes to monotonically numbered keys.
    pub writes: Vec<OperationRecord>,
    /// Reads of acknowledged keys.
    pub reads: Vec<MonitorRead>,
    /// Leadership transitions.
    pub leader_changes: Vec<LeaderChangeRecord>,
    /// Wall time of the run.
    pub duration: time::Duration,
}

/// Runs a writer, a reader and a leadership watcher concurrently for `spec.duration`,
/// or until `ctx` is canceled.
///
/// The writer writes `value-<seq>-<unix time>` to key `seq-<seq>` on every tick.
/// The reader re-reads the most recently acknowledged key and compares it with
/// the acknowledged value. Operations interrupted by the end of the run are not
/// recorded.
pub async fn monitor(
    ctx: &ctx::Ctx,
    driver: &WorkloadDriver,
    tracker: &LeaderTracker,
    spec: MonitorSpec,
) -> MonitorRun {
    let start = ctx.now();
    let ctx = &ctx.with_timeout(spec.duration);
    let counter = SequenceCounter::new();
    let last_ack: Mutex<Option<(String, String)>> = Mutex::default();

    let writer = async {
        let mut writes = vec![];
        loop {
            let seq = counter.next();
            let key = SequenceCounter::key(seq);
            let value = format!("value-{seq:06}-{}", ctx.now_utc().unix_timestamp());
            let record = driver.write(ctx, ClientId(0), seq, &key, &value).await;
            if !ctx.is_active() {
                break;
            }
            if record.success {
                *last_ack.lock().unwrap() = Some((key, value));
            } else {
                tracing::warn!(seq, "monitor write failed: {}", record.error_detail());
            }
            writes.push(record);
            if ctx.sleep(spec.write_interval).await.is_err() {
                break;
            }
        }
        writes
    };

    let reader = async {
        let mut reads = vec![];
        let mut seq = 0;
        while ctx.sleep(spec.read_interval).await.is_ok() {
            let last = last_ack.lock().unwrap().clone();
            let Some((key, expected)) = last else {
                continue;
            };
            seq += 1;
            let record = driver.read(ctx, ClientId(1), seq, &key).await;
            if !ctx.is_active() {
                break;
            }
            let outcome = match record.observed() {
                Some(v) if v == expected => ReadOutcome::Consistent,
                Some(v) => {
                    tracing::warn!(%key, %expected, observed = v, "inconsistent read");
                    ReadOutcome::Inconsistent
                }
                None => ReadOutcome::Failed,
            };
            reads.push(MonitorRead {
                record,
                expected,
                outcome,
            });
        }
        reads
    };

    let watcher = async {
        let mut changes = vec![];
        loop {
            match tracker.refresh(ctx).await {
                Ok(new) => {
                    leader::log_changes(&new);
                    changes.extend(new.into_iter().filter_map(|c| {
                        Some(LeaderChangeRecord {
                            partition: c.partition,
                            from: c.before?.replica.clone(),
                            to: c.after.replica.clone(),
                            term: c.after.term,
                            observed_at: c.after.observed_at,
                        })
                    }));
                }
                Err(PlatformError::Canceled(_)) => break,
                Err(err) => tracing::warn!("leadership query failed: {err:#}"),
            }
            if ctx.sleep(spec.leader_interval).await.is_err() {
                break;
            }
        }
        changes
    };

    let (writes, reads, leader_changes) = tokio::join!(writer, reader, watcher);
    MonitorRun {
        writes,
        reads,
        leader_changes,
        duration: ctx.now() - start,
    }
}
