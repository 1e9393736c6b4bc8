//! Breakdowns of recorded operations: by leadership epoch and by client.
use crate::{
    record::{serialize_millis, serialize_opt_millis, ClientId, OpKind, OperationRecord},
    stats::{LatencyStats, Ratio},
    workload::{ConcurrentBatch, LeaderChangeRecord},
};
use failover_concurrency::time;
use serde::Serialize;
use std::collections::BTreeMap;

/// Wall time from `earlier` to `later`, zero if `later` is not later.
fn between(earlier: time::Utc, later: time::Utc) -> time::Duration {
    (later - earlier).try_into().unwrap_or_default()
}

/// Interval between two consecutive leadership changes during which some
/// operations failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailoverEvent {
    /// The change opening the interval.
    #[serde(with = "::time::serde::rfc3339")]
    pub started_at: time::Utc,
    /// The change closing the interval.
    #[serde(with = "::time::serde::rfc3339")]
    pub ended_at: time::Utc,
    /// Length of the interval.
    #[serde(serialize_with = "serialize_millis")]
    pub duration: time::Duration,
    /// Operations issued within the interval which failed.
    pub impacted_operations: usize,
    /// Time from the start of the interval until the first successful
    /// operation issued within it.
    #[serde(serialize_with = "serialize_opt_millis")]
    pub recovery_time: Option<time::Duration>,
}

/// Finds the intervals between consecutive leadership changes in which
/// operations failed. Operations are assigned by their issue time; both
/// ends of an interval are exclusive.
pub fn failover_events<'a>(
    ops: impl IntoIterator<Item = &'a OperationRecord>,
    changes: &[LeaderChangeRecord],
) -> Vec<FailoverEvent> {
    let ops: Vec<_> = ops.into_iter().collect();
    changes
        .windows(2)
        .filter_map(|w| {
            let (start, end) = (w[0].observed_at, w[1].observed_at);
            let within = ops
                .iter()
                .filter(|op| op.issued_at > start && op.issued_at < end);
            let mut impacted = 0;
            let mut first_success = None;
            for op in within {
                if op.success {
                    first_success =
                        Some(first_success.map_or(op.issued_at, |t: time::Utc| t.min(op.issued_at)));
                } else {
                    impacted += 1;
                }
            }
            (impacted > 0).then(|| FailoverEvent {
                started_at: start,
                ended_at: end,
                duration: between(start, end),
                impacted_operations: impacted,
                recovery_time: first_success.map(|t| between(start, t)),
            })
        })
        .collect()
}

/// Latency of successful writes and reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PhaseLatency {
    /// Successful writes.
    pub write: LatencyStats,
    /// Successful reads.
    pub read: LatencyStats,
}

impl PhaseLatency {
    fn compute<'a>(ops: impl Iterator<Item = &'a OperationRecord> + Clone) -> Self {
        let of = |kind| {
            LatencyStats::compute(
                ops.clone()
                    .filter(|op| op.success && op.kind == kind)
                    .map(|op| op.latency),
            )
        };
        Self {
            write: of(OpKind::Write),
            read: of(OpKind::Read),
        }
    }
}

/// Latency before the first leadership change against latency from then on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyComparison {
    /// Operations issued before the first change, or all of them if
    /// leadership never changed.
    pub baseline: PhaseLatency,
    /// Operations issued at or after the first change.
    pub failover: PhaseLatency,
}

impl LatencyComparison {
    /// Splits `ops` at the first of `changes`.
    pub fn compute(ops: &[&OperationRecord], changes: &[LeaderChangeRecord]) -> Self {
        let Some(first) = changes.iter().map(|c| c.observed_at).min() else {
            return Self {
                baseline: PhaseLatency::compute(ops.iter().copied()),
                failover: PhaseLatency::default(),
            };
        };
        Self {
            baseline: PhaseLatency::compute(ops.iter().copied().filter(|op| op.issued_at < first)),
            failover: PhaseLatency::compute(ops.iter().copied().filter(|op| op.issued_at >= first)),
        }
    }
}

/// Outcomes of the operations of one client of a concurrent workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientPerformance {
    /// Workload.
    pub workload: &'static str,
    /// Client.
    pub client: ClientId,
    /// Successful out of issued operations.
    pub success: Ratio,
    /// Mean latency of the successful operations.
    #[serde(serialize_with = "serialize_millis")]
    pub mean_latency: time::Duration,
}

/// Per client breakdown of `batch`, ordered by client.
pub fn client_performance(workload: &'static str, batch: &ConcurrentBatch) -> Vec<ClientPerformance> {
    let mut by_client: BTreeMap<ClientId, Vec<&OperationRecord>> = BTreeMap::new();
    for r in &batch.records {
        by_client.entry(r.client).or_default().push(r);
    }
    by_client
        .into_iter()
        .map(|(client, records)| {
            let ok: Vec<_> = records.iter().filter(|r| r.success).map(|r| r.latency).collect();
            let mean_latency = match u32::try_from(ok.len()) {
                Ok(n) if n > 0 => ok.iter().sum::<time::Duration>() / n,
                _ => time::Duration::ZERO,
            };
            ClientPerformance {
                workload,
                client,
                success: Ratio::new(ok.len(), records.len()),
                mean_latency,
            }
        })
        .collect()
}
