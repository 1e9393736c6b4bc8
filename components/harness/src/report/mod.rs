//! Collects results and summarizes them into serializable reports.
#![allow(clippy::float_arithmetic)]
use crate::{
    record::{serialize_millis, OperationRecord},
    stats::{LatencyStats, Ratio},
    trial::{ReadMode, Scenario, TrialOutcome, TrialResult},
    verify::{ConsistencyVerdict, DurabilityReport, ImmediateReadOutcome},
    workload::{LeaderChangeRecord, MonitorRun, ReadOutcome, SequenceCounter},
};
use failover_concurrency::time;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Mutex};

mod analysis;
#[cfg(test)]
mod tests;

pub use analysis::{
    client_performance, failover_events, ClientPerformance, FailoverEvent, LatencyComparison,
    PhaseLatency,
};

/// Append-only collection of trial results.
#[derive(Debug, Default)]
pub struct Aggregator(Mutex<Vec<TrialResult>>);

impl Aggregator {
    /// Constructs an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a result.
    pub fn push(&self, result: TrialResult) {
        self.0.lock().unwrap().push(result);
    }

    /// Number of collected results.
    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    /// Whether no result was collected yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the collected results.
    pub fn results(&self) -> Vec<TrialResult> {
        self.0.lock().unwrap().clone()
    }

    /// Summarizes the collected results.
    pub fn report(&self) -> FailoverReport {
        FailoverReport::new(self.results())
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    total: usize,
    passed: usize,
    violated: usize,
    incomplete: usize,
    abandoned: usize,
}

impl Counts {
    fn add(&mut self, outcome: &TrialOutcome) {
        self.total += 1;
        match outcome {
            TrialOutcome::Passed => self.passed += 1,
            TrialOutcome::Violated { .. } => self.violated += 1,
            TrialOutcome::Incomplete { .. } => self.incomplete += 1,
            TrialOutcome::Abandoned => self.abandoned += 1,
        }
    }

    /// Passed out of trials which reached a verdict.
    fn success_rate(&self) -> Ratio {
        Ratio::new(self.passed, self.passed + self.violated)
    }
}

/// Summary of the trials of one scenario in one read mode.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    /// Scenario.
    pub scenario: Scenario,
    /// Read mode.
    pub read_mode: ReadMode,
    /// Number of trials.
    pub total: usize,
    /// Trials which passed.
    pub passed: usize,
    /// Trials in which the store violated a guarantee.
    pub violated: usize,
    /// Trials the harness could not complete.
    pub incomplete: usize,
    /// Canceled trials.
    pub abandoned: usize,
    /// Passed out of passed and violated trials.
    pub success_rate: Ratio,
    /// Immediate reads returning the written value, for the immediate read mode.
    pub immediate_availability: Option<Ratio>,
    /// Mean wall time of a trial.
    #[serde(serialize_with = "serialize_millis")]
    pub mean_trial_duration: time::Duration,
    /// Recovery durations.
    pub recovery: LatencyStats,
}

impl GroupSummary {
    fn new(scenario: Scenario, read_mode: ReadMode, trials: &[&TrialResult]) -> Self {
        let mut counts = Counts::default();
        for t in trials {
            counts.add(&t.outcome);
        }
        let immediate_availability = (read_mode == ReadMode::Immediate).then(|| {
            let outcomes: Vec<_> = trials
                .iter()
                .filter_map(|t| t.immediate_outcome.as_ref())
                .collect();
            Ratio::new(
                outcomes
                    .iter()
                    .filter(|o| ***o == ImmediateReadOutcome::Available)
                    .count(),
                outcomes.len(),
            )
        });
        let total_duration: time::Duration = trials.iter().map(|t| t.duration).sum();
        let mean_trial_duration = match u32::try_from(trials.len()) {
            Ok(n) if n > 0 => total_duration / n,
            _ => time::Duration::ZERO,
        };
        Self {
            scenario,
            read_mode,
            total: counts.total,
            passed: counts.passed,
            violated: counts.violated,
            incomplete: counts.incomplete,
            abandoned: counts.abandoned,
            success_rate: counts.success_rate(),
            immediate_availability,
            mean_trial_duration,
            recovery: LatencyStats::compute(trials.iter().filter_map(|t| t.recovery_duration)),
        }
    }
}

/// Report of a failover campaign.
///
/// Guarantee violations and trials the harness failed to complete are
/// counted separately.
#[derive(Debug, Clone, Serialize)]
pub struct FailoverReport {
    /// When the report was generated.
    #[serde(with = "::time::serde::rfc3339")]
    pub generated_at: time::Utc,
    /// Number of trials.
    pub total: usize,
    /// Trials which passed.
    pub passed: usize,
    /// Trials in which the store violated a guarantee.
    pub violations: usize,
    /// Trials the harness could not complete.
    pub incomplete: usize,
    /// Canceled trials.
    pub abandoned: usize,
    /// Passed out of passed and violated trials.
    pub success_rate: Ratio,
    /// Per scenario and read mode summaries.
    pub groups: Vec<GroupSummary>,
    /// All trials, in execution order.
    pub trials: Vec<TrialResult>,
}

impl FailoverReport {
    /// Summarizes `trials`.
    pub fn new(trials: Vec<TrialResult>) -> Self {
        let mut counts = Counts::default();
        let mut groups: BTreeMap<_, Vec<&TrialResult>> = BTreeMap::new();
        for t in &trials {
            counts.add(&t.outcome);
            groups.entry((t.scenario, t.read_mode)).or_default().push(t);
        }
        let groups = groups
            .into_iter()
            .map(|((scenario, read_mode), trials)| GroupSummary::new(scenario, read_mode, &trials))
            .collect();
        Self {
            generated_at: time::now_utc(),
            total: counts.total,
            passed: counts.passed,
            violations: counts.violated,
            incomplete: counts.incomplete,
            abandoned: counts.abandoned,
            success_rate: counts.success_rate(),
            groups,
            trials,
        }
    }

    /// Verdicts of the violating trials.
    pub fn violating_trials(&self) -> impl Iterator<Item = (&str, &ConsistencyVerdict)> {
        self.trials.iter().filter_map(|t| match &t.outcome {
            TrialOutcome::Violated { verdict } => Some((t.trial_id.as_str(), verdict)),
            _ => None,
        })
    }

    /// Logs a summary of the report.
    pub fn log_summary(&self) {
        tracing::info!(
            total = self.total,
            passed = self.passed,
            violations = self.violations,
            incomplete = self.incomplete,
            abandoned = self.abandoned,
            "failover campaign finished, success rate {:.1}%",
            self.success_rate.rate() * 100.
        );
        for g in &self.groups {
            tracing::info!(
                scenario = %g.scenario,
                read_mode = %g.read_mode,
                passed = g.passed,
                violated = g.violated,
                incomplete = g.incomplete,
                mean_recovery = ?g.recovery.mean,
                "scenario summary"
            );
        }
        for (trial, verdict) in self.violating_trials() {
            tracing::error!(trial, "{verdict}");
        }
    }
}

/// Report of the concurrent workloads.
#[derive(Debug, Clone, Serialize)]
pub struct ConcurrencyReport {
    /// When the report was generated.
    #[serde(with = "::time::serde::rfc3339")]
    pub generated_at: time::Utc,
    /// Final value check of the linearizability workload.
    pub linearizability: ConsistencyVerdict,
    /// Reads returning the value their client had just written.
    pub read_your_writes: Ratio,
    /// Final value check of the durability workload.
    pub durability: DurabilityReport,
    /// Latency of the writes of all workloads.
    pub write_latency: LatencyStats,
    /// Latency of the reads of all workloads.
    pub read_latency: LatencyStats,
    /// Per workload and client breakdown.
    pub clients: Vec<ClientPerformance>,
    /// All records of all workloads, retried reads included.
    pub operations: Vec<OperationRecord>,
}

impl ConcurrencyReport {
    /// Number of failed checks.
    pub fn violations(&self) -> usize {
        [&self.linearizability, &self.durability.verdict]
            .into_iter()
            .filter(|v| !v.passed)
            .count()
    }

    /// Logs a summary of the report.
    pub fn log_summary(&self) {
        for verdict in [&self.linearizability, &self.durability.verdict] {
            if verdict.passed {
                tracing::info!("{verdict}");
            } else {
                tracing::error!("{verdict}");
            }
        }
        tracing::info!(
            acknowledged = self.durability.acknowledged.num,
            attempted = self.durability.acknowledged.den,
            mean_write_latency = ?self.write_latency.mean,
            "read-your-writes rate {:.1}%",
            self.read_your_writes.rate() * 100.
        );
        for c in &self.clients {
            tracing::debug!(
                workload = c.workload,
                client = %c.client,
                ok = c.success.num,
                total = c.success.den,
                mean_latency = ?c.mean_latency,
                "client summary"
            );
        }
    }
}

/// Report of a monitor run.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    /// When the report was generated.
    #[serde(with = "::time::serde::rfc3339")]
    pub generated_at: time::Utc,
    /// Wall time of the run.
    #[serde(serialize_with = "serialize_millis")]
    pub duration: time::Duration,
    /// Acknowledged out of attempted writes.
    pub write_success: Ratio,
    /// Successful out of attempted reads.
    pub read_success: Ratio,
    /// Reads returning the acknowledged value out of attempted reads.
    pub consistency: Ratio,
    /// Reads returning a different value than the acknowledged one.
    pub inconsistent_reads: usize,
    /// Write latency.
    pub write_latency: LatencyStats,
    /// Read latency.
    pub read_latency: LatencyStats,
    /// Missing sequence numbers among the acknowledged writes.
    pub sequence_gaps: Vec<u64>,
    /// Leadership transitions.
    pub leader_changes: Vec<LeaderChangeRecord>,
    /// Intervals between leadership transitions in which operations failed.
    pub failover_events: Vec<FailoverEvent>,
    /// Latency before and after the first leadership transition.
    pub latency_comparison: LatencyComparison,
}

impl MonitorReport {
    /// Summarizes a monitor run.
    pub fn from_run(run: &MonitorRun) -> Self {
        let count = |outcome| run.reads.iter().filter(|r| r.outcome == outcome).count();
        let ops: Vec<_> = run
            .writes
            .iter()
            .chain(run.reads.iter().map(|r| &r.record))
            .collect();
        Self {
            generated_at: time::now_utc(),
            duration: run.duration,
            write_success: Ratio::new(
                run.writes.iter().filter(|w| w.success).count(),
                run.writes.len(),
            ),
            read_success: Ratio::new(
                run.reads.iter().filter(|r| r.record.success).count(),
                run.reads.len(),
            ),
            consistency: Ratio::new(count(ReadOutcome::Consistent), run.reads.len()),
            inconsistent_reads: count(ReadOutcome::Inconsistent),
            write_latency: LatencyStats::compute(run.writes.iter().map(|w| w.latency)),
            read_latency: LatencyStats::compute(run.reads.iter().map(|r| r.record.latency)),
            sequence_gaps: detect_sequence_gaps(&run.writes),
            leader_changes: run.leader_changes.clone(),
            failover_events: failover_events(ops.iter().copied(), &run.leader_changes),
            latency_comparison: LatencyComparison::compute(&ops, &run.leader_changes),
        }
    }

    /// Number of store-side anomalies: inconsistent reads and sequence gaps.
    pub fn violations(&self) -> usize {
        self.inconsistent_reads + self.sequence_gaps.len()
    }

    /// Logs a summary of the report.
    pub fn log_summary(&self) {
        tracing::info!(
            writes = self.write_success.den,
            reads = self.read_success.den,
            inconsistent_reads = self.inconsistent_reads,
            leader_changes = self.leader_changes.len(),
            failover_events = self.failover_events.len(),
            gaps = ?self.sequence_gaps,
            "monitor finished, write success {:.1}%, consistency {:.1}%",
            self.write_success.rate() * 100.,
            self.consistency.rate() * 100.
        );
    }
}

/// Returns the sequence numbers missing between consecutive acknowledged
/// writes to monotonically numbered keys, in increasing order.
pub fn detect_sequence_gaps<'a>(records: impl IntoIterator<Item = &'a OperationRecord>) -> Vec<u64> {
    let mut seqs: Vec<u64> = records
        .into_iter()
        .filter(|r| r.is_acknowledged_write())
        .filter_map(|r| SequenceCounter::parse_seq(&r.key))
        .collect();
    seqs.sort_unstable();
    seqs.dedup();
    seqs.windows(2).flat_map(|w| w[0] + 1..w[1]).collect()
}
