use super::*;
use crate::{
    partition::PartitionId,
    record::{ClientId, OpKind},
    trial::{Phase, TrialPlan},
    verify::{Guarantee, VerdictDetail},
    workload::{ConcurrentBatch, MonitorRead},
};
use assert_matches::assert_matches;
use pretty_assertions::assert_eq;

fn ms(n: u64) -> time::Duration {
    time::Duration::from_millis(n)
}

fn write(seq: u64, success: bool) -> OperationRecord {
    let now = time::now_utc();
    OperationRecord {
        kind: OpKind::Write,
        client: ClientId(0),
        seq,
        key: SequenceCounter::key(seq),
        value: Some(format!("value-{seq}")),
        issued_at: now,
        completed_at: now,
        latency: ms(seq),
        success,
        error: (!success).then(|| "operation timed out".to_owned()),
    }
}

fn trial(
    n: usize,
    scenario: Scenario,
    read_mode: ReadMode,
    outcome: TrialOutcome,
    recovery: Option<u64>,
) -> TrialResult {
    let plan = TrialPlan::new(n, scenario, read_mode, ms(0));
    TrialResult {
        trial_id: plan.trial_id,
        scenario,
        read_mode,
        delay: plan.delay,
        target_key: plan.key,
        partition: PartitionId(0),
        write: None,
        leader_before: None,
        terminated: None,
        terminated_at: None,
        leader_after: None,
        recovery_duration: recovery.map(ms),
        immediate_read: None,
        immediate_outcome: None,
        verification_read: None,
        verification_retries: vec![],
        duration: ms(2000),
        outcome,
    }
}

fn violated() -> TrialOutcome {
    TrialOutcome::Violated {
        verdict: ConsistencyVerdict {
            guarantee: Guarantee::FailoverDurability,
            passed: false,
            detail: VerdictDetail::ValueMismatch {
                observed: "v0".to_owned(),
                expected: "v1".to_owned(),
            },
        },
    }
}

fn incomplete() -> TrialOutcome {
    TrialOutcome::Incomplete {
        phase: Phase::Recovery,
        reason: "no new leader".to_owned(),
    }
}

#[test]
fn sequence_gaps() {
    let records: Vec<_> = [1, 2, 5, 6, 9].into_iter().map(|s| write(s, true)).collect();
    assert_eq!(vec![3, 4, 7, 8], detect_sequence_gaps(&records));
}

#[test]
fn sequence_gaps_ignore_failed_and_foreign_writes() {
    let mut records = vec![write(1, true), write(2, false), write(3, true), write(3, true)];
    let mut foreign = write(10, true);
    foreign.key = "precision-key-test-000001".to_owned();
    records.push(foreign);
    assert_eq!(vec![2], detect_sequence_gaps(&records));
    assert!(detect_sequence_gaps(&[]).is_empty());
    assert!(detect_sequence_gaps(&[write(4, true)]).is_empty());
}

#[test]
fn violations_and_incomplete_are_counted_separately() {
    let aggregator = Aggregator::new();
    assert!(aggregator.is_empty());
    let post = ReadMode::PostRecovery;
    aggregator.push(trial(1, Scenario::ImmediateFailure, post, TrialOutcome::Passed, Some(800)));
    aggregator.push(trial(2, Scenario::ImmediateFailure, post, violated(), Some(1200)));
    aggregator.push(trial(3, Scenario::ImmediateFailure, post, incomplete(), None));
    aggregator.push(trial(4, Scenario::PrecisionTimed, post, TrialOutcome::Passed, Some(1000)));
    aggregator.push(trial(5, Scenario::PrecisionTimed, post, TrialOutcome::Abandoned, None));
    assert_eq!(5, aggregator.len());

    let report = aggregator.report();
    assert_eq!(5, report.total);
    assert_eq!(2, report.passed);
    assert_eq!(1, report.violations);
    assert_eq!(1, report.incomplete);
    assert_eq!(1, report.abandoned);
    assert_eq!(Ratio::new(2, 3), report.success_rate);
    assert_eq!(
        vec!["test-000002"],
        report
            .violating_trials()
            .map(|(id, _)| id)
            .collect::<Vec<_>>()
    );

    assert_eq!(2, report.groups.len());
    let g = &report.groups[0];
    assert_eq!(Scenario::ImmediateFailure, g.scenario);
    assert_eq!((3, 1, 1, 1, 0), (g.total, g.passed, g.violated, g.incomplete, g.abandoned));
    assert_eq!(Ratio::new(1, 2), g.success_rate);
    assert_eq!(None, g.immediate_availability);
    assert_eq!(2, g.recovery.count);
    assert_eq!(ms(800), g.recovery.min);
    assert_eq!(ms(1200), g.recovery.max);
    assert_eq!(ms(2000), g.mean_trial_duration);

    let g = &report.groups[1];
    assert_eq!(Scenario::PrecisionTimed, g.scenario);
    assert_eq!(Ratio::new(1, 1), g.success_rate);
    assert_eq!(1, g.abandoned);
}

#[test]
fn immediate_availability() {
    let imm = ReadMode::Immediate;
    let mut available = trial(1, Scenario::DuringReplication, imm, TrialOutcome::Passed, Some(900));
    available.immediate_outcome = Some(ImmediateReadOutcome::Available);
    let mut unavailable =
        trial(2, Scenario::DuringReplication, imm, TrialOutcome::Passed, Some(900));
    unavailable.immediate_outcome = Some(ImmediateReadOutcome::Unavailable {
        error: "operation timed out".to_owned(),
    });
    let report = FailoverReport::new(vec![available, unavailable]);
    assert_eq!(
        Some(Ratio::new(1, 2)),
        report.groups[0].immediate_availability
    );
    // Immediate unavailability is not a violation.
    assert_eq!(0, report.violations);
    assert_eq!(Ratio::new(2, 2), report.success_rate);
}

#[test]
fn report_serializes_outcome_inline() {
    let report = FailoverReport::new(vec![trial(
        1,
        Scenario::ImmediateFailure,
        ReadMode::PostRecovery,
        incomplete(),
        None,
    )]);
    let json = serde_json::to_value(&report).unwrap();
    let t = &json["trials"][0];
    assert_eq!("test-000001", t["trial_id"]);
    assert_eq!("incomplete", t["outcome"]);
    assert_eq!("recovery", t["phase"]);
    assert_eq!(serde_json::Value::Null, t["recovery_duration"]);
    assert_eq!(2000.0, t["duration"]);
    assert_eq!("immediate_failure", json["groups"][0]["scenario"]);
}

#[test]
fn monitor_report() {
    let now = time::now_utc();
    let writes = vec![write(1, true), write(2, true), write(3, false), write(4, true)];
    let read = |outcome, value: Option<&str>| MonitorRead {
        record: OperationRecord {
            kind: OpKind::Read,
            client: ClientId(1),
            seq: 1,
            key: SequenceCounter::key(1),
            value: value.map(str::to_owned),
            issued_at: now,
            completed_at: now,
            latency: ms(4),
            success: value.is_some(),
            error: None,
        },
        expected: "value-1".to_owned(),
        outcome,
    };
    let run = MonitorRun {
        writes,
        reads: vec![
            read(ReadOutcome::Consistent, Some("value-1")),
            read(ReadOutcome::Inconsistent, Some("value-0")),
            read(ReadOutcome::Failed, None),
        ],
        leader_changes: vec![],
        duration: time::Duration::from_secs(10),
    };
    let report = MonitorReport::from_run(&run);
    assert_eq!(Ratio::new(3, 4), report.write_success);
    assert_eq!(Ratio::new(2, 3), report.read_success);
    assert_eq!(Ratio::new(1, 3), report.consistency);
    assert_eq!(1, report.inconsistent_reads);
    assert_eq!(vec![3], report.sequence_gaps);
    assert_eq!(2, report.violations());
    assert_eq!(4, report.write_latency.count);
    assert_eq!(ms(4), report.read_latency.max);
    assert!(report.failover_events.is_empty());
    assert_eq!(3, report.latency_comparison.baseline.write.count);
    assert_eq!(2, report.latency_comparison.baseline.read.count);
}

fn op(kind: OpKind, client: usize, at_ms: u64, latency_ms: u64, success: bool) -> OperationRecord {
    let t0 = time::Utc::from_unix_timestamp(1_700_000_000).unwrap();
    OperationRecord {
        kind,
        client: ClientId(client),
        seq: at_ms,
        key: SequenceCounter::key(at_ms),
        value: Some("v".to_owned()),
        issued_at: t0 + ms(at_ms),
        completed_at: t0 + ms(at_ms + latency_ms),
        latency: ms(latency_ms),
        success,
        error: (!success).then(|| "no leader".to_owned()),
    }
}

fn change(at_ms: u64, term: u64) -> LeaderChangeRecord {
    let t0 = time::Utc::from_unix_timestamp(1_700_000_000).unwrap();
    LeaderChangeRecord {
        partition: PartitionId(0),
        from: Some(crate::platform::ReplicaId::from("consensus-store-0")),
        to: Some(crate::platform::ReplicaId::from("consensus-store-1")),
        term,
        observed_at: t0 + ms(at_ms),
    }
}

#[test]
fn failover_events_between_leader_changes() {
    let ops = vec![
        op(OpKind::Write, 0, 500, 5, false),
        // First interval: two failures, then the store recovers.
        op(OpKind::Write, 0, 1500, 900, false),
        op(OpKind::Read, 1, 2000, 900, false),
        op(OpKind::Read, 1, 3500, 5, true),
        op(OpKind::Write, 0, 3000, 5, true),
        // Second interval: nothing failed.
        op(OpKind::Write, 0, 6000, 5, true),
    ];
    let changes = vec![change(1000, 2), change(5000, 3), change(7000, 4)];
    let events = failover_events(&ops, &changes);
    assert_matches!(&events[..], [e] => {
        assert_eq!(changes[0].observed_at, e.started_at);
        assert_eq!(changes[1].observed_at, e.ended_at);
        assert_eq!(ms(4000), e.duration);
        assert_eq!(2, e.impacted_operations);
        assert_eq!(Some(ms(2000)), e.recovery_time);
    });

    // A single change delimits no interval.
    assert!(failover_events(&ops, &changes[..1]).is_empty());
}

#[test]
fn latency_before_and_after_first_leader_change() {
    let ops = [
        op(OpKind::Write, 0, 100, 5, true),
        op(OpKind::Read, 0, 200, 3, true),
        op(OpKind::Write, 0, 1500, 400, true),
        op(OpKind::Write, 0, 1600, 1000, false),
        op(OpKind::Read, 0, 1700, 50, true),
    ];
    let ops: Vec<_> = ops.iter().collect();

    let cmp = LatencyComparison::compute(&ops, &[change(1000, 2), change(3000, 3)]);
    assert_eq!(1, cmp.baseline.write.count);
    assert_eq!(ms(5), cmp.baseline.write.max);
    assert_eq!(ms(3), cmp.baseline.read.max);
    // Failed operations are left out.
    assert_eq!(1, cmp.failover.write.count);
    assert_eq!(ms(400), cmp.failover.write.max);
    assert_eq!(ms(50), cmp.failover.read.max);

    let cmp = LatencyComparison::compute(&ops, &[]);
    assert_eq!(2, cmp.baseline.write.count);
    assert_eq!(2, cmp.baseline.read.count);
    assert_eq!(PhaseLatency::default(), cmp.failover);
}

#[test]
fn per_client_breakdown() {
    let batch = ConcurrentBatch {
        records: vec![
            op(OpKind::Write, 2, 0, 10, true),
            op(OpKind::Write, 1, 0, 20, true),
            op(OpKind::Read, 1, 10, 40, true),
            op(OpKind::Write, 1, 20, 5000, false),
            op(OpKind::Write, 2, 20, 5000, false),
        ],
        clients: 2,
    };
    let perf = client_performance("linearizability", &batch);
    assert_eq!(
        vec![
            ClientPerformance {
                workload: "linearizability",
                client: ClientId(1),
                success: Ratio::new(2, 3),
                mean_latency: ms(30),
            },
            ClientPerformance {
                workload: "linearizability",
                client: ClientId(2),
                success: Ratio::new(1, 2),
                mean_latency: ms(10),
            },
        ],
        perf
    );
}
