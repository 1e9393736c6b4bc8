//! Ready-made runs of the harness, parameterized by [`HarnessConfig`].
use crate::{
    config::HarnessConfig,
    leader::LeaderTracker,
    record::{ClientId, OpKind},
    report::{client_performance, ConcurrencyReport, MonitorReport},
    stats::LatencyStats,
    trial::{default_scenarios, fixed_delay_scenario, ScenarioRow},
    verify,
    workload::{self, ConcurrentSpec, MonitorSpec, WorkloadDriver},
};
use anyhow::Context as _;
use failover_concurrency::{ctx, time};

/// Key written concurrently by the linearizability workload.
pub const LINEARIZABILITY_KEY: &str = "linearizability-test-key";
/// Prefix of the per-client keys of the read-your-writes workload.
pub const READ_YOUR_WRITES_KEY: &str = "read-your-writes-test-key";
/// Key written concurrently by the durability workload.
pub const DURABILITY_KEY: &str = "durability-test-key";

/// Pause between the end of a concurrent workload and its final read.
const FINAL_READ_DELAY: time::Duration = time::Duration::from_millis(100);
/// Pause before retrying a final read which failed transiently.
const READ_RETRY_BACKOFF: time::Duration = time::Duration::from_millis(500);

/// Checks that the store is reachable and serves its own writes.
/// Nothing else should be run against a store failing this check.
pub async fn probe_connectivity(ctx: &ctx::Ctx, driver: &WorkloadDriver) -> anyhow::Result<()> {
    driver
        .probe(ctx)
        .await
        .context("store connectivity check failed")?;
    tracing::info!("store connectivity verified");
    Ok(())
}

/// Scenario table of a failover campaign: a single fixed delay if the
/// configuration sets one, the default table otherwise.
pub fn scenarios(cfg: &HarnessConfig) -> Vec<ScenarioRow> {
    match cfg.failure_delay_millis {
        Some(ms) => fixed_delay_scenario(time::Duration::from_millis(ms)),
        None => default_scenarios(),
    }
}

/// Monitor timings.
pub fn monitor_spec(cfg: &HarnessConfig) -> MonitorSpec {
    MonitorSpec {
        write_interval: time::Duration::from_millis(cfg.write_interval_millis),
        read_interval: time::Duration::from_millis(cfg.read_interval_millis),
        leader_interval: cfg.leader_poll_interval(),
        duration: cfg.test_duration(),
    }
}

/// Runs the linearizability, read-your-writes and durability workloads one
/// after another and checks the final values of the shared keys.
pub async fn run_concurrency(
    ctx: &ctx::Ctx,
    driver: &WorkloadDriver,
    cfg: &HarnessConfig,
) -> ctx::OrCanceled<ConcurrencyReport> {
    let (clients, ops) = (cfg.concurrent_clients, cfg.operations_per_client);
    let final_read = move |key: &'static str| {
        driver.read_with_retry(
            ctx,
            (ClientId(0), 1),
            key,
            cfg.operation_timeout(),
            READ_RETRY_BACKOFF,
        )
    };

    tracing::info!(clients, ops, "running linearizability workload");
    let lin = driver
        .concurrent(
            ctx,
            ConcurrentSpec::linearizability(LINEARIZABILITY_KEY, clients, ops, cfg.pacing()),
        )
        .await;
    ctx.sleep(FINAL_READ_DELAY).await?;
    let lin_reads = final_read(LINEARIZABILITY_KEY).await;

    tracing::info!(clients, ops, "running read-your-writes workload");
    let ryw = driver
        .concurrent(
            ctx,
            ConcurrentSpec::read_your_writes(READ_YOUR_WRITES_KEY, clients, ops, cfg.pacing()),
        )
        .await;

    let nonce = rand::random::<u64>();
    tracing::info!(clients, ops, nonce, "running durability workload");
    let dur = driver
        .concurrent(
            ctx,
            ConcurrentSpec::durability(DURABILITY_KEY, clients, ops, cfg.pacing(), nonce),
        )
        .await;
    ctx.sleep(FINAL_READ_DELAY).await?;
    let dur_reads = final_read(DURABILITY_KEY).await;
    if !ctx.is_active() {
        return Err(ctx::Canceled);
    }
    let (Some(lin_read), Some(dur_read)) = (lin_reads.last(), dur_reads.last()) else {
        return Err(ctx::Canceled);
    };

    let linearizability = verify::check_linearizability(&lin, lin_read);
    let read_your_writes = verify::read_your_writes_rate(ryw.write_read_pairs());
    let durability = verify::check_no_lost_updates(dur.writes(), dur_read);
    let mut clients = client_performance("linearizability", &lin);
    clients.extend(client_performance("read_your_writes", &ryw));
    clients.extend(client_performance("durability", &dur));

    let mut operations = lin.records;
    operations.extend(lin_reads);
    operations.extend(ryw.records);
    operations.extend(dur.records);
    operations.extend(dur_reads);
    let latencies = |kind| {
        LatencyStats::compute(
            operations
                .iter()
                .filter(|r| r.kind == kind)
                .map(|r| r.latency),
        )
    };
    Ok(ConcurrencyReport {
        generated_at: ctx.now_utc(),
        linearizability,
        read_your_writes,
        durability,
        write_latency: latencies(OpKind::Write),
        read_latency: latencies(OpKind::Read),
        clients,
        operations,
    })
}

/// Runs the continuous monitor for the configured duration.
pub async fn run_monitor(
    ctx: &ctx::Ctx,
    driver: &WorkloadDriver,
    tracker: &LeaderTracker,
    cfg: &HarnessConfig,
) -> MonitorReport {
    let spec = monitor_spec(cfg);
    tracing::info!(duration = ?spec.duration, "running monitor");
    let run = workload::monitor(ctx, driver, tracker, spec).await;
    MonitorReport::from_run(&run)
}
