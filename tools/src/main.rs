//! Failover tester: injects leader failures into a Kubernetes-hosted
//! key-value store and verifies its consistency guarantees.
use anyhow::Context as _;
use clap::{Parser, Subcommand};
use failover_concurrency::ctx;
use failover_harness::{
    injector::FailureInjector,
    leader::LeaderTracker,
    recovery::{RecoveryDetector, RecoveryEvent},
    report::Aggregator,
    suite,
    trial::{TrialRunner, TrialTimings},
    workload::WorkloadDriver,
};
use failover_tools::{k8s::KubePlatform, store::RpcStore, AppConfig};
use serde::Serialize;
use std::{
    fs,
    io::IsTerminal as _,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::metadata::LevelFilter;
use tracing_subscriber::{prelude::*, Registry};
use vise_exporter::MetricsExporter;

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "failover-tester", about)]
struct Args {
    /// Path to a YAML or JSON config file.
    #[arg(long, env = "CONFIG_FILE", global = true)]
    config: Option<PathBuf>,
    /// Path to write the JSON report to.
    #[arg(long, global = true)]
    report: Option<PathBuf>,
    /// Address to serve Prometheus metrics on.
    #[arg(long, global = true)]
    metrics_addr: Option<SocketAddr>,
    /// Namespace of the store.
    #[arg(long, global = true)]
    namespace: Option<String>,
    /// URL of the JSON-RPC store proxy.
    #[arg(long, global = true)]
    rpc_url: Option<String>,
    /// Subcommand to run.
    #[command(subcommand)]
    command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Run a failover campaign.
    Failover {
        /// Campaign mode: precision or comprehensive.
        #[arg(long)]
        mode: Option<String>,
        /// Fixed failure delay, replacing the scenario table.
        #[arg(long)]
        failure_delay_ms: Option<u64>,
    },
    /// Run the linearizability and durability workloads.
    Concurrency {
        /// Number of concurrent clients.
        #[arg(long)]
        clients: Option<usize>,
        /// Number of writes per client.
        #[arg(long)]
        operations: Option<usize>,
    },
    /// Run the continuous write/read/leadership monitor.
    Monitor {
        /// Duration of the run in seconds.
        #[arg(long)]
        duration_secs: Option<u64>,
    },
    /// Check the configuration and exit.
    VerifyConfig,
}

impl Args {
    /// Resolves the configuration: file and environment, then flags.
    fn config(&self) -> anyhow::Result<AppConfig> {
        let mut cfg = AppConfig::load(self.config.as_deref())?;
        if let Some(addr) = self.metrics_addr {
            cfg.metrics_addr = Some(addr);
        }
        if let Some(namespace) = &self.namespace {
            cfg.namespace.clone_from(namespace);
        }
        if let Some(url) = &self.rpc_url {
            cfg.rpc_url.clone_from(url);
        }
        match &self.command {
            Command::Failover {
                mode,
                failure_delay_ms,
            } => {
                if let Some(mode) = mode {
                    cfg.test_mode.clone_from(mode);
                }
                if failure_delay_ms.is_some() {
                    cfg.harness.failure_delay_millis = *failure_delay_ms;
                }
            }
            Command::Concurrency {
                clients,
                operations,
            } => {
                if let Some(n) = clients {
                    cfg.harness.concurrent_clients = *n;
                }
                if let Some(n) = operations {
                    cfg.harness.operations_per_client = *n;
                }
            }
            Command::Monitor { duration_secs } => {
                if let Some(secs) = duration_secs {
                    cfg.harness.test_duration_seconds = *secs;
                }
            }
            Command::VerifyConfig => {}
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Installs two log layers: human-readable INFO logs on stdout and
/// DEBUG logs in `log_file`.
fn init_logging(log_file: &Path) -> anyhow::Result<()> {
    if let Some(dir) = log_file.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {dir:?}"))?;
    }
    let log_file =
        fs::File::create(log_file).with_context(|| format!("failed to create {log_file:?}"))?;

    let stdout_log = tracing_subscriber::fmt::layer()
        .pretty()
        .with_ansi(std::env::var("NO_COLOR").is_err() && std::io::stdout().is_terminal())
        .with_file(false)
        .with_line_number(false)
        .with_filter(LevelFilter::INFO);
    let file_log = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(LevelFilter::DEBUG);
    let subscriber = Registry::default().with(stdout_log).with(file_log);
    tracing::subscriber::set_global_default(subscriber)
        .context("tracing::subscriber::set_global_default()")
}

/// Cancels `ctx` on SIGINT or SIGTERM.
fn cancel_on_signal(ctx: &ctx::Ctx) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut s) => {
                    s.recv().await;
                }
                Err(err) => {
                    tracing::warn!("failed to install SIGTERM handler: {err}");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(err) = res {
                    tracing::warn!("failed to listen for SIGINT: {err}");
                    return;
                }
            }
            () = terminate => {}
        }
        tracing::warn!("interrupted, finishing the current step");
        ctx.cancel();
    });
}

/// Writes `report` as pretty JSON to `path`, if set.
fn write_report<T: Serialize>(path: Option<&Path>, report: &T) -> anyhow::Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let json = serde_json::to_string_pretty(report).context("serde_json::to_string_pretty()")?;
    fs::write(path, json).with_context(|| format!("failed to write {path:?}"))?;
    tracing::info!(path = %path.display(), "report written");
    Ok(())
}

/// Connects to the cluster and primes the leadership cache.
async fn tracker(ctx: &ctx::Ctx, cfg: &AppConfig) -> anyhow::Result<Arc<LeaderTracker>> {
    let platform =
        KubePlatform::connect(&cfg.namespace, &cfg.store_name, cfg.partition_base).await?;
    let tracker = Arc::new(LeaderTracker::new(Arc::new(platform)));
    let changes = tracker
        .refresh(ctx)
        .await
        .context("initial leadership query failed")?;
    for change in &changes {
        let leader = &change.after;
        tracing::info!(
            partition = %change.partition,
            replica = leader.replica.as_ref().map(|r| r.0.as_str()),
            term = leader.term,
            state = ?leader.state,
            "partition leadership"
        );
    }
    Ok(tracker)
}

async fn run_failover(
    ctx: &ctx::Ctx,
    cfg: &AppConfig,
    driver: WorkloadDriver,
    report_path: Option<&Path>,
) -> anyhow::Result<()> {
    let tracker = tracker(ctx, cfg).await?;
    let background = ctx.child_cancelable();
    tokio::spawn({
        let (ctx, tracker) = (background.clone(), tracker.clone());
        let interval = cfg.harness.leader_poll_interval();
        async move { tracker.run(&ctx, interval).await }
    });
    let (events_send, mut events_recv) = tokio::sync::mpsc::unbounded_channel::<RecoveryEvent>();
    tokio::spawn(async move {
        while let Some(event) = events_recv.recv().await {
            tracing::debug!(
                partition = %event.partition,
                elapsed = ?event.elapsed,
                state = ?event.state,
                "recovery state"
            );
        }
    });

    let runner = TrialRunner::new(
        cfg.harness.mapper()?,
        tracker.clone(),
        FailureInjector::new(tracker.platform().clone(), cfg.replica_mapping()),
        RecoveryDetector::new(tracker, cfg.harness.recovery()).with_events(events_send),
        driver,
        TrialTimings::default(),
    );
    let aggregator = Aggregator::new();
    let res = runner
        .run_campaign(
            ctx,
            &suite::scenarios(&cfg.harness),
            cfg.test_mode()?,
            &aggregator,
        )
        .await;
    background.cancel();
    if res.is_err() {
        tracing::warn!(trials = aggregator.len(), "campaign interrupted");
    }
    let report = aggregator.report();
    report.log_summary();
    write_report(report_path, &report)?;
    anyhow::ensure!(
        report.violations == 0,
        "{} trials violated a guarantee",
        report.violations
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = args.config().context("invalid configuration")?;
    init_logging(&cfg.log_file)?;
    tracing::debug!(?args, "starting");

    if let Command::VerifyConfig = args.command {
        tracing::info!(
            config = %serde_json::to_string(&cfg).context("serde_json::to_string()")?,
            "configuration verified"
        );
        return Ok(());
    }

    let ctx = &ctx::root();
    cancel_on_signal(ctx);
    if let Some(addr) = cfg.metrics_addr {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let res = MetricsExporter::default()
                .with_graceful_shutdown(async move { ctx.canceled().await })
                .start(addr)
                .await;
            if let Err(err) = res {
                tracing::error!("metrics exporter failed: {err:#}");
            }
        });
    }

    let store = RpcStore::new(&cfg.rpc_url, &cfg.map_name, cfg.harness.operation_timeout())?;
    let driver = WorkloadDriver::new(Arc::new(store), cfg.harness.operation_timeout());
    suite::probe_connectivity(ctx, &driver).await?;

    let report_path = args.report.as_deref();
    match &args.command {
        Command::Failover { .. } => run_failover(ctx, &cfg, driver, report_path).await,
        Command::Concurrency { .. } => {
            let report = suite::run_concurrency(ctx, &driver, &cfg.harness)
                .await
                .context("concurrency workloads interrupted")?;
            report.log_summary();
            write_report(report_path, &report)?;
            anyhow::ensure!(
                report.violations() == 0,
                "{} checks failed",
                report.violations()
            );
            Ok(())
        }
        Command::Monitor { .. } => {
            let tracker = tracker(ctx, &cfg).await?;
            let report = suite::run_monitor(ctx, &driver, &tracker, &cfg.harness).await;
            report.log_summary();
            write_report(report_path, &report)?;
            anyhow::ensure!(
                report.violations() == 0,
                "monitor observed {} anomalies",
                report.violations()
            );
            Ok(())
        }
        Command::VerifyConfig => Ok(()),
    }
}
