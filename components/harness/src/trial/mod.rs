//! Failover trials: write a key, kill its partition's leader, wait for a new
//! one and check that the write survived.
use crate::{
    injector::{FailureInjector, InjectError},
    leader::{LeaderInfo, LeaderTracker},
    metrics::{OutcomeLabel, METRICS},
    partition::{PartitionId, PartitionMapper},
    platform::ReplicaId,
    record::{serialize_millis, serialize_opt_millis, ClientId, OperationRecord},
    recovery::{RecoveryDetector, RecoveryError},
    report::Aggregator,
    verify::{self, ConsistencyVerdict, ImmediateReadOutcome},
    workload::WorkloadDriver,
};
use failover_concurrency::{ctx, time};
use serde::Serialize;
use std::{fmt, str::FromStr, sync::Arc};


/// Failure scenario. Determines the delays between the write and the
/// leader termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    /// Terminate right after the write was acknowledged.
    ImmediateFailure,
    /// Terminate while the write is likely still being replicated.
    DuringReplication,
    /// Terminate at precise short delays.
    PrecisionTimed,
    /// Back-to-back trials with no delay.
    RapidSequential,
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ImmediateFailure => "immediate_failure",
            Self::DuringReplication => "during_replication",
            Self::PrecisionTimed => "precision_timed",
            Self::RapidSequential => "rapid_sequential",
        })
    }
}

/// When the written key is read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// Right after the termination, and again after recovery.
    Immediate,
    /// Only after recovery.
    PostRecovery,
}

impl fmt::Display for ReadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Immediate => "immediate",
            Self::PostRecovery => "post_recovery",
        })
    }
}

/// Which read modes a campaign exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestMode {
    /// Post-recovery reads only.
    #[default]
    Precision,
    /// Both read modes for every delay.
    Comprehensive,
}

impl TestMode {
    /// Read modes of a single delay, in execution order.
    pub fn read_modes(self) -> &'static [ReadMode] {
        match self {
            Self::Precision => &[ReadMode::PostRecovery],
            Self::Comprehensive => &[ReadMode::Immediate, ReadMode::PostRecovery],
        }
    }
}

impl FromStr for TestMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "precision" => Ok(Self::Precision),
            "comprehensive" => Ok(Self::Comprehensive),
            _ => anyhow::bail!("unknown test mode {s:?}, want precision or comprehensive"),
        }
    }
}

/// Phase of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Waiting for a ready leader before the write.
    AwaitLeader,
    /// Writing the key.
    Write,
    /// Waiting for the injection delay.
    Delay,
    /// Re-confirming the leader snapshot.
    Confirm,
    /// Terminating the leader.
    Terminate,
    /// Reading right after the termination.
    ImmediateRead,
    /// Waiting for a new stable leader.
    Recovery,
    /// Waiting after recovery.
    Settle,
    /// Reading after recovery.
    VerificationRead,
}

/// Row of the scenario table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioRow {
    /// Scenario.
    pub scenario: Scenario,
    /// Injection delays; one trial per delay and read mode.
    pub delays: Vec<time::Duration>,
    /// Pause between trials of this row, overriding the default.
    pub pause_between: Option<time::Duration>,
}

/// Scenario table of a failover campaign.
pub fn default_scenarios() -> Vec<ScenarioRow> {
    let ms = time::Duration::from_millis;
    vec![
        ScenarioRow {
            scenario: Scenario::ImmediateFailure,
            delays: vec![ms(0)],
            pause_between: None,
        },
        ScenarioRow {
            scenario: Scenario::DuringReplication,
            delays: vec![ms(50), ms(100), ms(200)],
            pause_between: None,
        },
        ScenarioRow {
            scenario: Scenario::PrecisionTimed,
            delays: vec![ms(10), ms(25), ms(75)],
            pause_between: None,
        },
        ScenarioRow {
            scenario: Scenario::RapidSequential,
            delays: vec![ms(0), ms(0), ms(0)],
            pause_between: Some(ms(500)),
        },
    ]
}

/// Scenario table consisting of a single delay.
pub fn fixed_delay_scenario(delay: time::Duration) -> Vec<ScenarioRow> {
    vec![ScenarioRow {
        scenario: Scenario::PrecisionTimed,
        delays: vec![delay],
        pause_between: None,
    }]
}

/// Timeouts and pauses of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialTimings {
    /// How long to wait for a ready leader before the write.
    pub ready_timeout: time::Duration,
    /// Timeout of the immediate read.
    pub immediate_read_timeout: time::Duration,
    /// Pause between recovery and the verification read.
    pub settle: time::Duration,
    /// Time budget of the verification read, retries included.
    pub verification_timeout: time::Duration,
    /// Pause before retrying a verification read that timed out or failed
    /// transiently.
    pub retry_backoff: time::Duration,
    /// Pause between trials.
    pub between_trials: time::Duration,
    /// Pause between the read modes of a delay.
    pub between_read_modes: time::Duration,
    /// Pause between scenarios.
    pub between_scenarios: time::Duration,
}

impl Default for TrialTimings {
    fn default() -> Self {
        Self {
            ready_timeout: time::Duration::from_secs(45),
            immediate_read_timeout: time::Duration::from_secs(5),
            settle: time::Duration::from_secs(1),
            verification_timeout: time::Duration::from_secs(10),
            retry_backoff: time::Duration::from_millis(500),
            between_trials: time::Duration::from_secs(2),
            between_read_modes: time::Duration::from_secs(3),
            between_scenarios: time::Duration::from_secs(5),
        }
    }
}

/// A single trial to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialPlan {
    /// Trial id, unique within the campaign.
    pub trial_id: String,
    /// Scenario.
    pub scenario: Scenario,
    /// Read mode.
    pub read_mode: ReadMode,
    /// Delay between the write and the termination.
    pub delay: time::Duration,
    /// Key to write.
    pub key: String,
}

impl TrialPlan {
    /// Plan of the `n`-th trial of a campaign.
    pub fn new(n: usize, scenario: Scenario, read_mode: ReadMode, delay: time::Duration) -> Self {
        let (trial_id, key) = match read_mode {
            ReadMode::Immediate => {
                let id = format!("imm-test-{n:06}");
                let key = format!("immediate-key-{id}");
                (id, key)
            }
            ReadMode::PostRecovery => {
                let id = format!("test-{n:06}");
                let key = format!("precision-key-{id}");
                (id, key)
            }
        };
        Self {
            trial_id,
            scenario,
            read_mode,
            delay,
            key,
        }
    }
}

/// Final outcome of a trial. The store violating a guarantee and the
/// harness failing to complete the trial are distinct outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TrialOutcome {
    /// The write survived the failover.
    Passed,
    /// The store violated a guarantee.
    Violated {
        /// The failed check.
        verdict: ConsistencyVerdict,
    },
    /// The trial could not be completed.
    Incomplete {
        /// Phase that failed.
        phase: Phase,
        /// Why.
        reason: String,
    },
    /// The trial was canceled.
    Abandoned,
}

impl TrialOutcome {
    fn incomplete(phase: Phase, reason: impl fmt::Display) -> Self {
        Self::Incomplete {
            phase,
            reason: reason.to_string(),
        }
    }

    fn label(&self) -> OutcomeLabel {
        match self {
            Self::Passed => OutcomeLabel::Passed,
            Self::Violated { .. } => OutcomeLabel::Violated,
            Self::Incomplete { .. } => OutcomeLabel::Incomplete,
            Self::Abandoned => OutcomeLabel::Abandoned,
        }
    }
}

/// Everything recorded about a trial.
#[derive(Debug, Clone, Serialize)]
pub struct TrialResult {
    /// Trial id.
    pub trial_id: String,
    /// Scenario.
    pub scenario: Scenario,
    /// Read mode.
    pub read_mode: ReadMode,
    /// Injection delay.
    #[serde(serialize_with = "serialize_millis")]
    pub delay: time::Duration,
    /// Written key.
    pub target_key: String,
    /// Partition of the key.
    pub partition: PartitionId,
    /// The write.
    pub write: Option<OperationRecord>,
    /// Leader captured before the termination.
    pub leader_before: Option<LeaderInfo>,
    /// Terminated process.
    pub terminated: Option<ReplicaId>,
    /// When the process was terminated.
    #[serde(with = "::time::serde::rfc3339::option")]
    pub terminated_at: Option<time::Utc>,
    /// New stable leader.
    pub leader_after: Option<LeaderInfo>,
    /// Time from the termination until the new leader was confirmed stable.
    #[serde(serialize_with = "serialize_opt_millis")]
    pub recovery_duration: Option<time::Duration>,
    /// Read issued right after the termination.
    pub immediate_read: Option<OperationRecord>,
    /// Classification of the immediate read.
    pub immediate_outcome: Option<ImmediateReadOutcome>,
    /// Read issued after recovery; the last attempt if it was retried.
    pub verification_read: Option<OperationRecord>,
    /// Failed verification read attempts preceding `verification_read`.
    pub verification_retries: Vec<OperationRecord>,
    /// Total duration of the trial.
    #[serde(serialize_with = "serialize_millis")]
    pub duration: time::Duration,
    /// Outcome.
    #[serde(flatten)]
    pub outcome: TrialOutcome,
}

impl TrialResult {
    fn new(plan: &TrialPlan, partition: PartitionId) -> Self {
        Self {
            trial_id: plan.trial_id.clone(),
            scenario: plan.scenario,
            read_mode: plan.read_mode,
            delay: plan.delay,
            target_key: plan.key.clone(),
            partition,
            write: None,
            leader_before: None,
            terminated: None,
            terminated_at: None,
            leader_after: None,
            recovery_duration: None,
            immediate_read: None,
            immediate_outcome: None,
            verification_read: None,
            verification_retries: vec![],
            duration: time::Duration::ZERO,
            outcome: TrialOutcome::Abandoned,
        }
    }
}

/// Executes failover trials.
#[derive(Debug)]
pub struct TrialRunner {
    mapper: PartitionMapper,
    tracker: Arc<LeaderTracker>,
    injector: FailureInjector,
    detector: RecoveryDetector,
    driver: WorkloadDriver,
    timings: TrialTimings,
}

impl TrialRunner {
    /// Constructs a runner.
    pub fn new(
        mapper: PartitionMapper,
        tracker: Arc<LeaderTracker>,
        injector: FailureInjector,
        detector: RecoveryDetector,
        driver: WorkloadDriver,
        timings: TrialTimings,
    ) -> Self {
        Self {
            mapper,
            tracker,
            injector,
            detector,
            driver,
            timings,
        }
    }

    /// Executes a single trial. Never fails: every failure is recorded in the outcome.
    pub async fn run_trial(&self, ctx: &ctx::Ctx, plan: &TrialPlan) -> TrialResult {
        let start = ctx.now();
        let partition = self.mapper.of(&plan.key);
        let mut result = TrialResult::new(plan, partition);
        tracing::info!(
            trial = plan.trial_id,
            scenario = %plan.scenario,
            read_mode = %plan.read_mode,
            delay = ?plan.delay,
            %partition,
            "starting trial"
        );
        result.outcome = self
            .execute(ctx, plan, &mut result)
            .await
            .unwrap_or(TrialOutcome::Abandoned);
        result.duration = ctx.now() - start;
        METRICS.trials[&result.outcome.label()].inc();
        match &result.outcome {
            TrialOutcome::Passed => tracing::info!(trial = plan.trial_id, "trial passed"),
            TrialOutcome::Violated { verdict } => {
                tracing::error!(trial = plan.trial_id, "guarantee violated: {verdict}")
            }
            TrialOutcome::Incomplete { phase, reason } => {
                tracing::warn!(trial = plan.trial_id, ?phase, "trial incomplete: {reason}")
            }
            TrialOutcome::Abandoned => tracing::warn!(trial = plan.trial_id, "trial abandoned"),
        }
        result
    }

    async fn execute(
        &self,
        ctx: &ctx::Ctx,
        plan: &TrialPlan,
        result: &mut TrialResult,
    ) -> ctx::OrCanceled<TrialOutcome> {
        let partition = result.partition;
        let client = ClientId(0);

        let leader = match self
            .tracker
            .wait_for_ready(ctx, partition, self.timings.ready_timeout)
            .await
        {
            Ok(leader) => leader,
            Err(RecoveryError::Canceled(err)) => return Err(err),
            Err(err) => return Ok(TrialOutcome::incomplete(Phase::AwaitLeader, err)),
        };

        let value = format!("value-{}-{}", plan.trial_id, ctx.now_utc().unix_timestamp());
        let write = self.driver.write(ctx, client, 1, &plan.key, &value).await;
        if !ctx.is_active() {
            return Err(ctx::Canceled);
        }
        result.write = Some(write.clone());
        if !write.success {
            return Ok(TrialOutcome::incomplete(Phase::Write, write.error_detail()));
        }

        ctx.sleep(plan.delay).await?;

        result.leader_before = Some((*leader).clone());
        if let Err(err) = self.injector.confirm_current(&self.tracker, &leader) {
            return Ok(TrialOutcome::incomplete(Phase::Confirm, err));
        }
        let terminated = match self.injector.terminate_leader(ctx, &leader).await {
            Ok(process) => {
                result.terminated = Some(process);
                result.terminated_at = Some(ctx.now_utc());
                ctx.now()
            }
            Err(InjectError::Canceled(err)) => return Err(err),
            Err(err) => return Ok(TrialOutcome::incomplete(Phase::Terminate, err)),
        };

        if plan.read_mode == ReadMode::Immediate {
            let read = self
                .driver
                .read_with_timeout(
                    ctx,
                    client,
                    2,
                    &plan.key,
                    self.timings.immediate_read_timeout,
                )
                .await;
            if !ctx.is_active() {
                return Err(ctx::Canceled);
            }
            let outcome = verify::classify_immediate_read(&write, &read);
            tracing::info!(trial = plan.trial_id, ?outcome, "immediate read");
            result.immediate_read = Some(read);
            result.immediate_outcome = Some(outcome);
        }

        match self
            .detector
            .await_recovery_since(ctx, partition, leader.term, terminated)
            .await
        {
            Ok(recovery) => {
                result.leader_after = Some((*recovery.leader).clone());
                result.recovery_duration = Some(recovery.elapsed);
            }
            Err(RecoveryError::Canceled(err)) => return Err(err),
            Err(err) => return Ok(TrialOutcome::incomplete(Phase::Recovery, err)),
        }

        ctx.sleep(self.timings.settle).await?;

        let mut attempts = self
            .driver
            .read_with_retry(
                ctx,
                (client, 3),
                &plan.key,
                self.timings.verification_timeout,
                self.timings.retry_backoff,
            )
            .await;
        if !ctx.is_active() {
            return Err(ctx::Canceled);
        }
        let Some(read) = attempts.pop() else {
            return Ok(TrialOutcome::incomplete(
                Phase::VerificationRead,
                "no read attempted",
            ));
        };
        let verdict = verify::check_failover_durability(&write, &read);
        result.verification_read = Some(read);
        result.verification_retries = attempts;
        Ok(if verdict.passed {
            TrialOutcome::Passed
        } else {
            TrialOutcome::Violated { verdict }
        })
    }

    /// Runs every delay of every row of `scenarios` in every read mode of
    /// `mode`, pushing results to `aggregator`. An interrupted trial is
    /// recorded as abandoned before the cancellation is returned.
    pub async fn run_campaign(
        &self,
        ctx: &ctx::Ctx,
        scenarios: &[ScenarioRow],
        mode: TestMode,
        aggregator: &Aggregator,
    ) -> ctx::OrCanceled<()> {
        let mut n = 0;
        for (i, row) in scenarios.iter().enumerate() {
            if i > 0 {
                ctx.sleep(self.timings.between_scenarios).await?;
            }
            tracing::info!(scenario = %row.scenario, delays = ?row.delays, "starting scenario");
            for (j, delay) in row.delays.iter().enumerate() {
                if j > 0 {
                    let pause = row.pause_between.unwrap_or(self.timings.between_trials);
                    ctx.sleep(pause).await?;
                }
                for (k, read_mode) in mode.read_modes().iter().enumerate() {
                    if k > 0 {
                        ctx.sleep(self.timings.between_read_modes).await?;
                    }
                    n += 1;
                    let plan = TrialPlan::new(n, row.scenario, *read_mode, *delay);
                    let result = self.run_trial(ctx, &plan).await;
                    let abandoned = result.outcome == TrialOutcome::Abandoned;
                    aggregator.push(result);
                    if abandoned {
                        return Err(ctx::Canceled);
                    }
                }
            }
        }
        Ok(())
    }
}
