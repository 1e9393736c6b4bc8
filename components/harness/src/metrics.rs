//! Harness metrics.
use crate::record::OpKind;
use std::time::Duration;
use vise::{
    Buckets, Counter, EncodeLabelSet, EncodeLabelValue, Family, Histogram, LabeledFamily, Metrics,
    Unit,
};

/// Outcome of a failover trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelValue)]
#[metrics(rename_all = "snake_case")]
pub(crate) enum OutcomeLabel {
    Passed,
    Violated,
    Incomplete,
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelValue)]
#[metrics(rename_all = "snake_case")]
pub(crate) enum KindLabel {
    Write,
    Read,
}

impl From<OpKind> for KindLabel {
    fn from(kind: OpKind) -> Self {
        match kind {
            OpKind::Write => Self::Write,
            OpKind::Read => Self::Read,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelValue)]
#[metrics(rename_all = "snake_case")]
pub(crate) enum ResultLabel {
    Ok,
    Err,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelSet)]
pub(crate) struct OperationLabels {
    pub(crate) kind: KindLabel,
    pub(crate) result: ResultLabel,
}

impl OperationLabels {
    pub(crate) fn new(kind: OpKind, success: bool) -> Self {
        Self {
            kind: kind.into(),
            result: if success {
                ResultLabel::Ok
            } else {
                ResultLabel::Err
            },
        }
    }
}

const RECOVERY_BUCKETS: Buckets = Buckets::exponential(0.125..=64.0, 2.0);

#[derive(Debug, Metrics)]
#[metrics(prefix = "failover")]
pub(crate) struct HarnessMetrics {
    /// Number of failover trials by outcome.
    #[metrics(labels = ["outcome"])]
    pub(crate) trials: LabeledFamily<OutcomeLabel, Counter>,
    /// Time from replica termination until a new stable leader was observed.
    #[metrics(unit = Unit::Seconds, buckets = RECOVERY_BUCKETS)]
    pub(crate) recovery_latency: Histogram<Duration>,
    /// Latency of store operations.
    #[metrics(unit = Unit::Seconds, buckets = Buckets::LATENCIES)]
    pub(crate) operation_latency: Family<OperationLabels, Histogram<Duration>>,
    /// Number of observed leadership changes.
    pub(crate) leader_changes: Counter,
    /// Number of failed leadership queries.
    pub(crate) leader_refresh_failures: Counter,
}

#[vise::register]
pub(crate) static METRICS: vise::Global<HarnessMetrics> = vise::Global::new();
