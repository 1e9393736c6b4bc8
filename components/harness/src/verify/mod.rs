//! Consistency checks over recorded operations.
//!
//! All checks are pure functions of the records. A failed or not-found
//! read is a failed check, never an inconclusive one.
use crate::{
    record::{ClientId, OpKind, OperationRecord},
    stats::Ratio,
    workload::ConcurrentBatch,
};
use serde::Serialize;
use std::{collections::BTreeSet, fmt};


/// Guarantee of the store being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Guarantee {
    /// The final value of a key written concurrently is the last write of some client.
    Linearizability,
    /// A client reads its own acknowledged write.
    ReadYourWrites,
    /// The final value of a key is one of the acknowledged writes.
    NoLostUpdates,
    /// A write acknowledged before a leader failure is readable after recovery.
    FailoverDurability,
}

impl fmt::Display for Guarantee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Linearizability => "linearizability",
            Self::ReadYourWrites => "read-your-writes",
            Self::NoLostUpdates => "no-lost-updates",
            Self::FailoverDurability => "failover-durability",
        })
    }
}

/// Diagnostics of a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VerdictDetail {
    /// The observed value is an admissible one.
    Matched {
        /// Observed value.
        observed: String,
    },
    /// The observed value is not the last write of any client.
    LastWriteMismatch {
        /// Observed value.
        observed: String,
        /// Last value written by every client.
        expected: Vec<String>,
        /// Client which wrote the observed value as one of its intermediate values.
        superseded_by: Option<ClientId>,
    },
    /// The observed value was never acknowledged.
    NotAcknowledged {
        /// Observed value.
        observed: String,
        /// Number of acknowledged writes.
        acknowledged: usize,
    },
    /// The observed value differs from the written one.
    ValueMismatch {
        /// Observed value.
        observed: String,
        /// Written value.
        expected: String,
    },
    /// The read failed or didn't find the key.
    ReadFailed {
        /// Read error.
        error: String,
    },
    /// The write being checked was not acknowledged.
    WriteFailed {
        /// Write error.
        error: String,
    },
}

impl fmt::Display for VerdictDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Matched { observed } => write!(f, "observed {observed:?}"),
            Self::LastWriteMismatch {
                observed,
                expected,
                superseded_by,
            } => {
                write!(f, "observed {observed:?}, expected one of {expected:?}")?;
                if let Some(client) = superseded_by {
                    write!(f, "; {observed:?} is a superseded write of {client}")?;
                }
                Ok(())
            }
            Self::NotAcknowledged {
                observed,
                acknowledged,
            } => write!(
                f,
                "observed {observed:?}, which is none of the {acknowledged} acknowledged writes"
            ),
            Self::ValueMismatch { observed, expected } => {
                write!(f, "observed {observed:?}, expected {expected:?}")
            }
            Self::ReadFailed { error } => write!(f, "read failed: {error}"),
            Self::WriteFailed { error } => write!(f, "write failed: {error}"),
        }
    }
}

/// Outcome of a consistency check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyVerdict {
    /// Guarantee checked.
    pub guarantee: Guarantee,
    /// Whether the guarantee held.
    pub passed: bool,
    /// Diagnostics.
    pub detail: VerdictDetail,
}

impl ConsistencyVerdict {
    fn new(guarantee: Guarantee, passed: bool, detail: VerdictDetail) -> Self {
        Self {
            guarantee,
            passed,
            detail,
        }
    }

    fn read_failed(guarantee: Guarantee, read: &OperationRecord) -> Self {
        Self::new(
            guarantee,
            false,
            VerdictDetail::ReadFailed {
                error: read.error_detail().to_owned(),
            },
        )
    }

    fn write_failed(guarantee: Guarantee, write: &OperationRecord) -> Self {
        Self::new(
            guarantee,
            false,
            VerdictDetail::WriteFailed {
                error: write.error_detail().to_owned(),
            },
        )
    }
}

impl fmt::Display for ConsistencyVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.passed { "PASS" } else { "FAIL" };
        write!(f, "{}: {status}: {}", self.guarantee, self.detail)
    }
}

/// Checks that the final value of a key written concurrently by several
/// clients is the last value some client attempted to write.
///
/// Every client's last write attempt counts, acknowledged or not: a write
/// which timed out may still have been applied.
pub fn check_linearizability(
    batch: &ConcurrentBatch,
    final_read: &OperationRecord,
) -> ConsistencyVerdict {
    const G: Guarantee = Guarantee::Linearizability;
    let Some(observed) = final_read.observed() else {
        return ConsistencyVerdict::read_failed(G, final_read);
    };
    let clients: BTreeSet<_> = batch.writes().map(|w| w.client).collect();
    let expected: Vec<String> = clients
        .into_iter()
        .filter_map(|c| batch.last_attempt(c)?.value.clone())
        .collect();
    if expected.iter().any(|v| v == observed) {
        return ConsistencyVerdict::new(
            G,
            true,
            VerdictDetail::Matched {
                observed: observed.to_owned(),
            },
        );
    }
    let superseded_by = batch
        .writes()
        .find(|w| w.value.as_deref() == Some(observed))
        .map(|w| w.client);
    ConsistencyVerdict::new(
        G,
        false,
        VerdictDetail::LastWriteMismatch {
            observed: observed.to_owned(),
            expected,
            superseded_by,
        },
    )
}

/// Checks that `read`, issued by the same client right after `write`,
/// returned the written value.
pub fn check_read_your_writes(
    write: &OperationRecord,
    read: &OperationRecord,
) -> ConsistencyVerdict {
    check_exact(Guarantee::ReadYourWrites, write, read)
}

/// Fraction of write/read pairs satisfying read-your-writes.
pub fn read_your_writes_rate<'a>(
    pairs: impl IntoIterator<Item = (&'a OperationRecord, &'a OperationRecord)>,
) -> Ratio {
    let mut ratio = Ratio::default();
    for (w, r) in pairs {
        ratio.den += 1;
        if check_read_your_writes(w, r).passed {
            ratio.num += 1;
        }
    }
    ratio
}

/// Outcome of the no-lost-updates check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DurabilityReport {
    /// The verdict.
    pub verdict: ConsistencyVerdict,
    /// Acknowledged writes out of attempted ones.
    pub acknowledged: Ratio,
}

/// Checks that the final value of a key is one of the acknowledged writes to it.
pub fn check_no_lost_updates<'a>(
    writes: impl IntoIterator<Item = &'a OperationRecord>,
    final_read: &OperationRecord,
) -> DurabilityReport {
    const G: Guarantee = Guarantee::NoLostUpdates;
    let writes: Vec<_> = writes
        .into_iter()
        .filter(|w| w.kind == OpKind::Write)
        .collect();
    let acked: BTreeSet<&str> = writes
        .iter()
        .filter(|w| w.success)
        .filter_map(|w| w.value.as_deref())
        .collect();
    let acknowledged = Ratio::new(
        writes.iter().filter(|w| w.success).count(),
        writes.len(),
    );
    let verdict = match final_read.observed() {
        None => ConsistencyVerdict::read_failed(G, final_read),
        Some(v) if acked.contains(v) => ConsistencyVerdict::new(
            G,
            true,
            VerdictDetail::Matched {
                observed: v.to_owned(),
            },
        ),
        Some(v) => ConsistencyVerdict::new(
            G,
            false,
            VerdictDetail::NotAcknowledged {
                observed: v.to_owned(),
                acknowledged: acknowledged.num,
            },
        ),
    };
    DurabilityReport {
        verdict,
        acknowledged,
    }
}

/// Checks that a write acknowledged before a leader failure is returned
/// by a read after recovery.
pub fn check_failover_durability(
    write: &OperationRecord,
    verification_read: &OperationRecord,
) -> ConsistencyVerdict {
    check_exact(Guarantee::FailoverDurability, write, verification_read)
}

fn check_exact(
    guarantee: Guarantee,
    write: &OperationRecord,
    read: &OperationRecord,
) -> ConsistencyVerdict {
    let Some(expected) = write.observed() else {
        return ConsistencyVerdict::write_failed(guarantee, write);
    };
    let Some(observed) = read.observed() else {
        return ConsistencyVerdict::read_failed(guarantee, read);
    };
    let detail = if observed == expected {
        VerdictDetail::Matched {
            observed: observed.to_owned(),
        }
    } else {
        VerdictDetail::ValueMismatch {
            observed: observed.to_owned(),
            expected: expected.to_owned(),
        }
    };
    ConsistencyVerdict::new(guarantee, observed == expected, detail)
}

/// Outcome of a read issued right after the leader was terminated,
/// before recovery was confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImmediateReadOutcome {
    /// Returned the written value.
    Available,
    /// Failed, timed out or didn't find the key.
    Unavailable {
        /// Read error.
        error: String,
    },
    /// Returned a different value.
    Mismatch {
        /// Observed value.
        observed: String,
    },
}

/// Classifies an immediate read of the value written by `write`.
pub fn classify_immediate_read(
    write: &OperationRecord,
    read: &OperationRecord,
) -> ImmediateReadOutcome {
    match read.observed() {
        None => ImmediateReadOutcome::Unavailable {
            error: read.error_detail().to_owned(),
        },
        Some(v) if Some(v) == write.value.as_deref() => ImmediateReadOutcome::Available,
        Some(v) => ImmediateReadOutcome::Mismatch {
            observed: v.to_owned(),
        },
    }
}
