//! Timestamped records of operations issued against the store.
use failover_concurrency::time;
use serde::{Serialize, Serializer};
use std::fmt;

/// Logical workload client. Numbered from 1 in concurrent workloads;
/// the single-client trial routine uses client 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ClientId(pub usize);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Kind of a store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// `put(key, value)`.
    Write,
    /// `get(key)`.
    Read,
}

/// One attempted store operation. Immutable once completed.
///
/// For writes `value` is the value written, for reads it is the value
/// observed (`None` if the read failed or the key was not found).
/// A read of a missing key is recorded with `success = false`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationRecord {
    /// Operation kind.
    pub kind: OpKind,
    /// Issuing client.
    pub client: ClientId,
    /// Per-client sequence number, starting from 1.
    pub seq: u64,
    /// Target key.
    pub key: String,
    /// Written or observed value.
    pub value: Option<String>,
    /// Wall-clock time at which the call was issued.
    #[serde(with = "::time::serde::rfc3339")]
    pub issued_at: time::Utc,
    /// Wall-clock time at which the call returned.
    #[serde(with = "::time::serde::rfc3339")]
    pub completed_at: time::Utc,
    /// Monotonic duration of the call.
    #[serde(serialize_with = "serialize_millis")]
    pub latency: time::Duration,
    /// Whether the call returned successfully (and, for reads, found the key).
    pub success: bool,
    /// Error detail of a failed call.
    pub error: Option<String>,
}

/// Error detail recorded for a read which did not find the key.
pub const NOT_FOUND: &str = "key not found";

impl OperationRecord {
    /// Value observed by a successful read, or written by a successful write.
    pub fn observed(&self) -> Option<&str> {
        if self.success {
            self.value.as_deref()
        } else {
            None
        }
    }

    /// Whether this is a successful (acknowledged) write.
    pub fn is_acknowledged_write(&self) -> bool {
        self.kind == OpKind::Write && self.success
    }

    /// Whether the call failed for a reason other than a missing key, so that
    /// repeating it may succeed.
    pub fn is_retryable(&self) -> bool {
        !self.success && self.error.as_deref().is_some_and(|e| e != NOT_FOUND)
    }

    /// Error detail, or an empty string for successful calls.
    pub fn error_detail(&self) -> &str {
        self.error.as_deref().unwrap_or_default()
    }
}

/// Serializes a duration as fractional milliseconds.
#[allow(clippy::float_arithmetic)]
pub(crate) fn serialize_millis<S: Serializer>(
    d: &time::Duration,
    s: S,
) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

/// Serializes an optional duration as fractional milliseconds.
pub(crate) fn serialize_opt_millis<S: Serializer>(
    d: &Option<time::Duration>,
    s: S,
) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => serialize_millis(d, s),
        None => s.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_serialize_as_rfc3339() {
        let at = time::Utc::from_unix_timestamp(1_709_294_400).unwrap();
        let record = OperationRecord {
            kind: OpKind::Read,
            client: ClientId(2),
            seq: 7,
            key: "k".to_owned(),
            value: None,
            issued_at: at,
            completed_at: at + time::Duration::from_millis(250),
            latency: time::Duration::from_millis(250),
            success: false,
            error: Some(NOT_FOUND.to_owned()),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!("2024-03-01T12:00:00Z", json["issued_at"]);
        assert_eq!("2024-03-01T12:00:00.25Z", json["completed_at"]);
        assert_eq!(250.0, json["latency"]);
        assert_eq!("read", json["kind"]);
        assert_eq!(2, json["client"]);
        assert_eq!(None, record.observed());
    }
}
