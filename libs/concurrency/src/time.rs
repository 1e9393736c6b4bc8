//! Time types used throughout the harness.
//!
//! Monotonic time comes from tokio, so that tests running with a paused
//! runtime (`#[tokio::test(start_paused = true)]`) control it entirely.
//! Wall-clock timestamps are UTC and only used for reporting.

/// Duration of an interval.
pub type Duration = std::time::Duration;

/// Monotonic clock time.
pub type Instant = tokio::time::Instant;

/// UTC wall-clock timestamp.
pub type Utc = time::OffsetDateTime;

/// Represents an optional deadline.
/// Isomorphic to `Option<Instant>`, however the total ordering on `Deadline`
/// is explicit: by the definition of derive(PartialOrd), `Finite(...) < Infinite`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Deadline {
    /// Finite deadline.
    Finite(Instant),
    /// Infinite deadline.
    Infinite,
}

impl From<Instant> for Deadline {
    fn from(t: Instant) -> Self {
        Self::Finite(t)
    }
}

impl Deadline {
    /// Time left until the deadline, `None` if infinite.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        match self {
            Self::Finite(t) => Some(t.saturating_duration_since(now)),
            Self::Infinite => None,
        }
    }
}

/// Current UTC time.
pub fn now_utc() -> Utc {
    time::OffsetDateTime::now_utc()
}
