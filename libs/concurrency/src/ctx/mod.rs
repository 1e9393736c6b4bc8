//! Implementation of the golang Context (https://pkg.go.dev/context).
//!
//! As soon as its context is canceled a function should return ASAP,
//! without doing any further blocking calls. It is NOT possible to extend
//! the context provided by the caller, who defines how long it allows the
//! call to execute.
//!
//! Context is essentially a cancellation token passed down the call stack and
//! awaited together with every blocking call: instead of "awaiting a store
//! response", you "await a store response OR the context getting canceled".
//! This way a harness-wide shutdown (SIGINT) or a per-operation timeout is
//! implemented uniformly.
use crate::{signal, time};
use std::{fmt, future::Future, sync::Arc};


/// Contexts are composed into a tree via `_parent` link.
/// We maintain an invariant `_parent.deadline <= deadline`.
/// If a parent gets canceled, the child also gets canceled immediately afterwards,
/// although not atomically. If the deadline passes the context gets canceled too.
///
/// Cascade cancellation is implemented by spawning a tokio task awaiting the
/// parent cancellation, the deadline, or the child cancellation, whichever
/// comes first.
#[derive(Clone)]
pub struct Ctx(Arc<Inner>);

struct Inner {
    /// Signal sent once this context is canceled.
    canceled: Arc<signal::Once>,
    /// Deadline after which the context will be automatically canceled.
    deadline: time::Deadline,
    /// Parent context.
    _parent: Option<Arc<Inner>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Wakes the task propagating the parent cancellation, so that it doesn't leak.
        self.canceled.send();
    }
}

/// Error returned when the blocking operation was interrupted
/// due to context getting canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("canceled")]
pub struct Canceled;

/// Wraps result with `Canceled` as an error.
pub type OrCanceled<T> = Result<T, Canceled>;

/// Constructs a top-level context.
/// Should be called only at the start of the `main()` function of the binary
/// or at the start of a test.
pub fn root() -> Ctx {
    Ctx(Arc::new(Inner {
        canceled: Arc::new(signal::Once::new()),
        deadline: time::Deadline::Infinite,
        _parent: None,
    }))
}

impl fmt::Debug for Ctx {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Ctx")
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl Ctx {
    /// Constructs a new child context.
    fn child(&self, deadline: time::Deadline) -> Self {
        let deadline = std::cmp::min(self.0.deadline, deadline);
        let parent_canceled = self.0.canceled.clone();
        let child_canceled = Arc::new(signal::Once::new());
        let child = Self(Arc::new(Inner {
            canceled: child_canceled.clone(),
            deadline,
            _parent: Some(self.0.clone()),
        }));
        if !self.is_active() {
            child_canceled.send();
        }
        // The task takes references only to the `canceled` signals, rather
        // than the whole context, to avoid a reference loop: the context is
        // canceled when dropped, which guarantees that this task completes.
        tokio::spawn(async move {
            let expired = async {
                match deadline {
                    time::Deadline::Finite(t) => tokio::time::sleep_until(t).await,
                    time::Deadline::Infinite => std::future::pending().await,
                }
            };
            tokio::select! {
                () = expired => child_canceled.send(),
                () = parent_canceled.cancel_safe_recv() => child_canceled.send(),
                () = child_canceled.cancel_safe_recv() => {},
            }
        });
        child
    }

    /// Cascade cancels this context and all the descendants.
    pub fn cancel(&self) {
        self.0.canceled.send();
    }

    /// Awaits until this context gets canceled.
    pub async fn canceled(&self) {
        self.0.canceled.cancel_safe_recv().await
    }

    /// Checks if this context is still active (i.e., not canceled).
    pub fn is_active(&self) -> bool {
        !self.0.canceled.try_recv()
    }

    /// The time at which this context will be canceled.
    /// Just a hint, because the context may get canceled before the deadline.
    pub fn deadline(&self) -> time::Deadline {
        self.0.deadline
    }

    /// Awaits until the provided future `fut` completes, or the context gets canceled.
    /// `fut` is required to be cancel-safe.
    pub async fn wait<F: Future>(&self, fut: F) -> OrCanceled<F::Output> {
        if !self.is_active() {
            return Err(Canceled);
        }
        tokio::select! {
            output = fut => Ok(output),
            () = self.0.canceled.cancel_safe_recv() => Err(Canceled),
        }
    }

    /// Constructs a sub-context with deadline `d`.
    pub fn with_deadline(&self, d: time::Deadline) -> Self {
        self.child(d)
    }

    /// Constructs a sub-context with deadline `now() + d`.
    pub fn with_timeout(&self, d: time::Duration) -> Self {
        self.child((self.now() + d).into())
    }

    /// Constructs a sub-context which can be canceled independently of `self`.
    pub fn child_cancelable(&self) -> Self {
        self.child(time::Deadline::Infinite)
    }

    /// Current time according to the monotone clock.
    pub fn now(&self) -> time::Instant {
        time::Instant::now()
    }

    /// Current time according to the wall clock.
    pub fn now_utc(&self) -> time::Utc {
        time::now_utc()
    }

    /// Waits for the duration `d`.
    pub async fn sleep(&self, d: time::Duration) -> OrCanceled<()> {
        self.wait(tokio::time::sleep(d)).await
    }

    /// Waits until `t`.
    pub async fn sleep_until(&self, t: time::Instant) -> OrCanceled<()> {
        self.wait(tokio::time::sleep_until(t)).await
    }
}
