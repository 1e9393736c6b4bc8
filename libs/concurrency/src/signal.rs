//! Simple signal reporting primitive. A building block for `Ctx`.

/// Communication channel over which a signal can be sent only once.
pub(crate) struct Once(tokio::sync::Semaphore);

impl std::fmt::Debug for Once {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Once").field(&self.try_recv()).finish()
    }
}

impl Once {
    /// Constructs a new `Once` channel.
    pub(crate) fn new() -> Self {
        Self(tokio::sync::Semaphore::new(0))
    }

    /// Sends the signal, waking all tasks awaiting for recv().
    /// Any subsequent call is a noop.
    pub(crate) fn send(&self) {
        self.0.close();
    }

    /// Waits for the first call to send().
    /// Cancel-safe.
    pub(crate) async fn cancel_safe_recv(&self) {
        // The semaphore never gets any permits, so the only
        // possible outcome of `acquire` is the closed error.
        let res = self.0.acquire().await;
        debug_assert!(res.is_err());
    }

    /// Checks if send() was already called.
    pub(crate) fn try_recv(&self) -> bool {
        self.0.is_closed()
    }
}
