//! Interface of the replicated key-value map under test.
use async_trait::async_trait;
use failover_concurrency::ctx;
use std::{fmt, sync::Arc};

/// Store errors. All of them are transient from the harness' point of view:
/// they are recorded on the operation and never abort a trial.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Operation was canceled by the caller's context.
    #[error("operation was canceled")]
    Canceled(#[from] ctx::Canceled),
    /// Operation did not complete within its timeout.
    #[error("operation timed out")]
    Timeout,
    /// Network or store-side failure.
    #[error("store request failed: {0:#}")]
    Transient(anyhow::Error),
}

/// Replicated map with put/get/list semantics.
///
/// Implementations must be usable concurrently by independent callers:
/// the harness shares one handle between all workload clients and only
/// calls `&self` methods on it.
#[async_trait]
pub trait Store: fmt::Debug + Send + Sync {
    /// Sets `key` to `value`, returning the previous value.
    async fn put(
        &self,
        ctx: &ctx::Ctx,
        key: &str,
        value: &str,
    ) -> Result<Option<String>, StoreError>;

    /// Gets the value of `key`, `None` if the key is not present.
    async fn get(&self, ctx: &ctx::Ctx, key: &str) -> Result<Option<String>, StoreError>;

    /// Lists all entries of the map.
    async fn list(&self, ctx: &ctx::Ctx) -> Result<Vec<(String, String)>, StoreError>;
}

#[async_trait]
impl<S: Store + ?Sized> Store for Arc<S> {
    async fn put(
        &self,
        ctx: &ctx::Ctx,
        key: &str,
        value: &str,
    ) -> Result<Option<String>, StoreError> {
        (**self).put(ctx, key, value).await
    }

    async fn get(&self, ctx: &ctx::Ctx, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(ctx, key).await
    }

    async fn list(&self, ctx: &ctx::Ctx) -> Result<Vec<(String, String)>, StoreError> {
        (**self).list(ctx).await
    }
}
