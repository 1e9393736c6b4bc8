//! Issues reads and writes against the store and records their outcomes.
//!
//! The driver never fails: store errors and timeouts become unsuccessful
//! [`OperationRecord`]s, which verifiers and the aggregator interpret.
use crate::{
    metrics::{OperationLabels, METRICS},
    record::{ClientId, OpKind, OperationRecord, NOT_FOUND},
    store::{Store, StoreError},
};
use failover_concurrency::{ctx, time};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

mod monitor;

pub use monitor::{monitor, LeaderChangeRecord, MonitorRead, MonitorRun, MonitorSpec, ReadOutcome};

/// Key of the connectivity probe.
pub const CONNECTIVITY_KEY: &str = "connectivity-test";

/// Produces the value client `c` writes in its `seq`-th operation.
pub type ValueFn = Arc<dyn Fn(ClientId, u64) -> String + Send + Sync>;

/// Concurrent workload: `clients` clients, each issuing `ops_per_client`
/// sequential writes to `key`, or to a key of its own.
#[derive(Clone)]
pub struct ConcurrentSpec {
    /// Number of clients, numbered from 1.
    pub clients: usize,
    /// Number of writes per client.
    pub ops_per_client: usize,
    /// Shared key, or the prefix of the per-client keys.
    pub key: String,
    /// Whether every client writes its own key, see [`ConcurrentSpec::key_of`].
    pub per_client_key: bool,
    /// Pause after every operation of a client.
    pub pacing: time::Duration,
    /// Whether every write is followed by a read of the key.
    pub read_after_write: bool,
    /// Values to write.
    pub value_fn: ValueFn,
}

impl fmt::Debug for ConcurrentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentSpec")
            .field("clients", &self.clients)
            .field("ops_per_client", &self.ops_per_client)
            .field("key", &self.key)
            .field("per_client_key", &self.per_client_key)
            .field("pacing", &self.pacing)
            .field("read_after_write", &self.read_after_write)
            .finish_non_exhaustive()
    }
}

impl ConcurrentSpec {
    /// Workload checking linearizability: client `i` writes `client-<i>-seq-<j>`.
    pub fn linearizability(
        key: &str,
        clients: usize,
        ops_per_client: usize,
        pacing: time::Duration,
    ) -> Self {
        Self {
            clients,
            ops_per_client,
            key: key.to_owned(),
            per_client_key: false,
            pacing,
            read_after_write: true,
            value_fn: Arc::new(|c, seq| format!("client-{}-seq-{seq}", c.0)),
        }
    }

    /// Workload checking read-your-writes: client `i` writes
    /// `client-<i>-seq-<j>` to its own key and reads it back. Other clients
    /// never touch the key, so any stale read is the store's fault.
    pub fn read_your_writes(
        key_prefix: &str,
        clients: usize,
        ops_per_client: usize,
        pacing: time::Duration,
    ) -> Self {
        Self {
            per_client_key: true,
            ..Self::linearizability(key_prefix, clients, ops_per_client, pacing)
        }
    }

    /// Workload checking durability of acknowledged writes: client `i` writes
    /// `durability-client-<i>-write-<j>-<nonce>`. The nonce keeps values of
    /// different runs distinct.
    pub fn durability(
        key: &str,
        clients: usize,
        ops_per_client: usize,
        pacing: time::Duration,
        nonce: u64,
    ) -> Self {
        Self {
            clients,
            ops_per_client,
            key: key.to_owned(),
            per_client_key: false,
            pacing,
            read_after_write: false,
            value_fn: Arc::new(move |c, seq| {
                format!("durability-client-{}-write-{seq}-{nonce}", c.0)
            }),
        }
    }

    /// Key written by `client`.
    pub fn key_of(&self, client: ClientId) -> String {
        if self.per_client_key {
            format!("{}-client-{}", self.key, client.0)
        } else {
            self.key.clone()
        }
    }
}

/// Records of a concurrent workload.
#[derive(Debug, Clone, Default)]
pub struct ConcurrentBatch {
    /// All records, in completion order.
    pub records: Vec<OperationRecord>,
    /// Number of clients.
    pub clients: usize,
}

impl ConcurrentBatch {
    /// All write attempts.
    pub fn writes(&self) -> impl Iterator<Item = &OperationRecord> {
        self.records.iter().filter(|r| r.kind == OpKind::Write)
    }

    /// Acknowledged writes.
    pub fn acknowledged(&self) -> impl Iterator<Item = &OperationRecord> {
        self.records.iter().filter(|r| r.is_acknowledged_write())
    }

    /// Write attempt with the highest sequence number of `client`.
    pub fn last_attempt(&self, client: ClientId) -> Option<&OperationRecord> {
        self.writes()
            .filter(|r| r.client == client)
            .max_by_key(|r| r.seq)
    }

    /// Pairs of a write and the read that followed it in the same client.
    pub fn write_read_pairs(&self) -> Vec<(&OperationRecord, &OperationRecord)> {
        self.writes()
            .filter_map(|w| {
                let r = self.records.iter().find(|r| {
                    r.kind == OpKind::Read && r.client == w.client && r.seq == w.seq
                })?;
                Some((w, r))
            })
            .collect()
    }
}

/// Global write sequence shared by clients writing monotonically numbered keys.
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU64);

impl SequenceCounter {
    /// Constructs a counter. The first number handed out is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence number.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Key of sequence number `seq`.
    pub fn key(seq: u64) -> String {
        format!("seq-{seq:06}")
    }

    /// Sequence number of a key produced by [`SequenceCounter::key`].
    pub fn parse_seq(key: &str) -> Option<u64> {
        key.strip_prefix("seq-")?.parse().ok()
    }
}

/// Issues store operations with a per-operation timeout.
#[derive(Debug, Clone)]
pub struct WorkloadDriver {
    store: Arc<dyn Store>,
    op_timeout: time::Duration,
}

impl WorkloadDriver {
    /// Constructs a driver.
    pub fn new(store: Arc<dyn Store>, op_timeout: time::Duration) -> Self {
        Self { store, op_timeout }
    }

    /// Store the driver issues operations against.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Writes `value` if given, reads otherwise.
    async fn execute(
        &self,
        ctx: &ctx::Ctx,
        (client, seq): (ClientId, u64),
        key: &str,
        value: Option<&str>,
        timeout: time::Duration,
    ) -> OperationRecord {
        let issued_at = ctx.now_utc();
        let start = ctx.now();
        let op_ctx = &ctx.with_timeout(timeout);
        let (kind, res) = match value {
            Some(value) => (
                OpKind::Write,
                op_ctx
                    .wait(self.store.put(op_ctx, key, value))
                    .await
                    .map(|res| res.map(|_| Some(value.to_owned()))),
            ),
            None => (OpKind::Read, op_ctx.wait(self.store.get(op_ctx, key)).await),
        };
        let res = match res {
            Ok(res) => res,
            Err(err) => Err(err.into()),
        };
        let res = match res {
            Err(StoreError::Canceled(_)) if ctx.is_active() => Err(StoreError::Timeout),
            res => res,
        };
        let latency = ctx.now() - start;
        let (success, observed, error) = match res {
            Ok(Some(v)) => (true, Some(v), None),
            Ok(None) => (false, None, Some(NOT_FOUND.to_owned())),
            Err(err) => (false, None, Some(err.to_string())),
        };
        METRICS.operation_latency[&OperationLabels::new(kind, success)].observe(latency);
        tracing::debug!(
            %client,
            seq,
            key,
            ?kind,
            success,
            ?latency,
            error = error.as_deref(),
            "store operation"
        );
        OperationRecord {
            kind,
            client,
            seq,
            key: key.to_owned(),
            // Failed writes still record the attempted value.
            value: match kind {
                OpKind::Write => value.map(str::to_owned),
                OpKind::Read => observed,
            },
            issued_at,
            completed_at: ctx.now_utc(),
            latency,
            success,
            error,
        }
    }

    /// Writes `value` to `key`.
    pub async fn write(
        &self,
        ctx: &ctx::Ctx,
        client: ClientId,
        seq: u64,
        key: &str,
        value: &str,
    ) -> OperationRecord {
        self.execute(ctx, (client, seq), key, Some(value), self.op_timeout)
            .await
    }

    /// Reads `key`.
    pub async fn read(
        &self,
        ctx: &ctx::Ctx,
        client: ClientId,
        seq: u64,
        key: &str,
    ) -> OperationRecord {
        self.read_with_timeout(ctx, client, seq, key, self.op_timeout)
            .await
    }

    /// Reads `key` with a custom timeout.
    pub async fn read_with_timeout(
        &self,
        ctx: &ctx::Ctx,
        client: ClientId,
        seq: u64,
        key: &str,
        timeout: time::Duration,
    ) -> OperationRecord {
        self.execute(ctx, (client, seq), key, None, timeout).await
    }

    /// Reads `key` until a read succeeds, finds the key missing, or `budget`
    /// runs out. Timeouts and transient store errors are retried after
    /// `backoff`, each attempt bounded by the remaining budget. Returns every
    /// attempt in order; all share `seq`. Never empty.
    pub async fn read_with_retry(
        &self,
        ctx: &ctx::Ctx,
        (client, seq): (ClientId, u64),
        key: &str,
        budget: time::Duration,
        backoff: time::Duration,
    ) -> Vec<OperationRecord> {
        let deadline = ctx.now() + budget;
        let mut attempts = vec![];
        loop {
            let remaining = deadline.saturating_duration_since(ctx.now());
            let read = self
                .read_with_timeout(ctx, client, seq, key, remaining.min(self.op_timeout))
                .await;
            let retry = read.is_retryable() && ctx.is_active();
            attempts.push(read);
            if !retry || ctx.now() + backoff >= deadline {
                return attempts;
            }
            tracing::debug!(%client, seq, key, attempt = attempts.len(), "retrying read");
            if ctx.sleep(backoff).await.is_err() {
                return attempts;
            }
        }
    }

    /// Single client: one write of `value` to `key`, then `reads` reads of it.
    pub async fn sequential(
        &self,
        ctx: &ctx::Ctx,
        key: &str,
        value: &str,
        reads: usize,
    ) -> Vec<OperationRecord> {
        let client = ClientId(0);
        let mut records = vec![self.write(ctx, client, 1, key, value).await];
        for i in 0..reads {
            records.push(self.read(ctx, client, 2 + i as u64, key).await);
        }
        records
    }

    /// Checks that the store accepts a write and returns it on a read.
    pub async fn probe(&self, ctx: &ctx::Ctx) -> anyhow::Result<()> {
        let value = format!("probe-{}", ctx.now_utc().unix_timestamp());
        let records = self.sequential(ctx, CONNECTIVITY_KEY, &value, 1).await;
        for r in &records {
            anyhow::ensure!(
                r.success,
                "{:?} of {CONNECTIVITY_KEY:?} failed: {}",
                r.kind,
                r.error_detail()
            );
        }
        anyhow::ensure!(
            records[1].value.as_deref() == Some(value.as_str()),
            "read of {CONNECTIVITY_KEY:?} returned {:?}, want {value:?}",
            records[1].value
        );
        Ok(())
    }

    /// Runs `spec.clients` clients concurrently. Every client issues its
    /// operations sequentially; the call returns once all clients are done.
    pub async fn concurrent(&self, ctx: &ctx::Ctx, spec: ConcurrentSpec) -> ConcurrentBatch {
        let records = Arc::new(Mutex::new(vec![]));
        let mut clients = tokio::task::JoinSet::new();
        for i in 1..=spec.clients {
            let (ctx, this, spec, records) =
                (ctx.clone(), self.clone(), spec.clone(), records.clone());
            clients.spawn(async move {
                let client = ClientId(i);
                let key = spec.key_of(client);
                for seq in 1..=spec.ops_per_client as u64 {
                    let value = (spec.value_fn)(client, seq);
                    let w = this.write(&ctx, client, seq, &key, &value).await;
                    records.lock().unwrap().push(w);
                    if spec.read_after_write {
                        let r = this.read(&ctx, client, seq, &key).await;
                        records.lock().unwrap().push(r);
                    }
                    if ctx.sleep(spec.pacing).await.is_err() {
                        return;
                    }
                }
            });
        }
        while let Some(res) = clients.join_next().await {
            if let Err(err) = res {
                if err.is_panic() {
                    std::panic::resume_unwind(err.into_panic());
                }
            }
        }
        let records = std::mem::take(&mut *records.lock().unwrap());
        ConcurrentBatch {
            records,
            clients: spec.clients,
        }
    }
}
