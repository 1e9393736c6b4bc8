//! In-memory implementations of the store and the platform, for tests.
use crate::{
    partition::PartitionId,
    platform::{LeaderState, PartitionStatus, Platform, PlatformError, ReplicaId},
    store::{Store, StoreError},
};
use async_trait::async_trait;
use failover_concurrency::{ctx, time};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Mutex,
};

/// Scripted behavior of a single store call.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Call fails with a transient error.
    Fail(String),
    /// Call never completes (until its context is canceled).
    Hang,
    /// Call completes normally after a delay.
    Delay(time::Duration),
}

#[derive(Debug, Default)]
struct StoreState {
    map: BTreeMap<String, String>,
    put_faults: VecDeque<Fault>,
    get_faults: VecDeque<Fault>,
    drop_writes: bool,
    puts: usize,
    gets: usize,
}

/// Single-copy map implementing [`Store`], with scriptable failures.
#[derive(Debug, Default)]
pub struct InMemoryStore(Mutex<StoreState>);

impl InMemoryStore {
    /// Constructs an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next not yet scripted `put` behave according to `fault`.
    pub fn push_put_fault(&self, fault: Fault) {
        self.0.lock().unwrap().put_faults.push_back(fault);
    }

    /// Makes the next not yet scripted `get` behave according to `fault`.
    pub fn push_get_fault(&self, fault: Fault) {
        self.0.lock().unwrap().get_faults.push_back(fault);
    }

    /// If set, `put` acknowledges writes without applying them.
    pub fn set_drop_writes(&self, drop_writes: bool) {
        self.0.lock().unwrap().drop_writes = drop_writes;
    }

    /// Overwrites a value directly, bypassing the fault script.
    pub fn set(&self, key: &str, value: &str) {
        self.0
            .lock()
            .unwrap()
            .map
            .insert(key.to_owned(), value.to_owned());
    }

    /// Current value of `key`.
    pub fn value(&self, key: &str) -> Option<String> {
        self.0.lock().unwrap().map.get(key).cloned()
    }

    /// Number of `put` and `get` calls so far.
    pub fn calls(&self) -> (usize, usize) {
        let s = self.0.lock().unwrap();
        (s.puts, s.gets)
    }

    async fn apply(ctx: &ctx::Ctx, fault: Option<Fault>) -> Result<(), StoreError> {
        match fault {
            None => Ok(()),
            Some(Fault::Fail(msg)) => Err(StoreError::Transient(anyhow::anyhow!(msg))),
            Some(Fault::Hang) => {
                ctx.canceled().await;
                Err(ctx::Canceled.into())
            }
            Some(Fault::Delay(d)) => Ok(ctx.sleep(d).await?),
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put(
        &self,
        ctx: &ctx::Ctx,
        key: &str,
        value: &str,
    ) -> Result<Option<String>, StoreError> {
        let fault = {
            let mut s = self.0.lock().unwrap();
            s.puts += 1;
            s.put_faults.pop_front()
        };
        Self::apply(ctx, fault).await?;
        let mut s = self.0.lock().unwrap();
        if s.drop_writes {
            return Ok(s.map.get(key).cloned());
        }
        Ok(s.map.insert(key.to_owned(), value.to_owned()))
    }

    async fn get(&self, ctx: &ctx::Ctx, key: &str) -> Result<Option<String>, StoreError> {
        let fault = {
            let mut s = self.0.lock().unwrap();
            s.gets += 1;
            s.get_faults.pop_front()
        };
        Self::apply(ctx, fault).await?;
        Ok(self.value(key))
    }

    async fn list(&self, ctx: &ctx::Ctx) -> Result<Vec<(String, String)>, StoreError> {
        if !ctx.is_active() {
            return Err(ctx::Canceled.into());
        }
        let s = self.0.lock().unwrap();
        Ok(s.map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

/// Status of a partition with a ready leader.
pub fn ready(partition: u32, replica: &str, term: u64) -> PartitionStatus {
    PartitionStatus::Known {
        partition: PartitionId(partition),
        leader: Some(replica.into()),
        term,
        state: LeaderState::Ready,
    }
}

/// Status of a partition in the middle of an election.
pub fn electing(partition: u32, replica: Option<&str>, term: u64) -> PartitionStatus {
    PartitionStatus::Known {
        partition: PartitionId(partition),
        leader: replica.map(ReplicaId::from),
        term,
        state: LeaderState::Electing,
    }
}

/// Scripted response of a leadership query.
pub type LeadersResponse = Result<Vec<PartitionStatus>, String>;

#[derive(Debug, Default)]
struct PlatformState {
    current: Vec<PartitionStatus>,
    script: VecDeque<LeadersResponse>,
    delays: VecDeque<time::Duration>,
    after_termination: Vec<LeadersResponse>,
    terminated: Vec<ReplicaId>,
    fail_terminations: bool,
    elect_on_termination: bool,
    queries: usize,
}

/// Platform with scripted leadership responses.
///
/// Every query consumes the next scripted response; a successful one
/// becomes the current state, returned by queries once the script runs out.
#[derive(Debug, Default)]
pub struct FakePlatform(Mutex<PlatformState>);

impl FakePlatform {
    /// Constructs a platform reporting `statuses`.
    pub fn new(statuses: Vec<PartitionStatus>) -> Self {
        Self(Mutex::new(PlatformState {
            current: statuses,
            ..PlatformState::default()
        }))
    }

    /// Appends responses to the script.
    pub fn push(&self, responses: impl IntoIterator<Item = LeadersResponse>) {
        self.0.lock().unwrap().script.extend(responses);
    }

    /// Latencies of the next queries. A query picks its response when it
    /// starts and returns it after the delay.
    pub fn push_delays(&self, delays: impl IntoIterator<Item = time::Duration>) {
        self.0.lock().unwrap().delays.extend(delays);
    }

    /// Responses appended to the script once a replica is terminated.
    pub fn after_termination(&self, responses: impl IntoIterator<Item = LeadersResponse>) {
        self.0
            .lock()
            .unwrap()
            .after_termination
            .extend(responses);
    }

    /// Makes `terminate` fail.
    pub fn set_fail_terminations(&self, fail: bool) {
        self.0.lock().unwrap().fail_terminations = fail;
    }

    /// Makes `terminate` immediately elect a new ready leader, in the next
    /// term, for every partition led by the terminated replica.
    pub fn set_elect_on_termination(&self, elect: bool) {
        self.0.lock().unwrap().elect_on_termination = elect;
    }

    /// Replicas terminated so far.
    pub fn terminated(&self) -> Vec<ReplicaId> {
        self.0.lock().unwrap().terminated.clone()
    }

    /// Number of leadership queries so far.
    pub fn queries(&self) -> usize {
        self.0.lock().unwrap().queries
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn leaders(&self, ctx: &ctx::Ctx) -> Result<Vec<PartitionStatus>, PlatformError> {
        if !ctx.is_active() {
            return Err(ctx::Canceled.into());
        }
        let (res, delay) = {
            let mut s = self.0.lock().unwrap();
            s.queries += 1;
            let res = match s.script.pop_front() {
                Some(Ok(statuses)) => {
                    s.current = statuses.clone();
                    Ok(statuses)
                }
                Some(Err(msg)) => Err(anyhow::anyhow!(msg).into()),
                None => Ok(s.current.clone()),
            };
            (res, s.delays.pop_front())
        };
        if let Some(delay) = delay {
            ctx.sleep(delay).await?;
        }
        res
    }

    async fn terminate(&self, ctx: &ctx::Ctx, replica: &ReplicaId) -> Result<(), PlatformError> {
        if !ctx.is_active() {
            return Err(ctx::Canceled.into());
        }
        let mut s = self.0.lock().unwrap();
        if s.fail_terminations {
            return Err(anyhow::anyhow!("pods \"{replica}\" is forbidden").into());
        }
        s.terminated.push(replica.clone());
        if s.elect_on_termination {
            for status in &mut s.current {
                if let PartitionStatus::Known {
                    leader: Some(leader),
                    term,
                    state,
                    ..
                } = status
                {
                    if leader == replica {
                        *leader = successor(leader);
                        *term += 1;
                        *state = LeaderState::Ready;
                    }
                }
            }
        }
        let next = std::mem::take(&mut s.after_termination);
        s.script.extend(next);
        Ok(())
    }
}

/// Next replica of a 3 replica group.
fn successor(replica: &ReplicaId) -> ReplicaId {
    match (replica.prefix(), replica.ordinal()) {
        (Some(prefix), Some(ordinal)) => ReplicaId(format!("{prefix}-{}", (ordinal + 1) % 3)),
        _ => replica.clone(),
    }
}
