//! Kubernetes implementation of the harness platform.
//!
//! Leadership is read from the `RaftGroup` custom resources of the store,
//! one per partition. Leaders are terminated by deleting their pod with a
//! zero grace period.
use anyhow::Context as _;
use async_trait::async_trait;
use failover_concurrency::ctx;
use failover_harness::{
    platform::{LeaderState, PartitionStatus, Platform, PlatformError, ReplicaId},
    PartitionId,
};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{DeleteParams, ListParams},
    Api, Client, CustomResource, ResourceExt as _,
};
use serde::{Deserialize, Serialize};

/// Default namespace of the store.
pub const DEFAULT_NAMESPACE: &str = "default";
/// Label selecting the raft groups of a store.
pub const STORE_LABEL: &str = "atomix.io/store";

/// Spec of the RaftGroup CRD. The harness only reads the status.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[kube(
    group = "consensus.atomix.io",
    version = "v1beta1",
    kind = "RaftGroup",
    plural = "raftgroups",
    status = "RaftGroupStatus"
)]
#[kube(namespaced)]
#[kube(schema = "disabled")]
pub struct RaftGroupSpec {
    /// Fields of the spec, kept opaque.
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// Status of a raft group.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct RaftGroupStatus {
    /// Current leader.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<RaftGroupLeader>,
    /// Current term.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term: Option<u64>,
    /// Leader state, "Ready" once the leader serves requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Leader of a raft group.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct RaftGroupLeader {
    /// Replica name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Partition number encoded in a raft group name: its third dash-separated
/// field, e.g. 2 for `consensus-store-2`.
pub fn group_number(name: &str) -> anyhow::Result<u32> {
    let field = name
        .split('-')
        .nth(2)
        .with_context(|| format!("raft group name {name:?} has less than 3 fields"))?;
    field
        .parse()
        .with_context(|| format!("raft group name {name:?}: bad partition number {field:?}"))
}

/// Converts a raft group into the status of its partition. Raft groups are
/// numbered from `partition_base`; the group numbered `partition_base` holds
/// partition 0.
pub fn partition_status(group: &RaftGroup, partition_base: u32) -> anyhow::Result<PartitionStatus> {
    let name = group.name_any();
    let number = group_number(&name)?;
    let partition = PartitionId(
        number
            .checked_sub(partition_base)
            .with_context(|| format!("raft group {name:?} numbered below {partition_base}"))?,
    );
    let Some(status) = &group.status else {
        return Ok(PartitionStatus::Unavailable {
            partition,
            reason: format!("raft group {name} has no status"),
        });
    };
    let leader = status
        .leader
        .as_ref()
        .and_then(|l| l.name.as_deref())
        .map(ReplicaId::from);
    let state = match &leader {
        None => LeaderState::NoLeader,
        Some(_) => status.state.as_deref().unwrap_or_default().parse()?,
    };
    Ok(PartitionStatus::Known {
        partition,
        leader,
        term: status.term.unwrap_or_default(),
        state,
    })
}

/// Platform backed by a Kubernetes cluster.
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
    namespace: String,
    store: String,
    partition_base: u32,
}

impl std::fmt::Debug for KubePlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubePlatform")
            .field("namespace", &self.namespace)
            .field("store", &self.store)
            .field("partition_base", &self.partition_base)
            .finish_non_exhaustive()
    }
}

impl KubePlatform {
    /// Connects to the cluster configured in the environment.
    pub async fn connect(namespace: &str, store: &str, partition_base: u32) -> anyhow::Result<Self> {
        let client = Client::try_default()
            .await
            .context("Client::try_default()")?;
        Ok(Self {
            client,
            namespace: namespace.to_owned(),
            store: store.to_owned(),
            partition_base,
        })
    }
}

#[async_trait]
impl Platform for KubePlatform {
    async fn leaders(&self, ctx: &ctx::Ctx) -> Result<Vec<PartitionStatus>, PlatformError> {
        let groups: Api<RaftGroup> = Api::namespaced(self.client.clone(), &self.namespace);
        let lp = ListParams::default().labels(&format!("{STORE_LABEL}={}", self.store));
        let groups = ctx
            .wait(groups.list(&lp))
            .await?
            .context("failed to list RaftGroups")?;
        let mut statuses = vec![];
        for group in groups.iter() {
            match partition_status(group, self.partition_base) {
                Ok(status) => statuses.push(status),
                Err(err) => tracing::warn!("skipping raft group: {err:#}"),
            }
        }
        Ok(statuses)
    }

    async fn terminate(&self, ctx: &ctx::Ctx, replica: &ReplicaId) -> Result<(), PlatformError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let dp = DeleteParams {
            grace_period_seconds: Some(0),
            ..DeleteParams::default()
        };
        ctx.wait(pods.delete(&replica.0, &dp))
            .await?
            .with_context(|| format!("failed to delete pod {replica}"))?;
        Ok(())
    }
}
