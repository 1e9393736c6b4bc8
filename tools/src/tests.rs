use crate::{
    k8s::{group_number, partition_status, RaftGroup, RaftGroupLeader, RaftGroupSpec, RaftGroupStatus},
    store::{store_error, RpcStore},
    AppConfig,
};
use assert_matches::assert_matches;
use failover_concurrency::{ctx, time};
use failover_harness::{
    platform::{LeaderState, PartitionStatus, ReplicaId},
    store::{Store as _, StoreError},
    trial::TestMode,
    PartitionId,
};
use pretty_assertions::assert_eq;
use std::{collections::BTreeMap, fs};

fn group(name: &str, status: Option<RaftGroupStatus>) -> RaftGroup {
    let mut group = RaftGroup::new(
        name,
        RaftGroupSpec {
            fields: serde_json::Map::new(),
        },
    );
    group.status = status;
    group
}

fn status(leader: Option<&str>, term: u64, state: &str) -> RaftGroupStatus {
    RaftGroupStatus {
        leader: leader.map(|name| RaftGroupLeader {
            name: Some(name.to_owned()),
        }),
        term: Some(term),
        state: Some(state.to_owned()),
    }
}

#[test]
fn raft_group_names() {
    assert_eq!(2, group_number("consensus-store-2").unwrap());
    assert_eq!(3, group_number("consensus-store-3-raft").unwrap());
    assert!(group_number("consensus-store").is_err());
    assert!(group_number("consensus-store-x").is_err());
}

#[test]
fn raft_group_status() {
    let g = group(
        "consensus-store-2",
        Some(status(Some("consensus-store-consensus-store-3"), 7, "Ready")),
    );
    assert_eq!(
        PartitionStatus::Known {
            partition: PartitionId(1),
            leader: Some(ReplicaId::from("consensus-store-consensus-store-3")),
            term: 7,
            state: LeaderState::Ready,
        },
        partition_status(&g, 1).unwrap()
    );

    let g = group("consensus-store-1", Some(status(Some("consensus-store-1"), 8, "Follower")));
    assert_matches!(
        partition_status(&g, 1).unwrap(),
        PartitionStatus::Known { partition: PartitionId(0), state: LeaderState::Electing, .. }
    );

    let g = group("consensus-store-1", Some(status(None, 8, "")));
    assert_matches!(
        partition_status(&g, 0).unwrap(),
        PartitionStatus::Known { partition: PartitionId(1), leader: None, state: LeaderState::NoLeader, .. }
    );

    let g = group("consensus-store-3", None);
    assert_matches!(
        partition_status(&g, 1).unwrap(),
        PartitionStatus::Unavailable { partition: PartitionId(2), .. }
    );

    assert!(partition_status(&group("consensus-store-0", None), 1).is_err());
}

#[test]
fn raft_group_deserialization() {
    let g: RaftGroup = serde_json::from_value(serde_json::json!({
        "apiVersion": "consensus.atomix.io/v1beta1",
        "kind": "RaftGroup",
        "metadata": {"name": "consensus-store-1", "namespace": "default"},
        "spec": {"replicas": 3},
        "status": {"leader": {"name": "consensus-store-2"}, "term": 12, "state": "Ready"},
    }))
    .unwrap();
    assert_eq!(Some(&serde_json::json!(3)), g.spec.fields.get("replicas"));
    assert_eq!(Some(12), g.status.as_ref().and_then(|s| s.term));
    assert_matches!(
        partition_status(&g, 1).unwrap(),
        PartitionStatus::Known { term: 12, state: LeaderState::Ready, .. }
    );
}

#[test]
fn config_defaults_are_valid() {
    let cfg = AppConfig::default();
    cfg.validate().unwrap();
    assert_eq!(TestMode::Precision, cfg.test_mode().unwrap());
    let mapping = cfg.replica_mapping();
    assert_eq!(
        ReplicaId::from("consensus-store-1"),
        mapping
            .process_of(&ReplicaId::from("consensus-store-consensus-store-2"))
            .unwrap()
    );
}

#[test]
fn config_file_and_env() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    fs::write(
        &path,
        "namespace: chaos\nharness:\n  concurrent_clients: 5\n  partition_count: 4\n",
    )
    .unwrap();
    let mut cfg = AppConfig::read(&path).unwrap();
    assert_eq!("chaos", cfg.namespace);
    assert_eq!(5, cfg.harness.concurrent_clients);
    assert_eq!(4, cfg.harness.partition_count);
    assert_eq!(5, cfg.harness.operations_per_client);

    let env = BTreeMap::from([
        ("CONCURRENT_CLIENTS", "7"),
        ("FAILURE_DELAY_MS", "25"),
        ("TEST_MODE", "comprehensive"),
        ("NAMESPACE", ""),
    ]);
    cfg.apply_env(|name| env.get(name).map(|v| v.to_string()))
        .unwrap();
    assert_eq!(7, cfg.harness.concurrent_clients);
    assert_eq!(Some(25), cfg.harness.failure_delay_millis);
    assert_eq!(TestMode::Comprehensive, cfg.test_mode().unwrap());
    // Empty variables are ignored.
    assert_eq!("chaos", cfg.namespace);
    cfg.validate().unwrap();

    let path = dir.path().join("config.json");
    fs::write(&path, r#"{"map_name": "m", "harness": {"recovery_timeout_seconds": 30}}"#).unwrap();
    let cfg = AppConfig::read(&path).unwrap();
    assert_eq!("m", cfg.map_name);
    assert_eq!(30, cfg.harness.recovery_timeout_seconds);
}

#[test]
fn invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    fs::write(&path, "harness:\n  concurrent_client: 5\n").unwrap();
    assert!(AppConfig::read(&path).is_err());

    let mut cfg = AppConfig::default();
    assert!(cfg
        .apply_env(|name| (name == "PARTITION_COUNT").then(|| "three".to_owned()))
        .is_err());

    let mut cfg = AppConfig {
        test_mode: "thorough".to_owned(),
        ..AppConfig::default()
    };
    assert!(cfg.validate().is_err());
    cfg.test_mode = "precision".to_owned();
    cfg.harness.partition_count = 0;
    assert!(cfg.validate().is_err());
    cfg.harness.partition_count = 3;
    cfg.rpc_url = "127.0.0.1:5678".to_owned();
    assert!(cfg.validate().is_err());
}

#[test]
fn client_errors() {
    assert_matches!(
        store_error("map_get", jsonrpsee::core::ClientError::RequestTimeout),
        StoreError::Timeout
    );
    let err = store_error(
        "map_put",
        jsonrpsee::core::ClientError::Custom("no leader".to_owned()),
    );
    assert_matches!(&err, StoreError::Transient(_));
    assert!(err.to_string().contains("map_put"), "{err}");
}

#[tokio::test]
async fn unreachable_store() {
    let ctx = &ctx::root();
    let store = RpcStore::new("http://127.0.0.1:1", "m", time::Duration::from_secs(1)).unwrap();
    assert_eq!("m", store.map());
    assert_matches!(
        store.get(ctx, "k").await,
        Err(StoreError::Transient(_) | StoreError::Timeout)
    );
    ctx.cancel();
    assert_matches!(store.put(ctx, "k", "v").await, Err(StoreError::Canceled(_)));
}
