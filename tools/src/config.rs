//! Configuration of the failover-tester binary.
//!
//! Values are resolved in order: defaults, the config file (YAML or JSON),
//! environment variables, command line flags. Later sources override earlier ones.
use crate::k8s;
use anyhow::Context as _;
use failover_harness::{injector::ReplicaMapping, trial::TestMode, HarnessConfig};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// Harness tunables.
    pub harness: HarnessConfig,
    /// Namespace of the store.
    pub namespace: String,
    /// Store name, as in the `atomix.io/store` label of its raft groups.
    pub store_name: String,
    /// Number of the raft group holding partition 0.
    pub partition_base: u32,
    /// Pod name prefix of the replicas. If unset, the leader name prefix is used.
    pub process_prefix: Option<String>,
    /// Difference between the leader ordinal and the pod ordinal.
    pub ordinal_offset: usize,
    /// URL of the JSON-RPC store proxy.
    pub rpc_url: String,
    /// Map the harness reads and writes.
    pub map_name: String,
    /// Failover campaign mode: `precision` or `comprehensive`.
    pub test_mode: String,
    /// File receiving DEBUG logs.
    pub log_file: PathBuf,
    /// Address of the Prometheus exporter.
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            harness: HarnessConfig::default(),
            namespace: k8s::DEFAULT_NAMESPACE.to_owned(),
            store_name: "consensus-store".to_owned(),
            partition_base: 1,
            process_prefix: Some("consensus-store".to_owned()),
            ordinal_offset: 1,
            rpc_url: "http://127.0.0.1:5678".to_owned(),
            map_name: "failover-test-map".to_owned(),
            test_mode: "precision".to_owned(),
            log_file: PathBuf::from("logs/failover-tester.log"),
            metrics_addr: None,
        }
    }
}

/// Parses the environment variable `name`, if set and non-empty.
fn env_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(v) if !v.is_empty() => Ok(Some(v.parse().with_context(|| format!("${name}"))?)),
        _ => Ok(None),
    }
}

impl AppConfig {
    /// Reads a config file. Files with a `.json` extension are parsed as
    /// JSON, everything else as YAML.
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let text =
            fs::read_to_string(path).with_context(|| format!("failed to read {path:?}"))?;
        let is_json = path.extension().is_some_and(|ext| ext == "json");
        if is_json {
            serde_json::from_str(&text).with_context(|| format!("failed to parse {path:?}"))
        } else {
            serde_yaml::from_str(&text).with_context(|| format!("failed to parse {path:?}"))
        }
    }

    /// Defaults overridden by the config file at `path`, if any, and by the environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut cfg = match path {
            Some(path) => Self::read(path)?,
            None => Self::default(),
        };
        cfg.apply_env(|name| std::env::var(name).ok())?;
        Ok(cfg)
    }

    /// Applies environment overrides, looked up with `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let h = &mut self.harness;
        if let Some(v) = env_var(&lookup, "CONCURRENT_CLIENTS")? {
            h.concurrent_clients = v;
        }
        if let Some(v) = env_var(&lookup, "OPERATIONS_PER_CLIENT")? {
            h.operations_per_client = v;
        }
        if let Some(v) = env_var(&lookup, "TEST_DURATION")? {
            h.test_duration_seconds = v;
        }
        if let Some(v) = env_var(&lookup, "FAILURE_DELAY_MS")? {
            h.failure_delay_millis = Some(v);
        }
        if let Some(v) = env_var(&lookup, "PARTITION_COUNT")? {
            h.partition_count = v;
        }
        if let Some(v) = env_var(&lookup, "POLL_INTERVAL_MS")? {
            h.poll_interval_millis = v;
        }
        if let Some(v) = env_var(&lookup, "RECOVERY_TIMEOUT")? {
            h.recovery_timeout_seconds = v;
        }
        if let Some(v) = env_var(&lookup, "NAMESPACE")? {
            self.namespace = v;
        }
        if let Some(v) = env_var(&lookup, "TEST_MODE")? {
            self.test_mode = v;
        }
        if let Some(v) = env_var(&lookup, "LOG_FILE")? {
            self.log_file = v;
        }
        if let Some(v) = env_var(&lookup, "RPC_URL")? {
            self.rpc_url = v;
        }
        if let Some(v) = env_var(&lookup, "MAP_NAME")? {
            self.map_name = v;
        }
        Ok(())
    }

    /// Checks the configuration. An invalid configuration is fatal.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.harness.validate().context("harness")?;
        self.test_mode().context("test_mode")?;
        anyhow::ensure!(!self.namespace.is_empty(), "namespace must be set");
        anyhow::ensure!(!self.map_name.is_empty(), "map_name must be set");
        anyhow::ensure!(
            self.rpc_url.starts_with("http://") || self.rpc_url.starts_with("https://"),
            "rpc_url must be an http(s) URL, got {:?}",
            self.rpc_url
        );
        Ok(())
    }

    /// Parsed failover campaign mode.
    pub fn test_mode(&self) -> anyhow::Result<TestMode> {
        self.test_mode.parse()
    }

    /// Mapping from leader names to pod names.
    pub fn replica_mapping(&self) -> ReplicaMapping {
        ReplicaMapping {
            process_prefix: self.process_prefix.clone(),
            ordinal_offset: self.ordinal_offset,
        }
    }
}
