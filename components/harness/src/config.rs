//! Harness configuration.
use crate::{partition::PartitionMapper, recovery::RecoveryConfig};
use failover_concurrency::time;
use serde::{Deserialize, Serialize};

/// Tunables of a harness run. Every field has a default, so that a config
/// file only needs to name the fields it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Number of clients of the concurrent workloads.
    pub concurrent_clients: usize,
    /// Number of operations each concurrent client issues.
    pub operations_per_client: usize,
    /// Duration of the continuous monitor.
    pub test_duration_seconds: u64,
    /// Fixed failure injection delay. Overrides the scenario table when set.
    pub failure_delay_millis: Option<u64>,
    /// Number of store partitions.
    pub partition_count: u32,
    /// Leadership poll interval of the recovery detector.
    pub poll_interval_millis: u64,
    /// Deadline of the recovery detector.
    pub recovery_timeout_seconds: u64,
    /// Time a new leader has to stay unchanged to count as stable.
    pub settle_interval_millis: u64,
    /// Timeout of a single store operation.
    pub operation_timeout_millis: u64,
    /// Pause between operations of a concurrent client.
    pub pacing_millis: u64,
    /// Write interval of the continuous monitor.
    pub write_interval_millis: u64,
    /// Read interval of the continuous monitor.
    pub read_interval_millis: u64,
    /// Leadership poll interval of the background tracker loop.
    pub leader_poll_interval_millis: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            concurrent_clients: 3,
            operations_per_client: 5,
            test_duration_seconds: 300,
            failure_delay_millis: None,
            partition_count: 3,
            poll_interval_millis: 1000,
            recovery_timeout_seconds: 60,
            settle_interval_millis: 2000,
            operation_timeout_millis: 10_000,
            pacing_millis: 10,
            write_interval_millis: 1000,
            read_interval_millis: 2000,
            leader_poll_interval_millis: 5000,
        }
    }
}

impl HarnessConfig {
    /// Checks the configuration for values the harness can't run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.concurrent_clients > 0, "concurrent_clients must be positive");
        anyhow::ensure!(
            self.operations_per_client > 0,
            "operations_per_client must be positive"
        );
        anyhow::ensure!(self.partition_count > 0, "partition_count must be positive");
        anyhow::ensure!(self.poll_interval_millis > 0, "poll_interval_millis must be positive");
        anyhow::ensure!(
            self.leader_poll_interval_millis > 0,
            "leader_poll_interval_millis must be positive"
        );
        anyhow::ensure!(
            self.write_interval_millis > 0 && self.read_interval_millis > 0,
            "monitor intervals must be positive"
        );
        anyhow::ensure!(
            self.operation_timeout_millis > 0,
            "operation_timeout_millis must be positive"
        );
        anyhow::ensure!(
            time::Duration::from_secs(self.recovery_timeout_seconds)
                > time::Duration::from_millis(self.poll_interval_millis),
            "recovery_timeout_seconds must exceed poll_interval_millis"
        );
        Ok(())
    }

    /// Partition mapper for the configured partition count.
    pub fn mapper(&self) -> anyhow::Result<PartitionMapper> {
        PartitionMapper::new(self.partition_count)
    }

    /// Recovery detector timings.
    pub fn recovery(&self) -> RecoveryConfig {
        RecoveryConfig {
            poll_interval: time::Duration::from_millis(self.poll_interval_millis),
            settle_interval: time::Duration::from_millis(self.settle_interval_millis),
            deadline: time::Duration::from_secs(self.recovery_timeout_seconds),
        }
    }

    /// Timeout of a single store operation.
    pub fn operation_timeout(&self) -> time::Duration {
        time::Duration::from_millis(self.operation_timeout_millis)
    }

    /// Pause between operations of a concurrent client.
    pub fn pacing(&self) -> time::Duration {
        time::Duration::from_millis(self.pacing_millis)
    }

    /// Duration of the continuous monitor.
    pub fn test_duration(&self) -> time::Duration {
        time::Duration::from_secs(self.test_duration_seconds)
    }

    /// Poll interval of the background leader tracker loop.
    pub fn leader_poll_interval(&self) -> time::Duration {
        time::Duration::from_millis(self.leader_poll_interval_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        HarnessConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg: HarnessConfig =
            serde_json::from_str(r#"{"partition_count": 5, "failure_delay_millis": 25}"#).unwrap();
        assert_eq!(5, cfg.partition_count);
        assert_eq!(Some(25), cfg.failure_delay_millis);
        assert_eq!(HarnessConfig::default().concurrent_clients, cfg.concurrent_clients);
    }

    #[test]
    fn invalid_config_rejected() {
        let cfg = HarnessConfig {
            partition_count: 0,
            ..HarnessConfig::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = HarnessConfig {
            concurrent_clients: 0,
            ..HarnessConfig::default()
        };
        assert!(cfg.validate().is_err());
        assert!(serde_json::from_str::<HarnessConfig>(r#"{"partitions": 3}"#).is_err());
    }

    #[test]
    fn huge_recovery_timeout() {
        let cfg = HarnessConfig {
            recovery_timeout_seconds: u64::MAX,
            ..HarnessConfig::default()
        };
        cfg.validate().unwrap();
        let cfg = HarnessConfig {
            recovery_timeout_seconds: 1,
            poll_interval_millis: 1000,
            ..HarnessConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn recovery_timings() {
        let cfg = HarnessConfig::default().recovery();
        assert_eq!(time::Duration::from_secs(1), cfg.poll_interval);
        assert_eq!(time::Duration::from_secs(2), cfg.settle_interval);
        assert_eq!(time::Duration::from_secs(60), cfg.deadline);
    }
}
