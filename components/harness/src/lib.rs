//! Failure-injection and consistency-verification engine for a replicated,
//! partitioned key-value store with per-partition leaders.
//!
//! A trial writes a key, terminates the leader of the key's partition after a
//! configured delay, waits for a strictly newer stable leader, reads the key
//! back and decides whether the store kept its guarantees. Concurrent
//! workloads additionally check linearizability and the absence of lost
//! updates on a shared key.
//!
//! The store and the platform hosting the replicas are consumed through the
//! [`store::Store`] and [`platform::Platform`] traits.

pub mod config;
pub mod injector;
pub mod leader;
mod metrics;
pub mod partition;
pub mod platform;
pub mod record;
pub mod recovery;
pub mod report;
pub mod stats;
pub mod store;
pub mod suite;
pub mod testonly;
pub mod trial;
pub mod verify;
pub mod workload;

pub use config::HarnessConfig;
pub use partition::{PartitionId, PartitionMapper};
