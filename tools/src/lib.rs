//! Adapters connecting the failover harness to a Kubernetes-hosted store:
//! leadership and pod termination through the Kubernetes API, reads and
//! writes through a JSON-RPC proxy of the store.
pub mod config;
pub mod k8s;
pub mod store;

#[cfg(test)]
mod tests;

pub use config::AppConfig;
