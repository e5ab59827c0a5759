//! Kubernetes operator for Vault clusters
//!
//! A `VaultService` custom resource describes a highly available Vault
//! cluster. The operator provisions an etcd storage cluster with mutual TLS,
//! deploys Vault against it, publishes which node is active, standby or
//! sealed, and upgrades nodes without taking the active one down first.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
#[cfg(feature = "metrics")]
pub mod server;
pub mod telemetry;

pub use error::{Error, Result};
