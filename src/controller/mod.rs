//! Controller module for VaultService reconciliation
//!
//! This module contains the main controller loop, the reconciliation steps,
//! and the builders for every object a Vault cluster owns.

pub mod api;
pub mod constants;
pub mod etcd;
pub mod health;
#[cfg(feature = "metrics")]
pub mod metrics;
mod reconciler;
pub mod resources;
pub mod status;
pub mod tls;
pub mod upgrade;
pub mod vault_config;

#[cfg(test)]
mod fake;
#[cfg(test)]
mod tls_test;

pub use api::{update_status_with_retry, update_with_retry, KubeResourceApi, ResourceApi};
pub use health::{HealthProbe, HttpsHealthProbe, VaultHealth};
pub use reconciler::{
    backoff_delay, error_policy, reconcile, reconcile_pass, run_controller, Context, PassOutcome,
};
