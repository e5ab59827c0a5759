//! Prometheus metrics for the Vault operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `vault_operator_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `vault_operator_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `vault_operator_nodes` (gauge): Vault nodes per role, labeled by namespace/name/role.
//! - `vault_operator_updated_nodes` (gauge): nodes running the target image, labeled by namespace/name.
//! - `vault_operator_stepdowns_total` (counter): active nodes deleted to finish an upgrade.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::crd::VaultServiceStatus;

/// Labels identifying one VaultService
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterLabels {
    pub namespace: String,
    pub name: String,
}

/// Labels for the per-role node gauge
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RoleLabels {
    pub namespace: String,
    pub name: String,
    /// "active", "standby" or "sealed"
    pub role: String,
}

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind, e.g. "kube", "validation", "unhealthy_member"
    pub kind: String,
}

pub static NODES: Lazy<Family<RoleLabels, Gauge<i64, AtomicI64>>> = Lazy::new(Family::default);

pub static UPDATED_NODES: Lazy<Family<ClusterLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static STEPDOWNS_TOTAL: Lazy<Family<ClusterLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "vault_operator_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "vault_operator_reconcile_errors_total",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "vault_operator_nodes",
        "Vault nodes per role as of the last status computation",
        NODES.clone(),
    );
    registry.register(
        "vault_operator_updated_nodes",
        "Vault nodes running the target image",
        UPDATED_NODES.clone(),
    );
    registry.register(
        "vault_operator_stepdowns_total",
        "Active Vault nodes deleted to complete an upgrade",
        STEPDOWNS_TOTAL.clone(),
    );
    registry
});

pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_stepdown(namespace: &str, name: &str) {
    let labels = ClusterLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
    };
    STEPDOWNS_TOTAL.get_or_create(&labels).inc();
}

/// Publish role counts from a freshly computed status
pub fn set_cluster_status(namespace: &str, name: &str, status: &VaultServiceStatus) {
    let nodes = &status.vault_status;
    let counts = [
        ("active", i64::from(!nodes.active.is_empty())),
        ("standby", nodes.standby.len() as i64),
        ("sealed", nodes.sealed.len() as i64),
    ];
    for (role, count) in counts {
        let labels = RoleLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
            role: role.to_string(),
        };
        NODES.get_or_create(&labels).set(count);
    }

    let labels = ClusterLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
    };
    UPDATED_NODES
        .get_or_create(&labels)
        .set(status.updated_nodes.len() as i64);
}

/// Drop every per-cluster series of a deleted VaultService
pub fn remove_cluster(namespace: &str, name: &str) {
    for role in ["active", "standby", "sealed"] {
        NODES.remove(&RoleLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
            role: role.to_string(),
        });
    }
    let labels = ClusterLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
    };
    UPDATED_NODES.remove(&labels);
    STEPDOWNS_TOTAL.remove(&labels);
}
