//! Operator runtime configuration
//!
//! Every setting can come from a flag or from the environment, so the same
//! binary runs unchanged from a Deployment manifest or a developer shell.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug, Parser)]
#[command(name = "vault-operator", version, about = "Kubernetes operator for Vault clusters")]
pub struct OperatorConfig {
    /// Namespace to watch; all namespaces when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Periodic resync interval in seconds
    #[arg(long, env = "VAULT_OPERATOR_RESYNC_SECONDS", default_value_t = 30)]
    pub resync_seconds: u64,

    /// Per-pod health request timeout in seconds
    #[arg(long, env = "VAULT_OPERATOR_HEALTH_TIMEOUT_SECONDS", default_value_t = 5)]
    pub health_timeout_seconds: u64,

    /// Cluster DNS domain used in storage certificate SANs
    #[arg(long, env = "VAULT_OPERATOR_CLUSTER_DOMAIN", default_value = "cluster.local")]
    pub cluster_domain: String,

    /// Listen address for /metrics and /healthz
    #[arg(long, env = "VAULT_OPERATOR_METRICS_ADDR", default_value = "0.0.0.0:8383")]
    pub metrics_addr: SocketAddr,

    #[arg(long, env = "VAULT_OPERATOR_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Fraction of traces sampled when OTLP export is enabled
    #[arg(long, env = "OTEL_TRACES_SAMPLER_ARG", default_value_t = 1.0)]
    pub trace_sample_ratio: f64,
}

impl OperatorConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_seconds.max(1))
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_seconds.max(1))
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            resync_seconds: 30,
            health_timeout_seconds: 5,
            cluster_domain: "cluster.local".to_string(),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8383)),
            log_format: LogFormat::Text,
            trace_sample_ratio: 1.0,
        }
    }
}
