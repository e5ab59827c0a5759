//! Fixed names, ports, paths and label keys
//!
//! Per-cluster object names are derived from the VaultService name only, so
//! every pass computes the same names without consulting any state.

use std::collections::BTreeMap;

use crate::crd::VaultService;
use kube::ResourceExt;

pub const CONTROLLER_NAME: &str = "vaultservice";

pub const VAULT_CONTAINER: &str = "vault";
pub const VAULT_CLIENT_PORT: i32 = 8200;
pub const VAULT_CLUSTER_PORT: i32 = 8201;
pub const VAULT_CLIENT_PORT_NAME: &str = "vault-client";
pub const VAULT_CLUSTER_PORT_NAME: &str = "vault-cluster";

pub const EXPORTER_CONTAINER: &str = "statsd-exporter";
pub const EXPORTER_IMAGE: &str = "prom/statsd-exporter:v0.5.0";
pub const STATSD_PORT: i32 = 9125;
pub const PROMETHEUS_PORT: i32 = 9102;

pub const VAULT_CONFIG_DIR: &str = "/run/vault/config";
pub const VAULT_CONFIG_FILE: &str = "vault.hcl";
pub const VAULT_TLS_DIR: &str = "/run/vault/tls";
pub const VAULT_CONFIG_VOLUME: &str = "vault-config";
pub const VAULT_TLS_VOLUME: &str = "vault-tls-secret";
pub const VAULT_RUN_AS: i64 = 9000;

pub const ETCD_SIZE: i32 = 3;
pub const ETCD_CLIENT_PORT: i32 = 2379;

// Secret data keys
pub const STORAGE_CLIENT_KEY: &str = "etcd-client.key";
pub const STORAGE_CLIENT_CERT: &str = "etcd-client.crt";
pub const STORAGE_CLIENT_CA: &str = "etcd-client-ca.crt";
pub const SERVER_KEY: &str = "server.key";
pub const SERVER_CERT: &str = "server.crt";
pub const SERVER_CA: &str = "server-ca.crt";
pub const PEER_KEY: &str = "peer.key";
pub const PEER_CERT: &str = "peer.crt";
pub const PEER_CA: &str = "peer-ca.crt";
pub const CLIENT_TRUST_CA: &str = "vault-client-ca.crt";

pub const HEALTH_PATH: &str = "/v1/sys/health";

pub fn selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "vault".to_string()),
        ("vault_cluster".to_string(), name.to_string()),
    ])
}

pub fn namespace_of(vs: &VaultService) -> String {
    vs.namespace().unwrap_or_else(|| "default".to_string())
}

pub fn etcd_cluster_name(name: &str) -> String {
    format!("{name}-etcd")
}

pub fn etcd_client_url(name: &str) -> String {
    format!("https://{}-client:{}", etcd_cluster_name(name), ETCD_CLIENT_PORT)
}

pub fn storage_client_secret(name: &str) -> String {
    format!("{name}-etcd-client-tls")
}

pub fn storage_server_secret(name: &str) -> String {
    format!("{name}-etcd-server-tls")
}

pub fn storage_peer_secret(vs: &VaultService) -> String {
    vs.spec
        .static_tls()
        .and_then(|s| s.peer_secret.clone())
        .unwrap_or_else(|| format!("{}-etcd-peer-tls", vs.name_any()))
}

pub fn vault_server_secret(vs: &VaultService) -> String {
    match vs.spec.static_tls() {
        Some(st) => st.server_secret.clone(),
        None => format!("{}-default-vault-server-tls", vs.name_any()),
    }
}

pub fn vault_client_secret(vs: &VaultService) -> String {
    match vs.spec.static_tls() {
        Some(st) => st.client_secret.clone(),
        None => format!("{}-default-vault-client-tls", vs.name_any()),
    }
}

/// Name of the merged configuration copy
pub fn config_copy_name(vs: &VaultService) -> String {
    let base = vs
        .spec
        .config_map_name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| vs.name_any());
    format!("{base}-copy")
}

pub fn vault_service_url(vs: &VaultService, port: i32) -> String {
    format!("https://{}.{}.svc:{}", vs.name_any(), namespace_of(vs), port)
}
