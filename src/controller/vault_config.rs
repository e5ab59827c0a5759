//! Merged vault.hcl configuration
//!
//! The user's base configuration (if any) is kept verbatim and followed by the
//! telemetry, listener and etcd storage stanzas this operator depends on.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::info;

use super::api::{update_with_retry, ResourceApi};
use super::constants::*;
use super::resources::owner_reference;
use crate::crd::VaultService;
use crate::error::{Error, Result};

fn tls_asset(file: &str) -> String {
    format!("{VAULT_TLS_DIR}/{file}")
}

/// `base` followed by the required stanzas, in a fixed order.
pub fn merge_vault_config(base: &str, etcd_url: &str) -> String {
    let mut cfg = String::from(base);
    cfg.push_str(&format!(
        "\ntelemetry {{\n\tstatsd_address = \"localhost:{STATSD_PORT}\"\n}}\n"
    ));
    cfg.push_str(&format!(
        r#"
listener "tcp" {{
  address     = "0.0.0.0:{VAULT_CLIENT_PORT}"
  cluster_address = "0.0.0.0:{VAULT_CLUSTER_PORT}"
  tls_cert_file = "{cert}"
  tls_key_file  = "{key}"
}}
"#,
        cert = tls_asset(SERVER_CERT),
        key = tls_asset(SERVER_KEY),
    ));
    cfg.push_str(&format!(
        r#"
storage "etcd" {{
  address = "{etcd_url}"
  etcd_api = "v3"
  ha_enabled = "true"
  tls_ca_file = "{ca}"
  tls_cert_file = "{cert}"
  tls_key_file = "{key}"
  sync = "false"
}}
"#,
        ca = tls_asset(STORAGE_CLIENT_CA),
        cert = tls_asset(STORAGE_CLIENT_CERT),
        key = tls_asset(STORAGE_CLIENT_KEY),
    ));
    cfg
}

/// Base configuration from the user's ConfigMap, empty when none is referenced.
async fn user_base_config<A: ResourceApi>(api: &A, vs: &VaultService) -> Result<String> {
    let Some(name) = vs.spec.config_map_name.as_deref().filter(|n| !n.is_empty()) else {
        return Ok(String::new());
    };
    let namespace = namespace_of(vs);
    let cm: ConfigMap = api
        .get(&namespace, name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("ConfigMap {namespace}/{name}")))?;

    Ok(cm
        .data
        .as_ref()
        .and_then(|d| d.get(VAULT_CONFIG_FILE))
        .cloned()
        .unwrap_or_default())
}

pub fn build_config_map(vs: &VaultService, merged: String) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_copy_name(vs)),
            namespace: Some(namespace_of(vs)),
            labels: Some(selector_labels(&vs.name_any())),
            owner_references: Some(vec![owner_reference(vs)]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(VAULT_CONFIG_FILE.to_string(), merged)])),
        ..Default::default()
    }
}

/// Write the merged configuration copy; returns whether anything was written.
///
/// An existing copy is replaced only when its content differs, so a change to
/// the user's base configuration still reaches the copy.
pub async fn ensure_config<A: ResourceApi>(api: &A, vs: &VaultService) -> Result<bool> {
    let namespace = namespace_of(vs);
    let base = user_base_config(api, vs).await?;
    let merged = merge_vault_config(&base, &etcd_client_url(&vs.name_any()));
    let desired = build_config_map(vs, merged);
    let name = config_copy_name(vs);

    if api.create(&namespace, &desired).await? {
        info!("Created Vault config {}/{}", namespace, name);
        return Ok(true);
    }

    let updated = update_with_retry(api, &namespace, &name, |cm: &mut ConfigMap| {
        if cm.data == desired.data {
            return false;
        }
        cm.data = desired.data.clone();
        true
    })
    .await?;
    if updated {
        info!("Updated Vault config {}/{}", namespace, name);
    }
    Ok(updated)
}
