//! VaultService Custom Resource Definition
//!
//! A VaultService describes a highly available Vault cluster whose storage
//! backend is an operator-managed etcd cluster.

use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_IMAGE: &str = "quay.io/coreos/vault";
pub const DEFAULT_VERSION: &str = "0.9.1-0";

/// The VaultService CRD represents a managed Vault cluster.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "vault.security.coreos.com",
    version = "v1alpha1",
    kind = "VaultService",
    namespaced,
    status = "VaultServiceStatus",
    shortname = "vs",
    printcolumn = r#"{"name":"Nodes","type":"integer","jsonPath":".spec.nodes"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Active","type":"string","jsonPath":".status.vaultStatus.active"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VaultServiceSpec {
    /// Number of Vault nodes; defaults to 1
    #[serde(default)]
    pub nodes: i32,

    /// Vault image without tag; defaults to quay.io/coreos/vault
    #[serde(default)]
    pub base_image: String,

    /// Vault image tag; defaults to 0.9.1-0
    #[serde(default)]
    pub version: String,

    /// Pod-level policy applied to every Vault container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodPolicy>,

    /// Name of a user ConfigMap carrying a base vault.hcl
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_name: Option<String>,

    /// TLS policy; certificates are generated when absent
    #[serde(default, rename = "TLS", skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsPolicy>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub resources: Option<ResourceRequirements>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsPolicy {
    #[serde(default, rename = "static", skip_serializing_if = "Option::is_none")]
    pub static_tls: Option<StaticTls>,
}

/// Pre-existing secrets supplied by the user instead of generated ones
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StaticTls {
    /// Vault server secret holding server.key, server.crt and server-ca.crt
    pub server_secret: String,
    /// Client trust secret holding vault-client-ca.crt
    pub client_secret: String,
    /// etcd member peer secret; generated when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_secret: Option<String>,
    /// etcd operator client secret; rejected by validation, the client
    /// secret is always generated alongside the etcd server certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_secret: Option<String>,
}

/// Lifecycle phase of a VaultService
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum VaultServicePhase {
    Initial,
    Running,
}

/// Which Vault pods hold which role
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VaultNodes {
    /// Pod currently holding the Vault lock; empty when none is known
    #[serde(default)]
    pub active: String,
    #[serde(default)]
    pub standby: Vec<String>,
    #[serde(default)]
    pub sealed: Vec<String>,
}

/// Status subresource for VaultService
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VaultServiceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<VaultServicePhase>,
    #[serde(default)]
    pub initialized: bool,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub client_port: i32,
    #[serde(default)]
    pub vault_status: VaultNodes,
    /// Pods already running the target image
    #[serde(default)]
    pub updated_nodes: Vec<String>,
    /// Anomalies observed during the last status computation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// What a defaulting pass changed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Defaulted {
    pub spec: bool,
    pub status: bool,
}

impl Defaulted {
    pub fn any(&self) -> bool {
        self.spec || self.status
    }
}

impl VaultServiceSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.nodes < 1 {
            return Err("nodes must be at least 1".to_string());
        }
        if self.base_image.trim().is_empty() {
            return Err("baseImage must not be empty".to_string());
        }
        if self.version.trim().is_empty() {
            return Err("version must not be empty".to_string());
        }
        if let Some(st) = self.static_tls() {
            if st.server_secret.trim().is_empty() || st.client_secret.trim().is_empty() {
                return Err("TLS.static requires both serverSecret and clientSecret".to_string());
            }
            if st.operator_secret.is_some() {
                return Err(
                    "TLS.static.operatorSecret is not supported: the generated etcd server certificate must share a CA with the etcd client secret"
                        .to_string(),
                );
            }
        }
        if let Some(name) = &self.config_map_name {
            validate_object_name(name)
                .map_err(|e| format!("configMapName {name:?} is invalid: {e}"))?;
        }
        Ok(())
    }

    /// Target image, `<baseImage>:<version>`
    pub fn vault_image(&self) -> String {
        format!("{}:{}", self.base_image, self.version)
    }

    pub fn static_tls(&self) -> Option<&StaticTls> {
        self.tls.as_ref().and_then(|t| t.static_tls.as_ref())
    }

    /// Certificates for Vault itself are generated unless static secrets are named
    pub fn is_auto_tls(&self) -> bool {
        self.static_tls().is_none()
    }
}

impl VaultService {
    /// Fill unset fields with their defaults and report what changed.
    pub fn set_defaults(&mut self) -> Defaulted {
        let mut changed = Defaulted::default();
        let spec = &mut self.spec;
        if spec.nodes == 0 {
            spec.nodes = 1;
            changed.spec = true;
        }
        if spec.base_image.is_empty() {
            spec.base_image = DEFAULT_BASE_IMAGE.to_string();
            changed.spec = true;
        }
        if spec.version.is_empty() {
            spec.version = DEFAULT_VERSION.to_string();
            changed.spec = true;
        }

        let status = self.status.get_or_insert_with(Default::default);
        if status.phase.is_none() {
            status.phase = Some(VaultServicePhase::Initial);
            changed.status = true;
        }
        changed
    }

    pub fn phase(&self) -> Option<VaultServicePhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }
}

/// RFC 1123 subdomain check used for referenced object names
fn validate_object_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() || name.len() > 253 {
        return Err("must be 1-253 characters");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return Err("must consist of lower case alphanumerics, '-' or '.'");
    }
    let starts_ok = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    let ends_ok = name.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
    if !starts_ok || !ends_ok {
        return Err("must start and end with an alphanumeric character");
    }
    Ok(())
}
