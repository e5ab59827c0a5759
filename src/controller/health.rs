//! Per-pod Vault health checks
//!
//! Each Vault pod is reached at `<pod-ip-with-dashes>.<namespace>.pod`, the
//! name its server certificate carries through the `*.<namespace>.pod` SAN.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::Deserialize;
use tracing::debug;

use super::constants::{HEALTH_PATH, VAULT_CLIENT_PORT};
use crate::error::{Error, Result};

/// Health as reported by `GET /v1/sys/health`
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct VaultHealth {
    pub initialized: bool,
    pub sealed: bool,
    pub standby: bool,
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Fetch health from one pod, trusting only `ca_pem`
    async fn check(&self, pod: &Pod, ca_pem: &str) -> Result<VaultHealth>;
}

/// DNS name addressing a single pod
pub fn pod_dns_name(pod: &Pod) -> Result<String> {
    let ip = pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ip.as_deref())
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| Error::UnhealthyMember(format!("pod {} has no IP yet", pod.name_any())))?;
    let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
    Ok(format!("{}.{}.pod", ip.replace('.', "-"), namespace))
}

/// Health query that answers 200 in every state so the body is always JSON
fn health_url(base: &str) -> String {
    format!("{base}{HEALTH_PATH}?standbyok=true&sealedcode=200&uninitcode=200")
}

/// Decode a health response, accepting any status whose body is health JSON.
pub async fn decode_health(resp: reqwest::Response, pod: &str) -> Result<VaultHealth> {
    let status = resp.status();
    let body = resp.bytes().await?;
    serde_json::from_slice::<VaultHealth>(&body).map_err(|e| {
        Error::UnhealthyMember(format!(
            "pod {pod} returned an unreadable health response ({status}): {e}"
        ))
    })
}

/// [`HealthProbe`] over HTTPS
pub struct HttpsHealthProbe {
    timeout: Duration,
}

impl HttpsHealthProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn client(&self, ca_pem: &str) -> Result<reqwest::Client> {
        let ca = reqwest::Certificate::from_pem(ca_pem.as_bytes())?;
        Ok(reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(ca)
            .timeout(self.timeout)
            .build()?)
    }
}

#[async_trait]
impl HealthProbe for HttpsHealthProbe {
    async fn check(&self, pod: &Pod, ca_pem: &str) -> Result<VaultHealth> {
        let host = pod_dns_name(pod)?;
        let url = health_url(&format!("https://{host}:{VAULT_CLIENT_PORT}"));
        debug!(pod = %pod.name_any(), %url, "Requesting Vault health");

        let resp = self.client(ca_pem)?.get(&url).send().await.map_err(|e| {
            Error::UnhealthyMember(format!(
                "failed requesting health info for the vault pod ({}/{}): {e}",
                pod.namespace().unwrap_or_default(),
                pod.name_any()
            ))
        })?;
        decode_health(resp, &pod.name_any()).await
    }
}
