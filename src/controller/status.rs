//! Cluster status aggregation
//!
//! Every Vault pod is polled for health and sorted into Active, Standby or
//! Sealed. A single pod that is terminating, not running or unreachable
//! aborts the whole computation; no partial status is ever produced.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::api::{update_status_with_retry, ResourceApi};
use super::constants::*;
use super::health::{HealthProbe, VaultHealth};
use super::tls::client_trust_ca;
use crate::crd::{VaultNodes, VaultService, VaultServicePhase, VaultServiceStatus};
use crate::error::{Error, Result};

/// Role a pod plays in the Vault cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    Active,
    Standby,
    Sealed,
    /// Unsealed but not yet initialized; counted nowhere
    Uninitialized,
}

pub fn classify(health: &VaultHealth) -> NodeRole {
    if health.sealed {
        NodeRole::Sealed
    } else if !health.initialized {
        NodeRole::Uninitialized
    } else if health.standby {
        NodeRole::Standby
    } else {
        NodeRole::Active
    }
}

/// One pod's health and the image it runs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodObservation {
    pub name: String,
    pub image: Option<String>,
    pub health: VaultHealth,
}

/// Fold pod observations into a status snapshot.
///
/// Role lists and `updatedNodes` come out sorted. When more than one pod
/// claims Active, `active` is left empty and the claimants are listed in
/// `message`.
pub fn aggregate(
    observations: &[PodObservation],
    target_image: &str,
    service_name: &str,
) -> VaultServiceStatus {
    let mut active = Vec::new();
    let mut nodes = VaultNodes::default();
    let mut updated = Vec::new();
    let mut initialized = false;

    for obs in observations {
        initialized |= obs.health.initialized;
        match classify(&obs.health) {
            NodeRole::Active => active.push(obs.name.clone()),
            NodeRole::Standby => nodes.standby.push(obs.name.clone()),
            NodeRole::Sealed => nodes.sealed.push(obs.name.clone()),
            NodeRole::Uninitialized => {}
        }
        if obs.image.as_deref() == Some(target_image) {
            updated.push(obs.name.clone());
        }
    }

    active.sort();
    nodes.standby.sort();
    nodes.sealed.sort();
    updated.sort();

    let message = match active.len() {
        0 if initialized => Some("no active Vault node".to_string()),
        0 | 1 => None,
        _ => Some(format!(
            "split brain: multiple active Vault nodes {}",
            active.join(", ")
        )),
    };
    if active.len() == 1 {
        nodes.active = active.remove(0);
    }

    VaultServiceStatus {
        phase: Some(VaultServicePhase::Running),
        initialized,
        service_name: service_name.to_string(),
        client_port: VAULT_CLIENT_PORT,
        vault_status: nodes,
        updated_nodes: updated,
        message,
    }
}

fn ensure_serving(pod: &Pod) -> Result<()> {
    if pod.metadata.deletion_timestamp.is_some() {
        return Err(Error::UnhealthyMember(format!(
            "pod {} is terminating",
            pod.name_any()
        )));
    }
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    if phase != Some("Running") {
        return Err(Error::UnhealthyMember(format!(
            "pod {} is not running (phase {})",
            pod.name_any(),
            phase.unwrap_or("Unknown")
        )));
    }
    Ok(())
}

fn primary_image(pod: &Pod) -> Option<String> {
    pod.spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.image.clone())
}

/// Poll every Vault pod and compute a fresh status.
pub async fn get_vault_status<A, P>(api: &A, probe: &P, vs: &VaultService) -> Result<VaultServiceStatus>
where
    A: ResourceApi,
    P: HealthProbe,
{
    let namespace = namespace_of(vs);
    let mut pods: Vec<Pod> = api
        .list(&namespace, &selector_labels(&vs.name_any()))
        .await?;
    pods.sort_by_key(|p| p.name_any());

    for pod in &pods {
        ensure_serving(pod)?;
    }

    let mut observations = Vec::with_capacity(pods.len());
    if !pods.is_empty() {
        let ca = client_trust_ca(api, vs).await?;
        for pod in &pods {
            let health = probe.check(pod, &ca).await?;
            debug!(pod = %pod.name_any(), ?health, "Observed Vault health");
            observations.push(PodObservation {
                name: pod.name_any(),
                image: primary_image(pod),
                health,
            });
        }
    }

    let status = aggregate(&observations, &vs.spec.vault_image(), &vs.name_any());
    if let Some(message) = &status.message {
        warn!("Vault cluster {}/{}: {}", namespace, vs.name_any(), message);
    }
    Ok(status)
}

/// Write `status` unless the stored status already equals it; returns whether it wrote.
pub async fn update_vault_status<A: ResourceApi>(
    api: &A,
    vs: &VaultService,
    status: &VaultServiceStatus,
) -> Result<bool> {
    let namespace = namespace_of(vs);
    let name = vs.name_any();
    let written = update_status_with_retry(api, &namespace, &name, |fresh: &mut VaultService| {
        if fresh.status.as_ref() == Some(status) {
            return false;
        }
        fresh.status = Some(status.clone());
        true
    })
    .await?;

    if written {
        info!(
            active = %status.vault_status.active,
            standby = ?status.vault_status.standby,
            sealed = ?status.vault_status.sealed,
            updated = ?status.updated_nodes,
            "Updated status of VaultService {}/{}",
            namespace,
            name
        );
    }
    Ok(written)
}
