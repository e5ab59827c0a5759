//! Rolling upgrades that keep the active Vault node serving
//!
//! When the target image changes, the deployment is rolled forward with
//! `maxUnavailable = nodes - 1`, so the rollout replaces standby nodes while
//! the active one keeps serving. Once every other node runs the new image and
//! is standby or sealed, the active pod is deleted to force a stepdown.

use std::collections::BTreeSet;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::info;

use super::api::{update_with_retry, ResourceApi};
use super::constants::namespace_of;
use crate::crd::{VaultService, VaultServiceSpec, VaultServiceStatus};
use crate::error::Result;

/// Deployment change that moves the cluster to the target image
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RollForward {
    pub image: String,
    pub max_unavailable: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpgradePlan {
    pub roll_forward: Option<RollForward>,
    /// Active pod to delete
    pub step_down: Option<String>,
}

impl UpgradePlan {
    pub fn is_noop(&self) -> bool {
        self.roll_forward.is_none() && self.step_down.is_none()
    }
}

/// Image of the primary container in the deployment's pod template
pub fn deployed_image(deployment: &Deployment) -> Option<&str> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first())
        .and_then(|c| c.image.as_deref())
}

/// Whether the active node can be stepped down without losing an up-to-date successor.
///
/// True iff an active node exists, the standby set equals the updated set, and
/// standby together with sealed equals the updated set. Since the roles are
/// disjoint this also means the active node itself is not updated.
pub fn ready_to_step_down(status: &VaultServiceStatus) -> bool {
    let nodes = &status.vault_status;
    if nodes.active.is_empty() {
        return false;
    }
    let standby: BTreeSet<&str> = nodes.standby.iter().map(String::as_str).collect();
    let sealed: BTreeSet<&str> = nodes.sealed.iter().map(String::as_str).collect();
    let updated: BTreeSet<&str> = status.updated_nodes.iter().map(String::as_str).collect();

    if standby != updated {
        return false;
    }
    let accounted: BTreeSet<&str> = standby.union(&sealed).copied().collect();
    accounted == updated
}

/// Decide the upgrade actions for this pass.
pub fn plan_upgrade(
    deployment: &Deployment,
    spec: &VaultServiceSpec,
    status: &VaultServiceStatus,
) -> UpgradePlan {
    let target = spec.vault_image();
    let roll_forward = (deployed_image(deployment) != Some(target.as_str())).then(|| RollForward {
        image: target,
        max_unavailable: (spec.nodes - 1).max(0),
    });
    let step_down = ready_to_step_down(status).then(|| status.vault_status.active.clone());

    UpgradePlan {
        roll_forward,
        step_down,
    }
}

fn apply_roll_forward(deployment: &mut Deployment, rf: &RollForward) -> bool {
    let Some(spec) = deployment.spec.as_mut() else {
        return false;
    };
    let Some(container) = spec
        .template
        .spec
        .as_mut()
        .and_then(|p| p.containers.first_mut())
    else {
        return false;
    };
    if container.image.as_deref() == Some(rf.image.as_str()) {
        return false;
    }
    container.image = Some(rf.image.clone());

    let strategy = spec.strategy.get_or_insert_with(Default::default);
    strategy
        .rolling_update
        .get_or_insert_with(Default::default)
        .max_unavailable = Some(IntOrString::Int(rf.max_unavailable));
    true
}

/// Roll the deployment forward and step the active node down when it is safe.
pub async fn sync_upgrade<A: ResourceApi>(
    api: &A,
    vs: &VaultService,
    status: &VaultServiceStatus,
) -> Result<UpgradePlan> {
    let namespace = namespace_of(vs);
    let name = vs.name_any();
    let deployment: Deployment = api
        .get(&namespace, &name)
        .await?
        .ok_or_else(|| crate::Error::NotFound(format!("Deployment {namespace}/{name}")))?;

    let plan = plan_upgrade(&deployment, &vs.spec, status);

    if let Some(rf) = &plan.roll_forward {
        let rolled = update_with_retry(api, &namespace, &name, |d: &mut Deployment| {
            apply_roll_forward(d, rf)
        })
        .await?;
        if rolled {
            info!(
                image = %rf.image,
                max_unavailable = rf.max_unavailable,
                "Rolling Vault cluster {}/{} forward",
                namespace,
                name
            );
        }
    }

    if let Some(active) = &plan.step_down {
        // The pod's grace period bounds how long Vault may hold the lock
        if api.delete::<Pod>(&namespace, active).await? {
            info!("Stepped down active Vault node {}/{}", namespace, active);
        }
    }

    Ok(plan)
}
