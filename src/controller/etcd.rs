//! Dependent etcd cluster for Vault's storage backend

use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info};

use super::api::ResourceApi;
use super::constants::*;
use super::resources::owner_reference;
use crate::crd::{
    EtcdCluster, EtcdClusterSpec, EtcdMemberSecrets, EtcdPodPolicy, EtcdStaticTls, EtcdTlsPolicy,
    VaultService,
};
use crate::error::{Error, Result};

pub fn build_etcd_cluster(vs: &VaultService) -> EtcdCluster {
    let name = vs.name_any();
    let mut cluster = EtcdCluster::new(
        &etcd_cluster_name(&name),
        EtcdClusterSpec {
            size: ETCD_SIZE,
            version: None,
            pod: Some(EtcdPodPolicy {
                etcd_env: vec![EnvVar {
                    name: "ETCD_AUTO_COMPACTION_RETENTION".to_string(),
                    value: Some("1".to_string()),
                    ..Default::default()
                }],
                resources: vs.spec.pod.as_ref().and_then(|p| p.resources.clone()),
            }),
            tls: Some(EtcdTlsPolicy {
                static_tls: Some(EtcdStaticTls {
                    member: Some(EtcdMemberSecrets {
                        peer_secret: storage_peer_secret(vs),
                        server_secret: storage_server_secret(&name),
                    }),
                    operator_secret: Some(storage_client_secret(&name)),
                }),
            }),
        },
    );
    cluster.metadata = ObjectMeta {
        name: Some(etcd_cluster_name(&name)),
        namespace: Some(namespace_of(vs)),
        labels: Some(selector_labels(&name)),
        owner_references: Some(vec![owner_reference(vs)]),
        ..Default::default()
    };
    cluster
}

/// Create the etcd cluster if it is missing; returns whether it was created.
pub async fn ensure_etcd_cluster<A: ResourceApi>(api: &A, vs: &VaultService) -> Result<bool> {
    let namespace = namespace_of(vs);
    let cluster = build_etcd_cluster(vs);
    let created = api.create(&namespace, &cluster).await?;
    if created {
        info!("Created EtcdCluster {}/{}", namespace, cluster.name_any());
    }
    Ok(created)
}

/// Ready iff every configured member reports ready.
pub fn is_etcd_ready(cluster: &EtcdCluster) -> bool {
    cluster.ready_members() == cluster.spec.size as usize
}

/// Re-fetch the etcd cluster and report whether all members are ready.
pub async fn check_etcd_ready<A: ResourceApi>(api: &A, vs: &VaultService) -> Result<bool> {
    let namespace = namespace_of(vs);
    let name = etcd_cluster_name(&vs.name_any());
    let cluster: EtcdCluster = api
        .get(&namespace, &name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("EtcdCluster {namespace}/{name}")))?;

    let ready = is_etcd_ready(&cluster);
    debug!(
        ready_members = cluster.ready_members(),
        size = cluster.spec.size,
        ready,
        "Checked etcd readiness"
    );
    Ok(ready)
}
