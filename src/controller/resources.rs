//! Vault Deployment and Service, owner references and replica sync

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, ExecAction,
    HTTPGetAction, KeyToPath, PodSecurityContext, PodSpec, PodTemplateSpec, Probe,
    ProjectedVolumeSource, ResourceRequirements, SecretProjection, SecurityContext, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount, VolumeProjection,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use tracing::info;

use super::api::{update_with_retry, ResourceApi};
use super::constants::*;
use crate::crd::VaultService;
use crate::error::Result;

// ============================================================================
// Helpers
// ============================================================================

pub fn owner_reference(vs: &VaultService) -> OwnerReference {
    OwnerReference {
        api_version: VaultService::api_version(&()).to_string(),
        kind: VaultService::kind(&()).to_string(),
        name: vs.name_any(),
        uid: vs.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn object_meta(vs: &VaultService, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(namespace_of(vs)),
        labels: Some(selector_labels(&vs.name_any())),
        owner_references: Some(vec![owner_reference(vs)]),
        ..Default::default()
    }
}

fn pod_resources(vs: &VaultService) -> Option<ResourceRequirements> {
    vs.spec.pod.as_ref().and_then(|p| p.resources.clone())
}

fn tcp_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

// ============================================================================
// Deployment
// ============================================================================

pub fn build_deployment(vs: &VaultService) -> Deployment {
    let labels = selector_labels(&vs.name_any());
    Deployment {
        metadata: object_meta(vs, vs.name_any()),
        spec: Some(DeploymentSpec {
            replicas: Some(vs.spec.nodes),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: build_pod_template(vs, &labels),
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_unavailable: Some(IntOrString::Int(1)),
                    max_surge: Some(IntOrString::Int(1)),
                }),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_pod_template(vs: &VaultService, labels: &BTreeMap<String, String>) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            name: Some(vs.name_any()),
            labels: Some(labels.clone()),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![build_vault_container(vs), build_exporter_container(vs)],
            volumes: Some(vec![
                Volume {
                    name: VAULT_CONFIG_VOLUME.to_string(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: Some(config_copy_name(vs)),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                build_tls_volume(vs),
            ]),
            security_context: Some(PodSecurityContext {
                run_as_user: Some(VAULT_RUN_AS),
                run_as_non_root: Some(true),
                fs_group: Some(VAULT_RUN_AS),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}

/// etcd client assets and the Vault server assets, projected into one directory
fn build_tls_volume(vs: &VaultService) -> Volume {
    let project = |secret: String, keys: &[&str]| VolumeProjection {
        secret: Some(SecretProjection {
            name: Some(secret),
            items: Some(
                keys.iter()
                    .map(|k| KeyToPath {
                        key: k.to_string(),
                        path: k.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    };

    Volume {
        name: VAULT_TLS_VOLUME.to_string(),
        projected: Some(ProjectedVolumeSource {
            sources: Some(vec![
                project(
                    storage_client_secret(&vs.name_any()),
                    &[STORAGE_CLIENT_CA, STORAGE_CLIENT_CERT, STORAGE_CLIENT_KEY],
                ),
                project(vault_server_secret(vs), &[SERVER_CA, SERVER_CERT, SERVER_KEY]),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_vault_container(vs: &VaultService) -> Container {
    Container {
        name: VAULT_CONTAINER.to_string(),
        image: Some(vs.spec.vault_image()),
        command: Some(vec![
            "/bin/vault".to_string(),
            "server".to_string(),
            format!("-config={VAULT_CONFIG_DIR}/{VAULT_CONFIG_FILE}"),
        ]),
        env: Some(vec![
            EnvVar {
                name: "VAULT_API_ADDR".to_string(),
                value: Some(vault_service_url(vs, VAULT_CLIENT_PORT)),
                ..Default::default()
            },
            EnvVar {
                name: "VAULT_CLUSTER_ADDR".to_string(),
                value: Some(vault_service_url(vs, VAULT_CLUSTER_PORT)),
                ..Default::default()
            },
        ]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: VAULT_CONFIG_VOLUME.to_string(),
                mount_path: VAULT_CONFIG_DIR.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: VAULT_TLS_VOLUME.to_string(),
                mount_path: VAULT_TLS_DIR.to_string(),
                ..Default::default()
            },
        ]),
        security_context: Some(SecurityContext {
            capabilities: Some(Capabilities {
                // Vault mlocks its memory so secrets never reach swap
                add: Some(vec!["IPC_LOCK".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ports: Some(vec![
            tcp_port(VAULT_CLIENT_PORT_NAME, VAULT_CLIENT_PORT),
            tcp_port(VAULT_CLUSTER_PORT_NAME, VAULT_CLUSTER_PORT),
        ]),
        liveness_probe: Some(Probe {
            exec: Some(ExecAction {
                command: Some(vec![
                    "curl".to_string(),
                    "--connect-timeout".to_string(),
                    "5".to_string(),
                    "--max-time".to_string(),
                    "10".to_string(),
                    "-k".to_string(),
                    "-s".to_string(),
                    format!("https://localhost:{VAULT_CLIENT_PORT}{HEALTH_PATH}"),
                ]),
            }),
            initial_delay_seconds: Some(10),
            timeout_seconds: Some(10),
            period_seconds: Some(60),
            failure_threshold: Some(3),
            ..Default::default()
        }),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some(HEALTH_PATH.to_string()),
                port: IntOrString::Int(VAULT_CLIENT_PORT),
                scheme: Some("HTTPS".to_string()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(10),
            timeout_seconds: Some(10),
            period_seconds: Some(10),
            failure_threshold: Some(3),
            ..Default::default()
        }),
        resources: pod_resources(vs),
        ..Default::default()
    }
}

fn build_exporter_container(vs: &VaultService) -> Container {
    Container {
        name: EXPORTER_CONTAINER.to_string(),
        image: Some(EXPORTER_IMAGE.to_string()),
        ports: Some(vec![
            ContainerPort {
                name: Some("statsd".to_string()),
                container_port: STATSD_PORT,
                protocol: Some("UDP".to_string()),
                ..Default::default()
            },
            tcp_port("prometheus", PROMETHEUS_PORT),
        ]),
        resources: pod_resources(vs),
        ..Default::default()
    }
}

// ============================================================================
// Service
// ============================================================================

pub fn build_service(vs: &VaultService) -> Service {
    let port = |name: &str, port: i32| ServicePort {
        name: Some(name.to_string()),
        protocol: Some("TCP".to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        ..Default::default()
    };

    Service {
        metadata: object_meta(vs, vs.name_any()),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(&vs.name_any())),
            ports: Some(vec![
                port(VAULT_CLIENT_PORT_NAME, VAULT_CLIENT_PORT),
                port(VAULT_CLUSTER_PORT_NAME, VAULT_CLUSTER_PORT),
                port("prometheus", PROMETHEUS_PORT),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// ============================================================================
// Ensure
// ============================================================================

/// Create the Vault deployment and service if missing.
///
/// Existing objects are left untouched here; replica count and image are
/// converged separately so the selector is only ever written at creation.
pub async fn ensure_deployment<A: ResourceApi>(api: &A, vs: &VaultService) -> Result<usize> {
    let namespace = namespace_of(vs);
    let mut created = 0;

    let deployment = build_deployment(vs);
    if api.create(&namespace, &deployment).await? {
        info!("Created Deployment {}/{}", namespace, deployment.name_any());
        created += 1;
    }

    let service = build_service(vs);
    if api.create(&namespace, &service).await? {
        info!("Created Service {}/{}", namespace, service.name_any());
        created += 1;
    }
    Ok(created)
}

/// Align the deployment's replica count with `spec.nodes`; returns whether it changed.
pub async fn sync_cluster_size<A: ResourceApi>(api: &A, vs: &VaultService) -> Result<bool> {
    let namespace = namespace_of(vs);
    let name = vs.name_any();
    let desired = vs.spec.nodes;

    let changed = update_with_retry(api, &namespace, &name, |d: &mut Deployment| {
        let spec = d.spec.get_or_insert_with(Default::default);
        if spec.replicas == Some(desired) {
            return false;
        }
        spec.replicas = Some(desired);
        true
    })
    .await?;

    if changed {
        info!("Resized Vault cluster {}/{} to {} nodes", namespace, name, desired);
    }
    Ok(changed)
}

// ============================================================================
// Tests
// ============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::VaultServiceSpec;

    fn mock_vault() -> VaultService {
        let mut vs = VaultService::new("example", VaultServiceSpec::default());
        vs.metadata.namespace = Some("vault".to_string());
        vs.metadata.uid = Some("vs-uid".to_string());
        vs.set_defaults();
        vs.spec.nodes = 2;
        vs
    }

    #[test]
    fn test_owner_reference() {
        let owner = owner_reference(&mock_vault());
        assert_eq!(owner.api_version, "vault.security.coreos.com/v1alpha1");
        assert_eq!(owner.kind, "VaultService");
        assert_eq!(owner.uid, "vs-uid");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn test_build_deployment() {
        let deploy = build_deployment(&mock_vault());
        let spec = deploy.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(spec.selector.match_labels.unwrap()["vault_cluster"], "example");

        let rolling = spec.strategy.unwrap().rolling_update.unwrap();
        assert_eq!(rolling.max_unavailable, Some(IntOrString::Int(1)));
        assert_eq!(rolling.max_surge, Some(IntOrString::Int(1)));

        let pod = spec.template.spec.unwrap();
        let vault = &pod.containers[0];
        assert_eq!(vault.name, "vault");
        assert_eq!(vault.image.as_deref(), Some("quay.io/coreos/vault:0.9.1-0"));
        assert_eq!(
            vault.security_context.as_ref().unwrap().capabilities.as_ref().unwrap().add,
            Some(vec!["IPC_LOCK".to_string()])
        );
        let env = vault.env.as_ref().unwrap();
        assert_eq!(env[0].value.as_deref(), Some("https://example.vault.svc:8200"));
        assert_eq!(env[1].value.as_deref(), Some("https://example.vault.svc:8201"));
        assert_eq!(vault.liveness_probe.as_ref().unwrap().period_seconds, Some(60));
        assert_eq!(pod.containers[1].name, "statsd-exporter");

        let volumes = pod.volumes.unwrap();
        assert_eq!(
            volumes[0].config_map.as_ref().unwrap().name.as_deref(),
            Some("example-copy")
        );
        let sources = volumes[1].projected.as_ref().unwrap().sources.as_ref().unwrap();
        let secret_names: Vec<_> = sources
            .iter()
            .map(|s| s.secret.as_ref().unwrap().name.clone().unwrap())
            .collect();
        assert_eq!(
            secret_names,
            vec!["example-etcd-client-tls", "example-default-vault-server-tls"]
        );
    }

    #[test]
    fn test_build_service() {
        let svc = build_service(&mock_vault());
        assert_eq!(svc.name_any(), "example");
        let ports: Vec<i32> = svc.spec.unwrap().ports.unwrap().iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![8200, 8201, 9102]);
    }
}
