//! VaultService reconciliation
//!
//! One pass runs a fixed sequence of idempotent steps and stops at the first
//! unmet precondition. Passes for different VaultServices may run
//! concurrently; all shared state lives in the cluster.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kube::{
    api::Api,
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    Resource, ResourceExt,
};
use tracing::{error, info, instrument, warn};

use super::api::{update_status_with_retry, KubeResourceApi, ResourceApi};
use super::constants::{namespace_of, CONTROLLER_NAME};
use super::health::{HealthProbe, HttpsHealthProbe};
use super::{etcd, resources, status, tls, upgrade, vault_config};
use crate::config::OperatorConfig;
use crate::crd::{EtcdCluster, VaultService, VaultServicePhase};
use crate::error::{Error, Result, StageContext};

const RETRIABLE_BASE_DELAY: Duration = Duration::from_secs(5);
const FATAL_BASE_DELAY: Duration = Duration::from_secs(60);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Shared state for the VaultService controller
pub struct Context<A = KubeResourceApi, P = HttpsHealthProbe> {
    pub api: A,
    pub probe: P,
    pub config: OperatorConfig,
    /// Consecutive failures per VaultService, for backoff
    failures: Mutex<HashMap<String, u32>>,
}

impl<A: ResourceApi, P: HealthProbe> Context<A, P> {
    pub fn new(api: A, probe: P, config: OperatorConfig) -> Self {
        Self {
            api,
            probe,
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn record_failure(&self, key: &str) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    fn reset_failures(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

/// How a reconciliation pass ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassOutcome {
    /// The VaultService no longer exists
    Gone,
    /// Defaults were written; the resulting update event re-enters
    Defaulted,
    /// etcd is not ready yet
    WaitingForStorage,
    Synced { status_written: bool, stepped_down: bool },
}

fn object_key(vs: &VaultService) -> String {
    format!("{}/{}", namespace_of(vs), vs.name_any())
}

/// Delay before retrying after `failures` consecutive failures
pub fn backoff_delay(retriable: bool, failures: u32) -> Duration {
    let base = if retriable {
        RETRIABLE_BASE_DELAY
    } else {
        FATAL_BASE_DELAY
    };
    let exp = failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp).min(MAX_BACKOFF)
}

/// Persist a validation failure where users look for it
async fn report_invalid<A: ResourceApi>(api: &A, vs: &VaultService, message: &str) -> Result<()> {
    let namespace = namespace_of(vs);
    let message = format!("invalid spec: {message}");
    update_status_with_retry(api, &namespace, &vs.name_any(), |fresh: &mut VaultService| {
        let status = fresh.status.get_or_insert_with(Default::default);
        if status.message.as_deref() == Some(message.as_str()) {
            return false;
        }
        status.message = Some(message.clone());
        true
    })
    .await?;
    Ok(())
}

/// Run one reconciliation pass against the latest stored VaultService.
pub async fn reconcile_pass<A, P>(ctx: &Context<A, P>, obj: &VaultService) -> Result<PassOutcome>
where
    A: ResourceApi,
    P: HealthProbe,
{
    let api = &ctx.api;
    let namespace = namespace_of(obj);
    let name = obj.name_any();

    // 1. Fetch and default
    let Some(mut vs) = api
        .get::<VaultService>(&namespace, &name)
        .await
        .stage("fetch VaultService")?
    else {
        #[cfg(feature = "metrics")]
        super::metrics::remove_cluster(&namespace, &name);
        return Ok(PassOutcome::Gone);
    };

    let defaulted = vs.set_defaults();
    if defaulted.any() {
        let status = vs.status.clone();
        if defaulted.spec {
            vs = api.replace(&namespace, &vs).await.stage("set defaults")?;
        }
        if defaulted.status {
            vs.status = status;
            api.replace_status(&namespace, &vs)
                .await
                .stage("set default status")?;
        }
        info!("Applied defaults to VaultService {}/{}", namespace, name);
        return Ok(PassOutcome::Defaulted);
    }

    if let Err(e) = vs.spec.validate() {
        warn!("Validation failed for {}/{}: {}", namespace, name, e);
        report_invalid(api, &vs, &e).await.stage("report invalid spec")?;
        return Err(Error::ValidationError(e));
    }

    // 2. Bring up etcd before Vault ever starts
    if vs.phase() == Some(VaultServicePhase::Initial) {
        tls::ensure_storage_tls(api, &vs, &ctx.config.cluster_domain)
            .await
            .stage("ensure etcd TLS")?;
        etcd::ensure_etcd_cluster(api, &vs)
            .await
            .stage("ensure etcd cluster")?;
        if !etcd::check_etcd_ready(api, &vs)
            .await
            .stage("check etcd readiness")?
        {
            info!("etcd cluster for {}/{} is not ready yet", namespace, name);
            return Ok(PassOutcome::WaitingForStorage);
        }
    }

    // 3. Vault TLS, configuration and workload
    tls::ensure_vault_tls(api, &vs)
        .await
        .stage("ensure Vault TLS")?;
    vault_config::ensure_config(api, &vs)
        .await
        .stage("ensure Vault config")?;
    resources::ensure_deployment(api, &vs)
        .await
        .stage("ensure Vault deployment")?;

    // 4. Replica count
    resources::sync_cluster_size(api, &vs)
        .await
        .stage("sync cluster size")?;

    // 5. Observe
    let observed = status::get_vault_status(api, &ctx.probe, &vs)
        .await
        .stage("get Vault status")?;
    #[cfg(feature = "metrics")]
    super::metrics::set_cluster_status(&namespace, &name, &observed);

    // 6. Upgrade
    let plan = upgrade::sync_upgrade(api, &vs, &observed)
        .await
        .stage("sync upgrade")?;
    #[cfg(feature = "metrics")]
    {
        if plan.step_down.is_some() {
            super::metrics::inc_stepdown(&namespace, &name);
        }
    }

    // 7. Persist
    let status_written = status::update_vault_status(api, &vs, &observed)
        .await
        .stage("update status")?;

    Ok(PassOutcome::Synced {
        status_written,
        stepped_down: plan.step_down.is_some(),
    })
}

/// Main reconciliation entry point for the controller runtime
#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
pub async fn reconcile<A, P>(obj: Arc<VaultService>, ctx: Arc<Context<A, P>>) -> Result<Action>
where
    A: ResourceApi,
    P: HealthProbe,
{
    let started = Instant::now();
    let result = reconcile_pass(&ctx, &obj).await;

    #[cfg(feature = "metrics")]
    super::metrics::observe_reconcile_duration_seconds(
        CONTROLLER_NAME,
        started.elapsed().as_secs_f64(),
    );
    #[cfg(not(feature = "metrics"))]
    let _ = started;

    let outcome = result?;
    ctx.reset_failures(&object_key(&obj));
    info!(?outcome, "Reconciled VaultService");

    Ok(match outcome {
        PassOutcome::Gone => Action::await_change(),
        _ => Action::requeue(ctx.config.resync_interval()),
    })
}

/// Requeue with exponential backoff per VaultService
pub fn error_policy<A, P>(obj: Arc<VaultService>, error: &Error, ctx: Arc<Context<A, P>>) -> Action
where
    A: ResourceApi,
    P: HealthProbe,
{
    let failures = ctx.record_failure(&object_key(&obj));
    let delay = backoff_delay(error.is_retriable(), failures);

    #[cfg(feature = "metrics")]
    super::metrics::inc_reconcile_error(CONTROLLER_NAME, error.kind());

    if error.is_retriable() {
        warn!(
            error = %error,
            kind = error.kind(),
            failures,
            "Reconcile of {} failed, retrying in {:?}",
            object_key(&obj),
            delay
        );
    } else {
        error!(
            error = %error,
            kind = error.kind(),
            failures,
            "Reconcile of {} failed, retrying in {:?}",
            object_key(&obj),
            delay
        );
    }
    Action::requeue(delay)
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = kube::core::NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Main entry point to start the VaultService controller
pub async fn run_controller(client: Client, ctx: Arc<Context>) -> Result<()> {
    let namespace = ctx.config.namespace.as_deref();
    let services: Api<VaultService> = scoped_api(&client, namespace);

    info!(
        namespace = namespace.unwrap_or("*"),
        "Starting VaultService controller"
    );

    // Verify CRD exists
    match services.list(&Default::default()).await {
        Ok(_) => info!("VaultService CRD is available"),
        Err(e) => {
            error!("VaultService CRD not found: {:?}", e);
            return Err(Error::ConfigError(
                "VaultService CRD not installed".to_string(),
            ));
        }
    }

    let owned = Config::default().labels("app=vault");
    Controller::new(services, Config::default())
        .owns::<Deployment>(scoped_api(&client, namespace), owned.clone())
        .owns::<Service>(scoped_api(&client, namespace), owned.clone())
        .owns::<ConfigMap>(scoped_api(&client, namespace), owned.clone())
        .owns::<Secret>(scoped_api(&client, namespace), owned.clone())
        .owns::<EtcdCluster>(scoped_api(&client, namespace), owned)
        .shutdown_on_signal()
        .run(
            reconcile::<KubeResourceApi, HttpsHealthProbe>,
            error_policy::<KubeResourceApi, HttpsHealthProbe>,
            ctx,
        )
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => info!("Reconciled VaultService {}", obj),
                Err(e) => warn!("Reconcile error: {}", e),
            }
        })
        .await;

    Ok(())
}
