//! Generic access to namespaced Kubernetes objects
//!
//! The reconciler talks to the cluster only through [`ResourceApi`], which
//! folds the idempotence rules into the verbs themselves: creating an object
//! that already exists and deleting one that is already gone both succeed.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Attempts made by [`update_with_retry`] before a conflict is surfaced
pub const MAX_CONFLICT_RETRIES: usize = 3;

/// Any namespaced object type the operator reads or writes
pub trait Managed:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> Managed for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[async_trait]
pub trait ResourceApi: Send + Sync {
    /// `None` when the object does not exist
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// Returns `false` when an object with that name already exists
    async fn create<K: Managed>(&self, namespace: &str, obj: &K) -> Result<bool>;

    /// Optimistic-concurrency update; a stale resourceVersion is a conflict error
    async fn replace<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Same as [`ResourceApi::replace`] against the status subresource
    async fn replace_status<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Returns `false` when the object was already gone
    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Objects carrying every label in `labels`
    async fn list<K: Managed>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>>;
}

/// [`ResourceApi`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeResourceApi {
    client: Client,
}

impl KubeResourceApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: Managed>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn object_name<K: Managed>(obj: &K) -> Result<String> {
    obj.meta()
        .name
        .clone()
        .ok_or_else(|| Error::MissingField(format!("{}.metadata.name", K::kind(&()))))
}

pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ResourceApi for KubeResourceApi {
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn create<K: Managed>(&self, namespace: &str, obj: &K) -> Result<bool> {
        match self.api::<K>(namespace).create(&PostParams::default(), obj).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 && e.reason == "AlreadyExists" => {
                debug!(kind = %K::kind(&()), name = %obj.name_any(), "object already exists");
                Ok(false)
            }
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn replace<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = object_name(obj)?;
        Ok(self
            .api::<K>(namespace)
            .replace(&name, &PostParams::default(), obj)
            .await?)
    }

    async fn replace_status<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = object_name(obj)?;
        let body = serde_json::to_vec(obj)?;
        Ok(self
            .api::<K>(namespace)
            .replace_status(&name, &PostParams::default(), body)
            .await?)
    }

    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<bool> {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn list<K: Managed>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>> {
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(self.api::<K>(namespace).list(&params).await?.items)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Target {
    Object,
    Status,
}

/// Fetch, mutate and replace an existing object.
///
/// `mutate` returns whether it changed anything; nothing is written when it
/// did not. A conflicting concurrent write re-fetches the object and applies
/// the mutation again, up to [`MAX_CONFLICT_RETRIES`] attempts.
pub async fn update_with_retry<K, A, F>(api: &A, namespace: &str, name: &str, mutate: F) -> Result<bool>
where
    K: Managed,
    A: ResourceApi,
    F: FnMut(&mut K) -> bool + Send,
{
    retry_update(api, namespace, name, mutate, Target::Object).await
}

/// [`update_with_retry`] against the status subresource
pub async fn update_status_with_retry<K, A, F>(
    api: &A,
    namespace: &str,
    name: &str,
    mutate: F,
) -> Result<bool>
where
    K: Managed,
    A: ResourceApi,
    F: FnMut(&mut K) -> bool + Send,
{
    retry_update(api, namespace, name, mutate, Target::Status).await
}

async fn retry_update<K, A, F>(
    api: &A,
    namespace: &str,
    name: &str,
    mut mutate: F,
    target: Target,
) -> Result<bool>
where
    K: Managed,
    A: ResourceApi,
    F: FnMut(&mut K) -> bool + Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut obj: K = api
            .get(namespace, name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} {namespace}/{name}", K::kind(&()))))?;

        if !mutate(&mut obj) {
            return Ok(false);
        }

        let written = match target {
            Target::Object => api.replace(namespace, &obj).await,
            Target::Status => api.replace_status(namespace, &obj).await,
        };
        match written {
            Ok(_) => return Ok(true),
            Err(e) if e.is_conflict() && attempt < MAX_CONFLICT_RETRIES => {
                warn!(
                    kind = %K::kind(&()),
                    %namespace,
                    %name,
                    attempt,
                    "Update conflict, retrying from a fresh read"
                );
            }
            Err(e) => return Err(e),
        }
    }
}
