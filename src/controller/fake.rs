//! In-memory stand-ins for the cluster and for Vault pods, used by tests
//!
//! `FakeApi` stores objects as JSON keyed by kind, namespace and name. It
//! assigns UIDs and resource versions, rejects stale replaces, counts every
//! successful write and garbage-collects dependents by owner UID on delete.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::core::ErrorResponse;
use kube::ResourceExt;
use serde_json::Value;

use super::api::{Managed, ResourceApi};
use super::health::{HealthProbe, VaultHealth};
use crate::error::{Error, Result};

type Key = (String, String, String);

#[derive(Default)]
struct Store {
    objects: BTreeMap<Key, Value>,
    next_uid: u64,
    next_version: u64,
    writes: Vec<String>,
    pending_conflicts: usize,
}

#[derive(Default)]
pub struct FakeApi {
    store: Mutex<Store>,
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn key<K: Managed>(namespace: &str, name: &str) -> Key {
    (K::kind(&()).to_string(), namespace.to_string(), name.to_string())
}

fn resource_version(value: &Value) -> Option<String> {
    value["metadata"]["resourceVersion"].as_str().map(String::from)
}

fn owner_uids(value: &Value) -> Vec<String> {
    value["metadata"]["ownerReferences"]
        .as_array()
        .map(|refs| {
            refs.iter()
                .filter_map(|r| r["uid"].as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().unwrap()
    }

    /// Insert or overwrite an object without counting it as an operator write
    pub fn seed<K: Managed>(&self, obj: &K) -> K {
        let ns = obj.namespace().unwrap_or_else(|| "default".to_string());
        let mut store = self.lock();
        let mut value = serde_json::to_value(obj).unwrap();
        store.next_version += 1;
        let version = store.next_version.to_string();
        if value["metadata"]["uid"].is_null() {
            store.next_uid += 1;
            value["metadata"]["uid"] = Value::String(format!("uid-{}", store.next_uid));
        }
        value["metadata"]["resourceVersion"] = Value::String(version);
        store
            .objects
            .insert(key::<K>(&ns, &obj.name_any()), value.clone());
        serde_json::from_value(value).unwrap()
    }

    /// Read an object directly, bypassing the trait
    pub fn peek<K: Managed>(&self, namespace: &str, name: &str) -> Option<K> {
        self.lock()
            .objects
            .get(&key::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    /// Remove an object the way an outside actor would
    pub fn remove<K: Managed>(&self, namespace: &str, name: &str) {
        let mut store = self.lock();
        Self::delete_cascade(&mut store, &key::<K>(namespace, name));
    }

    /// Every successful write, as `"<verb> <Kind> <name>"`
    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    pub fn count<K: Managed>(&self) -> usize {
        let kind = K::kind(&()).to_string();
        self.lock().objects.keys().filter(|(k, _, _)| *k == kind).count()
    }

    /// Make the next `n` replace calls fail with a conflict
    pub fn inject_conflicts(&self, n: usize) {
        self.lock().pending_conflicts = n;
    }

    fn record(store: &mut Store, verb: &str, kind: &str, name: &str) {
        store.writes.push(format!("{verb} {kind} {name}"));
    }

    fn delete_cascade(store: &mut Store, root: &Key) -> bool {
        let Some(removed) = store.objects.remove(root) else {
            return false;
        };
        let mut orphaned: Vec<String> = removed["metadata"]["uid"]
            .as_str()
            .map(|uid| vec![uid.to_string()])
            .unwrap_or_default();
        while let Some(uid) = orphaned.pop() {
            let dependents: Vec<Key> = store
                .objects
                .iter()
                .filter(|(_, v)| owner_uids(v).contains(&uid))
                .map(|(k, _)| k.clone())
                .collect();
            for dep in dependents {
                if let Some(v) = store.objects.remove(&dep) {
                    if let Some(dep_uid) = v["metadata"]["uid"].as_str() {
                        orphaned.push(dep_uid.to_string());
                    }
                }
            }
        }
        true
    }

    fn write_existing<K: Managed>(&self, namespace: &str, obj: &K, status_only: bool) -> Result<K> {
        let name = obj.name_any();
        let k = key::<K>(namespace, &name);
        let mut store = self.lock();
        if store.pending_conflicts > 0 {
            store.pending_conflicts -= 1;
            return Err(api_error(409, "Conflict", format!("{name}: injected conflict")));
        }
        let Some(current) = store.objects.get(&k).cloned() else {
            return Err(api_error(404, "NotFound", format!("{name} not found")));
        };
        let incoming = serde_json::to_value(obj)?;
        if let Some(rv) = resource_version(&incoming) {
            if Some(rv) != resource_version(&current) {
                return Err(api_error(
                    409,
                    "Conflict",
                    format!("{name}: the object has been modified"),
                ));
            }
        }

        let mut next = if status_only {
            let mut next = current.clone();
            next["status"] = incoming["status"].clone();
            next
        } else {
            let mut next = incoming;
            next["metadata"]["uid"] = current["metadata"]["uid"].clone();
            if !current["status"].is_null() {
                next["status"] = current["status"].clone();
            }
            next
        };
        store.next_version += 1;
        next["metadata"]["resourceVersion"] = Value::String(store.next_version.to_string());
        store.objects.insert(k, next.clone());
        let verb = if status_only { "replace_status" } else { "replace" };
        Self::record(&mut store, verb, K::kind(&()).as_ref(), &name);
        Ok(serde_json::from_value(next)?)
    }
}

#[async_trait]
impl ResourceApi for FakeApi {
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let value = self.lock().objects.get(&key::<K>(namespace, name)).cloned();
        Ok(value.map(serde_json::from_value::<K>).transpose()?)
    }

    async fn create<K: Managed>(&self, namespace: &str, obj: &K) -> Result<bool> {
        let name = obj.name_any();
        let k = key::<K>(namespace, &name);
        let mut store = self.lock();
        if store.objects.contains_key(&k) {
            return Ok(false);
        }
        let mut value = serde_json::to_value(obj)?;
        store.next_uid += 1;
        store.next_version += 1;
        value["metadata"]["uid"] = Value::String(format!("uid-{}", store.next_uid));
        value["metadata"]["namespace"] = Value::String(namespace.to_string());
        value["metadata"]["resourceVersion"] = Value::String(store.next_version.to_string());
        store.objects.insert(k, value);
        Self::record(&mut store, "create", K::kind(&()).as_ref(), &name);
        Ok(true)
    }

    async fn replace<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K> {
        self.write_existing(namespace, obj, false)
    }

    async fn replace_status<K: Managed>(&self, namespace: &str, obj: &K) -> Result<K> {
        self.write_existing(namespace, obj, true)
    }

    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<bool> {
        let mut store = self.lock();
        let deleted = Self::delete_cascade(&mut store, &key::<K>(namespace, name));
        if deleted {
            Self::record(&mut store, "delete", K::kind(&()).as_ref(), name);
        }
        Ok(deleted)
    }

    async fn list<K: Managed>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>> {
        let kind = K::kind(&()).to_string();
        let store = self.lock();
        store
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .filter(|(_, v)| {
                labels
                    .iter()
                    .all(|(lk, lv)| v["metadata"]["labels"][lk].as_str() == Some(lv.as_str()))
            })
            .map(|(_, v)| serde_json::from_value(v.clone()).map_err(Error::from))
            .collect()
    }
}

/// Health answers scripted per pod name; unscripted pods are unreachable
#[derive(Default)]
pub struct ScriptedProbe {
    answers: Mutex<HashMap<String, VaultHealth>>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, pod: &str, health: VaultHealth) {
        self.answers.lock().unwrap().insert(pod.to_string(), health);
    }

    pub fn forget(&self, pod: &str) {
        self.answers.lock().unwrap().remove(pod);
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn check(&self, pod: &Pod, _ca_pem: &str) -> Result<VaultHealth> {
        self.answers
            .lock()
            .unwrap()
            .get(&pod.name_any())
            .copied()
            .ok_or_else(|| Error::UnhealthyMember(format!("pod {} is unreachable", pod.name_any())))
    }
}

pub const ACTIVE: VaultHealth = VaultHealth {
    initialized: true,
    sealed: false,
    standby: false,
};

pub const STANDBY: VaultHealth = VaultHealth {
    initialized: true,
    sealed: false,
    standby: true,
};

pub const SEALED: VaultHealth = VaultHealth {
    initialized: true,
    sealed: true,
    standby: true,
};
