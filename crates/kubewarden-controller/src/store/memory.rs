//! In-memory stand-in for the API server used by reconcile tests.
//!
//! Mirrors the semantics the controllers rely on: every write bumps the
//! resource version, replaces with a stale version conflict, deletion
//! waits for finalizers and status is only written through the status
//! endpoint.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use kube::ResourceExt;
use parking_lot::Mutex;
use serde_json::{Value, json};

use super::{Labels, Object, ObjectStore, StoreError, kind_of};
use crate::crds::{
    AdmissionPolicy, AdmissionPolicyGroup, ClusterAdmissionPolicy, ClusterAdmissionPolicyGroup,
};
use crate::index::PolicyIndex;

type Key = (String, Option<String>, String);

#[derive(Default)]
pub(crate) struct MemoryStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    version: u64,
    failing_deletes: BTreeSet<String>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

fn key<K: Object>(ns: Option<&str>, name: &str) -> Key {
    (kind_of::<K>(), ns.map(str::to_string), name.to_string())
}

fn key_of<K: Object>(obj: &K) -> Key {
    key::<K>(obj.namespace().as_deref(), &obj.name_any())
}

fn not_found<K: Object>(name: &str) -> StoreError {
    StoreError::NotFound {
        kind: kind_of::<K>(),
        name: name.to_string(),
    }
}

fn finalizers(value: &Value) -> bool {
    value["metadata"]["finalizers"]
        .as_array()
        .is_some_and(|f| !f.is_empty())
}

fn is_deleting(value: &Value) -> bool {
    !value["metadata"]["deletionTimestamp"].is_null()
}

/// Drops `null` entries so absent and `null` fields compare equal.
fn prune_nulls(value: &mut Value) {
    if let Some(map) = value.as_object_mut() {
        map.retain(|_, v| !v.is_null());
        map.values_mut().for_each(prune_nulls);
    } else if let Some(items) = value.as_array_mut() {
        items.iter_mut().for_each(prune_nulls);
    }
}

fn merge_string_map(existing: &Value, desired: &mut Value) {
    let Some(existing) = existing.as_object() else {
        return;
    };
    if desired.is_null() {
        *desired = json!({});
    }
    if let Some(desired) = desired.as_object_mut() {
        for (k, v) in existing {
            desired.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Inserts `obj` as if it had been created by someone else.
    pub(crate) fn insert<K: Object>(&self, obj: K) -> K {
        let mut state = self.state.lock();
        let mut value = serde_json::to_value(&obj).expect("serializable object");
        let version = state.next_version();
        value["metadata"]["resourceVersion"] = json!(version);
        if value["metadata"]["uid"].is_null() {
            value["metadata"]["uid"] = json!(format!("uid-{version}"));
        }
        prune_nulls(&mut value);
        state.objects.insert(key_of(&obj), value.clone());
        serde_json::from_value(value).expect("deserializable object")
    }

    pub(crate) fn fetch<K: Object>(&self, ns: Option<&str>, name: &str) -> Option<K> {
        let state = self.state.lock();
        state
            .objects
            .get(&key::<K>(ns, name))
            .map(|v| serde_json::from_value(v.clone()).expect("deserializable object"))
    }

    pub(crate) fn count<K: Object>(&self) -> usize {
        let kind = kind_of::<K>();
        let state = self.state.lock();
        state.objects.keys().filter(|(k, _, _)| *k == kind).count()
    }

    pub(crate) fn all<K: Object>(&self) -> Vec<K> {
        let kind = kind_of::<K>();
        let state = self.state.lock();
        state
            .objects
            .iter()
            .filter(|((k, _, _), _)| *k == kind)
            .map(|(_, v)| serde_json::from_value(v.clone()).expect("deserializable object"))
            .collect()
    }

    /// Relists every policy kind into `index`, as the policy watches do.
    pub(crate) fn sync_index(&self, index: &PolicyIndex) {
        index.reset(self.all::<ClusterAdmissionPolicy>());
        index.reset(self.all::<AdmissionPolicy>());
        index.reset(self.all::<AdmissionPolicyGroup>());
        index.reset(self.all::<ClusterAdmissionPolicyGroup>());
    }

    /// Makes every delete of an object named `name` fail.
    pub(crate) fn fail_deletes_of(&self, name: &str) {
        self.state.lock().failing_deletes.insert(name.to_string());
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: Object>(&self, ns: Option<&str>, name: &str) -> Result<Option<K>, StoreError> {
        let state = self.state.lock();
        match state.objects.get(&key::<K>(ns, name)) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    async fn list<K: Object>(&self, ns: Option<&str>, selector: &Labels) -> Result<Vec<K>, StoreError> {
        let kind = kind_of::<K>();
        let state = self.state.lock();
        state
            .objects
            .iter()
            .filter(|((k, obj_ns, _), _)| *k == kind && (ns.is_none() || obj_ns.as_deref() == ns))
            .filter(|(_, v)| {
                selector
                    .iter()
                    .all(|(lk, lv)| v["metadata"]["labels"][lk].as_str() == Some(lv.as_str()))
            })
            .map(|(_, v)| serde_json::from_value(v.clone()).map_err(StoreError::from))
            .collect()
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K, StoreError> {
        let key = key_of(obj);
        let mut state = self.state.lock();
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: kind_of::<K>(),
                name: obj.name_any(),
            });
        }
        let mut value = serde_json::to_value(obj)?;
        let version = state.next_version();
        value["metadata"]["resourceVersion"] = json!(version);
        value["metadata"]["uid"] = json!(format!("uid-{version}"));
        if let Some(v) = value.as_object_mut() {
            v.remove("status");
        }
        prune_nulls(&mut value);
        state.objects.insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    async fn replace<K: Object>(&self, obj: &K) -> Result<K, StoreError> {
        let key = key_of(obj);
        let name = obj.name_any();
        let mut state = self.state.lock();
        let Some(existing) = state.objects.get(&key).cloned() else {
            return Err(not_found::<K>(&name));
        };
        if existing["metadata"]["resourceVersion"].as_str() != obj.resource_version().as_deref() {
            return Err(StoreError::Conflict {
                kind: kind_of::<K>(),
                name,
                message: "the object has been modified; please apply your changes to the latest version and try again".into(),
            });
        }
        let mut value = serde_json::to_value(obj)?;
        value["status"] = existing["status"].clone();
        value["metadata"]["deletionTimestamp"] = existing["metadata"]["deletionTimestamp"].clone();
        value["metadata"]["uid"] = existing["metadata"]["uid"].clone();
        if is_deleting(&value) && !finalizers(&value) {
            state.objects.remove(&key);
            return Ok(serde_json::from_value(value)?);
        }
        value["metadata"]["resourceVersion"] = json!(state.next_version());
        prune_nulls(&mut value);
        state.objects.insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    async fn apply<K: Object>(&self, obj: &K) -> Result<K, StoreError> {
        let key = key_of(obj);
        let mut state = self.state.lock();
        let mut desired = serde_json::to_value(obj)?;
        let Some(existing) = state.objects.get(&key).cloned() else {
            let version = state.next_version();
            desired["metadata"]["resourceVersion"] = json!(version);
            desired["metadata"]["uid"] = json!(format!("uid-{version}"));
            prune_nulls(&mut desired);
            state.objects.insert(key, desired.clone());
            return Ok(serde_json::from_value(desired)?);
        };
        for field in ["labels", "annotations"] {
            merge_string_map(&existing["metadata"][field], &mut desired["metadata"][field]);
        }
        for field in ["uid", "resourceVersion", "deletionTimestamp", "finalizers"] {
            desired["metadata"][field] = existing["metadata"][field].clone();
        }
        desired["status"] = existing["status"].clone();
        prune_nulls(&mut desired);
        if desired == existing {
            return Ok(serde_json::from_value(existing)?);
        }
        desired["metadata"]["resourceVersion"] = json!(state.next_version());
        state.objects.insert(key, desired.clone());
        Ok(serde_json::from_value(desired)?)
    }

    async fn delete<K: Object>(&self, ns: Option<&str>, name: &str) -> Result<(), StoreError> {
        let key = key::<K>(ns, name);
        let mut state = self.state.lock();
        if state.failing_deletes.contains(name) {
            return Err(StoreError::Conflict {
                kind: kind_of::<K>(),
                name: name.to_string(),
                message: "injected failure".into(),
            });
        }
        let Some(mut value) = state.objects.get(&key).cloned() else {
            return Err(not_found::<K>(name));
        };
        if !finalizers(&value) {
            state.objects.remove(&key);
            return Ok(());
        }
        if !is_deleting(&value) {
            value["metadata"]["deletionTimestamp"] = json!("2026-01-01T00:00:00Z");
            value["metadata"]["resourceVersion"] = json!(state.next_version());
            state.objects.insert(key, value);
        }
        Ok(())
    }

    async fn patch_status<K: Object>(
        &self,
        ns: Option<&str>,
        name: &str,
        status: &Value,
    ) -> Result<(), StoreError> {
        let key = key::<K>(ns, name);
        let mut state = self.state.lock();
        let Some(mut value) = state.objects.get(&key).cloned() else {
            return Err(not_found::<K>(name));
        };
        value["status"] = status.clone();
        value["metadata"]["resourceVersion"] = json!(state.next_version());
        prune_nulls(&mut value);
        state.objects.insert(key, value);
        Ok(())
    }
}
