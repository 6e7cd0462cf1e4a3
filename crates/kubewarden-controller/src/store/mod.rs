//! Access to the cluster object store.
//!
//! Controllers only talk to the API server through [`ObjectStore`], which
//! keeps reconcile logic independent from the transport and lets the
//! reconcile flows run against an in-memory store in tests.

use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;
use kube::Resource;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

mod kube_store;
#[cfg(test)]
pub(crate) mod memory;

pub use kube_store::KubeStore;

/// Label selector as `key=value` pairs that must all match.
pub type Labels = BTreeMap<String, String>;

pub trait Object:
    Resource<DynamicType = ()> + Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> Object for K where
    K: Resource<DynamicType = ()> + Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: String, name: String },
    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: String, name: String },
    #[error("conflict on {kind} {name:?}: {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn get<K: Object>(&self, ns: Option<&str>, name: &str) -> Result<Option<K>, StoreError>;

    /// Lists objects of kind `K` in `ns` (all namespaces when `None`) carrying
    /// every label in `selector`.
    async fn list<K: Object>(&self, ns: Option<&str>, selector: &Labels) -> Result<Vec<K>, StoreError>;

    async fn create<K: Object>(&self, obj: &K) -> Result<K, StoreError>;

    /// Replaces `obj`, failing with [`StoreError::Conflict`] when its
    /// resource version is stale.
    async fn replace<K: Object>(&self, obj: &K) -> Result<K, StoreError>;

    /// Server-side apply of the desired shape of `obj`.
    async fn apply<K: Object>(&self, obj: &K) -> Result<K, StoreError>;

    /// Requests deletion. Objects with finalizers stay around, marked as
    /// deleting, until their finalizers are removed.
    async fn delete<K: Object>(&self, ns: Option<&str>, name: &str) -> Result<(), StoreError>;

    async fn patch_status<K: Object>(
        &self,
        ns: Option<&str>,
        name: &str,
        status: &serde_json::Value,
    ) -> Result<(), StoreError>;
}

pub(crate) fn kind_of<K: Object>() -> String {
    K::kind(&()).into_owned()
}
