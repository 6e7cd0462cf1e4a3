use async_trait::async_trait;
use kube::{
    Api, Client, ResourceExt,
    api::{
        ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
    },
};

use super::{Labels, Object, ObjectStore, StoreError, kind_of};
use crate::config::FIELD_MANAGER;

/// [`ObjectStore`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: Object>(&self, ns: Option<&str>) -> Api<DynamicObject> {
        let ar = ApiResource::erase::<K>(&());
        match ns {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

fn to_dynamic<K: Object>(obj: &K) -> Result<DynamicObject, StoreError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

fn from_dynamic<K: Object>(obj: DynamicObject) -> Result<K, StoreError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

fn map_error<K: Object>(name: &str, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound {
            kind: kind_of::<K>(),
            name: name.to_string(),
        },
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            StoreError::AlreadyExists {
                kind: kind_of::<K>(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict {
            kind: kind_of::<K>(),
            name: name.to_string(),
            message: ae.message.clone(),
        },
        e => StoreError::Kube(e),
    }
}

fn selector_string(selector: &Labels) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: Object>(&self, ns: Option<&str>, name: &str) -> Result<Option<K>, StoreError> {
        match self.api::<K>(ns).get_opt(name).await {
            Ok(Some(obj)) => Ok(Some(from_dynamic(obj)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(map_error::<K>(name, e)),
        }
    }

    async fn list<K: Object>(&self, ns: Option<&str>, selector: &Labels) -> Result<Vec<K>, StoreError> {
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(&selector_string(selector));
        }
        let list = self
            .api::<K>(ns)
            .list(&lp)
            .await
            .map_err(|e| map_error::<K>("", e))?;
        list.items.into_iter().map(from_dynamic).collect()
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K, StoreError> {
        let name = obj.name_any();
        let created = self
            .api::<K>(obj.namespace().as_deref())
            .create(&PostParams::default(), &to_dynamic(obj)?)
            .await
            .map_err(|e| map_error::<K>(&name, e))?;
        from_dynamic(created)
    }

    async fn replace<K: Object>(&self, obj: &K) -> Result<K, StoreError> {
        let name = obj.name_any();
        let replaced = self
            .api::<K>(obj.namespace().as_deref())
            .replace(&name, &PostParams::default(), &to_dynamic(obj)?)
            .await
            .map_err(|e| map_error::<K>(&name, e))?;
        from_dynamic(replaced)
    }

    async fn apply<K: Object>(&self, obj: &K) -> Result<K, StoreError> {
        let name = obj.name_any();
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let applied = self
            .api::<K>(obj.namespace().as_deref())
            .patch(&name, &params, &Patch::Apply(&to_dynamic(obj)?))
            .await
            .map_err(|e| map_error::<K>(&name, e))?;
        from_dynamic(applied)
    }

    async fn delete<K: Object>(&self, ns: Option<&str>, name: &str) -> Result<(), StoreError> {
        self.api::<K>(ns)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_error::<K>(name, e))?;
        Ok(())
    }

    async fn patch_status<K: Object>(
        &self,
        ns: Option<&str>,
        name: &str,
        status: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let patch = serde_json::json!({ "status": status });
        self.api::<K>(ns)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_error::<K>(name, e))?;
        Ok(())
    }
}
