//! Kubernetes-backed [`ResourceClient`]
//!
//! Builds a dynamic API from the document's apiVersion/kind and speaks
//! `DynamicObject` to the server. The field manager for server-side apply
//! is the single well-known identity in `loom_common::FIELD_MANAGER`.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;
use serde_json::Value;

use super::{ApplyError, ObjectRef, ResourceClient};

/// Production resource client over a shared kube [`Client`]
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
}

impl KubeResourceClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a dynamic API scoped to the object's namespace (or the
    /// cluster for cluster-scoped refs)
    fn dynamic_api(&self, obj_ref: &ObjectRef) -> Result<Api<DynamicObject>, ApplyError> {
        let (group, version) = match obj_ref.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", obj_ref.api_version.as_str()),
        };
        let gvk = GroupVersionKind::gvk(group, version, &obj_ref.kind);
        let resource = ApiResource::from_gvk(&gvk);

        Ok(match &obj_ref.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        })
    }

    fn to_dynamic(doc: &Value) -> Result<DynamicObject, ApplyError> {
        serde_json::from_value(doc.clone())
            .map_err(|e| ApplyError::InvalidSpec(format!("document is not a valid object: {e}")))
    }

    fn to_value(obj: DynamicObject) -> Result<Value, ApplyError> {
        serde_json::to_value(obj)
            .map_err(|e| ApplyError::Terminal(format!("cannot serialize server object: {e}")))
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get(&self, obj_ref: &ObjectRef) -> Result<Option<Value>, ApplyError> {
        let api = self.dynamic_api(obj_ref)?;
        match api.get_opt(&obj_ref.name).await {
            Ok(Some(obj)) => Ok(Some(Self::to_value(obj)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(ApplyError::classify(e, obj_ref)),
        }
    }

    async fn ssa_apply(&self, doc: &Value, force: bool) -> Result<Value, ApplyError> {
        let obj_ref = ObjectRef::from_doc(doc)?;
        let api = self.dynamic_api(&obj_ref)?;

        let mut params = PatchParams::apply(loom_common::FIELD_MANAGER);
        if force {
            params = params.force();
        }

        api.patch(&obj_ref.name, &params, &Patch::Apply(doc))
            .await
            .map_err(|e| ApplyError::classify(e, &obj_ref))
            .and_then(Self::to_value)
    }

    async fn merge_patch(&self, doc: &Value) -> Result<Value, ApplyError> {
        let obj_ref = ObjectRef::from_doc(doc)?;
        let api = self.dynamic_api(&obj_ref)?;
        let params = PatchParams::default();

        api.patch(&obj_ref.name, &params, &Patch::Merge(doc))
            .await
            .map_err(|e| ApplyError::classify(e, &obj_ref))
            .and_then(Self::to_value)
    }

    async fn create(&self, doc: &Value) -> Result<Value, ApplyError> {
        let obj_ref = ObjectRef::from_doc(doc)?;
        let api = self.dynamic_api(&obj_ref)?;
        let obj = Self::to_dynamic(doc)?;

        api.create(&PostParams::default(), &obj)
            .await
            .map_err(|e| ApplyError::classify(e, &obj_ref))
            .and_then(Self::to_value)
    }

    async fn replace(&self, doc: &Value) -> Result<Value, ApplyError> {
        let obj_ref = ObjectRef::from_doc(doc)?;
        let api = self.dynamic_api(&obj_ref)?;
        let obj = Self::to_dynamic(doc)?;

        api.replace(&obj_ref.name, &PostParams::default(), &obj)
            .await
            .map_err(|e| ApplyError::classify(e, &obj_ref))
            .and_then(Self::to_value)
    }

    async fn delete(&self, obj_ref: &ObjectRef) -> Result<(), ApplyError> {
        let api = self.dynamic_api(obj_ref)?;
        api.delete(&obj_ref.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| ApplyError::classify(e, obj_ref))
    }
}
