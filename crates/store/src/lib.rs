//! Drover store: the resource store contract and its kube-backed client.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, PostParams},
    core::{DynamicObject, ErrorResponse, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use serde_json::Value;
use tracing::debug;

use drover_core::{ManagedResource, StoreError};

/// GVK key of the kind managed when none is given on the command line.
pub const DEFAULT_GVK_KEY: &str = "machinelearning.seldon.io/v1/SeldonDeployment";

/// Typed get/create/update/delete against the remote orchestrator.
///
/// No retry policy lives here: a transport failure surfaces to the
/// caller, and the convergence waiter decides what a failed read means.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, name: &str, namespace: &str) -> Result<ManagedResource, StoreError>;
    async fn create(&self, resource: &ManagedResource) -> Result<ManagedResource, StoreError>;
    async fn update(&self, resource: &ManagedResource) -> Result<ManagedResource, StoreError>;
    async fn delete(&self, name: &str, namespace: &str) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: ResourceStore + ?Sized> ResourceStore for std::sync::Arc<T> {
    async fn get(&self, name: &str, namespace: &str) -> Result<ManagedResource, StoreError> {
        (**self).get(name, namespace).await
    }

    async fn create(&self, resource: &ManagedResource) -> Result<ManagedResource, StoreError> {
        (**self).create(resource).await
    }

    async fn update(&self, resource: &ManagedResource) -> Result<ManagedResource, StoreError> {
        (**self).update(resource).await
    }

    async fn delete(&self, name: &str, namespace: &str) -> Result<(), StoreError> {
        (**self).delete(name, namespace).await
    }
}

/// Resource store backed by the cluster from the ambient kubeconfig,
/// addressing one namespaced kind resolved at connect time.
pub struct KubeStore {
    client: Client,
    ar: kube::core::ApiResource,
}

impl KubeStore {
    /// Build a client and resolve the managed kind via API discovery.
    pub async fn connect(gvk_key: &str) -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        if !namespaced {
            return Err(anyhow!("{} is cluster-scoped; drover manages namespaced kinds", gvk_key));
        }
        debug!(gvk = %gvk_key, plural = %ar.plural, "resolved managed kind");
        Ok(Self { client, ar })
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.ar)
    }

    fn api_version(&self) -> String {
        if self.ar.group.is_empty() {
            self.ar.version.clone()
        } else {
            format!("{}/{}", self.ar.group, self.ar.version)
        }
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, name: &str, namespace: &str) -> Result<ManagedResource, StoreError> {
        let obj = self
            .api(namespace)
            .get(name)
            .await
            .map_err(|e| map_kube_err("get", name, namespace, e))?;
        from_dynamic(&obj)
    }

    async fn create(&self, resource: &ManagedResource) -> Result<ManagedResource, StoreError> {
        let name = &resource.metadata.name;
        let namespace = &resource.metadata.namespace;
        let obj = to_dynamic(resource, &self.api_version(), &self.ar.kind)?;
        let created = self
            .api(namespace)
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_kube_err("create", name, namespace, e))?;
        from_dynamic(&created)
    }

    async fn update(&self, resource: &ManagedResource) -> Result<ManagedResource, StoreError> {
        let name = &resource.metadata.name;
        let namespace = &resource.metadata.namespace;
        let obj = to_dynamic(resource, &self.api_version(), &self.ar.kind)?;
        let updated = self
            .api(namespace)
            .replace(name, &PostParams::default(), &obj)
            .await
            .map_err(|e| map_kube_err("update", name, namespace, e))?;
        from_dynamic(&updated)
    }

    async fn delete(&self, name: &str, namespace: &str) -> Result<(), StoreError> {
        let _ = self
            .api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_err("delete", name, namespace, e))?;
        Ok(())
    }
}

/// Convert to the wire shape, filling in `apiVersion`/`kind` when the
/// manifest left them out.
fn to_dynamic(resource: &ManagedResource, api_version: &str, kind: &str) -> Result<DynamicObject, StoreError> {
    let mut v = serde_json::to_value(resource).map_err(|e| StoreError::Decode(e.to_string()))?;
    if let Some(obj) = v.as_object_mut() {
        obj.entry("apiVersion")
            .or_insert_with(|| Value::String(api_version.to_string()));
        obj.entry("kind").or_insert_with(|| Value::String(kind.to_string()));
    }
    serde_json::from_value(v).map_err(|e| StoreError::Decode(e.to_string()))
}

fn from_dynamic(obj: &DynamicObject) -> Result<ManagedResource, StoreError> {
    let mut v = serde_json::to_value(obj).map_err(|e| StoreError::Decode(e.to_string()))?;
    strip_managed_fields(&mut v);
    serde_json::from_value(v).map_err(|e| StoreError::Decode(e.to_string()))
}

fn strip_managed_fields(v: &mut Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn map_kube_err(op: &str, name: &str, namespace: &str, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ae) => map_api_err(op, name, namespace, &ae),
        other => StoreError::Transport(format!("{} {}/{}: {}", op, namespace, name, other)),
    }
}

fn map_api_err(op: &str, name: &str, namespace: &str, ae: &ErrorResponse) -> StoreError {
    let what = format!("{}/{}", namespace, name);
    match (ae.code, ae.reason.as_str()) {
        (404, _) => StoreError::NotFound(what),
        (409, "AlreadyExists") => StoreError::AlreadyExists(what),
        (409, _) => StoreError::Conflict(format!("{}: {}", what, ae.message)),
        _ => StoreError::Transport(format!("{} {}: {}", op, what, ae.message)),
    }
}

fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind {
            group: String::new(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        [group, version, kind] => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}
