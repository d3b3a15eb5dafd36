//! Drover core types and errors

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Namespace substituted when a manifest does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Lifecycle state reported by the remote controller.
///
/// The set is open-ended: states this crate does not know about are kept
/// verbatim in `Other` rather than rejected. An empty string maps to
/// `Unset`, meaning the controller has not populated status yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceState {
    Unset,
    Creating,
    Available,
    Failed,
    Other(String),
}

impl Default for ResourceState {
    fn default() -> Self {
        Self::Unset
    }
}

impl From<String> for ResourceState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "" => Self::Unset,
            "Creating" => Self::Creating,
            "Available" => Self::Available,
            "Failed" => Self::Failed,
            _ => Self::Other(s),
        }
    }
}

impl From<ResourceState> for String {
    fn from(s: ResourceState) -> Self {
        s.as_str().to_string()
    }
}

impl ResourceState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Unset => "",
            Self::Creating => "Creating",
            Self::Available => "Available",
            Self::Failed => "Failed",
            Self::Other(s) => s,
        }
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Object metadata. Fields drover does not model (resourceVersion,
/// labels, creationTimestamp, ...) ride along in `extra` so a
/// read-modify-write never drops server-held data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Desired state. Only the replica count is interpreted here; the rest
/// of the spec is opaque to drover and preserved as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Observed state as written by the remote controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    #[serde(default, skip_serializing_if = "ResourceState::is_unset")]
    pub state: ResourceState,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResourceStatus {
    pub fn is_empty(&self) -> bool {
        self.state.is_unset() && self.extra.is_empty()
    }
}

/// The declarative object whose lifecycle drover drives.
///
/// `apiVersion`/`kind` from the manifest live in the root `extra` map;
/// the store fills them in from its resolved kind when absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagedResource {
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: ResourceSpec,
    #[serde(default, skip_serializing_if = "ResourceStatus::is_empty")]
    pub status: ResourceStatus,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ManagedResource {
    pub fn identity(&self) -> ResourceIdentity {
        ResourceIdentity {
            name: self.metadata.name.clone(),
            namespace: self.metadata.namespace.clone(),
            uid: self.metadata.uid.clone().unwrap_or_default(),
        }
    }
}

/// Identity of a managed resource. Immutable once the create step has
/// assigned the uid; the only state shared with the event observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub name: String,
    pub namespace: String,
    pub uid: String,
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Store-level errors. Semantically meaningful but all fatal to the
/// running workflow; no reconciliation or retry happens at this layer.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("transport: {0}")]
    Transport(String),
}

/// Outcome of a convergence wait. A store failure during polling is kept
/// distinct from a timeout so "controller too slow" never masquerades as
/// "controller rejected request" or vice versa.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timeout: {0}")]
    Timeout(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_known_values() {
        for s in ["Creating", "Available", "Failed"] {
            let state = ResourceState::from(s.to_string());
            assert_eq!(String::from(state.clone()), s);
            assert!(!state.is_unset());
        }
    }

    #[test]
    fn unknown_state_is_preserved_not_rejected() {
        let state = ResourceState::from("Deploying".to_string());
        assert_eq!(state, ResourceState::Other("Deploying".to_string()));
        assert_eq!(state.as_str(), "Deploying");
    }

    #[test]
    fn empty_state_is_unset() {
        let state = ResourceState::from(String::new());
        assert!(state.is_unset());
        assert_eq!(ResourceState::default(), ResourceState::Unset);
    }

    #[test]
    fn manifest_decodes_with_defaults() {
        let v = serde_json::json!({
            "apiVersion": "machinelearning.seldon.io/v1",
            "kind": "SeldonDeployment",
            "metadata": { "name": "demo" },
            "spec": { "predictors": [ { "name": "default" } ] }
        });
        let r: ManagedResource = serde_json::from_value(v).unwrap();
        assert_eq!(r.metadata.name, "demo");
        assert!(r.metadata.namespace.is_empty());
        assert!(r.metadata.uid.is_none());
        assert!(r.spec.replicas.is_none());
        assert!(r.status.state.is_unset());
        assert!(r.spec.extra.contains_key("predictors"));
        assert_eq!(
            r.extra.get("kind").and_then(|v| v.as_str()),
            Some("SeldonDeployment")
        );
    }

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let v = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Demo",
            "metadata": {
                "name": "demo",
                "namespace": "ns",
                "uid": "u-1",
                "resourceVersion": "42",
                "labels": { "app": "demo" }
            },
            "spec": { "replicas": 1, "image": "demo:latest" },
            "status": { "state": "Available", "replicas": 1 }
        });
        let r: ManagedResource = serde_json::from_value(v.clone()).unwrap();
        assert_eq!(r.spec.replicas, Some(1));
        assert_eq!(r.status.state, ResourceState::Available);
        let back = serde_json::to_value(&r).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn identity_defaults_missing_uid_to_empty() {
        let r = ManagedResource {
            metadata: Metadata {
                name: "demo".into(),
                namespace: "ns".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let id = r.identity();
        assert_eq!(id.to_string(), "ns/demo");
        assert!(id.uid.is_empty());
    }
}
