#![allow(clippy::module_name_repetitions)]
//! Cluster access: the `ClusterApi` contract, the pod/label-selector model it returns,
//! and the kubectl-backed implementations of cluster, port-forward and attach access.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

use crate::errors::ClusterError;

pub mod attach;
pub mod forward;
pub mod kubectl;
pub mod runtime;

pub use attach::{Attacher, KubectlAttach};
pub use forward::{KubectlPortForwarder, KubectlTunnel, PortForwarder, PortPair, Tunnel, TunnelOpener};
pub use kubectl::KubectlCluster;

/// Narrow view of the Kubernetes API used by bootstrap, deploy and session resolution.
///
/// Implementations report absence as `ClusterError::NotFound` (or `Ok(false)` / `Ok(None)`
/// where the method returns an existence answer).
pub trait ClusterApi: Send + Sync {
    fn namespace_exists(&self, name: &str) -> Result<bool, ClusterError>;
    fn create_namespace(&self, name: &str) -> Result<(), ClusterError>;
    fn service_account_exists(&self, namespace: &str, name: &str) -> Result<bool, ClusterError>;
    fn deployment_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DeploymentStatus>, ClusterError>;
    /// Create or update the object described by `manifest`.
    fn apply(&self, manifest: &Manifest) -> Result<(), ClusterError>;
    fn list_pods(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Pod>, ClusterError>;
    fn delete(&self, kind: &str, namespace: &str, name: &str) -> Result<(), ClusterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeploymentStatus {
    pub desired_replicas: u32,
    pub ready_replicas: u32,
}

impl DeploymentStatus {
    /// Ready once every desired replica is ready; a deployment scaled to zero is ready.
    pub fn is_ready(&self) -> bool {
        self.ready_replicas == self.desired_replicas
    }
}

/// A Kubernetes object in its JSON form, with the identifying fields lifted out.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub body: serde_json::Value,
}

impl Manifest {
    pub fn new(body: serde_json::Value) -> Self {
        let field = |ptr: &str| body.pointer(ptr).and_then(|v| v.as_str()).map(str::to_string);
        Self {
            kind: field("/kind").unwrap_or_default(),
            name: field("/metadata/name").unwrap_or_default(),
            namespace: field("/metadata/namespace"),
            body,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub deletion_timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Container {
    pub name: String,
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct PodSpec {
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContainerStatus {
    pub name: String,
    pub ready: bool,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PodStatus {
    pub phase: String,
    pub container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Pod {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
    pub status: PodStatus,
}

impl Pod {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn is_running(&self) -> bool {
        self.status.phase == "Running" && self.metadata.deletion_timestamp.is_none()
    }

    /// Running and every container reports ready.
    pub fn is_ready(&self) -> bool {
        self.is_running()
            && !self.status.container_statuses.is_empty()
            && self.status.container_statuses.iter().all(|c| c.ready)
    }

    pub fn container(&self, name: &str) -> Option<&Container> {
        self.spec.containers.iter().find(|c| c.name == name)
    }

    pub fn first_container(&self) -> Option<&Container> {
        self.spec.containers.first()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }
}

impl fmt::Display for Pod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.metadata.namespace, self.metadata.name)
    }
}

/// Equality-based label selector (`k=v,k2=v2`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector(BTreeMap<String, String>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorParseError(pub String);

impl fmt::Display for SelectorParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid selector '{}': expected key=value", self.0)
    }
}

impl std::error::Error for SelectorParseError {}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        Self(map.clone())
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    /// Parse `key=value` pairs separated by commas; surrounding whitespace is ignored
    /// and an empty input yields an empty selector.
    pub fn parse(s: &str) -> Result<Self, SelectorParseError> {
        let mut map = BTreeMap::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (k, v) = part
                .split_once('=')
                .ok_or_else(|| SelectorParseError(part.to_string()))?;
            let k = k.trim();
            if k.is_empty() {
                return Err(SelectorParseError(part.to_string()));
            }
            map.insert(k.to_string(), v.trim().to_string());
        }
        Ok(Self(map))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        f.write_str(&parts.join(","))
    }
}

/// First pod matching `selector` in `namespace` that is currently running.
pub fn first_running_pod(
    cluster: &dyn ClusterApi,
    namespace: &str,
    selector: &LabelSelector,
) -> Result<Option<Pod>, ClusterError> {
    let pods = cluster.list_pods(namespace, selector)?;
    Ok(pods.into_iter().find(Pod::is_running))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_parse_and_display() {
        let sel = LabelSelector::parse(" release=test , app = web").unwrap();
        assert_eq!(sel.to_string(), "app=web,release=test");
        assert!(LabelSelector::parse("").unwrap().is_empty());
        assert_eq!(
            LabelSelector::parse("release").unwrap_err(),
            SelectorParseError("release".to_string())
        );
    }

    #[test]
    fn test_selector_matches_subset_of_labels() {
        let sel = LabelSelector::new().with("release", "app");
        let mut labels = BTreeMap::new();
        labels.insert("release".to_string(), "app".to_string());
        labels.insert("tier".to_string(), "web".to_string());
        assert!(sel.matches(&labels));
        labels.insert("release".to_string(), "other".to_string());
        assert!(!sel.matches(&labels));
    }

    #[test]
    fn test_pod_deserializes_from_kubectl_json() {
        let raw = r#"{
            "metadata": {"name": "web-0", "namespace": "dev", "labels": {"release": "devspace"},
                         "annotations": {"devspace.revision": "3"}},
            "spec": {"containers": [{"name": "app", "image": "nginx"}, {"name": "sidecar"}]},
            "status": {"phase": "Running", "containerStatuses": [{"name": "app", "ready": true}]}
        }"#;
        let pod: Pod = serde_json::from_str(raw).unwrap();
        assert!(pod.is_ready());
        assert_eq!(pod.to_string(), "dev/web-0");
        assert_eq!(pod.first_container().map(|c| c.name.as_str()), Some("app"));
        assert!(pod.container("sidecar").is_some());
        assert!(pod.container("db").is_none());
        assert_eq!(pod.annotation("devspace.revision"), Some("3"));
    }

    #[test]
    fn test_terminating_pod_is_not_running() {
        let mut pod = Pod::default();
        pod.status.phase = "Running".into();
        assert!(pod.is_running());
        pod.metadata.deletion_timestamp = Some("2024-01-01T00:00:00Z".into());
        assert!(!pod.is_running());
    }

    #[test]
    fn test_deployment_ready_when_counts_match() {
        let status = |desired, ready| DeploymentStatus {
            desired_replicas: desired,
            ready_replicas: ready,
        };
        assert!(status(1, 1).is_ready());
        assert!(!status(1, 0).is_ready());
        assert!(!status(2, 1).is_ready());
        assert!(status(0, 0).is_ready());
    }

    #[test]
    fn test_manifest_lifts_identity() {
        let m = Manifest::new(serde_json::json!({
            "kind": "ServiceAccount",
            "metadata": {"name": "devspace-tiller", "namespace": "dev"}
        }));
        assert_eq!(m.kind, "ServiceAccount");
        assert_eq!(m.name, "devspace-tiller");
        assert_eq!(m.namespace.as_deref(), Some("dev"));
    }
}
