use super::{SelectorQuery, SessionError};
use crate::kube::{first_running_pod, ClusterApi, Pod};

/// First running pod matching `query`; never cached, pods come and go.
pub fn resolve_pod(cluster: &dyn ClusterApi, query: &SelectorQuery) -> Result<Pod, SessionError> {
    if let Some(kind) = query.resource_type.as_deref() {
        if !kind.is_empty() && kind != "pod" {
            return Err(SessionError::UnsupportedResource(kind.to_string()));
        }
    }
    if query.labels.is_empty() {
        return Err(SessionError::NoSelector);
    }
    first_running_pod(cluster, &query.namespace, &query.labels)
        .map_err(SessionError::Lookup)?
        .ok_or_else(|| SessionError::NoPod {
            query: query.to_string(),
        })
}

/// The named container, or the pod's first container when no name is given.
pub fn resolve_container(pod: &Pod, name: Option<&str>) -> Result<String, SessionError> {
    match name.filter(|n| !n.is_empty()) {
        Some(n) => pod
            .container(n)
            .map(|c| c.name.clone())
            .ok_or_else(|| SessionError::ContainerMissing {
                container: n.to_string(),
                pod: pod.to_string(),
            }),
        None => pod
            .first_container()
            .map(|c| c.name.clone())
            .ok_or_else(|| SessionError::NoContainers {
                pod: pod.to_string(),
            }),
    }
}
