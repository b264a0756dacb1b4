//! Manifests for the in-cluster chart backend (Tiller): service account, RBAC, deployment
//! and service.

use serde_json::json;

use crate::kube::{LabelSelector, Manifest};

pub const DEPLOYMENT_NAME: &str = "tiller-deploy";
pub const SERVICE_ACCOUNT_NAME: &str = "devspace-tiller";
pub const ROLE_NAME: &str = "devspace-tiller";
pub const ROLE_MANAGER_NAME: &str = "tiller-config-manager";
pub const DEFAULT_IMAGE: &str = "gcr.io/kubernetes-helm/tiller:v2.11.0";
pub const BACKEND_PORT: u16 = 44134;
pub const PROBE_PORT: u16 = 44135;
pub const MAX_HISTORY: u32 = 10;

/// Labels carried by backend pods.
pub fn pod_selector() -> LabelSelector {
    LabelSelector::new().with("app", "helm").with("name", "tiller")
}

pub fn binding_name(role: &str) -> String {
    format!("{role}-binding")
}

pub fn service_account(namespace: &str) -> Manifest {
    Manifest::new(json!({
        "apiVersion": "v1",
        "kind": "ServiceAccount",
        "metadata": { "name": SERVICE_ACCOUNT_NAME, "namespace": namespace }
    }))
}

fn role(name: &str, namespace: &str, rules: serde_json::Value) -> Manifest {
    Manifest::new(json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "Role",
        "metadata": { "name": name, "namespace": namespace },
        "rules": rules
    }))
}

fn role_binding(role: &str, namespace: &str, backend_namespace: &str) -> Manifest {
    Manifest::new(json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "RoleBinding",
        "metadata": { "name": binding_name(role), "namespace": namespace },
        "subjects": [{
            "kind": "ServiceAccount",
            "name": SERVICE_ACCOUNT_NAME,
            "namespace": backend_namespace
        }],
        "roleRef": {
            "apiGroup": "rbac.authorization.k8s.io",
            "kind": "Role",
            "name": role
        }
    }))
}

/// RBAC objects for the backend service account, in apply order.
///
/// The backend gets full rights inside every app namespace (and its own), plus a config
/// manager role on its own namespace for release storage.
pub fn rbac_manifests(backend_namespace: &str, app_namespaces: &[String]) -> Vec<Manifest> {
    let mut namespaces: Vec<&str> = vec![backend_namespace];
    for ns in app_namespaces {
        if !namespaces.contains(&ns.as_str()) {
            namespaces.push(ns);
        }
    }

    let mut out = Vec::new();
    for ns in &namespaces {
        out.push(role(
            ROLE_NAME,
            ns,
            json!([{ "apiGroups": ["*"], "resources": ["*"], "verbs": ["*"] }]),
        ));
        out.push(role_binding(ROLE_NAME, ns, backend_namespace));
    }
    out.push(role(
        ROLE_MANAGER_NAME,
        backend_namespace,
        json!([{
            "apiGroups": ["", "extensions", "apps"],
            "resources": ["configmaps"],
            "verbs": ["create", "get", "list", "update", "delete"]
        }]),
    ));
    out.push(role_binding(ROLE_MANAGER_NAME, backend_namespace, backend_namespace));
    out
}

pub fn deployment(namespace: &str, image: &str) -> Manifest {
    let http_check = |path: &str| {
        json!({
            "httpGet": { "path": path, "port": PROBE_PORT },
            "initialDelaySeconds": 1,
            "timeoutSeconds": 1
        })
    };
    Manifest::new(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": DEPLOYMENT_NAME,
            "namespace": namespace,
            "labels": { "app": "helm", "name": "tiller" }
        },
        "spec": {
            "replicas": 1,
            "selector": { "matchLabels": { "app": "helm", "name": "tiller" } },
            "template": {
                "metadata": { "labels": { "app": "helm", "name": "tiller" } },
                "spec": {
                    "serviceAccountName": SERVICE_ACCOUNT_NAME,
                    "automountServiceAccountToken": true,
                    "containers": [{
                        "name": "tiller",
                        "image": image,
                        "imagePullPolicy": "IfNotPresent",
                        "ports": [
                            { "containerPort": BACKEND_PORT, "name": "tiller" },
                            { "containerPort": PROBE_PORT, "name": "http" }
                        ],
                        "env": [
                            { "name": "TILLER_NAMESPACE", "value": namespace },
                            { "name": "TILLER_HISTORY_MAX", "value": MAX_HISTORY.to_string() }
                        ],
                        "livenessProbe": http_check("/liveness"),
                        "readinessProbe": http_check("/readiness")
                    }]
                }
            }
        }
    }))
}

pub fn service(namespace: &str) -> Manifest {
    Manifest::new(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": DEPLOYMENT_NAME,
            "namespace": namespace,
            "labels": { "app": "helm", "name": "tiller" }
        },
        "spec": {
            "type": "ClusterIP",
            "selector": { "app": "helm", "name": "tiller" },
            "ports": [{ "name": "tiller", "port": BACKEND_PORT, "targetPort": "tiller" }]
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rbac_covers_each_namespace_once() {
        let ms = rbac_manifests("tiller", &["dev".to_string(), "tiller".to_string()]);
        let roles: Vec<_> = ms
            .iter()
            .filter(|m| m.kind == "Role" && m.name == ROLE_NAME)
            .map(|m| m.namespace.clone().unwrap_or_default())
            .collect();
        assert_eq!(roles, vec!["tiller".to_string(), "dev".to_string()]);
        assert!(ms
            .iter()
            .any(|m| m.kind == "RoleBinding" && m.name == "tiller-config-manager-binding"));
    }

    #[test]
    fn test_deployment_matches_pod_selector() {
        let d = deployment("tiller", DEFAULT_IMAGE);
        let labels = d.body["spec"]["template"]["metadata"]["labels"].clone();
        let labels: std::collections::BTreeMap<String, String> =
            serde_json::from_value(labels).unwrap();
        assert!(pod_selector().matches(&labels));
        assert_eq!(
            d.body["spec"]["template"]["spec"]["containers"][0]["image"],
            DEFAULT_IMAGE
        );
    }
}
