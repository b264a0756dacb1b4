//! `ClusterApi` over the kubectl CLI (`-o json` reads, `apply -f -` writes).

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use super::{ClusterApi, DeploymentStatus, LabelSelector, Manifest, Pod};
use crate::errors::ClusterError;
use crate::util::{shell_join, ExecOutput, ExecRequest, ExecService};

#[derive(Debug, Clone)]
pub struct KubectlCluster {
    kubectl: PathBuf,
    exec: ExecService,
}

impl KubectlCluster {
    pub fn new(kubectl: PathBuf) -> Self {
        Self {
            kubectl,
            exec: ExecService::new(Duration::from_secs(60)),
        }
    }

    /// Discover kubectl on PATH (or via DEVSPACE_KUBECTL).
    pub fn discover() -> io::Result<Self> {
        Ok(Self::new(super::runtime::kubectl_path()?))
    }

    pub fn kubectl_path(&self) -> &PathBuf {
        &self.kubectl
    }

    fn run(&self, args: &[String], stdin: Option<Vec<u8>>) -> Result<ExecOutput, ClusterError> {
        tracing::debug!(target: "devspace.kube", cmd = %format!("kubectl {}", shell_join(args)));
        let mut req = ExecRequest::new(self.kubectl.as_os_str()).args(args);
        if let Some(payload) = stdin {
            req = req.stdin(payload);
        }
        let out = self.exec.run(req).map_err(|e| match e.downcast_ref::<io::Error>() {
            Some(ioe) => ClusterError::from_io(ioe),
            None => ClusterError::Failed(e.to_string()),
        })?;
        if out.success() {
            return Ok(out);
        }
        let text = out.error_text();
        if is_not_found_text(&text) {
            Err(ClusterError::NotFound(text))
        } else {
            Err(ClusterError::Failed(text))
        }
    }

    fn exists(&self, args: &[String]) -> Result<bool, ClusterError> {
        match self.run(args, None) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn is_not_found_text(text: &str) -> bool {
    text.contains("NotFound") || text.contains("not found")
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DeploymentJson {
    spec: DeploymentSpecJson,
    status: DeploymentStatusJson,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DeploymentSpecJson {
    replicas: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DeploymentStatusJson {
    replicas: u32,
    ready_replicas: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PodListJson {
    items: Vec<Pod>,
}

impl ClusterApi for KubectlCluster {
    fn namespace_exists(&self, name: &str) -> Result<bool, ClusterError> {
        self.exists(&owned(&["get", "namespace", name, "-o", "name"]))
    }

    fn create_namespace(&self, name: &str) -> Result<(), ClusterError> {
        self.run(&owned(&["create", "namespace", name]), None).map(|_| ())
    }

    fn service_account_exists(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        self.exists(&owned(&[
            "get",
            "serviceaccount",
            name,
            "-n",
            namespace,
            "-o",
            "name",
        ]))
    }

    fn deployment_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DeploymentStatus>, ClusterError> {
        let args = owned(&["get", "deployment", name, "-n", namespace, "-o", "json"]);
        let out = match self.run(&args, None) {
            Ok(out) => out,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let dep: DeploymentJson = serde_json::from_str(&out.stdout)
            .map_err(|e| ClusterError::Failed(format!("invalid deployment json: {e}")))?;
        Ok(Some(DeploymentStatus {
            desired_replicas: dep.spec.replicas.unwrap_or(dep.status.replicas),
            ready_replicas: dep.status.ready_replicas,
        }))
    }

    fn apply(&self, manifest: &Manifest) -> Result<(), ClusterError> {
        let body = serde_json::to_vec(&manifest.body)
            .map_err(|e| ClusterError::Failed(format!("cannot encode {}: {e}", manifest.kind)))?;
        self.run(&owned(&["apply", "-f", "-"]), Some(body)).map(|_| ())
    }

    fn list_pods(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Pod>, ClusterError> {
        let mut args = owned(&["get", "pods", "-n", namespace, "-o", "json"]);
        if !selector.is_empty() {
            args.push("-l".to_string());
            args.push(selector.to_string());
        }
        let out = self.run(&args, None)?;
        let list: PodListJson = serde_json::from_str(&out.stdout)
            .map_err(|e| ClusterError::Failed(format!("invalid pod list json: {e}")))?;
        Ok(list.items)
    }

    fn delete(&self, kind: &str, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.run(
            &owned(&["delete", kind, name, "-n", namespace, "--wait=false"]),
            None,
        )
        .map(|_| ())
    }
}
