//! `ChartBackend` over the Helm v2 client binary (`--host` pointed at the tunnel).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::{BackendFactory, ChartBackend, ReleaseInfo};
use crate::errors::BackendError;
use crate::util::{shell_join, ExecOutput, ExecRequest, ExecService};

#[derive(Debug, Clone)]
pub struct HelmCli {
    helm: PathBuf,
    host: String,
    backend_namespace: String,
    home: PathBuf,
    exec: ExecService,
}

impl HelmCli {
    pub fn new(helm: PathBuf, host: &str, backend_namespace: &str, home: PathBuf) -> Self {
        Self {
            helm,
            host: host.to_string(),
            backend_namespace: backend_namespace.to_string(),
            home,
            // Chart installs can pull images and hooks; give them room
            exec: ExecService::new(Duration::from_secs(300)),
        }
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "--host".into(),
            self.host.clone(),
            "--tiller-namespace".into(),
            self.backend_namespace.clone(),
            "--home".into(),
            self.home.display().to_string(),
        ]
    }

    fn run(&self, args: Vec<String>) -> Result<ExecOutput, BackendError> {
        let mut argv = args;
        argv.extend(self.base_args());
        tracing::debug!(target: "devspace.helm", cmd = %format!("helm {}", shell_join(&argv)));
        let out = self
            .exec
            .run(
                ExecRequest::new(self.helm.as_os_str())
                    .args(&argv)
                    .env("HELM_HOME", self.home.as_os_str()),
            )
            .map_err(|e| match e.downcast_ref::<std::io::Error>() {
                Some(ioe) => BackendError::from_io(ioe),
                None => BackendError::Failed(e.to_string()),
            })?;
        if out.success() {
            Ok(out)
        } else {
            Err(BackendError::Failed(out.error_text()))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct ListJson {
    releases: Vec<ListedRelease>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct ListedRelease {
    name: String,
    namespace: String,
    revision: u32,
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HistoryEntry {
    revision: u32,
}

fn is_release_not_found(text: &str, name: &str) -> bool {
    text.contains(&format!("release: \"{name}\" not found"))
        || (text.contains(name) && text.contains("not found"))
}

fn parse_history(stdout: &str) -> Result<Option<u32>, BackendError> {
    if stdout.trim().is_empty() {
        return Ok(None);
    }
    let entries: Vec<HistoryEntry> = serde_json::from_str(stdout)
        .map_err(|e| BackendError::Failed(format!("invalid release history: {e}")))?;
    Ok(entries.iter().map(|e| e.revision).max())
}

impl ChartBackend for HelmCli {
    fn list_releases(&self, limit: usize) -> Result<Vec<ReleaseInfo>, BackendError> {
        let out = self.run(vec![
            "list".into(),
            "--max".into(),
            limit.to_string(),
            "--output".into(),
            "json".into(),
        ])?;
        // helm v2 prints nothing at all when there are no releases
        if out.stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        let list: ListJson = serde_json::from_str(&out.stdout)
            .map_err(|e| BackendError::Failed(format!("invalid release list: {e}")))?;
        Ok(list
            .releases
            .into_iter()
            .map(|r| ReleaseInfo {
                name: r.name,
                namespace: r.namespace,
                revision: r.revision,
                status: r.status,
            })
            .collect())
    }

    fn install_or_upgrade(
        &self,
        name: &str,
        namespace: &str,
        chart_path: &Path,
        values: &serde_yaml::Value,
    ) -> Result<u32, BackendError> {
        let rendered = serde_yaml::to_string(values)
            .map_err(|e| BackendError::Failed(format!("cannot encode values: {e}")))?;
        let mut file = tempfile::Builder::new()
            .prefix("devspace-values-")
            .suffix(".yaml")
            .tempfile()
            .map_err(|e| BackendError::Failed(format!("cannot create values file: {e}")))?;
        file.write_all(rendered.as_bytes())
            .map_err(|e| BackendError::Failed(format!("cannot write values file: {e}")))?;

        self.run(vec![
            "upgrade".into(),
            name.into(),
            chart_path.display().to_string(),
            "--install".into(),
            "--namespace".into(),
            namespace.into(),
            "--values".into(),
            file.path().display().to_string(),
        ])?;
        self.release_revision(name)?
            .ok_or_else(|| BackendError::ReleaseNotFound(name.to_string()))
    }

    fn release_revision(&self, name: &str) -> Result<Option<u32>, BackendError> {
        match self.run(vec![
            "history".into(),
            name.into(),
            "--max".into(),
            "1".into(),
            "--output".into(),
            "json".into(),
        ]) {
            Ok(out) => parse_history(&out.stdout),
            Err(BackendError::Failed(text)) if is_release_not_found(&text, name) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn delete_release(&self, name: &str, purge: bool) -> Result<(), BackendError> {
        let mut args = vec!["delete".to_string(), name.to_string()];
        if purge {
            args.push("--purge".into());
        }
        match self.run(args) {
            Ok(_) => Ok(()),
            Err(BackendError::Failed(text)) if is_release_not_found(&text, name) => {
                Err(BackendError::ReleaseNotFound(name.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn update_dependencies(&self, chart_path: &Path) -> Result<(), BackendError> {
        self.run(vec![
            "dependency".into(),
            "update".into(),
            chart_path.display().to_string(),
        ])
        .map(|_| ())
    }
}

/// Creates `HelmCli` clients sharing one binary path and repository home.
#[derive(Debug, Clone)]
pub struct HelmCliFactory {
    helm: PathBuf,
    home: PathBuf,
}

impl HelmCliFactory {
    pub fn new(helm: PathBuf, home: PathBuf) -> Self {
        Self { helm, home }
    }
}

impl BackendFactory for HelmCliFactory {
    fn connect(&self, endpoint: &str, backend_namespace: &str) -> Arc<dyn ChartBackend> {
        Arc::new(HelmCli::new(
            self.helm.clone(),
            endpoint,
            backend_namespace,
            self.home.clone(),
        ))
    }
}
