//! Deployment pipeline: decide whether the release must be (re)installed, install it with
//! the override values, wait for a ready pod and only then record the new fingerprint.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_yaml::{Mapping, Value};

use crate::bootstrap::ClusterConnection;
use crate::errors::{BackendError, ClusterError};
use crate::kube::{first_running_pod, LabelSelector, Pod};
use crate::release_cache::{fingerprint, ReleaseCache};
use crate::wait::{poll_until, CancelToken, PollError, WaitPolicy};

/// Pod annotation carrying the release revision the pod was rolled out for.
pub const REVISION_ANNOTATION: &str = "revision";
pub const RELEASE_LABEL: &str = "release";

pub const RELEASE_WAIT: WaitPolicy =
    WaitPolicy::new(Duration::from_secs(2), Duration::from_secs(120));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployReason {
    NoRunningPod,
    Forced,
    ChartChanged,
}

impl fmt::Display for DeployReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeployReason::NoRunningPod => "no running release pod",
            DeployReason::Forced => "forced",
            DeployReason::ChartChanged => "chart changed",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeployDecision {
    Skip(Pod),
    Deploy(DeployReason),
}

/// First match wins: no running pod, then force, then a fingerprint change.
pub fn decide(
    existing: Option<Pod>,
    force: bool,
    current_hash: &str,
    cached_hash: Option<&str>,
) -> DeployDecision {
    match existing {
        None => DeployDecision::Deploy(DeployReason::NoRunningPod),
        Some(_) if force => DeployDecision::Deploy(DeployReason::Forced),
        Some(_) if cached_hash != Some(current_hash) => {
            DeployDecision::Deploy(DeployReason::ChartChanged)
        }
        Some(pod) => DeployDecision::Skip(pod),
    }
}

#[derive(Debug)]
pub enum DeployError {
    Fingerprint { path: PathBuf, source: io::Error },
    Cache(io::Error),
    Values(String),
    Cluster(ClusterError),
    Install(BackendError),
    ReadinessTimeout {
        release: String,
        revision: u32,
        message: String,
    },
    Cancelled,
}

impl fmt::Display for DeployError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployError::Fingerprint { path, source } => {
                write!(f, "Error hashing chart directory {}: {}", path.display(), source)
            }
            DeployError::Cache(e) => write!(f, "Error reading or saving generated.yaml: {e}"),
            DeployError::Values(msg) => write!(f, "Couldn't deploy chart: {msg}"),
            DeployError::Cluster(e) => write!(f, "Unable to list release pods: {e}"),
            DeployError::Install(e) => write!(f, "Unable to deploy helm chart: {e}"),
            DeployError::ReadinessTimeout {
                release,
                revision,
                message,
            } => write!(
                f,
                "release {release} (revision {revision}) did not get a ready pod: {message}"
            ),
            DeployError::Cancelled => f.write_str("deployment wait cancelled"),
        }
    }
}

impl std::error::Error for DeployError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeployError::Fingerprint { source, .. } => Some(source),
            DeployError::Cache(e) => Some(e),
            DeployError::Cluster(e) => Some(e),
            DeployError::Install(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub release_name: String,
    pub namespace: String,
    pub chart_path: PathBuf,
    pub force: bool,
    /// Empty `command`/`args` for every container so its entrypoint does not run.
    pub no_sleep: bool,
    /// Image name → resolved reference.
    pub images: BTreeMap<String, String>,
    pub pull_secrets: Vec<String>,
    pub ready_wait: WaitPolicy,
}

impl DeployOptions {
    pub fn new(release_name: &str, namespace: &str, chart_path: impl Into<PathBuf>) -> Self {
        Self {
            release_name: release_name.to_string(),
            namespace: namespace.to_string(),
            chart_path: chart_path.into(),
            force: false,
            no_sleep: false,
            images: BTreeMap::new(),
            pull_secrets: Vec::new(),
            ready_wait: RELEASE_WAIT,
        }
    }

    pub fn release_selector(&self) -> LabelSelector {
        LabelSelector::new().with(RELEASE_LABEL, &self.release_name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Deployment {
    pub pod: Pod,
    pub revision: Option<u32>,
    /// False when the running release was reused.
    pub deployed: bool,
}

/// Deep-merge `over` into `base`: mappings merge key by key, anything else replaces.
pub fn merge_values(base: &mut Value, over: Value) {
    match (base, over) {
        (Value::Mapping(b), Value::Mapping(o)) => {
            for (k, v) in o {
                match b.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        b.insert(k, v);
                    }
                }
            }
        }
        (b, o) => *b = o,
    }
}

fn read_chart_values(chart: &Path) -> Result<Value, DeployError> {
    let path = chart.join("values.yaml");
    match fs::read_to_string(&path) {
        Ok(text) if text.trim().is_empty() => Ok(Value::Mapping(Mapping::new())),
        Ok(text) => serde_yaml::from_str(&text).map_err(|e| {
            DeployError::Values(format!("error reading chart values {}: {e}", path.display()))
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Value::Mapping(Mapping::new())),
        Err(e) => Err(DeployError::Values(format!(
            "error reading chart values {}: {e}",
            path.display()
        ))),
    }
}

/// Chart values with the container image/command overrides and pull secrets applied.
pub fn build_values(chart: &Path, opts: &DeployOptions) -> Result<Value, DeployError> {
    let mut values = read_chart_values(chart)?;
    if !values.is_mapping() {
        return Err(DeployError::Values("values.yaml is not a mapping".to_string()));
    }

    let mut containers = Mapping::new();
    for (name, image) in &opts.images {
        let mut c = Mapping::new();
        c.insert("image".into(), Value::String(image.clone()));
        if opts.no_sleep {
            c.insert("command".into(), Value::Sequence(Vec::new()));
            c.insert("args".into(), Value::Sequence(Vec::new()));
        }
        containers.insert(Value::String(name.clone()), Value::Mapping(c));
    }

    let mut secrets: Vec<Value> = values
        .get("pullSecrets")
        .and_then(Value::as_sequence)
        .cloned()
        .unwrap_or_default();
    for s in &opts.pull_secrets {
        let v = Value::String(s.clone());
        if !secrets.contains(&v) {
            secrets.push(v);
        }
    }

    let mut over = Mapping::new();
    over.insert("containers".into(), Value::Mapping(containers));
    over.insert("pullSecrets".into(), Value::Sequence(secrets));
    merge_values(&mut values, Value::Mapping(over));
    Ok(values)
}

fn pod_matches_revision(pod: &Pod, revision: u32) -> bool {
    match pod.annotation(REVISION_ANNOTATION) {
        Some(r) => r.trim() == revision.to_string(),
        None => true,
    }
}

pub struct DeploymentPipeline<'a> {
    conn: &'a ClusterConnection,
    cache: &'a ReleaseCache,
    cancel: CancelToken,
}

impl<'a> DeploymentPipeline<'a> {
    pub fn new(conn: &'a ClusterConnection, cache: &'a ReleaseCache) -> Self {
        Self {
            conn,
            cache,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn ensure_deployed(&self, opts: &DeployOptions) -> Result<Deployment, DeployError> {
        let hash = fingerprint(&opts.chart_path).map_err(|e| DeployError::Fingerprint {
            path: opts.chart_path.clone(),
            source: e,
        })?;
        let (cached_hash, cached_revision) = self.cache.last_deploy().map_err(DeployError::Cache)?;

        let selector = opts.release_selector();
        let existing = match first_running_pod(self.conn.cluster(), &opts.namespace, &selector) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(target: "devspace.deploy", error = %e, "cannot look up release pod");
                None
            }
        };

        match decide(existing, opts.force, &hash, cached_hash.as_deref()) {
            DeployDecision::Skip(pod) => {
                tracing::info!(target: "devspace.deploy", release = %opts.release_name, pod = %pod, "chart unchanged, reusing release");
                let revision = match cached_revision {
                    Some(r) => Some(r),
                    None => self
                        .conn
                        .backend()
                        .release_revision(&opts.release_name)
                        .unwrap_or(None),
                };
                Ok(Deployment {
                    pod,
                    revision,
                    deployed: false,
                })
            }
            DeployDecision::Deploy(reason) => {
                tracing::info!(target: "devspace.deploy", release = %opts.release_name, %reason, "deploying chart");
                let values = build_values(&opts.chart_path, opts)?;
                let revision = self
                    .conn
                    .backend()
                    .install_or_upgrade(&opts.release_name, &opts.namespace, &opts.chart_path, &values)
                    .map_err(DeployError::Install)?;
                let pod = self.wait_for_ready_pod(opts, &selector, revision)?;
                self.cache
                    .record_deploy(&hash, revision)
                    .map_err(DeployError::Cache)?;
                Ok(Deployment {
                    pod,
                    revision: Some(revision),
                    deployed: true,
                })
            }
        }
    }

    fn wait_for_ready_pod(
        &self,
        opts: &DeployOptions,
        selector: &LabelSelector,
        revision: u32,
    ) -> Result<Pod, DeployError> {
        let cluster = self.conn.cluster();
        poll_until(opts.ready_wait, &self.cancel, || {
            let pods = cluster
                .list_pods(&opts.namespace, selector)
                .map_err(|e| e.to_string())?;
            let ready = pods
                .into_iter()
                .find(|p| p.is_ready() && pod_matches_revision(p, revision));
            Ok(ready)
        })
        .map_err(|e| match e {
            PollError::Cancelled { .. } => DeployError::Cancelled,
            PollError::TimedOut { last, .. } => DeployError::ReadinessTimeout {
                release: opts.release_name.clone(),
                revision,
                message: last.unwrap_or_else(|| {
                    format!("no ready pod within {}s", opts.ready_wait.budget.as_secs())
                }),
            },
        })
    }
}
