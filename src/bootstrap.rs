//! Chart backend bootstrap.
//!
//! [`BootstrapManager::ensure_ready`] walks the backend through
//! `NamespaceChecked → WorkloadChecked → Installing|Upgrading → ReplicasPending →
//! TunnelEstablished → ApiVerified → Ready` exactly once per manager. Every caller,
//! concurrent or later, observes that single outcome: the same connection or a clone of
//! the same error.
//!
//! Each waiting stage has its own budget ([`crate::wait::BACKEND_WAIT`] by default), so a
//! slow rollout does not eat into the tunnel's retries.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::OnceCell;

use crate::errors::ClusterError;
use crate::helm::{tiller, BackendFactory, ChartBackend, HelmHome, IndexFetcher};
use crate::kube::{ClusterApi, Manifest, Tunnel, TunnelOpener};
use crate::wait::{poll_until, CancelToken, PollError, WaitPolicy, BACKEND_WAIT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BootstrapStage {
    NamespaceChecked,
    WorkloadChecked,
    Installing,
    Upgrading,
    ReplicasPending,
    TunnelEstablished,
    ApiVerified,
    Ready,
}

impl fmt::Display for BootstrapStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BootstrapStage::NamespaceChecked => "namespace",
            BootstrapStage::WorkloadChecked => "workload check",
            BootstrapStage::Installing => "install",
            BootstrapStage::Upgrading => "upgrade",
            BootstrapStage::ReplicasPending => "rollout",
            BootstrapStage::TunnelEstablished => "tunnel",
            BootstrapStage::ApiVerified => "api check",
            BootstrapStage::Ready => "ready",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapErrorKind {
    Failed,
    TimedOut,
    Cancelled,
    ToolMissing,
}

/// Terminal bootstrap failure; cloned to every caller of the run-once bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapError {
    pub stage: BootstrapStage,
    pub kind: BootstrapErrorKind,
    pub message: String,
}

impl BootstrapError {
    fn failed(stage: BootstrapStage, err: &ClusterError) -> Self {
        let kind = match err {
            ClusterError::ToolMissing(_) => BootstrapErrorKind::ToolMissing,
            _ => BootstrapErrorKind::Failed,
        };
        Self {
            stage,
            kind,
            message: err.to_string(),
        }
    }

    fn from_poll(stage: BootstrapStage, what: &str, budget: Duration, err: PollError<String>) -> Self {
        let last = err
            .last()
            .map(|e| format!(" (last error: {e})"))
            .unwrap_or_default();
        match err {
            PollError::TimedOut { attempts, .. } => Self {
                stage,
                kind: BootstrapErrorKind::TimedOut,
                message: format!(
                    "{what} within {}s after {attempts} attempts{last}",
                    budget.as_secs()
                ),
            },
            PollError::Cancelled { .. } => Self {
                stage,
                kind: BootstrapErrorKind::Cancelled,
                message: format!("cancelled while waiting: {what}{last}"),
            },
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == BootstrapErrorKind::TimedOut
    }
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chart backend {} failed: {}", self.stage, self.message)
    }
}

impl std::error::Error for BootstrapError {}

/// Progress of one bootstrap attempt: current stage and the last error seen per stage.
#[derive(Debug, Clone)]
pub struct BootstrapState {
    stage: BootstrapStage,
    last_errors: BTreeMap<BootstrapStage, String>,
}

impl Default for BootstrapState {
    fn default() -> Self {
        Self::new()
    }
}

impl BootstrapState {
    pub fn new() -> Self {
        Self {
            stage: BootstrapStage::NamespaceChecked,
            last_errors: BTreeMap::new(),
        }
    }

    pub fn stage(&self) -> BootstrapStage {
        self.stage
    }

    pub fn advance(&mut self, next: BootstrapStage) {
        tracing::debug!(target: "devspace.bootstrap", from = %self.stage, to = %next, "stage");
        self.stage = next;
    }

    pub fn record(&mut self, error: &str) {
        self.last_errors.insert(self.stage, error.to_string());
    }

    pub fn last_error(&self, stage: BootstrapStage) -> Option<&str> {
        self.last_errors.get(&stage).map(String::as_str)
    }
}

/// Cluster access plus a verified chart backend client, shared read-only once ready.
pub struct ClusterConnection {
    cluster: Arc<dyn ClusterApi>,
    backend: Arc<dyn ChartBackend>,
    backend_namespace: String,
    endpoint: String,
    _tunnel: Option<Tunnel>,
}

impl ClusterConnection {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        backend: Arc<dyn ChartBackend>,
        backend_namespace: &str,
        endpoint: &str,
        tunnel: Option<Tunnel>,
    ) -> Self {
        Self {
            cluster,
            backend,
            backend_namespace: backend_namespace.to_string(),
            endpoint: endpoint.to_string(),
            _tunnel: tunnel,
        }
    }

    pub fn cluster(&self) -> &dyn ClusterApi {
        self.cluster.as_ref()
    }

    pub fn cluster_arc(&self) -> Arc<dyn ClusterApi> {
        self.cluster.clone()
    }

    pub fn backend(&self) -> &dyn ChartBackend {
        self.backend.as_ref()
    }

    pub fn backend_namespace(&self) -> &str {
        &self.backend_namespace
    }

    /// `host:port` of the tunnel to the backend.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl fmt::Debug for ClusterConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConnection")
            .field("backend_namespace", &self.backend_namespace)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    pub backend_namespace: String,
    /// Namespaces the backend service account gets deploy rights in.
    pub app_namespaces: Vec<String>,
    pub image: String,
    pub wait: WaitPolicy,
    /// Chart repository home to prepare once the backend is ready.
    pub helm_home: Option<HelmHome>,
    /// Whether the service account and roles are ours to delete on teardown.
    pub manage_rbac: bool,
}

impl BootstrapOptions {
    pub fn new(backend_namespace: &str) -> Self {
        Self {
            backend_namespace: backend_namespace.to_string(),
            app_namespaces: Vec::new(),
            image: tiller::DEFAULT_IMAGE.to_string(),
            wait: BACKEND_WAIT,
            helm_home: None,
            manage_rbac: true,
        }
    }
}

pub struct BootstrapManager {
    cluster: Arc<dyn ClusterApi>,
    tunnels: Arc<dyn TunnelOpener>,
    backends: Arc<dyn BackendFactory>,
    fetcher: Option<Arc<dyn IndexFetcher>>,
    options: BootstrapOptions,
    cancel: CancelToken,
    cell: OnceCell<Result<Arc<ClusterConnection>, BootstrapError>>,
    failed_state: Mutex<Option<BootstrapState>>,
}

impl BootstrapManager {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        tunnels: Arc<dyn TunnelOpener>,
        backends: Arc<dyn BackendFactory>,
        options: BootstrapOptions,
    ) -> Self {
        Self {
            cluster,
            tunnels,
            backends,
            fetcher: None,
            options,
            cancel: CancelToken::new(),
            cell: OnceCell::new(),
            failed_state: Mutex::new(None),
        }
    }

    pub fn with_index_fetcher(mut self, fetcher: Arc<dyn IndexFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Cancelling this token interrupts any wait of the running bootstrap.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn options(&self) -> &BootstrapOptions {
        &self.options
    }

    /// The connection, once a bootstrap has succeeded.
    pub fn connection(&self) -> Option<Arc<ClusterConnection>> {
        self.cell.get().and_then(|r| r.as_ref().ok().cloned())
    }

    /// State of the failed bootstrap attempt; `None` before a run and after a success.
    pub fn failed_state(&self) -> Option<BootstrapState> {
        self.failed_state.lock().ok().and_then(|s| s.clone())
    }

    /// Run the bootstrap once and share its outcome.
    ///
    /// `force_upgrade` only has an effect on the call that actually runs the bootstrap.
    pub fn ensure_ready(&self, force_upgrade: bool) -> Result<Arc<ClusterConnection>, BootstrapError> {
        self.cell
            .get_or_init(|| {
                let mut state = BootstrapState::new();
                let outcome = self.run(&mut state, force_upgrade);
                if let Err(ref e) = outcome {
                    state.record(&e.message);
                    if let Ok(mut slot) = self.failed_state.lock() {
                        *slot = Some(state);
                    }
                }
                outcome
            })
            .clone()
    }

    fn run(
        &self,
        state: &mut BootstrapState,
        force_upgrade: bool,
    ) -> Result<Arc<ClusterConnection>, BootstrapError> {
        let ns = self.options.backend_namespace.as_str();
        let budget = self.options.wait.budget;

        self.ensure_namespace(state, ns)?;

        state.advance(BootstrapStage::WorkloadChecked);
        let status = self
            .cluster
            .deployment_status(ns, tiller::DEPLOYMENT_NAME)
            .map_err(|e| BootstrapError::failed(state.stage(), &e))?;
        match status {
            None => self.install(state, ns, false)?,
            Some(_) if force_upgrade => self.install(state, ns, true)?,
            Some(_) => {}
        }

        state.advance(BootstrapStage::ReplicasPending);
        poll_until(self.options.wait, &self.cancel, || {
            match self.cluster.deployment_status(ns, tiller::DEPLOYMENT_NAME) {
                Ok(Some(s)) if s.is_ready() => Ok(Some(())),
                Ok(Some(s)) => Err(format!(
                    "{}/{} replicas ready",
                    s.ready_replicas, s.desired_replicas
                )),
                Ok(None) => Err(format!("deployment {ns}/{} not found", tiller::DEPLOYMENT_NAME)),
                Err(e) => Err(e.to_string()),
            }
        })
        .map_err(|e| {
            BootstrapError::from_poll(state.stage(), "backend did not become ready", budget, e)
        })?;

        state.advance(BootstrapStage::TunnelEstablished);
        let selector = tiller::pod_selector();
        let tunnel = poll_until(self.options.wait, &self.cancel, || {
            self.tunnels
                .open(ns, &selector, tiller::BACKEND_PORT)
                .map(Some)
                .map_err(|e| e.to_string())
        })
        .map_err(|e| {
            BootstrapError::from_poll(state.stage(), "could not open a tunnel to the backend", budget, e)
        })?;
        let endpoint = tunnel.endpoint();
        tracing::info!(target: "devspace.bootstrap", endpoint = %endpoint, "tunnel established");

        state.advance(BootstrapStage::ApiVerified);
        let backend = self.backends.connect(&endpoint, ns);
        poll_until(self.options.wait, &self.cancel, || {
            backend
                .list_releases(1)
                .map(|_| Some(()))
                .map_err(|e| e.to_string())
        })
        .map_err(|e| {
            BootstrapError::from_poll(state.stage(), "backend api did not respond", budget, e)
        })?;

        state.advance(BootstrapStage::Ready);
        self.prepare_repositories();

        Ok(Arc::new(ClusterConnection::new(
            self.cluster.clone(),
            backend,
            ns,
            &endpoint,
            Some(tunnel),
        )))
    }

    fn ensure_namespace(&self, state: &BootstrapState, ns: &str) -> Result<(), BootstrapError> {
        let exists = self
            .cluster
            .namespace_exists(ns)
            .map_err(|e| BootstrapError::failed(state.stage(), &e))?;
        if !exists {
            tracing::info!(target: "devspace.bootstrap", namespace = %ns, "creating namespace");
            self.cluster
                .create_namespace(ns)
                .map_err(|e| BootstrapError::failed(state.stage(), &e))?;
        }
        Ok(())
    }

    fn apply(&self, state: &BootstrapState, manifest: &Manifest) -> Result<(), BootstrapError> {
        tracing::debug!(target: "devspace.bootstrap", kind = %manifest.kind, name = %manifest.name, "apply");
        self.cluster
            .apply(manifest)
            .map_err(|e| BootstrapError::failed(state.stage(), &e))
    }

    fn install(&self, state: &mut BootstrapState, ns: &str, upgrade: bool) -> Result<(), BootstrapError> {
        if upgrade {
            state.advance(BootstrapStage::Upgrading);
        } else {
            state.advance(BootstrapStage::Installing);
            let has_account = self
                .cluster
                .service_account_exists(ns, tiller::SERVICE_ACCOUNT_NAME)
                .map_err(|e| BootstrapError::failed(state.stage(), &e))?;
            if !has_account {
                // Roles land in every app namespace, so those must exist first
                for app in &self.options.app_namespaces {
                    if app != ns {
                        self.ensure_namespace(state, app)?;
                    }
                }
                self.apply(state, &tiller::service_account(ns))?;
                for m in tiller::rbac_manifests(ns, &self.options.app_namespaces) {
                    self.apply(state, &m)?;
                }
            }
        }
        self.apply(state, &tiller::deployment(ns, &self.options.image))?;
        self.apply(state, &tiller::service(ns))?;
        tracing::info!(
            target: "devspace.bootstrap",
            namespace = %ns,
            upgrade,
            "backend workload applied"
        );
        Ok(())
    }

    /// Best effort: a missing home or an unreachable repository is logged, never fatal.
    fn prepare_repositories(&self) {
        let Some(ref home) = self.options.helm_home else {
            return;
        };
        match home.ensure() {
            Ok(true) => {
                if let Some(ref fetcher) = self.fetcher {
                    match crate::helm::repos::refresh_indexes(home, fetcher.as_ref()) {
                        Ok(report) => tracing::debug!(
                            target: "devspace.bootstrap",
                            refreshed = report.refreshed.len(),
                            failed = report.failed.len(),
                            "repository indexes refreshed"
                        ),
                        Err(e) => tracing::warn!(target: "devspace.bootstrap", error = %format!("{e:#}"), "repository refresh skipped"),
                    }
                }
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(target: "devspace.bootstrap", home = %home.root().display(), error = %e, "cannot prepare chart home")
            }
        }
    }

    /// Remove the backend: deployment, service and (when managed) service account, roles
    /// and bindings. "Not found" is ignored; every other failure is collected.
    pub fn delete_backend(&self) -> Result<(), ClusterError> {
        let ns = self.options.backend_namespace.as_str();
        let mut targets: Vec<(&str, String, String)> = vec![
            ("deployment", ns.to_string(), tiller::DEPLOYMENT_NAME.to_string()),
            ("service", ns.to_string(), tiller::DEPLOYMENT_NAME.to_string()),
        ];
        if self.options.manage_rbac {
            targets.push((
                "serviceaccount",
                ns.to_string(),
                tiller::SERVICE_ACCOUNT_NAME.to_string(),
            ));
            let mut namespaces = vec![ns.to_string()];
            for app in &self.options.app_namespaces {
                if !namespaces.contains(app) {
                    namespaces.push(app.clone());
                }
            }
            for app in namespaces {
                for role in [tiller::ROLE_NAME, tiller::ROLE_MANAGER_NAME] {
                    targets.push(("role", app.clone(), role.to_string()));
                    targets.push(("rolebinding", app.clone(), tiller::binding_name(role)));
                }
            }
        }

        let errors: Vec<String> = targets
            .iter()
            .filter_map(|(kind, ns, name)| match self.cluster.delete(kind, ns, name) {
                Ok(()) => None,
                Err(e) if e.is_not_found() => None,
                Err(e) => Some(format!("{kind} {ns}/{name}: {e}")),
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ClusterError::Failed(errors.join("\n")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_records_errors_per_stage() {
        let mut st = BootstrapState::new();
        assert_eq!(st.stage(), BootstrapStage::NamespaceChecked);
        st.advance(BootstrapStage::Installing);
        st.record("forbidden");
        st.advance(BootstrapStage::ReplicasPending);
        assert_eq!(st.last_error(BootstrapStage::Installing), Some("forbidden"));
        assert_eq!(st.last_error(BootstrapStage::ReplicasPending), None);
    }

    #[test]
    fn test_timeout_error_message() {
        let err = BootstrapError::from_poll(
            BootstrapStage::ReplicasPending,
            "backend did not become ready",
            Duration::from_secs(120),
            PollError::TimedOut {
                attempts: 25,
                last: Some("0/1 replicas ready".to_string()),
            },
        );
        assert!(err.is_timeout());
        let msg = err.to_string();
        assert!(msg.contains("backend did not become ready within 120s"), "{msg}");
        assert!(msg.contains("0/1 replicas ready"), "{msg}");
    }

    #[test]
    fn test_missing_tool_kind() {
        let err = BootstrapError::failed(
            BootstrapStage::NamespaceChecked,
            &ClusterError::ToolMissing("kubectl is required but was not found in PATH.".into()),
        );
        assert_eq!(err.kind, BootstrapErrorKind::ToolMissing);
    }
}
