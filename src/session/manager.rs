//! Starts and stops sync and port-forward sessions for the configured declarations.
//!
//! Sessions are resolved to pods at start time. A declaration whose pod or container cannot
//! be found is skipped with a warning; start failures follow the caller's
//! `SessionFailurePolicy`. `stop_all` stops every sync handle exactly once, also when some of
//! them fail to stop.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::resolve::{resolve_container, resolve_pod};
use super::sync::{SyncEngine, SyncHandle, SyncSpec};
use super::{SelectorQuery, SessionError, SessionFailurePolicy};
use crate::config::{BandwidthLimits, PortForwardingConfig, SyncConfig};
use crate::kube::{ClusterApi, LabelSelector, Pod, PortForwarder, PortPair};
use crate::wait::CancelToken;

/// How long a forward may take to report its local listeners before we move on.
pub const FORWARD_READY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct SyncDeclaration {
    pub query: SelectorQuery,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub exclude_paths: Vec<String>,
    pub download_exclude_paths: Vec<String>,
    pub upload_exclude_paths: Vec<String>,
    pub bandwidth: BandwidthLimits,
}

impl SyncDeclaration {
    pub fn from_config(cfg: &SyncConfig, default_namespace: &str, workdir: &Path) -> Self {
        let sub = cfg.local_sub_path.trim_start_matches("./");
        Self {
            query: SelectorQuery {
                labels: LabelSelector::from_map(&cfg.label_selector),
                namespace: non_empty_or(cfg.namespace.as_deref(), default_namespace),
                resource_type: None,
                container: cfg.container_name.clone(),
            },
            local_path: if sub.is_empty() || sub == "." {
                workdir.to_path_buf()
            } else {
                workdir.join(sub)
            },
            remote_path: cfg.container_path.clone(),
            exclude_paths: cfg.exclude_paths.clone(),
            download_exclude_paths: cfg.download_exclude_paths.clone(),
            upload_exclude_paths: cfg.upload_exclude_paths.clone(),
            bandwidth: cfg.bandwidth_limits.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardDeclaration {
    pub query: SelectorQuery,
    pub ports: Vec<PortPair>,
}

impl ForwardDeclaration {
    pub fn from_config(cfg: &PortForwardingConfig, default_namespace: &str) -> Self {
        Self {
            query: SelectorQuery {
                labels: LabelSelector::from_map(&cfg.label_selector),
                namespace: non_empty_or(cfg.namespace.as_deref(), default_namespace),
                resource_type: cfg.resource_type.clone(),
                container: None,
            },
            ports: cfg
                .port_mappings
                .iter()
                .map(|m| PortPair::new(m.local_port, m.remote_port))
                .collect(),
        }
    }
}

fn non_empty_or(value: Option<&str>, default: &str) -> String {
    match value {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => default.to_string(),
    }
}

/// A running sync session. `stop` reaches the engine at most once.
pub struct SyncSessionHandle {
    pod: Pod,
    container: String,
    local_path: PathBuf,
    remote_path: String,
    inner: Box<dyn SyncHandle>,
    stopped: bool,
}

impl SyncSessionHandle {
    pub fn pod(&self) -> &Pod {
        &self.pod
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn stop(&mut self) -> Result<(), SessionError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.inner.stop()
    }
}

impl std::fmt::Debug for SyncSessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSessionHandle")
            .field("pod", &self.pod.to_string())
            .field("container", &self.container)
            .field("local_path", &self.local_path)
            .field("remote_path", &self.remote_path)
            .field("stopped", &self.stopped)
            .finish()
    }
}

/// A running port forward; cancelled on `stop` or drop.
#[derive(Debug)]
pub struct ForwardSessionHandle {
    pod: Pod,
    ports: Vec<PortPair>,
    ready: bool,
    stop: CancelToken,
    thread: Option<JoinHandle<()>>,
}

impl ForwardSessionHandle {
    pub fn pod(&self) -> &Pod {
        &self.pod
    }

    pub fn ports(&self) -> &[PortPair] {
        &self.ports
    }

    /// Whether the forwarder reported its listeners within the ready timeout.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn stop(&mut self) {
        self.stop.cancel();
        if let Some(h) = self.thread.take() {
            let _ = h.join();
        }
    }
}

impl Drop for ForwardSessionHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Outcome of starting all sync declarations. Indices refer to the declaration list.
#[derive(Debug, Default)]
pub struct SyncBatch {
    pub handles: Vec<SyncSessionHandle>,
    pub skipped: Vec<(usize, SessionError)>,
    pub failed: Vec<(usize, SessionError)>,
}

#[derive(Debug, Default)]
pub struct ForwardBatch {
    pub handles: Vec<ForwardSessionHandle>,
    pub skipped: Vec<(usize, SessionError)>,
    pub failed: Vec<(usize, SessionError)>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub syncs_stopped: usize,
    pub forwards_stopped: usize,
    pub errors: Vec<String>,
}

pub struct SessionManager {
    cluster: Arc<dyn ClusterApi>,
    engine: Arc<dyn SyncEngine>,
    forwarder: Arc<dyn PortForwarder>,
    forward_ready_timeout: Duration,
    verbose_sync: bool,
}

impl SessionManager {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        engine: Arc<dyn SyncEngine>,
        forwarder: Arc<dyn PortForwarder>,
    ) -> Self {
        Self {
            cluster,
            engine,
            forwarder,
            forward_ready_timeout: FORWARD_READY_TIMEOUT,
            verbose_sync: false,
        }
    }

    pub fn with_forward_ready_timeout(mut self, timeout: Duration) -> Self {
        self.forward_ready_timeout = timeout;
        self
    }

    pub fn with_verbose_sync(mut self, verbose: bool) -> Self {
        self.verbose_sync = verbose;
        self
    }

    pub fn start_sync(&self, decl: &SyncDeclaration) -> Result<SyncSessionHandle, SessionError> {
        let pod = resolve_pod(self.cluster.as_ref(), &decl.query)?;
        let container = resolve_container(&pod, decl.query.container.as_deref())?;
        let spec = SyncSpec {
            pod: pod.clone(),
            container: container.clone(),
            local_path: decl.local_path.clone(),
            remote_path: decl.remote_path.clone(),
            exclude_paths: decl.exclude_paths.clone(),
            download_exclude_paths: decl.download_exclude_paths.clone(),
            upload_exclude_paths: decl.upload_exclude_paths.clone(),
            bandwidth: decl.bandwidth,
            verbose: self.verbose_sync,
        };
        let inner = self.engine.start(spec)?;
        tracing::info!(
            target: "devspace.session",
            pod = %pod,
            container = %container,
            local = %decl.local_path.display(),
            remote = %decl.remote_path,
            "sync started"
        );
        Ok(SyncSessionHandle {
            pod,
            container,
            local_path: decl.local_path.clone(),
            remote_path: decl.remote_path.clone(),
            inner,
            stopped: false,
        })
    }

    /// Start every sync declaration in order.
    ///
    /// Under `Abort`, the first failure stops the sessions already started and is returned.
    pub fn start_sync_all(
        &self,
        decls: &[SyncDeclaration],
        policy: SessionFailurePolicy,
    ) -> Result<SyncBatch, SessionError> {
        let mut batch = SyncBatch::default();
        for (idx, decl) in decls.iter().enumerate() {
            match self.start_sync(decl) {
                Ok(h) => batch.handles.push(h),
                Err(e) if e.is_skip() => {
                    tracing::warn!(target: "devspace.session", index = idx, error = %e, "sync skipped");
                    batch.skipped.push((idx, e));
                }
                Err(e) => match policy {
                    SessionFailurePolicy::Abort => {
                        tracing::error!(target: "devspace.session", index = idx, error = %e, "sync failed, aborting");
                        let report = self.stop_all(&mut batch.handles, &mut []);
                        for err in report.errors {
                            tracing::warn!(target: "devspace.session", error = %err, "stop after abort failed");
                        }
                        return Err(e);
                    }
                    SessionFailurePolicy::Isolate => {
                        tracing::warn!(target: "devspace.session", index = idx, error = %e, "sync failed");
                        batch.failed.push((idx, e));
                    }
                },
            }
        }
        Ok(batch)
    }

    /// Start a forward and wait up to the ready timeout for its listeners.
    ///
    /// A forward that is not ready in time is still returned; only its `is_ready` is false.
    pub fn start_forward(
        &self,
        decl: &ForwardDeclaration,
    ) -> Result<ForwardSessionHandle, SessionError> {
        let pod = resolve_pod(self.cluster.as_ref(), &decl.query)?;
        let stop = CancelToken::new();
        let (tx, rx) = mpsc::channel();
        let forwarder = self.forwarder.clone();
        let task_pod = pod.clone();
        let task_ports = decl.ports.clone();
        let task_stop = stop.clone();
        let thread = std::thread::spawn(move || {
            if let Err(e) = forwarder.forward(&task_pod, &task_ports, task_stop, tx) {
                tracing::warn!(target: "devspace.session", pod = %task_pod, error = %e, "port forwarding ended");
            }
        });
        let ready = match rx.recv_timeout(self.forward_ready_timeout) {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(target: "devspace.session", pod = %pod, "Timeout waiting for port forwarding to start");
                false
            }
        };
        Ok(ForwardSessionHandle {
            pod,
            ports: decl.ports.clone(),
            ready,
            stop,
            thread: Some(thread),
        })
    }

    /// Start every forward declaration; forward failures never abort the run.
    pub fn start_forward_all(&self, decls: &[ForwardDeclaration]) -> ForwardBatch {
        let mut batch = ForwardBatch::default();
        for (idx, decl) in decls.iter().enumerate() {
            match self.start_forward(decl) {
                Ok(h) => batch.handles.push(h),
                Err(e) if e.is_skip() => {
                    tracing::warn!(target: "devspace.session", index = idx, error = %e, "port forwarding skipped");
                    batch.skipped.push((idx, e));
                }
                Err(e) => {
                    tracing::warn!(target: "devspace.session", index = idx, error = %e, "port forwarding failed");
                    batch.failed.push((idx, e));
                }
            }
        }
        batch
    }

    /// Stop every session. Stop errors are collected; they never skip the remaining handles.
    pub fn stop_all(
        &self,
        syncs: &mut [SyncSessionHandle],
        forwards: &mut [ForwardSessionHandle],
    ) -> StopReport {
        let mut report = StopReport::default();
        for h in syncs.iter_mut() {
            if h.is_stopped() {
                continue;
            }
            match h.stop() {
                Ok(()) => report.syncs_stopped += 1,
                Err(e) => {
                    tracing::warn!(target: "devspace.session", pod = %h.pod, error = %e, "sync stop failed");
                    report.errors.push(format!("{}: {e}", h.pod));
                }
            }
        }
        for f in forwards.iter_mut() {
            f.stop();
            report.forwards_stopped += 1;
        }
        report
    }
}
