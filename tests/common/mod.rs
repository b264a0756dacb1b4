#![allow(dead_code)]
//! In-memory collaborators recording every call.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use devspace::errors::{BackendError, ClusterError};
use devspace::helm::{BackendFactory, ChartBackend};
use devspace::helm::ReleaseInfo;
use devspace::kube::{
    Attacher, ClusterApi, Container, ContainerStatus, DeploymentStatus, LabelSelector, Manifest,
    Pod, PortForwarder, PortPair, Tunnel, TunnelOpener,
};
use devspace::session::{SessionError, SyncEngine, SyncHandle, SyncSpec};
use devspace::wait::{CancelToken, WaitPolicy};

pub const FAST_WAIT: WaitPolicy = WaitPolicy::new(Duration::from_millis(5), Duration::from_millis(300));

pub fn pod(ns: &str, name: &str, labels: &[(&str, &str)], containers: &[&str], ready: bool) -> Pod {
    let mut p = Pod::default();
    p.metadata.name = name.to_string();
    p.metadata.namespace = ns.to_string();
    p.metadata.labels = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    p.spec.containers = containers
        .iter()
        .map(|c| Container {
            name: c.to_string(),
            image: None,
        })
        .collect();
    p.status.phase = "Running".to_string();
    p.status.container_statuses = containers
        .iter()
        .map(|c| ContainerStatus {
            name: c.to_string(),
            ready,
        })
        .collect();
    p
}

#[derive(Default)]
pub struct ClusterState {
    pub namespaces: BTreeSet<String>,
    pub service_accounts: BTreeSet<(String, String)>,
    pub deployments: BTreeMap<(String, String), DeploymentStatus>,
    pub pods: Vec<Pod>,
    pub applied: Vec<Manifest>,
    pub created_namespaces: Vec<String>,
    pub deleted: Vec<(String, String, String)>,
}

/// Cluster whose deployments become ready on apply unless `backend_never_ready` is set.
///
/// Applying a namespaced object into a namespace that does not exist fails with
/// "not found", as the API server does.
#[derive(Default)]
pub struct FakeCluster {
    pub state: Mutex<ClusterState>,
    pub backend_never_ready: bool,
    /// Every namespace lookup fails.
    pub forbidden: bool,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn never_ready() -> Arc<Self> {
        Arc::new(Self {
            backend_never_ready: true,
            ..Self::default()
        })
    }

    pub fn forbidden() -> Arc<Self> {
        Arc::new(Self {
            forbidden: true,
            ..Self::default()
        })
    }

    /// A cluster that already runs a ready backend in `ns`.
    pub fn with_backend(ns: &str) -> Arc<Self> {
        let c = Self::default();
        {
            let mut st = c.state.lock().unwrap();
            st.namespaces.insert(ns.to_string());
            st.service_accounts
                .insert((ns.to_string(), "devspace-tiller".to_string()));
            st.deployments.insert(
                (ns.to_string(), "tiller-deploy".to_string()),
                DeploymentStatus {
                    desired_replicas: 1,
                    ready_replicas: 1,
                },
            );
        }
        Arc::new(c)
    }

    pub fn add_pod(&self, p: Pod) {
        self.state.lock().unwrap().pods.push(p);
    }

    pub fn applied_kinds(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .applied
            .iter()
            .map(|m| m.kind.clone())
            .collect()
    }
}

impl ClusterApi for FakeCluster {
    fn namespace_exists(&self, name: &str) -> Result<bool, ClusterError> {
        if self.forbidden {
            return Err(ClusterError::Failed(format!(
                "namespaces \"{name}\" is forbidden"
            )));
        }
        Ok(self.state.lock().unwrap().namespaces.contains(name))
    }

    fn create_namespace(&self, name: &str) -> Result<(), ClusterError> {
        let mut st = self.state.lock().unwrap();
        st.namespaces.insert(name.to_string());
        st.created_namespaces.push(name.to_string());
        Ok(())
    }

    fn service_account_exists(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .service_accounts
            .contains(&(namespace.to_string(), name.to_string())))
    }

    fn deployment_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DeploymentStatus>, ClusterError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .deployments
            .get(&(namespace.to_string(), name.to_string()))
            .copied())
    }

    fn apply(&self, manifest: &Manifest) -> Result<(), ClusterError> {
        let mut st = self.state.lock().unwrap();
        let ns = manifest.namespace.clone().unwrap_or_default();
        if !ns.is_empty() && !st.namespaces.contains(&ns) {
            return Err(ClusterError::NotFound(format!(
                "namespaces \"{ns}\" not found"
            )));
        }
        match manifest.kind.as_str() {
            "ServiceAccount" => {
                st.service_accounts.insert((ns, manifest.name.clone()));
            }
            "Deployment" => {
                let ready = if self.backend_never_ready { 0 } else { 1 };
                st.deployments.insert(
                    (ns, manifest.name.clone()),
                    DeploymentStatus {
                        desired_replicas: 1,
                        ready_replicas: ready,
                    },
                );
            }
            _ => {}
        }
        st.applied.push(manifest.clone());
        Ok(())
    }

    fn list_pods(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<Pod>, ClusterError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pods
            .iter()
            .filter(|p| p.namespace() == namespace && selector.matches(&p.metadata.labels))
            .cloned()
            .collect())
    }

    fn delete(&self, kind: &str, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.state.lock().unwrap().deleted.push((
            kind.to_string(),
            namespace.to_string(),
            name.to_string(),
        ));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTunnels {
    pub opens: AtomicUsize,
    pub fail: bool,
}

impl FakeTunnels {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }
}

impl TunnelOpener for FakeTunnels {
    fn open(&self, _ns: &str, _sel: &LabelSelector, _port: u16) -> Result<Tunnel, ClusterError> {
        let n = self.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ClusterError::Failed("connection refused".into()));
        }
        Ok(Tunnel::detached(40000 + n as u16))
    }
}

/// Chart backend that installs into a `FakeCluster`: every install adds a ready pod
/// labelled `release=<name>` annotated with the new revision, unless `no_pods` is set.
/// While `fail_install` is set every install is recorded and then rejected.
pub struct FakeBackend {
    pub cluster: Arc<FakeCluster>,
    pub installs: Mutex<Vec<(String, String, serde_yaml::Value)>>,
    pub fail_install: AtomicBool,
    pub revision: AtomicU32,
    pub list_calls: AtomicUsize,
    pub no_pods: bool,
    pub containers: Vec<String>,
}

impl FakeBackend {
    pub fn new(cluster: Arc<FakeCluster>) -> Arc<Self> {
        Arc::new(Self::build(cluster, false))
    }

    pub fn without_pods(cluster: Arc<FakeCluster>) -> Arc<Self> {
        Arc::new(Self::build(cluster, true))
    }

    fn build(cluster: Arc<FakeCluster>, no_pods: bool) -> Self {
        Self {
            cluster,
            installs: Mutex::new(Vec::new()),
            fail_install: AtomicBool::new(false),
            revision: AtomicU32::new(0),
            list_calls: AtomicUsize::new(0),
            no_pods,
            containers: vec!["app".to_string(), "sidecar".to_string()],
        }
    }

    pub fn failing(cluster: Arc<FakeCluster>) -> Arc<Self> {
        let b = Self::build(cluster, false);
        b.fail_install.store(true, Ordering::SeqCst);
        Arc::new(b)
    }

    pub fn install_count(&self) -> usize {
        self.installs.lock().unwrap().len()
    }
}

impl ChartBackend for FakeBackend {
    fn list_releases(&self, _limit: usize) -> Result<Vec<ReleaseInfo>, BackendError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }

    fn install_or_upgrade(
        &self,
        name: &str,
        namespace: &str,
        _chart_path: &Path,
        values: &serde_yaml::Value,
    ) -> Result<u32, BackendError> {
        self.installs
            .lock()
            .unwrap()
            .push((name.to_string(), namespace.to_string(), values.clone()));
        if self.fail_install.load(Ordering::SeqCst) {
            return Err(BackendError::Failed(format!(
                "release {name} failed: timed out waiting for the condition"
            )));
        }
        let rev = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.no_pods {
            let containers: Vec<&str> = self.containers.iter().map(String::as_str).collect();
            let mut p = pod(
                namespace,
                &format!("{name}-{rev}"),
                &[("release", name)],
                &containers,
                true,
            );
            p.metadata
                .annotations
                .insert("revision".to_string(), rev.to_string());
            let mut st = self.cluster.state.lock().unwrap();
            st.pods
                .retain(|q| q.metadata.labels.get("release").map(String::as_str) != Some(name));
            st.pods.push(p);
        }
        Ok(rev)
    }

    fn release_revision(&self, _name: &str) -> Result<Option<u32>, BackendError> {
        let rev = self.revision.load(Ordering::SeqCst);
        Ok(if rev == 0 { None } else { Some(rev) })
    }

    fn delete_release(&self, _name: &str, _purge: bool) -> Result<(), BackendError> {
        Ok(())
    }

    fn update_dependencies(&self, _chart_path: &Path) -> Result<(), BackendError> {
        Ok(())
    }
}

pub struct FakeBackendFactory {
    pub backend: Arc<FakeBackend>,
    pub connects: Mutex<Vec<String>>,
}

impl FakeBackendFactory {
    pub fn new(backend: Arc<FakeBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            connects: Mutex::new(Vec::new()),
        })
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().unwrap().len()
    }
}

impl BackendFactory for FakeBackendFactory {
    fn connect(&self, endpoint: &str, _backend_namespace: &str) -> Arc<dyn ChartBackend> {
        self.connects.lock().unwrap().push(endpoint.to_string());
        self.backend.clone()
    }
}

/// Sync engine recording starts and per-session stop counts.
///
/// Sessions whose remote path is listed in `fail_start` fail to start; those listed in
/// `fail_stop` report an error when stopped (after counting the stop).
#[derive(Default)]
pub struct FakeSyncEngine {
    pub started: Mutex<Vec<SyncSpec>>,
    pub stops: Arc<Mutex<BTreeMap<String, usize>>>,
    pub fail_start: Vec<String>,
    pub fail_stop: Vec<String>,
}

impl FakeSyncEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn started_pods(&self) -> Vec<String> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.pod.name().to_string())
            .collect()
    }

    pub fn stop_count(&self, remote: &str) -> usize {
        self.stops.lock().unwrap().get(remote).copied().unwrap_or(0)
    }
}

struct FakeSyncHandle {
    remote: String,
    stops: Arc<Mutex<BTreeMap<String, usize>>>,
    fail: bool,
}

impl SyncHandle for FakeSyncHandle {
    fn stop(&mut self) -> Result<(), SessionError> {
        *self
            .stops
            .lock()
            .unwrap()
            .entry(self.remote.clone())
            .or_insert(0) += 1;
        if self.fail {
            Err(SessionError::Stop(format!("{} is stuck", self.remote)))
        } else {
            Ok(())
        }
    }
}

impl SyncEngine for FakeSyncEngine {
    fn start(&self, spec: SyncSpec) -> Result<Box<dyn SyncHandle>, SessionError> {
        if self.fail_start.contains(&spec.remote_path) {
            return Err(SessionError::Start(format!("cannot reach {}", spec.remote_path)));
        }
        let handle = FakeSyncHandle {
            remote: spec.remote_path.clone(),
            stops: self.stops.clone(),
            fail: self.fail_stop.contains(&spec.remote_path),
        };
        self.started.lock().unwrap().push(spec);
        Ok(Box::new(handle))
    }
}

/// Forwarder that reports ready immediately (unless `never_ready`) and blocks until stopped.
#[derive(Default)]
pub struct FakeForwarder {
    pub forwards: Mutex<Vec<(String, Vec<PortPair>)>>,
    pub stopped: AtomicUsize,
    pub never_ready: bool,
}

impl FakeForwarder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn silent() -> Arc<Self> {
        Arc::new(Self {
            never_ready: true,
            ..Self::default()
        })
    }
}

impl PortForwarder for FakeForwarder {
    fn forward(
        &self,
        pod: &Pod,
        ports: &[PortPair],
        stop: CancelToken,
        ready: mpsc::Sender<Vec<u16>>,
    ) -> Result<(), ClusterError> {
        self.forwards
            .lock()
            .unwrap()
            .push((pod.name().to_string(), ports.to_vec()));
        if !self.never_ready {
            let _ = ready.send(ports.iter().map(|p| p.local).collect());
        }
        stop.wait();
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Attacher returning a fixed exit code.
pub struct FakeAttacher {
    pub calls: Mutex<Vec<(String, String, Vec<String>)>>,
    pub exit_code: i32,
}

impl FakeAttacher {
    pub fn new(exit_code: i32) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            exit_code,
        })
    }
}

impl Attacher for FakeAttacher {
    fn attach(&self, pod: &Pod, container: &str, args: &[String]) -> io::Result<i32> {
        self.calls.lock().unwrap().push((
            pod.name().to_string(),
            container.to_string(),
            args.to_vec(),
        ));
        Ok(self.exit_code)
    }
}
