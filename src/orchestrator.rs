//! The `up` workflow: bootstrap the chart backend, deploy the release, start port forwards
//! and syncs, attach a terminal, and stop every session once the terminal exits.
//!
//! Bootstrap and deployment failures end the run before any session exists.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use crate::bootstrap::{BootstrapManager, BootstrapOptions, ClusterConnection};
use crate::color::{log_done_stderr, log_info_stderr, log_warn_stderr};
use crate::config::Config;
use crate::deploy::{Deployment, DeployOptions, DeploymentPipeline};
use crate::helm::{BackendFactory, HelmCliFactory, HelmHome, HttpIndexFetcher, IndexFetcher};
use crate::kube::{
    Attacher, ClusterApi, KubectlAttach, KubectlCluster, KubectlPortForwarder, KubectlTunnel,
    PortForwarder, TunnelOpener,
};
use crate::registry;
use crate::release_cache::ReleaseCache;
use crate::session::{
    resolve_container, ForwardDeclaration, SessionFailurePolicy, SessionManager, SyncDeclaration,
    SyncEngine,
};
use crate::sync_engine::TarSyncEngine;

/// Readiness timeout of the backend tunnel's port forward.
const TUNNEL_READY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct UpOptions {
    pub workdir: PathBuf,
    pub force_backend_upgrade: bool,
    pub init_registries: bool,
    pub force_deploy: bool,
    pub sync: bool,
    pub port_forwarding: bool,
    pub no_sleep: bool,
    pub verbose_sync: bool,
    pub container: Option<String>,
    pub command: Vec<String>,
    pub sync_failure: SessionFailurePolicy,
    pub helm_home: Option<HelmHome>,
    pub use_color: bool,
}

impl UpOptions {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            force_backend_upgrade: false,
            init_registries: true,
            force_deploy: false,
            sync: true,
            port_forwarding: true,
            no_sleep: false,
            verbose_sync: false,
            container: None,
            command: Vec::new(),
            sync_failure: SessionFailurePolicy::Abort,
            helm_home: None,
            use_color: false,
        }
    }
}

/// Everything the workflow talks to outside this process.
#[derive(Clone)]
pub struct Collaborators {
    pub cluster: Arc<dyn ClusterApi>,
    pub tunnels: Arc<dyn TunnelOpener>,
    pub backends: Arc<dyn BackendFactory>,
    pub fetcher: Option<Arc<dyn IndexFetcher>>,
    pub forwarder: Arc<dyn PortForwarder>,
    pub sync_engine: Arc<dyn SyncEngine>,
    pub attacher: Arc<dyn Attacher>,
}

impl Collaborators {
    /// The bundled kubectl/helm implementations.
    pub fn from_tools(kubectl: &Path, helm: &Path, home: &HelmHome) -> Self {
        let cluster: Arc<dyn ClusterApi> = Arc::new(KubectlCluster::new(kubectl.to_path_buf()));
        let forwarder: Arc<dyn PortForwarder> =
            Arc::new(KubectlPortForwarder::new(kubectl.to_path_buf()));
        let fetcher: Option<Arc<dyn IndexFetcher>> = match HttpIndexFetcher::new() {
            Ok(f) => Some(Arc::new(f)),
            Err(e) => {
                tracing::warn!(target: "devspace.up", error = %format!("{e:#}"), "repository index fetcher unavailable");
                None
            }
        };
        Self {
            tunnels: Arc::new(KubectlTunnel::new(
                cluster.clone(),
                forwarder.clone(),
                TUNNEL_READY_TIMEOUT,
            )),
            backends: Arc::new(HelmCliFactory::new(
                helm.to_path_buf(),
                home.root().to_path_buf(),
            )),
            fetcher,
            sync_engine: Arc::new(TarSyncEngine::new(kubectl.to_path_buf())),
            attacher: Arc::new(KubectlAttach::new(kubectl.to_path_buf())),
            forwarder,
            cluster,
        }
    }
}

pub struct Orchestrator {
    config: Config,
    collab: Collaborators,
    opts: UpOptions,
    bootstrap: BootstrapManager,
}

impl Orchestrator {
    pub fn new(config: Config, collab: Collaborators, opts: UpOptions) -> Self {
        let mut boot_opts = BootstrapOptions::new(config.tiller_namespace());
        boot_opts.app_namespaces = config.app_namespaces();
        boot_opts.helm_home = opts.helm_home.clone();
        let mut bootstrap = BootstrapManager::new(
            collab.cluster.clone(),
            collab.tunnels.clone(),
            collab.backends.clone(),
            boot_opts,
        );
        if let Some(ref f) = collab.fetcher {
            bootstrap = bootstrap.with_index_fetcher(f.clone());
        }
        Self {
            config,
            collab,
            opts,
            bootstrap,
        }
    }

    pub fn bootstrap(&self) -> &BootstrapManager {
        &self.bootstrap
    }

    /// Run the workflow; returns the attached command's exit code.
    pub fn up(&self) -> Result<i32> {
        let color = self.opts.use_color;
        let namespace = self.config.release_namespace().to_string();
        // The backend's roles are bound inside the release namespace
        self.ensure_release_namespace(&namespace)?;

        let conn = self.bootstrap.ensure_ready(self.opts.force_backend_upgrade)?;
        log_done_stderr(
            color,
            &format!("Chart backend ready in namespace {}", conn.backend_namespace()),
        );

        if self.opts.init_registries {
            let secrets = registry::init_pull_secrets(conn.cluster(), &self.config, &namespace)
                .context("registry initialization failed")?;
            if !secrets.is_empty() {
                log_done_stderr(color, &format!("Pull secrets ready: {}", secrets.join(", ")));
            }
        }

        let deployment = self.deploy(&conn, &namespace)?;

        let sessions = SessionManager::new(
            conn.cluster_arc(),
            self.collab.sync_engine.clone(),
            self.collab.forwarder.clone(),
        )
        .with_verbose_sync(self.opts.verbose_sync);

        let mut forwards = if self.opts.port_forwarding {
            let decls: Vec<ForwardDeclaration> = self
                .config
                .port_configs()
                .iter()
                .map(|c| ForwardDeclaration::from_config(c, &namespace))
                .collect();
            let batch = sessions.start_forward_all(&decls);
            for h in &batch.handles {
                let ports: Vec<String> = h.ports().iter().map(|p| p.to_string()).collect();
                if h.is_ready() {
                    log_done_stderr(
                        color,
                        &format!("Port forwarding started on {} ({})", ports.join(", "), h.pod()),
                    );
                } else {
                    log_warn_stderr(
                        color,
                        &format!("Timeout waiting for port forwarding {} to start", ports.join(", ")),
                    );
                }
            }
            for (_, e) in batch.skipped.iter().chain(batch.failed.iter()) {
                log_warn_stderr(color, &format!("Port forwarding skipped: {e}"));
            }
            batch.handles
        } else {
            Vec::new()
        };

        let mut syncs = if self.opts.sync {
            let decls: Vec<SyncDeclaration> = self
                .config
                .sync_configs()
                .iter()
                .map(|c| SyncDeclaration::from_config(c, &namespace, &self.opts.workdir))
                .collect();
            let batch = match sessions.start_sync_all(&decls, self.opts.sync_failure) {
                Ok(b) => b,
                Err(e) => {
                    sessions.stop_all(&mut [], &mut forwards);
                    return Err(anyhow!(e));
                }
            };
            for h in &batch.handles {
                log_done_stderr(
                    color,
                    &format!(
                        "Sync started on {} <-> {} ({}/{})",
                        h.local_path().display(),
                        h.remote_path(),
                        h.pod(),
                        h.container()
                    ),
                );
            }
            for (_, e) in &batch.skipped {
                log_warn_stderr(color, &format!("Couldn't start sync: {e}"));
            }
            if !batch.failed.is_empty() {
                log_warn_stderr(
                    color,
                    &format!("{} sync session(s) failed to start:", batch.failed.len()),
                );
                for (idx, e) in &batch.failed {
                    log_warn_stderr(color, &format!("  sync #{}: {e}", idx + 1));
                }
            }
            batch.handles
        } else {
            Vec::new()
        };

        let attached = self.attach(&deployment);

        let report = sessions.stop_all(&mut syncs, &mut forwards);
        for e in &report.errors {
            log_warn_stderr(color, &format!("Error stopping sync: {e}"));
        }
        tracing::debug!(
            target: "devspace.up",
            syncs = report.syncs_stopped,
            forwards = report.forwards_stopped,
            "sessions stopped"
        );
        attached
    }

    fn ensure_release_namespace(&self, namespace: &str) -> Result<()> {
        let cluster = self.collab.cluster.as_ref();
        let exists = cluster
            .namespace_exists(namespace)
            .with_context(|| format!("unable to look up namespace {namespace}"))?;
        if !exists {
            cluster
                .create_namespace(namespace)
                .with_context(|| format!("unable to create namespace {namespace}"))?;
            log_info_stderr(self.opts.use_color, &format!("Created namespace {namespace}"));
        }
        Ok(())
    }

    fn deploy(&self, conn: &ClusterConnection, namespace: &str) -> Result<Deployment> {
        let cache = ReleaseCache::in_workdir(&self.opts.workdir);
        let mut opts = DeployOptions::new(
            self.config.release_name(),
            namespace,
            self.opts.workdir.join(self.config.chart_path()),
        );
        opts.force = self.opts.force_deploy;
        opts.no_sleep = self.opts.no_sleep;
        opts.images = registry::image_references(&self.config);
        opts.pull_secrets = registry::implied_pull_secrets(&self.config);

        let deployment = DeploymentPipeline::new(conn, &cache).ensure_deployed(&opts)?;
        let revision = deployment
            .revision
            .map(|r| r.to_string())
            .unwrap_or_else(|| "?".into());
        if deployment.deployed {
            log_done_stderr(
                self.opts.use_color,
                &format!("Deployed release {} (revision {revision})", opts.release_name),
            );
        } else {
            log_info_stderr(
                self.opts.use_color,
                &format!("Release {} is up to date (revision {revision})", opts.release_name),
            );
        }
        Ok(deployment)
    }

    fn attach(&self, deployment: &Deployment) -> Result<i32> {
        let container = resolve_container(&deployment.pod, self.opts.container.as_deref())?;
        log_info_stderr(
            self.opts.use_color,
            &format!("Attaching to {} ({container})", deployment.pod),
        );
        self.collab
            .attacher
            .attach(&deployment.pod, &container, &self.opts.command)
            .with_context(|| format!("unable to attach to {}", deployment.pod))
    }
}
