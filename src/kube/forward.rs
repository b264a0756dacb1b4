//! Port forwarding: the blocking `PortForwarder` contract, its kubectl implementation,
//! and `Tunnel`, a background forward to a single pod port used to reach the chart backend.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{first_running_pod, ClusterApi, LabelSelector, Pod};
use crate::errors::ClusterError;
use crate::wait::CancelToken;

/// `local:remote`; a local port of 0 lets the forwarder pick a free port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortPair {
    pub local: u16,
    pub remote: u16,
}

impl PortPair {
    pub fn new(local: u16, remote: u16) -> Self {
        Self { local, remote }
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.local == 0 {
            write!(f, ":{}", self.remote)
        } else {
            write!(f, "{}:{}", self.local, self.remote)
        }
    }
}

pub trait PortForwarder: Send + Sync {
    /// Forward `ports` to `pod` until `stop` is cancelled.
    ///
    /// Blocks for the lifetime of the forward. Once every pair listens locally, the bound
    /// local ports (in `ports` order) are sent on `ready`.
    fn forward(
        &self,
        pod: &Pod,
        ports: &[PortPair],
        stop: CancelToken,
        ready: mpsc::Sender<Vec<u16>>,
    ) -> Result<(), ClusterError>;
}

#[derive(Debug, Clone)]
pub struct KubectlPortForwarder {
    kubectl: PathBuf,
}

impl KubectlPortForwarder {
    pub fn new(kubectl: PathBuf) -> Self {
        Self { kubectl }
    }
}

/// Parse `Forwarding from 127.0.0.1:38123 -> 44134` into `(38123, 44134)`.
fn parse_forwarding_line(line: &str) -> Option<(u16, u16)> {
    let rest = line.trim().strip_prefix("Forwarding from ")?;
    let (addr, remote) = rest.split_once(" -> ")?;
    let local = addr.rsplit(':').next()?.parse().ok()?;
    let remote = remote.trim().parse().ok()?;
    Some((local, remote))
}

impl PortForwarder for KubectlPortForwarder {
    fn forward(
        &self,
        pod: &Pod,
        ports: &[PortPair],
        stop: CancelToken,
        ready: mpsc::Sender<Vec<u16>>,
    ) -> Result<(), ClusterError> {
        let mut cmd = Command::new(&self.kubectl);
        cmd.arg("port-forward")
            .arg("-n")
            .arg(pod.namespace())
            .arg(format!("pod/{}", pod.name()));
        for p in ports {
            cmd.arg(p.to_string());
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| ClusterError::from_io(&e))?;
        let wanted: Vec<u16> = ports.iter().map(|p| p.remote).collect();

        let reader = child.stdout.take().map(|stdout| {
            std::thread::spawn(move || {
                let mut bound: BTreeMap<u16, u16> = BTreeMap::new();
                let mut sent = false;
                for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                    tracing::debug!(target: "devspace.forward", "{line}");
                    if let Some((local, remote)) = parse_forwarding_line(&line) {
                        bound.entry(remote).or_insert(local);
                    }
                    if !sent && wanted.iter().all(|r| bound.contains_key(r)) {
                        let locals = wanted.iter().filter_map(|r| bound.get(r).copied()).collect();
                        let _ = ready.send(locals);
                        sent = true;
                    }
                }
            })
        });
        let mut stderr = child.stderr.take();

        let result = loop {
            if stop.wait_timeout(Duration::from_millis(200)) {
                let _ = child.kill();
                let _ = child.wait();
                break Ok(());
            }
            match child.try_wait() {
                Ok(Some(status)) => {
                    let mut msg = String::new();
                    if let Some(ref mut e) = stderr {
                        let _ = std::io::Read::read_to_string(e, &mut msg);
                    }
                    break Err(ClusterError::Failed(format!(
                        "port-forward to {pod} exited ({status}): {}",
                        msg.trim()
                    )));
                }
                Ok(None) => {}
                Err(e) => break Err(ClusterError::from_io(&e)),
            }
        };
        if let Some(h) = reader {
            let _ = h.join();
        }
        result
    }
}

/// Running forward to one pod port; cancelled when dropped.
#[derive(Debug)]
pub struct Tunnel {
    local_port: u16,
    stop: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl Tunnel {
    /// Tunnel handle with no background task behind it (the endpoint is managed elsewhere).
    pub fn detached(local_port: u16) -> Self {
        Self {
            local_port,
            stop: CancelToken::new(),
            handle: None,
        }
    }

    /// Start `forwarder` for `pod:remote_port` on a background thread and wait up to
    /// `ready_timeout` for the local port.
    pub fn start(
        forwarder: Arc<dyn PortForwarder>,
        pod: Pod,
        remote_port: u16,
        ready_timeout: Duration,
    ) -> Result<Self, ClusterError> {
        let stop = CancelToken::new();
        let (tx, rx) = mpsc::channel();
        let task_stop = stop.clone();
        let handle = std::thread::spawn(move || {
            let pair = [PortPair::new(0, remote_port)];
            if let Err(e) = forwarder.forward(&pod, &pair, task_stop, tx) {
                tracing::debug!(target: "devspace.forward", error = %e, "tunnel closed");
            }
        });
        match rx.recv_timeout(ready_timeout) {
            Ok(ports) if !ports.is_empty() => Ok(Self {
                local_port: ports[0],
                stop,
                handle: Some(handle),
            }),
            _ => {
                stop.cancel();
                let _ = handle.join();
                Err(ClusterError::Failed(format!(
                    "tunnel to port {remote_port} did not become ready"
                )))
            }
        }
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn endpoint(&self) -> String {
        format!("127.0.0.1:{}", self.local_port)
    }

    pub fn close(&mut self) {
        self.stop.cancel();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens a tunnel to the first running pod matching `selector` in `namespace`.
pub trait TunnelOpener: Send + Sync {
    fn open(
        &self,
        namespace: &str,
        selector: &LabelSelector,
        remote_port: u16,
    ) -> Result<Tunnel, ClusterError>;
}

pub struct KubectlTunnel {
    cluster: Arc<dyn ClusterApi>,
    forwarder: Arc<dyn PortForwarder>,
    ready_timeout: Duration,
}

impl KubectlTunnel {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        forwarder: Arc<dyn PortForwarder>,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            cluster,
            forwarder,
            ready_timeout,
        }
    }
}

impl TunnelOpener for KubectlTunnel {
    fn open(
        &self,
        namespace: &str,
        selector: &LabelSelector,
        remote_port: u16,
    ) -> Result<Tunnel, ClusterError> {
        let pod = first_running_pod(self.cluster.as_ref(), namespace, selector)?
            .ok_or_else(|| ClusterError::NotFound(format!("no running pod for {selector} in {namespace}")))?;
        Tunnel::start(self.forwarder.clone(), pod, remote_port, self.ready_timeout)
    }
}
