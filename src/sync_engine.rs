//! Upload-only sync engine: polls the local tree and streams changed files into the
//! container as a tar archive over `kubectl exec`.
//!
//! Download settings are accepted but unused; the container side is never read back.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use walkdir::WalkDir;

use crate::session::{SessionError, SyncEngine, SyncHandle, SyncSpec};
use crate::util::{shell_join, ExecRequest, ExecService};
use crate::wait::CancelToken;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1500);
const CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct TarSyncEngine {
    kubectl: PathBuf,
    exec: ExecService,
    poll_interval: Duration,
}

impl TarSyncEngine {
    pub fn new(kubectl: PathBuf) -> Self {
        Self {
            kubectl,
            exec: ExecService::new(Duration::from_secs(60)),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl SyncEngine for TarSyncEngine {
    fn start(&self, spec: SyncSpec) -> Result<Box<dyn SyncHandle>, SessionError> {
        if !spec.local_path.is_dir() {
            return Err(SessionError::Start(format!(
                "local path {} is not a directory",
                spec.local_path.display()
            )));
        }
        let target = RemoteTarget {
            kubectl: self.kubectl.clone(),
            namespace: spec.pod.namespace().to_string(),
            pod: spec.pod.name().to_string(),
            container: spec.container.clone(),
            root: spec.remote_path.trim_end_matches('/').to_string(),
        };
        let out = self
            .exec
            .run(ExecRequest::new(self.kubectl.as_os_str()).args(target.exec_args(&[
                "mkdir".into(),
                "-p".into(),
                target.root_or_slash(),
            ])))
            .map_err(|e| SessionError::Start(e.to_string()))?;
        if !out.success() {
            return Err(SessionError::Start(out.error_text()));
        }

        let excludes: Vec<String> = spec
            .exclude_paths
            .iter()
            .chain(spec.upload_exclude_paths.iter())
            .cloned()
            .collect();
        let stop = CancelToken::new();
        let worker = Worker {
            local: spec.local_path.clone(),
            target,
            excludes,
            upload_limit: spec.bandwidth.upload,
            verbose: spec.verbose,
            exec: self.exec.clone(),
            interval: self.poll_interval,
            stop: stop.clone(),
        };
        let handle = thread::Builder::new()
            .name("devspace-sync".into())
            .spawn(move || worker.run())
            .map_err(|e| SessionError::Start(e.to_string()))?;
        Ok(Box::new(TarSyncHandle {
            stop,
            handle: Some(handle),
        }))
    }
}

struct TarSyncHandle {
    stop: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl SyncHandle for TarSyncHandle {
    fn stop(&mut self) -> Result<(), SessionError> {
        self.stop.cancel();
        match self.handle.take() {
            Some(h) => h
                .join()
                .map_err(|_| SessionError::Stop("sync worker panicked".into())),
            None => Ok(()),
        }
    }
}

impl Drop for TarSyncHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[derive(Debug, Clone)]
struct RemoteTarget {
    kubectl: PathBuf,
    namespace: String,
    pod: String,
    container: String,
    root: String,
}

impl RemoteTarget {
    fn root_or_slash(&self) -> String {
        if self.root.is_empty() {
            "/".to_string()
        } else {
            self.root.clone()
        }
    }

    fn exec_args(&self, cmd: &[String]) -> Vec<String> {
        let mut args = vec![
            "exec".to_string(),
            "-i".to_string(),
            "-n".to_string(),
            self.namespace.clone(),
            self.pod.clone(),
            "-c".to_string(),
            self.container.clone(),
            "--".to_string(),
        ];
        args.extend(cmd.iter().cloned());
        args
    }

    fn remote_path(&self, rel: &str) -> String {
        format!("{}/{}", self.root, rel)
    }
}

/// Size and mtime per relative path; directories are implied by their files.
type Snapshot = BTreeMap<String, (u64, SystemTime)>;

struct Worker {
    local: PathBuf,
    target: RemoteTarget,
    excludes: Vec<String>,
    upload_limit: Option<u64>,
    verbose: bool,
    exec: ExecService,
    interval: Duration,
    stop: CancelToken,
}

impl Worker {
    fn run(self) {
        let mut previous = Snapshot::new();
        loop {
            let current = scan(&self.local, &self.excludes);
            let (changed, removed) = diff(&previous, &current);
            let mut ok = true;
            if !changed.is_empty() {
                if let Err(e) = self.upload(&changed) {
                    tracing::warn!(target: "devspace.sync", error = %e, "upload failed");
                    ok = false;
                }
            }
            if !removed.is_empty() {
                if let Err(e) = self.remove(&removed) {
                    tracing::warn!(target: "devspace.sync", error = %e, "remote delete failed");
                }
            }
            // Failed uploads are retried on the next tick
            if ok {
                previous = current;
            }
            if self.stop.wait_timeout(self.interval) {
                break;
            }
        }
        tracing::debug!(target: "devspace.sync", pod = %self.target.pod, "sync worker stopped");
    }

    fn upload(&self, files: &[String]) -> io::Result<()> {
        let started = Instant::now();
        let mut tar = Command::new("tar")
            .arg("-c")
            .arg("-f")
            .arg("-")
            .arg("-C")
            .arg(&self.local)
            .arg("-T")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let remote_args = self.target.exec_args(&[
            "tar".into(),
            "-x".into(),
            "-f".into(),
            "-".into(),
            "-C".into(),
            self.target.root_or_slash(),
        ]);
        tracing::debug!(target: "devspace.sync", cmd = %format!("kubectl {}", shell_join(&remote_args)));
        let mut kubectl = Command::new(&self.target.kubectl)
            .args(&remote_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let list: Vec<u8> = files.iter().flat_map(|f| format!("{f}\n").into_bytes()).collect();
        let list_writer = tar.stdin.take().map(|mut stdin| {
            thread::spawn(move || {
                let _ = stdin.write_all(&list);
            })
        });

        let copied = match (tar.stdout.take(), kubectl.stdin.take()) {
            (Some(mut from), Some(mut to)) => throttled_copy(&mut from, &mut to, self.upload_limit),
            _ => Err(io::Error::other("sync pipes unavailable")),
        };
        if let Some(w) = list_writer {
            let _ = w.join();
        }
        let tar_status = tar.wait()?;
        let mut remote_err = String::new();
        if let Some(mut err) = kubectl.stderr.take() {
            let _ = err.read_to_string(&mut remote_err);
        }
        let remote_status = kubectl.wait()?;
        let bytes = copied?;
        if !tar_status.success() {
            return Err(io::Error::other("local tar failed"));
        }
        if !remote_status.success() {
            return Err(io::Error::other(format!(
                "remote tar failed: {}",
                remote_err.trim()
            )));
        }
        let msg = format!(
            "Uploaded {} file(s), {} bytes in {:?}",
            files.len(),
            bytes,
            started.elapsed()
        );
        if self.verbose {
            crate::color::log_info_stderr(crate::color::color_enabled_stderr(), &msg);
        }
        tracing::debug!(target: "devspace.sync", files = files.len(), bytes, "{}", msg);
        Ok(())
    }

    fn remove(&self, files: &[String]) -> io::Result<()> {
        let mut cmd = vec!["rm".to_string(), "-rf".to_string(), "--".to_string()];
        cmd.extend(files.iter().map(|f| self.target.remote_path(f)));
        let out = self
            .exec
            .run(ExecRequest::new(self.target.kubectl.as_os_str()).args(self.target.exec_args(&cmd)))
            .map_err(io::Error::other)?;
        if !out.success() {
            return Err(io::Error::other(out.error_text()));
        }
        if self.verbose {
            crate::color::log_info_stderr(
                crate::color::color_enabled_stderr(),
                &format!("Removed {} file(s) in container", files.len()),
            );
        }
        Ok(())
    }
}

/// Copy `from` into `to`, sleeping so the rate stays under `limit_kbps` when set.
fn throttled_copy(from: &mut dyn Read, to: &mut dyn Write, limit_kbps: Option<u64>) -> io::Result<u64> {
    let started = Instant::now();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = from.read(&mut buf)?;
        if n == 0 {
            break;
        }
        to.write_all(&buf[..n])?;
        total += n as u64;
        if let Some(limit) = limit_kbps.filter(|l| *l > 0) {
            let due = Duration::from_secs_f64(total as f64 / (limit as f64 * 1024.0));
            let elapsed = started.elapsed();
            if due > elapsed {
                thread::sleep(due - elapsed);
            }
        }
    }
    to.flush()?;
    Ok(total)
}

fn scan(root: &Path, excludes: &[String]) -> Snapshot {
    let mut snap = Snapshot::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.path() == root || !is_excluded(&relative(root, e.path()), excludes)
        });
    for entry in walker.flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        snap.insert(relative(root, entry.path()), (meta.len(), mtime));
    }
    snap
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Files that are new or modified, and files that disappeared.
fn diff(previous: &Snapshot, current: &Snapshot) -> (Vec<String>, Vec<String>) {
    let changed = current
        .iter()
        .filter(|(k, v)| previous.get(*k) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect();
    let removed = previous
        .keys()
        .filter(|k| !current.contains_key(*k))
        .cloned()
        .collect();
    (changed, removed)
}

/// Gitignore-like matching: a leading `/` anchors at the sync root, a pattern without `/`
/// matches any path component, and `*`/`?` are wildcards within a component.
pub fn is_excluded(rel: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| matches_pattern(rel, p))
}

fn matches_pattern(rel: &str, pattern: &str) -> bool {
    let pattern = pattern.trim().trim_end_matches('/');
    if pattern.is_empty() {
        return false;
    }
    let parts: Vec<&str> = rel.split('/').collect();
    if let Some(anchored) = pattern.strip_prefix('/') {
        let pat: Vec<&str> = anchored.split('/').collect();
        return pat.len() <= parts.len()
            && pat.iter().zip(parts.iter()).all(|(p, s)| glob_match(p, s));
    }
    if !pattern.contains('/') {
        return parts.iter().any(|s| glob_match(pattern, s));
    }
    let pat: Vec<&str> = pattern.split('/').collect();
    (0..parts.len()).any(|start| {
        pat.len() <= parts.len() - start
            && pat
                .iter()
                .zip(parts[start..].iter())
                .all(|(p, s)| glob_match(p, s))
    })
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
