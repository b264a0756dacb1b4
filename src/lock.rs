use fs2::FileExt;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Project-scoped lock guard that removes the lock file on drop.
#[derive(Debug)]
pub struct UpLock {
    file: File,
    path: PathBuf,
}

impl UpLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UpLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();

        // Brief retries keep removal reliable on slow filesystems without background threads
        for _ in 0..10 {
            if !self.path.exists() {
                break;
            }
            if fs::remove_file(&self.path).is_ok() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
    }
}

const LOCK_HELD_MSG: &str =
    "Another devspace up is already running in this project (lock held). Please try again later.";

/// Acquire a non-blocking exclusive lock for the project rooted at `workdir`.
pub fn acquire_lock(workdir: &Path) -> io::Result<UpLock> {
    let paths = candidate_lock_paths(workdir);
    let mut last_err: Option<io::Error> = None;

    for p in &paths {
        match acquire_lock_at(p) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Err(e),
            Err(e) => last_err = Some(e),
        }
    }

    let mut msg = String::from("Failed to create lock file in any candidate location: ");
    msg.push_str(
        &paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    );
    if let Some(e) = last_err {
        msg.push_str(&format!(" (last error: {e})"));
    }
    Err(io::Error::other(msg))
}

/// Acquire a lock at a specific path.
pub fn acquire_lock_at(p: &Path) -> io::Result<UpLock> {
    if let Some(parent) = p.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let f = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(p)?;
    match f.try_lock_exclusive() {
        Ok(()) => {
            tracing::debug!(target: "devspace.lock", path = %p.display(), "lock acquired");
            Ok(UpLock {
                file: f,
                path: p.to_path_buf(),
            })
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            Err(io::Error::new(io::ErrorKind::WouldBlock, LOCK_HELD_MSG))
        }
        Err(e) => Err(e),
    }
}

/// Honor DEVSPACE_SKIP_LOCK=1 to skip acquiring any lock.
pub fn should_acquire_lock() -> bool {
    env::var("DEVSPACE_SKIP_LOCK").ok().as_deref() != Some("1")
}

/// Candidate lock file locations:
///   1) <workdir>/.devspace/up.lock
///   2) <xdg_runtime or tmp>/devspace.<hash(workdir)>.lock
pub fn candidate_lock_paths(workdir: &Path) -> Vec<PathBuf> {
    let rt_base = env::var("XDG_RUNTIME_DIR")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(env::temp_dir);
    let abs = fs::canonicalize(workdir).unwrap_or_else(|_| workdir.to_path_buf());
    let hash = crate::util::hash_key_hex(&abs.to_string_lossy());
    vec![
        workdir.join(".devspace").join("up.lock"),
        rt_base.join(format!("devspace.{hash}.lock")),
    ]
}
