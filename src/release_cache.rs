//! Release cache: content fingerprint of the chart directory plus the generated-state file
//! (`.devspace/generated.yaml`) that remembers what was last deployed successfully.
//!
//! The state file is only written after a deploy completed end-to-end, so a fingerprint
//! found on disk always belongs to a release that reached readiness.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

pub const GENERATED_FILE: &str = "generated.yaml";

/// Deterministic sha256 over a directory tree (or a single file).
///
/// Entries are visited in file-name order, each contributing its kind, its path relative
/// to `root` and, for files, its bytes. Identical trees hash identically wherever they live;
/// any byte or name change produces a different hash.
pub fn fingerprint(root: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let msg = e.to_string();
            e.into_io_error().unwrap_or_else(|| io::Error::other(msg))
        })?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let ft = entry.file_type();
        if ft.is_dir() {
            hasher.update(b"d\0");
            hasher.update(rel.as_bytes());
            hasher.update(b"\0");
        } else if ft.is_file() {
            hasher.update(b"f\0");
            hasher.update(rel.as_bytes());
            hasher.update(b"\0");
            let mut f = fs::File::open(entry.path())?;
            loop {
                let n = f.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            hasher.update(b"\0");
        } else if ft.is_symlink() {
            hasher.update(b"l\0");
            hasher.update(rel.as_bytes());
            hasher.update(b"\0");
            let target = fs::read_link(entry.path())?;
            hasher.update(target.to_string_lossy().as_bytes());
            hasher.update(b"\0");
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Contents of the generated-state file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct GeneratedState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub helm_chart_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_revision: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ReleaseCache {
    path: PathBuf,
}

impl ReleaseCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<workdir>/.devspace/generated.yaml`
    pub fn in_workdir(workdir: &Path) -> Self {
        Self::new(workdir.join(".devspace").join(GENERATED_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the state; a missing file is an empty state.
    pub fn load(&self) -> io::Result<GeneratedState> {
        match fs::read_to_string(&self.path) {
            Ok(text) => serde_yaml::from_str(&text).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{}: {e}", self.path.display()),
                )
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(GeneratedState::default()),
            Err(e) => Err(e),
        }
    }

    /// Last deployed fingerprint and revision.
    pub fn last_deploy(&self) -> io::Result<(Option<String>, Option<u32>)> {
        let state = self.load()?;
        Ok((state.helm_chart_hash, state.release_revision))
    }

    /// Replace the file atomically (write to a sibling temp file, then rename).
    pub fn save(&self, state: &GeneratedState) -> io::Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let text = serde_yaml::to_string(state)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(text.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn record_deploy(&self, hash: &str, revision: u32) -> io::Result<()> {
        self.save(&GeneratedState {
            helm_chart_hash: Some(hash.to_string()),
            release_revision: Some(revision),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_location_independent() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        for root in [a.path(), b.path()] {
            fs::create_dir_all(root.join("templates")).unwrap();
            fs::write(root.join("Chart.yaml"), "name: app\n").unwrap();
            fs::write(root.join("templates/deploy.yaml"), "kind: Deployment\n").unwrap();
        }
        assert_eq!(fingerprint(a.path()).unwrap(), fingerprint(b.path()).unwrap());
    }

    #[test]
    fn test_fingerprint_sees_renames() {
        let td = tempfile::tempdir().unwrap();
        fs::write(td.path().join("values.yaml"), "x: 1\n").unwrap();
        let before = fingerprint(td.path()).unwrap();
        fs::rename(td.path().join("values.yaml"), td.path().join("values2.yaml")).unwrap();
        assert_ne!(before, fingerprint(td.path()).unwrap());
    }

    #[test]
    fn test_fingerprint_missing_dir_is_error() {
        let td = tempfile::tempdir().unwrap();
        assert!(fingerprint(&td.path().join("chart")).is_err());
    }

    #[test]
    fn test_record_deploy_replaces_previous_state() {
        let td = tempfile::tempdir().unwrap();
        let cache = ReleaseCache::in_workdir(td.path());
        assert_eq!(cache.last_deploy().unwrap(), (None, None));

        cache.record_deploy("cafe", 6).unwrap();
        cache.record_deploy("deadbeef", 7).unwrap();
        assert_eq!(
            cache.last_deploy().unwrap(),
            (Some("deadbeef".to_string()), Some(7))
        );
        // Files written by older versions may carry extra keys
        fs::write(cache.path(), "helmChartHash: abc\nimageTags:\n  default: x\n").unwrap();
        assert_eq!(cache.load().unwrap().helm_chart_hash.as_deref(), Some("abc"));

        cache.record_deploy("deadbeef", 7).unwrap();
        let text = fs::read_to_string(cache.path()).unwrap();
        assert!(text.contains("helmChartHash: deadbeef"), "{text}");
    }
}
