//! Local chart repository home: `repositories.yaml` with a default `stable` entry and the
//! per-repository index cache, refreshed in parallel.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const STABLE_REPO_NAME: &str = "stable";
pub const STABLE_REPO_URL: &str = "https://kubernetes-charts.storage.googleapis.com";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RepoFile {
    pub api_version: String,
    pub repositories: Vec<RepoEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RepoEntry {
    pub name: String,
    pub url: String,
    pub cache: String,
    pub ca_file: String,
    pub cert_file: String,
    pub key_file: String,
}

impl RepoFile {
    pub fn default_file() -> Self {
        Self {
            api_version: "v1".to_string(),
            repositories: vec![RepoEntry {
                name: STABLE_REPO_NAME.to_string(),
                url: STABLE_REPO_URL.to_string(),
                cache: format!("repository/cache/{STABLE_REPO_NAME}-index.yaml"),
                ..RepoEntry::default()
            }],
        }
    }
}

/// Chart client home directory (`~/.devspace/helm` unless overridden).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelmHome {
    root: PathBuf,
}

impl HelmHome {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `DEVSPACE_HELM_HOME`, else `~/.devspace/helm`.
    pub fn from_env() -> io::Result<Self> {
        if let Ok(p) = std::env::var("DEVSPACE_HELM_HOME") {
            if !p.trim().is_empty() {
                return Ok(Self::new(p));
            }
        }
        let home = home::home_dir().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "cannot determine home directory")
        })?;
        Ok(Self::new(home.join(".devspace").join("helm")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repository_file(&self) -> PathBuf {
        self.root.join("repository").join("repositories.yaml")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("repository").join("cache")
    }

    /// Where the index of `entry` is cached.
    pub fn index_path(&self, entry: &RepoEntry) -> PathBuf {
        if entry.cache.is_empty() {
            return self.cache_dir().join(format!("{}-index.yaml", entry.name));
        }
        let p = Path::new(&entry.cache);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }

    pub fn stable_index_path(&self) -> PathBuf {
        self.cache_dir().join(format!("{STABLE_REPO_NAME}-index.yaml"))
    }

    /// Create the directory layout and write the default repository file if missing.
    /// Returns true when the stable index still has to be fetched.
    pub fn ensure(&self) -> io::Result<bool> {
        fs::create_dir_all(self.root.join("cache"))?;
        fs::create_dir_all(self.cache_dir())?;
        let repo_file = self.repository_file();
        if !repo_file.exists() {
            let text = serde_yaml::to_string(&RepoFile::default_file())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            fs::write(&repo_file, text)?;
        }
        Ok(!self.stable_index_path().exists())
    }

    pub fn load_repositories(&self) -> Result<RepoFile> {
        let path = self.repository_file();
        let text = fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("invalid {}", path.display()))
    }
}

/// Downloads a repository's `index.yaml`.
pub trait IndexFetcher: Send + Sync {
    fn fetch_index(&self, repo_url: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct HttpIndexFetcher {
    client: reqwest::blocking::Client,
}

impl HttpIndexFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("devspace/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build http client")?;
        Ok(Self { client })
    }
}

impl IndexFetcher for HttpIndexFetcher {
    fn fetch_index(&self, repo_url: &str) -> Result<Vec<u8>> {
        let url = format!("{}/index.yaml", repo_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .send()
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?;
        Ok(resp.bytes().with_context(|| format!("reading {url}"))?.to_vec())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub refreshed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Refresh every configured repository index, one thread per repository.
///
/// A single repository failing is logged and recorded in the report; it never fails the
/// refresh as a whole.
pub fn refresh_indexes(home: &HelmHome, fetcher: &dyn IndexFetcher) -> Result<RefreshReport> {
    let repos = home.load_repositories()?;
    let results: Vec<(String, Result<()>)> = std::thread::scope(|s| {
        let handles: Vec<_> = repos
            .repositories
            .iter()
            .map(|entry| {
                let target = home.index_path(entry);
                (
                    entry.name.clone(),
                    s.spawn(move || -> Result<()> {
                        let body = fetcher.fetch_index(&entry.url)?;
                        if let Some(parent) = target.parent() {
                            fs::create_dir_all(parent)?;
                        }
                        fs::write(&target, body)
                            .with_context(|| format!("cannot write {}", target.display()))?;
                        Ok(())
                    }),
                )
            })
            .collect();
        handles
            .into_iter()
            .map(|(name, h)| {
                let res = h
                    .join()
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("index refresh panicked")));
                (name, res)
            })
            .collect()
    });

    let mut report = RefreshReport::default();
    for (name, res) in results {
        match res {
            Ok(()) => report.refreshed.push(name),
            Err(e) => {
                tracing::warn!(target: "devspace.bootstrap", repo = %name, error = %format!("{e:#}"), "unable to download repo index");
                report.failed.push((name, format!("{e:#}")));
            }
        }
    }
    Ok(report)
}
