#![allow(clippy::module_name_repetitions)]
//! Project configuration: `.devspace/config.yaml` with an optional `.devspace/overwrite.yaml`
//! overlay.
//!
//! Overlay rules (see [`Config::overlay`]):
//! - `Option` scalars set in the overlay replace the base value.
//! - Lists set in the overlay (`ports`, `sync`, `deployments`) replace the base list.
//! - Maps (`images`, `registries`) merge key by key; an entry present on both sides is
//!   overlaid field by field.
//!
//! Only fields where "explicitly set" matters for the overlay are `Option`; everything else
//! is a plain defaulted value.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub mod edit;

pub const CONFIG_DIR: &str = ".devspace";
pub const CONFIG_FILE: &str = "config.yaml";
pub const OVERWRITE_FILE: &str = "overwrite.yaml";
pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_RELEASE_NAME: &str = "devspace";
pub const DEFAULT_CHART_PATH: &str = "chart/";

const CONFIG_GITIGNORE: &str = "logs/\noverwrite.yaml\n";

#[derive(Debug)]
pub enum ConfigError {
    Missing(PathBuf),
    Io { path: PathBuf, source: io::Error },
    Parse { path: PathBuf, message: String },
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(p) => write!(
                f,
                "no configuration found at {} (create it before running devspace)",
                p.display()
            ),
            ConfigError::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            ConfigError::Parse { path, message } => {
                write!(f, "invalid configuration {}: {}", path.display(), message)
            }
            ConfigError::Invalid(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub dev_space: DevSpaceConfig,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub images: BTreeMap<String, ImageConfig>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub registries: BTreeMap<String, RegistryConfig>,
    pub tiller: TillerConfig,
    pub cluster: ClusterConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DevSpaceConfig {
    pub release: ReleaseConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployments: Option<Vec<DeploymentConfig>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<PortForwardingConfig>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<Vec<SyncConfig>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ReleaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DeploymentConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmDeploymentConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct HelmDeploymentConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct PortForwardingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    pub label_selector: BTreeMap<String, String>,
    pub port_mappings: Vec<PortMapping>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub local_port: u16,
    pub remote_port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub label_selector: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    pub local_sub_path: String,
    pub container_path: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclude_paths: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub download_exclude_paths: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub upload_exclude_paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth_limits: Option<BandwidthLimits>,
}

/// KB/s limits; `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct BandwidthLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ImageConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Key into `registries`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistryConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<RegistryAuth>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistryAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TillerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_provider: Option<String>,
}

fn overlay_opt<T: Clone>(base: &mut Option<T>, over: &Option<T>) {
    if over.is_some() {
        base.clone_from(over);
    }
}

impl ImageConfig {
    fn overlay(&mut self, over: &ImageConfig) {
        if !over.name.is_empty() {
            self.name.clone_from(&over.name);
        }
        overlay_opt(&mut self.tag, &over.tag);
        overlay_opt(&mut self.registry, &over.registry);
    }
}

impl RegistryConfig {
    fn overlay(&mut self, over: &RegistryConfig) {
        overlay_opt(&mut self.url, &over.url);
        overlay_opt(&mut self.auth, &over.auth);
    }
}

impl Config {
    /// Apply `over` on top of `self`.
    pub fn overlay(&mut self, over: &Config) {
        overlay_opt(&mut self.version, &over.version);
        overlay_opt(&mut self.dev_space.release.name, &over.dev_space.release.name);
        overlay_opt(
            &mut self.dev_space.release.namespace,
            &over.dev_space.release.namespace,
        );
        overlay_opt(&mut self.dev_space.deployments, &over.dev_space.deployments);
        overlay_opt(&mut self.dev_space.ports, &over.dev_space.ports);
        overlay_opt(&mut self.dev_space.sync, &over.dev_space.sync);
        for (k, v) in &over.images {
            self.images
                .entry(k.clone())
                .and_modify(|base| base.overlay(v))
                .or_insert_with(|| v.clone());
        }
        for (k, v) in &over.registries {
            self.registries
                .entry(k.clone())
                .and_modify(|base| base.overlay(v))
                .or_insert_with(|| v.clone());
        }
        overlay_opt(&mut self.tiller.namespace, &over.tiller.namespace);
        overlay_opt(&mut self.cluster.cloud_provider, &over.cluster.cloud_provider);
    }

    pub fn release_name(&self) -> &str {
        self.dev_space
            .release
            .name
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_RELEASE_NAME)
    }

    pub fn release_namespace(&self) -> &str {
        self.dev_space
            .release
            .namespace
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    /// Namespace of the chart backend; the release namespace unless configured.
    pub fn tiller_namespace(&self) -> &str {
        self.tiller
            .namespace
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.release_namespace())
    }

    /// Chart of the release: the first helm deployment's chart path, else `chart/`.
    pub fn chart_path(&self) -> &str {
        self.dev_space
            .deployments
            .iter()
            .flatten()
            .filter_map(|d| d.helm.as_ref().and_then(|h| h.chart_path.as_deref()))
            .next()
            .unwrap_or(DEFAULT_CHART_PATH)
    }

    /// Namespaces the chart backend must be able to deploy into.
    pub fn app_namespaces(&self) -> Vec<String> {
        let mut out = vec![self.release_namespace().to_string()];
        for d in self.dev_space.deployments.iter().flatten() {
            if d.helm.is_none() {
                continue;
            }
            let ns = d
                .namespace
                .as_deref()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| self.release_namespace())
                .to_string();
            if !out.contains(&ns) {
                out.push(ns);
            }
        }
        out
    }

    pub fn sync_configs(&self) -> &[SyncConfig] {
        self.dev_space.sync.as_deref().unwrap_or(&[])
    }

    pub fn port_configs(&self) -> &[PortForwardingConfig] {
        self.dev_space.ports.as_deref().unwrap_or(&[])
    }
}

fn read_config(path: &Path) -> Result<Option<Config>, ConfigError> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    if text.trim().is_empty() {
        return Ok(Some(Config::default()));
    }
    serde_yaml::from_str(&text)
        .map(Some)
        .map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

fn write_config(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    let text = serde_yaml::to_string(cfg).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    fs::write(path, text).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Create `<workdir>/.devspace` (with its .gitignore) if it does not exist yet.
pub fn ensure_config_dir(workdir: &Path) -> io::Result<PathBuf> {
    let dir = workdir.join(CONFIG_DIR);
    if !dir.exists() {
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(".gitignore"), CONFIG_GITIGNORE)?;
    }
    Ok(dir)
}

/// The base file and the optional overlay, kept apart so edits can be written back.
#[derive(Debug, Clone)]
pub struct ConfigFiles {
    dir: PathBuf,
    pub base: Config,
    pub overwrite: Option<Config>,
}

impl ConfigFiles {
    pub fn load(workdir: &Path) -> Result<Self, ConfigError> {
        let dir = workdir.join(CONFIG_DIR);
        let base_path = dir.join(CONFIG_FILE);
        let base = read_config(&base_path)?.ok_or(ConfigError::Missing(base_path))?;
        let overwrite = read_config(&dir.join(OVERWRITE_FILE))?;
        tracing::debug!(
            target: "devspace.config",
            dir = %dir.display(),
            overwrite = overwrite.is_some(),
            "configuration loaded"
        );
        Ok(Self {
            dir,
            base,
            overwrite,
        })
    }

    /// Base with the overlay applied.
    pub fn merged(&self) -> Config {
        let mut cfg = self.base.clone();
        if let Some(ref over) = self.overwrite {
            cfg.overlay(over);
        }
        cfg
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        write_config(&self.dir.join(CONFIG_FILE), &self.base)?;
        if let Some(ref over) = self.overwrite {
            write_config(&self.dir.join(OVERWRITE_FILE), over)?;
        }
        tracing::info!(target: "devspace.config", dir = %self.dir.display(), "configuration saved");
        Ok(())
    }
}
