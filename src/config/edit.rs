//! Removal edits behind `devspace remove sync|port|package`.
//!
//! Every removal is validated with `is_empty()` first: a request that names no selector,
//! path, port or `--all` must not touch any file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_yaml::Value;

use super::{Config, ConfigError, DEFAULT_CHART_PATH};
use crate::kube::LabelSelector;

/// Parse `--selector k=v,k2=v2`.
pub fn parse_selectors(s: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    LabelSelector::parse(s)
        .map(|sel| sel.as_map().clone())
        .map_err(|e| ConfigError::Invalid(format!("Error parsing selectors: {e}")))
}

#[derive(Debug, Clone, Default)]
pub struct SyncRemoval {
    pub selector: BTreeMap<String, String>,
    pub local_path: Option<String>,
    pub container_path: Option<String>,
    pub all: bool,
}

impl SyncRemoval {
    pub fn is_empty(&self) -> bool {
        !self.all
            && self.selector.is_empty()
            && self.local_path.as_deref().map_or(true, str::is_empty)
            && self.container_path.as_deref().map_or(true, str::is_empty)
    }
}

fn matches_nonempty(flag: &Option<String>, value: &str) -> bool {
    flag.as_deref().is_some_and(|f| !f.is_empty() && f == value)
}

fn remove_sync_in(cfg: &mut Config, r: &SyncRemoval) -> usize {
    let Some(list) = cfg.dev_space.sync.as_mut() else {
        return 0;
    };
    let before = list.len();
    list.retain(|s| {
        let hit = r.all
            || matches_nonempty(&r.local_path, &s.local_sub_path)
            || matches_nonempty(&r.container_path, &s.container_path)
            || (!r.selector.is_empty() && r.selector == s.label_selector);
        !hit
    });
    before - list.len()
}

/// Drop every sync entry matched by `r` from the base config and the overlay.
/// Returns the number of entries removed.
pub fn remove_sync(base: &mut Config, overwrite: Option<&mut Config>, r: &SyncRemoval) -> usize {
    let mut n = remove_sync_in(base, r);
    if let Some(over) = overwrite {
        n += remove_sync_in(over, r);
    }
    n
}

#[derive(Debug, Clone, Default)]
pub struct PortRemoval {
    pub selector: BTreeMap<String, String>,
    pub ports: Vec<u16>,
    pub all: bool,
}

impl PortRemoval {
    pub fn is_empty(&self) -> bool {
        !self.all && self.selector.is_empty() && self.ports.is_empty()
    }
}

/// Parse `8080,3000`; blank elements are ignored.
pub fn parse_port_list(s: &str) -> Result<Vec<u16>, ConfigError> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.parse::<u16>()
                .map_err(|_| ConfigError::Invalid(format!("invalid port '{p}'")))
        })
        .collect()
}

fn remove_ports_in(cfg: &mut Config, r: &PortRemoval) -> usize {
    let Some(list) = cfg.dev_space.ports.as_mut() else {
        return 0;
    };
    let mut removed = 0;
    list.retain_mut(|pf| {
        if r.all || (!r.selector.is_empty() && r.selector == pf.label_selector) {
            removed += pf.port_mappings.len().max(1);
            return false;
        }
        let before = pf.port_mappings.len();
        pf.port_mappings
            .retain(|pm| !r.ports.contains(&pm.local_port) && !r.ports.contains(&pm.remote_port));
        removed += before - pf.port_mappings.len();
        !pf.port_mappings.is_empty()
    });
    removed
}

/// Drop matching forward entries (by selector or `--all`) and individual port mappings
/// whose local or remote port is listed; an entry left without mappings is dropped too.
/// Returns the number of mappings removed.
pub fn remove_ports(base: &mut Config, overwrite: Option<&mut Config>, r: &PortRemoval) -> usize {
    let mut n = remove_ports_in(base, r);
    if let Some(over) = overwrite {
        n += remove_ports_in(over, r);
    }
    n
}

/// Chart directory of the deployment a package edit applies to.
///
/// With several deployments configured, `deployment` must name one of them.
pub fn select_chart_path(cfg: &Config, deployment: Option<&str>) -> Result<PathBuf, ConfigError> {
    let deployment = deployment.filter(|d| !d.is_empty());
    let deployments = cfg.dev_space.deployments.as_deref().unwrap_or(&[]);
    if deployments.is_empty() {
        return match deployment {
            Some(name) => Err(ConfigError::Invalid(format!("Deployment {name} not found"))),
            None => Ok(PathBuf::from(DEFAULT_CHART_PATH)),
        };
    }
    if deployments.len() != 1 && deployment.is_none() {
        return Err(ConfigError::Invalid(
            "Please specify the deployment via the -d flag".to_string(),
        ));
    }
    let selected = deployments
        .iter()
        .find(|d| deployment.map_or(true, |name| d.name == name))
        .ok_or_else(|| {
            ConfigError::Invalid(format!("Deployment {} not found", deployment.unwrap_or("")))
        })?;
    selected
        .helm
        .as_ref()
        .and_then(|h| h.chart_path.as_deref())
        .map(PathBuf::from)
        .ok_or_else(|| {
            ConfigError::Invalid(format!(
                "Selected deployment {} is not a valid helm deployment",
                selected.name
            ))
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageRemoval {
    Removed(String),
    RemovedAll(usize),
    NotPresent(String),
    NoDependencies,
}

impl PackageRemoval {
    /// Whether the requirements file changed and dependencies must be rebuilt.
    pub fn changed(&self) -> bool {
        matches!(self, PackageRemoval::Removed(_) | PackageRemoval::RemovedAll(_))
    }
}

/// Remove `name` (or every dependency when `name` is `None`) from a parsed requirements.yaml.
pub fn remove_dependency(requirements: &mut Value, name: Option<&str>) -> Result<PackageRemoval, ConfigError> {
    let Some(deps) = requirements.get_mut("dependencies") else {
        return Ok(PackageRemoval::NoDependencies);
    };
    let list = deps
        .as_sequence_mut()
        .ok_or_else(|| ConfigError::Invalid("Error parsing yaml: dependencies is not a list".to_string()))?;
    match name {
        None => {
            let n = list.len();
            list.clear();
            Ok(PackageRemoval::RemovedAll(n))
        }
        Some(name) => {
            let pos = list
                .iter()
                .position(|d| d.get("name").and_then(Value::as_str) == Some(name));
            match pos {
                Some(i) => {
                    list.remove(i);
                    Ok(PackageRemoval::Removed(name.to_string()))
                }
                None => Ok(PackageRemoval::NotPresent(name.to_string())),
            }
        }
    }
}

pub fn requirements_path(chart: &Path) -> PathBuf {
    chart.join("requirements.yaml")
}
