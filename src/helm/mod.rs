#![allow(clippy::module_name_repetitions)]
//! Chart backend access: the `ChartBackend` contract, the Helm v2 CLI client that talks to
//! the in-cluster backend through a tunnel, the backend's manifests, and the local chart
//! repository home.

use std::path::Path;
use std::sync::Arc;

use crate::errors::BackendError;

pub mod cli;
pub mod repos;
pub mod tiller;

pub use cli::{HelmCli, HelmCliFactory};
pub use repos::{HelmHome, HttpIndexFetcher, IndexFetcher, RefreshReport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub name: String,
    pub namespace: String,
    pub revision: u32,
    pub status: String,
}

pub trait ChartBackend: Send + Sync {
    fn list_releases(&self, limit: usize) -> Result<Vec<ReleaseInfo>, BackendError>;

    /// Install the release if absent, upgrade it otherwise; returns the new revision.
    fn install_or_upgrade(
        &self,
        name: &str,
        namespace: &str,
        chart_path: &Path,
        values: &serde_yaml::Value,
    ) -> Result<u32, BackendError>;

    /// Latest revision of `name`, `None` if the release does not exist.
    fn release_revision(&self, name: &str) -> Result<Option<u32>, BackendError>;

    fn delete_release(&self, name: &str, purge: bool) -> Result<(), BackendError>;

    fn update_dependencies(&self, chart_path: &Path) -> Result<(), BackendError>;
}

/// Builds a backend client bound to a tunnel endpoint (`host:port`) and backend namespace.
pub trait BackendFactory: Send + Sync {
    fn connect(&self, endpoint: &str, backend_namespace: &str) -> Arc<dyn ChartBackend>;
}
