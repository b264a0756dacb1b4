//! File sync engine contract.

use std::path::PathBuf;

use super::SessionError;
use crate::config::BandwidthLimits;
use crate::kube::Pod;

/// Everything a sync engine needs for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSpec {
    pub pod: Pod,
    pub container: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub exclude_paths: Vec<String>,
    pub download_exclude_paths: Vec<String>,
    pub upload_exclude_paths: Vec<String>,
    pub bandwidth: BandwidthLimits,
    pub verbose: bool,
}

pub trait SyncEngine: Send + Sync {
    /// Start syncing; must return promptly, with the session running in the background.
    fn start(&self, spec: SyncSpec) -> Result<Box<dyn SyncHandle>, SessionError>;
}

pub trait SyncHandle: Send {
    fn stop(&mut self) -> Result<(), SessionError>;
}
