#![allow(clippy::module_name_repetitions)]
//! Sync and port-forward sessions bound to pods resolved from label selectors.

use std::fmt;

use clap::ValueEnum;

use crate::errors::ClusterError;
use crate::kube::LabelSelector;

pub mod manager;
pub mod resolve;
pub mod sync;

pub use manager::{
    ForwardBatch, ForwardDeclaration, ForwardSessionHandle, SessionManager, StopReport,
    SyncBatch, SyncDeclaration, SyncSessionHandle,
};
pub use resolve::{resolve_container, resolve_pod};
pub use sync::{SyncEngine, SyncHandle, SyncSpec};

/// Declarative target of a session; resolved to a pod every time a session starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectorQuery {
    pub labels: LabelSelector,
    pub namespace: String,
    pub resource_type: Option<String>,
    pub container: Option<String>,
}

impl fmt::Display for SelectorQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}", self.labels, self.namespace)
    }
}

/// What to do when a sync session fails to start.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum SessionFailurePolicy {
    /// Stop everything started so far and fail the run.
    #[default]
    Abort,
    /// Keep going; failures are reported in the batch summary.
    Isolate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    NoSelector,
    UnsupportedResource(String),
    Lookup(ClusterError),
    NoPod { query: String },
    NoContainers { pod: String },
    ContainerMissing { container: String, pod: String },
    Start(String),
    Stop(String),
}

impl SessionError {
    /// Resolution misses are skipped with a warning; everything else is a failure.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            SessionError::NoSelector
                | SessionError::UnsupportedResource(_)
                | SessionError::NoPod { .. }
                | SessionError::NoContainers { .. }
                | SessionError::ContainerMissing { .. }
        )
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NoSelector => f.write_str("no label selector configured"),
            SessionError::UnsupportedResource(kind) => write!(
                f,
                "resource type '{kind}' is not supported (only pod is supported)"
            ),
            SessionError::Lookup(e) => write!(f, "Unable to list devspace pods: {e}"),
            SessionError::NoPod { query } => write!(f, "no running pod matches {query}"),
            SessionError::NoContainers { pod } => {
                write!(f, "selected pod {pod} has no containers")
            }
            SessionError::ContainerMissing { container, pod } => {
                write!(f, "container {container} wasn't found in pod {pod}")
            }
            SessionError::Start(msg) => write!(f, "Sync error: {msg}"),
            SessionError::Stop(msg) => write!(f, "stop failed: {msg}"),
        }
    }
}

impl std::error::Error for SessionError {}
