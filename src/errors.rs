//! Error types shared by the cluster and chart-backend collaborators, plus exit-code mapping.
//!
//! - A missing external tool (kubectl, helm) maps to exit code 127; everything else to 1.
//! - Collaborator errors keep "not found" distinct from other failures so callers can
//!   branch on absence without string matching.
use std::fmt;
use std::io;

/// Map an io::Error to a process exit code:
/// - 127 for NotFound (command not found)
/// - 1 for all other errors
pub fn exit_code_for_io_error(e: &io::Error) -> u8 {
    if e.kind() == io::ErrorKind::NotFound {
        127
    } else {
        1
    }
}

/// Failure reported by a [`crate::kube::ClusterApi`] implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    NotFound(String),
    ToolMissing(String),
    Failed(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    pub fn from_io(e: &io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            ClusterError::ToolMissing(e.to_string())
        } else {
            ClusterError::Failed(e.to_string())
        }
    }
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterError::NotFound(msg)
            | ClusterError::ToolMissing(msg)
            | ClusterError::Failed(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for ClusterError {}

/// Failure reported by a [`crate::helm::ChartBackend`] implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    ReleaseNotFound(String),
    ToolMissing(String),
    Failed(String),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::ReleaseNotFound(_))
    }

    pub fn from_io(e: &io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            BackendError::ToolMissing(e.to_string())
        } else {
            BackendError::Failed(e.to_string())
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::ReleaseNotFound(name) => write!(f, "release: \"{name}\" not found"),
            BackendError::ToolMissing(msg) => f.write_str(msg),
            BackendError::Failed(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for BackendError {}

/// Walk an anyhow chain and pick the exit code of the first recognizable cause.
pub fn exit_code_for_error(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if let Some(ioe) = cause.downcast_ref::<io::Error>() {
            return exit_code_for_io_error(ioe);
        }
        if let Some(ClusterError::ToolMissing(_)) = cause.downcast_ref::<ClusterError>() {
            return 127;
        }
        if let Some(BackendError::ToolMissing(_)) = cause.downcast_ref::<BackendError>() {
            return 127;
        }
        if let Some(be) = cause.downcast_ref::<crate::bootstrap::BootstrapError>() {
            if be.kind == crate::bootstrap::BootstrapErrorKind::ToolMissing {
                return 127;
            }
        }
    }
    1
}
