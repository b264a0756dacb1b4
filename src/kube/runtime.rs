#![allow(clippy::module_name_repetitions)]
//! kubectl / helm discovery.

use std::env;
use std::io;
use std::path::PathBuf;

use which::which;

fn tool_path(env_key: &str, default_name: &str, label: &str) -> io::Result<PathBuf> {
    let candidate = env::var(env_key)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default_name.to_string());
    if let Ok(p) = which(&candidate) {
        return Ok(p);
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("{label} is required but was not found in PATH."),
    ))
}

/// Locate kubectl; `DEVSPACE_KUBECTL` may name another binary or an absolute path.
pub fn kubectl_path() -> io::Result<PathBuf> {
    tool_path("DEVSPACE_KUBECTL", "kubectl", "kubectl")
}

/// Locate the Helm v2 client; `DEVSPACE_HELM` may name another binary or an absolute path.
pub fn helm_path() -> io::Result<PathBuf> {
    tool_path("DEVSPACE_HELM", "helm", "helm")
}
