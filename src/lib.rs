#![allow(clippy::module_name_repetitions)]
//! devspace: bring up a development environment inside a Kubernetes cluster.
//!
//! The `up` workflow ([`orchestrator::Orchestrator::up`]) bootstraps the in-cluster chart
//! backend, deploys the project chart when it changed, starts port forwards and file syncs
//! against the release pods, and attaches an interactive shell. Everything outside the
//! process (cluster, chart backend, sync, forwarding, attach) sits behind a trait with a
//! kubectl/helm backed implementation.

pub mod bootstrap;
pub mod color;
pub mod config;
pub mod deploy;
pub mod errors;
pub mod helm;
pub mod kube;
pub mod lock;
pub mod logging;
pub mod orchestrator;
pub mod registry;
pub mod release_cache;
pub mod session;
pub mod sync_engine;
pub mod util;
pub mod wait;

pub use bootstrap::{BootstrapError, BootstrapManager, BootstrapOptions, ClusterConnection};
pub use color::*;
pub use deploy::{DeployOptions, Deployment, DeploymentPipeline};
pub use errors::*;
pub use lock::*;
pub use orchestrator::{Collaborators, Orchestrator, UpOptions};
pub use release_cache::{fingerprint, GeneratedState, ReleaseCache};
pub use session::{SessionFailurePolicy, SessionManager};
pub use wait::{CancelToken, WaitPolicy};
