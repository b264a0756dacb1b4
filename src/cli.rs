use clap::{Args, Parser, Subcommand};

use devspace::{ColorMode, SessionFailurePolicy};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\nbuild date: ",
    env!("DEVSPACE_BUILD_DATE"),
    "\ntarget:     ",
    env!("DEVSPACE_BUILD_TARGET"),
    "\nprofile:    ",
    env!("DEVSPACE_BUILD_PROFILE"),
);

#[derive(Parser, Debug)]
#[command(
    name = "devspace",
    version,
    long_version = LONG_VERSION,
    about = "Develop inside a Kubernetes cluster: deploy the project chart, sync files, forward ports and open a shell.",
    after_long_help = "Examples:\n  devspace up\n  devspace up -d --sync-failure isolate\n  devspace up -c web -- npm run dev\n  devspace remove sync --local ./src\n  devspace remove port 8080,3000\n  devspace remove package redis -d backend\n"
)]
pub(crate) struct Cli {
    /// Print detailed execution info (raises the log level to debug)
    #[arg(long, global = true)]
    pub(crate) verbose: bool,

    /// Colorize output: auto|always|never
    #[arg(long = "color", value_enum, global = true)]
    pub(crate) color: Option<ColorMode>,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum Command {
    /// Start the development environment and attach a terminal to the release pod
    Up(UpArgs),
    /// Remove sync paths, port forwards or chart packages from the configuration
    Remove {
        #[command(subcommand)]
        cmd: RemoveCmd,
    },
}

#[derive(Args, Debug, Clone)]
pub(crate) struct UpArgs {
    /// Upgrade the chart backend even if it is already running
    #[arg(long = "tiller")]
    pub(crate) tiller: bool,

    /// Create pull secrets for the configured registries
    #[arg(long = "init-registries", default_value_t = true, action = clap::ArgAction::Set)]
    pub(crate) init_registries: bool,

    /// Deploy the chart even if it did not change
    #[arg(long = "deploy", short = 'd')]
    pub(crate) deploy: bool,

    /// Start the configured file syncs
    #[arg(long = "sync", default_value_t = true, action = clap::ArgAction::Set)]
    pub(crate) sync: bool,

    /// Start the configured port forwards
    #[arg(long = "portforwarding", default_value_t = true, action = clap::ArgAction::Set)]
    pub(crate) portforwarding: bool,

    /// Clear the containers' command and args so their entrypoint does not run
    #[arg(long = "no-sleep")]
    pub(crate) no_sleep: bool,

    /// Log every file the sync uploads
    #[arg(long = "verbose-sync")]
    pub(crate) verbose_sync: bool,

    /// Container to open the terminal in (default: the pod's first container)
    #[arg(long = "container", short = 'c')]
    pub(crate) container: Option<String>,

    /// What to do when a sync session fails to start
    #[arg(long = "sync-failure", value_enum, default_value_t = SessionFailurePolicy::Abort)]
    pub(crate) sync_failure: SessionFailurePolicy,

    /// Command to run in the container instead of a shell
    #[arg(trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum RemoveCmd {
    /// Remove sync paths matching the given selectors
    Sync {
        /// Label selector of the entries to remove (k=v,k2=v2)
        #[arg(long = "selector")]
        selector: Option<String>,
        /// Local path of the entries to remove
        #[arg(long = "local")]
        local: Option<String>,
        /// Container path of the entries to remove
        #[arg(long = "container")]
        container: Option<String>,
        /// Remove every sync path
        #[arg(long = "all")]
        all: bool,
    },
    /// Remove port forwards by port list or selector
    Port {
        /// Comma separated local or remote ports to remove
        ports: Option<String>,
        /// Label selector of the entries to remove (k=v,k2=v2)
        #[arg(long = "selector")]
        selector: Option<String>,
        /// Remove every port forward
        #[arg(long = "all")]
        all: bool,
    },
    /// Remove a dependency from the chart's requirements.yaml
    Package {
        /// Name of the dependency to remove
        name: Option<String>,
        /// Remove every dependency
        #[arg(long = "all")]
        all: bool,
        /// Deployment whose chart is edited (required with several deployments)
        #[arg(long = "deployment", short = 'd')]
        deployment: Option<String>,
    },
}
