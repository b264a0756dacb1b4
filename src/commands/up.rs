use std::env;
use std::process::ExitCode;

use anyhow::{Context, Result};

use devspace::config::{ensure_config_dir, ConfigFiles};
use devspace::helm::HelmHome;
use devspace::kube::runtime;
use devspace::{acquire_lock, should_acquire_lock, Collaborators, Orchestrator, UpOptions};

use crate::cli::UpArgs;

pub(crate) fn run_up(args: &UpArgs) -> ExitCode {
    let use_err = devspace::color_enabled_stderr();
    match up(args, use_err) {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => super::report_failure(use_err, &e),
    }
}

fn up(args: &UpArgs, use_err: bool) -> Result<i32> {
    let workdir = env::current_dir().context("cannot determine working directory")?;
    let config = ConfigFiles::load(&workdir)?.merged();

    // Held until the attached terminal exits and every session is stopped
    let _lock = if should_acquire_lock() {
        Some(acquire_lock(&workdir)?)
    } else {
        None
    };
    ensure_config_dir(&workdir).context("cannot create .devspace directory")?;

    let kubectl = runtime::kubectl_path()?;
    let helm = runtime::helm_path()?;
    let home = HelmHome::from_env().context("cannot locate the chart repository home")?;
    tracing::debug!(
        target: "devspace.up",
        kubectl = %kubectl.display(),
        helm = %helm.display(),
        home = %home.root().display(),
        "tools discovered"
    );

    let collab = Collaborators::from_tools(&kubectl, &helm, &home);
    let mut opts = UpOptions::new(&workdir);
    opts.force_backend_upgrade = args.tiller;
    opts.init_registries = args.init_registries;
    opts.force_deploy = args.deploy;
    opts.sync = args.sync;
    opts.port_forwarding = args.portforwarding;
    opts.no_sleep = args.no_sleep;
    opts.verbose_sync = args.verbose_sync;
    opts.container = args.container.clone();
    opts.command = args.command.clone();
    opts.sync_failure = args.sync_failure;
    opts.helm_home = Some(home);
    opts.use_color = use_err;

    Orchestrator::new(config, collab, opts).up()
}
