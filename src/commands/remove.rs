use std::env;
use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use devspace::config::edit::{
    parse_port_list, parse_selectors, remove_dependency, remove_ports, remove_sync,
    requirements_path, select_chart_path, PackageRemoval, PortRemoval, SyncRemoval,
};
use devspace::config::ConfigFiles;
use devspace::helm::{HelmCliFactory, HelmHome};
use devspace::kube::{runtime, KubectlCluster, KubectlPortForwarder, KubectlTunnel};
use devspace::{log_done_stderr, log_warn_stderr, BootstrapManager, BootstrapOptions};

use crate::cli::RemoveCmd;

/// Outcome of a remove sub-operation that did not fail.
enum Outcome {
    Done(String),
    Nothing(String),
    /// No selector flag given; nothing was touched.
    Usage(&'static str),
}

pub(crate) fn run_remove(cmd: &RemoveCmd) -> ExitCode {
    let use_err = devspace::color_enabled_stderr();
    let result = env::current_dir()
        .context("cannot determine working directory")
        .and_then(|workdir| match cmd {
            RemoveCmd::Sync {
                selector,
                local,
                container,
                all,
            } => remove_sync_cmd(&workdir, selector.as_deref(), local, container, *all),
            RemoveCmd::Port {
                ports,
                selector,
                all,
            } => remove_port_cmd(&workdir, ports.as_deref(), selector.as_deref(), *all),
            RemoveCmd::Package {
                name,
                all,
                deployment,
            } => remove_package_cmd(&workdir, name.as_deref(), *all, deployment.as_deref()),
        });
    match result {
        Ok(Outcome::Done(msg)) => {
            log_done_stderr(use_err, &msg);
            ExitCode::from(0)
        }
        Ok(Outcome::Nothing(msg)) => {
            log_warn_stderr(use_err, &msg);
            ExitCode::from(0)
        }
        Ok(Outcome::Usage(msg)) => {
            log_warn_stderr(use_err, msg);
            ExitCode::from(1)
        }
        Err(e) => super::report_failure(use_err, &e),
    }
}

fn selectors(s: Option<&str>) -> Result<std::collections::BTreeMap<String, String>> {
    match s.filter(|s| !s.trim().is_empty()) {
        Some(s) => Ok(parse_selectors(s)?),
        None => Ok(Default::default()),
    }
}

fn remove_sync_cmd(
    workdir: &Path,
    selector: Option<&str>,
    local: &Option<String>,
    container: &Option<String>,
    all: bool,
) -> Result<Outcome> {
    let removal = SyncRemoval {
        selector: selectors(selector)?,
        local_path: local.clone(),
        container_path: container.clone(),
        all,
    };
    if removal.is_empty() {
        return Ok(Outcome::Usage(
            "You have to specify at least one of the flags --selector, --local, --container or --all",
        ));
    }
    let mut files = ConfigFiles::load(workdir)?;
    let n = remove_sync(&mut files.base, files.overwrite.as_mut(), &removal);
    if n == 0 {
        return Ok(Outcome::Nothing("No matching sync path found".into()));
    }
    files.save()?;
    Ok(Outcome::Done(format!("Successfully removed {n} sync path(s)")))
}

fn remove_port_cmd(
    workdir: &Path,
    ports: Option<&str>,
    selector: Option<&str>,
    all: bool,
) -> Result<Outcome> {
    let removal = PortRemoval {
        selector: selectors(selector)?,
        ports: match ports {
            Some(p) => parse_port_list(p)?,
            None => Vec::new(),
        },
        all,
    };
    if removal.is_empty() {
        return Ok(Outcome::Usage(
            "You have to specify at least one of: a port list, --selector or --all",
        ));
    }
    let mut files = ConfigFiles::load(workdir)?;
    let n = remove_ports(&mut files.base, files.overwrite.as_mut(), &removal);
    if n == 0 {
        return Ok(Outcome::Nothing("No matching port forwarding found".into()));
    }
    files.save()?;
    Ok(Outcome::Done(format!("Successfully removed {n} port mapping(s)")))
}

fn remove_package_cmd(
    workdir: &Path,
    name: Option<&str>,
    all: bool,
    deployment: Option<&str>,
) -> Result<Outcome> {
    let name = name.filter(|n| !n.is_empty());
    if name.is_none() && !all {
        return Ok(Outcome::Usage(
            "You have to specify a package name or --all",
        ));
    }
    let config = ConfigFiles::load(workdir)?.merged();
    let chart = workdir.join(select_chart_path(&config, deployment)?);
    let req_path = requirements_path(&chart);
    let text = match fs::read_to_string(&req_path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Outcome::Nothing(format!(
                "No requirements.yaml found in {}",
                chart.display()
            )))
        }
        Err(e) => return Err(anyhow!("cannot read {}: {e}", req_path.display())),
    };
    let mut requirements: serde_yaml::Value = serde_yaml::from_str(&text)
        .map_err(|e| anyhow!("Error parsing yaml {}: {e}", req_path.display()))?;

    let removal = remove_dependency(&mut requirements, if all { None } else { name })?;
    match removal {
        PackageRemoval::NoDependencies => {
            return Ok(Outcome::Nothing("No dependencies found".into()))
        }
        PackageRemoval::NotPresent(n) => {
            return Ok(Outcome::Nothing(format!("Package {n} not found in requirements.yaml")))
        }
        PackageRemoval::Removed(_) | PackageRemoval::RemovedAll(_) => {}
    }
    let out = serde_yaml::to_string(&requirements)
        .map_err(|e| anyhow!("cannot serialize requirements.yaml: {e}"))?;
    fs::write(&req_path, out)
        .map_err(|e| anyhow!("cannot write {}: {e}", req_path.display()))?;

    update_dependencies(&config, &chart)?;
    Ok(Outcome::Done(match removal {
        PackageRemoval::Removed(n) => format!("Successfully removed dependency {n}"),
        PackageRemoval::RemovedAll(n) => format!("Successfully removed all {n} dependencies"),
        _ => "Dependencies updated".to_string(),
    }))
}

/// Rebuild the chart's dependencies through the chart backend.
fn update_dependencies(config: &devspace::config::Config, chart: &Path) -> Result<()> {
    let kubectl = runtime::kubectl_path()?;
    let helm = runtime::helm_path()?;
    let home = HelmHome::from_env().context("cannot locate the chart repository home")?;
    let cluster = Arc::new(KubectlCluster::new(kubectl.clone()));
    let tunnels = Arc::new(KubectlTunnel::new(
        cluster.clone(),
        Arc::new(KubectlPortForwarder::new(kubectl)),
        std::time::Duration::from_secs(10),
    ));
    let mut opts = BootstrapOptions::new(config.tiller_namespace());
    opts.app_namespaces = config.app_namespaces();
    let manager = BootstrapManager::new(
        cluster,
        tunnels,
        Arc::new(HelmCliFactory::new(helm, home.root().to_path_buf())),
        opts,
    );
    let conn = manager.ensure_ready(false)?;
    conn.backend()
        .update_dependencies(chart)
        .context("Error updating chart dependencies")?;
    Ok(())
}
