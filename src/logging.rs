//! Diagnostic events (`tracing`) go to stderr, filtered by `DEVSPACE_LOG`, and, inside a
//! project, to `.devspace/logs/default.log`.

use std::env;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::{DefaultFields, Format};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::color::UI_TARGET;
use crate::config::CONFIG_DIR;

pub const LOG_ENV: &str = "DEVSPACE_LOG";
pub const LOG_DIR: &str = "logs";
pub const LOG_FILE: &str = "default.log";

static INIT: OnceCell<()> = OnceCell::new();

/// Filter directive: `DEVSPACE_LOG` when set, else `debug` with `--verbose`, else `warn`.
pub fn filter_directive(env_value: Option<&str>, verbose: bool) -> String {
    match env_value.map(str::trim).filter(|s| !s.is_empty()) {
        Some(v) => v.to_string(),
        None if verbose => "debug".to_string(),
        None => "warn".to_string(),
    }
}

/// Status lines already reach stderr through `eprintln!`; only the log file keeps their events.
fn stderr_filter(directive: &str) -> EnvFilter {
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|e| {
        eprintln!("devspace: ignoring invalid {LOG_ENV}={directive}: {e}");
        EnvFilter::new("warn")
    });
    match format!("{UI_TARGET}=off").parse::<Directive>() {
        Ok(off) => filter.add_directive(off),
        Err(_) => filter,
    }
}

/// The log file keeps `info` and up unless `DEVSPACE_LOG` says otherwise.
pub fn file_filter_directive(env_value: Option<&str>) -> String {
    env_value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("info")
        .to_string()
}

/// `<workdir>/.devspace/logs`, only when the project directory already exists.
pub fn project_log_dir(workdir: &Path) -> Option<PathBuf> {
    let dir = workdir.join(CONFIG_DIR);
    dir.is_dir().then(|| dir.join(LOG_DIR))
}

/// Open `<dir>/default.log` for appending, creating `dir` as needed.
pub fn open_log_file(dir: &Path) -> io::Result<File> {
    fs::create_dir_all(dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE))
}

type FileLayer<S> = tracing_subscriber::fmt::Layer<S, DefaultFields, Format, Mutex<File>>;

/// Plain-text formatting for the log file.
fn file_fmt_layer<S>(file: File) -> FileLayer<S> {
    tracing_subscriber::fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true)
}

/// Install the subscriber once; later calls are no-ops. Returns whether this call installed it.
///
/// A log file that cannot be opened only costs the file output.
pub fn init_logging(verbose: bool, log_dir: Option<&Path>) -> bool {
    if INIT.get().is_some() {
        return false;
    }
    let env_value = env::var(LOG_ENV).ok();
    let directive = filter_directive(env_value.as_deref(), verbose);
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(stderr_filter(&directive));
    let file = log_dir.and_then(|dir| match open_log_file(dir) {
        Ok(f) => Some(f),
        Err(e) => {
            eprintln!("devspace: cannot write logs to {}: {e}", dir.display());
            None
        }
    });
    let file_filter = EnvFilter::try_new(file_filter_directive(env_value.as_deref()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = file.map(|f| file_fmt_layer(f).with_filter(file_filter));
    let installed = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .is_ok();
    let _ = INIT.set(());
    installed
}
