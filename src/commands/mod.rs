pub(crate) mod remove;
pub(crate) mod up;

use std::process::ExitCode;

/// Print a fatal error and map it to the process exit code.
pub(crate) fn report_failure(use_err: bool, e: &anyhow::Error) -> ExitCode {
    devspace::log_error_stderr(use_err, &format!("{e:#}"));
    ExitCode::from(devspace::exit_code_for_error(e))
}
