#![allow(clippy::module_name_repetitions)]
//! Colored status lines on stderr.
//!
//! Every user-facing line is `[<status>] message`, painted per status when color is on:
//!     let use_err = devspace::color_enabled_stderr();
//!     devspace::log_done_stderr(use_err, "Chart backend ready");
//! Each line is also emitted as a `devspace.ui` tracing event so the project log file
//! carries the same transcript (the stderr subscriber filters that target out).

use clap::ValueEnum;
use once_cell::sync::OnceCell;

pub const UI_TARGET: &str = "devspace.ui";

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn enabled_for(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Always => true,
            ColorMode::Never => false,
            ColorMode::Auto => is_tty,
        }
    }
}

static COLOR_MODE: OnceCell<ColorMode> = OnceCell::new();

pub fn set_color_mode(mode: ColorMode) {
    let _ = COLOR_MODE.set(mode);
}

/// `NO_COLOR` (https://no-color.org/) wins, then `--color`, then `DEVSPACE_COLOR`.
fn color_enabled_for(is_tty: bool, no_color: bool, env_pref: Option<&str>) -> bool {
    if no_color {
        return false;
    }
    COLOR_MODE
        .get()
        .copied()
        .or_else(|| env_pref.and_then(|v| ColorMode::from_str(v.trim(), true).ok()))
        .unwrap_or(ColorMode::Auto)
        .enabled_for(is_tty)
}

pub fn color_enabled_stderr() -> bool {
    color_enabled_for(
        atty::is(atty::Stream::Stderr),
        std::env::var_os("NO_COLOR").is_some(),
        std::env::var("DEVSPACE_COLOR").ok().as_deref(),
    )
}

/// ANSI-wrapped when enabled.
fn paint(enabled: bool, code: &str, s: &str) -> String {
    if enabled {
        format!("{code}{s}\x1b[0m")
    } else {
        s.to_string()
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Status {
    Info,
    Done,
    Warn,
    Fatal,
}

impl Status {
    fn code(self) -> &'static str {
        match self {
            Status::Info => "\x1b[36;1m",
            Status::Done => "\x1b[32;1m",
            Status::Warn => "\x1b[33m",
            Status::Fatal => "\x1b[31;1m",
        }
    }

    /// Info lines carry no tag; progress reads better without one.
    fn tag(self) -> Option<&'static str> {
        match self {
            Status::Info => None,
            Status::Done => Some("[done]"),
            Status::Warn => Some("[warn]"),
            Status::Fatal => Some("[fatal]"),
        }
    }
}

pub fn status_line(use_color: bool, status: Status, msg: &str) -> String {
    let text = match status.tag() {
        Some(tag) => format!("{tag} {msg}"),
        None => msg.to_string(),
    };
    paint(use_color, status.code(), &text)
}

pub fn log_status_stderr(use_color: bool, status: Status, msg: &str) {
    match status {
        Status::Info | Status::Done => tracing::info!(target: UI_TARGET, ?status, "{msg}"),
        Status::Warn => tracing::warn!(target: UI_TARGET, "{msg}"),
        Status::Fatal => tracing::error!(target: UI_TARGET, "{msg}"),
    }
    eprintln!("{}", status_line(use_color, status, msg));
}

pub fn log_info_stderr(use_color: bool, msg: &str) {
    log_status_stderr(use_color, Status::Info, msg);
}

pub fn log_done_stderr(use_color: bool, msg: &str) {
    log_status_stderr(use_color, Status::Done, msg);
}

pub fn log_warn_stderr(use_color: bool, msg: &str) {
    log_status_stderr(use_color, Status::Warn, msg);
}

pub fn log_error_stderr(use_color: bool, msg: &str) {
    log_status_stderr(use_color, Status::Fatal, msg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_lines_are_tagged_and_painted() {
        assert_eq!(status_line(false, Status::Info, "Attaching"), "Attaching");
        assert_eq!(status_line(false, Status::Warn, "no pod"), "[warn] no pod");
        assert_eq!(
            status_line(true, Status::Fatal, "boom"),
            "\x1b[31;1m[fatal] boom\x1b[0m"
        );
    }

    #[test]
    fn test_no_color_wins_and_env_preference_is_case_insensitive() {
        assert!(!color_enabled_for(true, true, Some("always")));
        assert!(color_enabled_for(false, false, Some(" Always ")));
        assert!(!color_enabled_for(true, false, Some("never")));
        // Unknown values fall back to auto
        assert!(color_enabled_for(true, false, Some("sometimes")));
        assert!(!color_enabled_for(false, false, None));
    }
}
