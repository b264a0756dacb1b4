use std::fs;
use std::path::Path;
use std::process::{Command, Output};

const CONFIG: &str = r#"devSpace:
  release:
    name: web
    namespace: dev
  ports:
  - labelSelector:
      release: web
    portMappings:
    - localPort: 8080
      remotePort: 80
    - localPort: 3000
      remotePort: 3000
  sync:
  - labelSelector:
      release: web
    localSubPath: ./src
    containerPath: /app
  - labelSelector:
      release: web
    localSubPath: ./assets
    containerPath: /srv/assets
"#;

fn project() -> tempfile::TempDir {
    let td = tempfile::tempdir().expect("tmpdir");
    fs::create_dir_all(td.path().join(".devspace")).unwrap();
    fs::write(td.path().join(".devspace/config.yaml"), CONFIG).unwrap();
    td
}

fn devspace(dir: &Path, args: &[&str]) -> Output {
    let bin = env!("CARGO_BIN_EXE_devspace");
    Command::new(bin)
        .args(args)
        .current_dir(dir)
        .env("DEVSPACE_SKIP_LOCK", "1")
        .env("NO_COLOR", "1")
        .output()
        .expect("run devspace")
}

fn config_text(dir: &Path) -> String {
    fs::read_to_string(dir.join(".devspace/config.yaml")).unwrap()
}

#[test]
fn test_remove_sync_without_flags_is_a_usage_error() {
    let td = project();
    let out = devspace(td.path(), &["remove", "sync"]);
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("--selector"), "stderr: {stderr}");
    assert_eq!(config_text(td.path()), CONFIG);
}

#[test]
fn test_remove_sync_by_local_path() {
    let td = project();
    let out = devspace(td.path(), &["remove", "sync", "--local", "./src"]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert!(String::from_utf8_lossy(&out.stderr).contains("Successfully removed 1 sync path"));

    let text = config_text(td.path());
    assert!(!text.contains("/app"), "{text}");
    assert!(text.contains("/srv/assets"), "{text}");
}

#[test]
fn test_remove_sync_with_no_match_leaves_config() {
    let td = project();
    let out = devspace(td.path(), &["remove", "sync", "--container", "/nowhere"]);
    assert!(out.status.success());
    assert_eq!(config_text(td.path()), CONFIG);
}

#[test]
fn test_remove_port_by_number() {
    let td = project();
    let out = devspace(td.path(), &["remove", "port", "8080"]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));

    let text = config_text(td.path());
    assert!(!text.contains("8080"), "{text}");
    assert!(text.contains("3000"), "{text}");
}

#[test]
fn test_project_commands_log_to_devspace_logs() {
    let td = project();
    let out = devspace(td.path(), &["remove", "port", "3000"]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));

    let log = fs::read_to_string(td.path().join(".devspace/logs/default.log")).expect("log file");
    assert!(log.contains("configuration saved"), "{log}");
    assert!(!String::from_utf8_lossy(&out.stderr).contains("configuration saved"));
}

#[test]
fn test_remove_port_rejects_invalid_port() {
    let td = project();
    let out = devspace(td.path(), &["remove", "port", "http"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("invalid port"));
    assert_eq!(config_text(td.path()), CONFIG);
}

#[test]
fn test_remove_package_requires_name_or_all() {
    let td = project();
    let out = devspace(td.path(), &["remove", "package"]);
    assert_eq!(out.status.code(), Some(1));
    assert_eq!(config_text(td.path()), CONFIG);
}

#[test]
fn test_remove_package_without_requirements_is_a_no_op() {
    let td = project();
    fs::create_dir_all(td.path().join("chart")).unwrap();
    let out = devspace(td.path(), &["remove", "package", "redis"]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert!(String::from_utf8_lossy(&out.stderr).contains("No requirements.yaml"));
}

#[test]
fn test_up_without_config_fails() {
    let td = tempfile::tempdir().expect("tmpdir");
    let out = devspace(td.path(), &["up"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(!td.path().join(".devspace").exists());
}
