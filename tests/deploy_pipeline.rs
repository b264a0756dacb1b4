mod common;

use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{pod, FakeBackend, FakeCluster, FAST_WAIT};
use devspace::bootstrap::ClusterConnection;
use devspace::deploy::{DeployError, DeployOptions, DeploymentPipeline};
use devspace::release_cache::ReleaseCache;

fn chart(dir: &Path) {
    fs::create_dir_all(dir.join("templates")).unwrap();
    fs::write(dir.join("Chart.yaml"), "name: web\nversion: 0.1.0\n").unwrap();
    fs::write(dir.join("values.yaml"), "pullSecrets:\n  - existing\nreplicas: 1\n").unwrap();
    fs::write(dir.join("templates/deployment.yaml"), "kind: Deployment\n").unwrap();
}

fn connection(cluster: &Arc<FakeCluster>, backend: &Arc<FakeBackend>) -> ClusterConnection {
    ClusterConnection::new(cluster.clone(), backend.clone(), "dev", "127.0.0.1:44134", None)
}

fn options(chart_dir: &Path) -> DeployOptions {
    let mut opts = DeployOptions::new("web", "dev", chart_dir);
    opts.ready_wait = FAST_WAIT;
    opts
}

#[test]
fn test_unchanged_chart_with_running_pod_skips_install() {
    let td = tempfile::tempdir().unwrap();
    let chart_dir = td.path().join("chart");
    chart(&chart_dir);
    let cluster = FakeCluster::new();
    let backend = FakeBackend::new(cluster.clone());
    let conn = connection(&cluster, &backend);
    let cache = ReleaseCache::in_workdir(td.path());
    let opts = options(&chart_dir);

    let first = DeploymentPipeline::new(&conn, &cache)
        .ensure_deployed(&opts)
        .expect("deploy");
    assert!(first.deployed);
    assert_eq!(first.revision, Some(1));
    assert_eq!(first.pod.name(), "web-1");
    let state = cache.load().unwrap();
    assert!(state.helm_chart_hash.is_some());
    assert_eq!(state.release_revision, Some(1));

    let second = DeploymentPipeline::new(&conn, &cache)
        .ensure_deployed(&opts)
        .expect("reuse");
    assert!(!second.deployed);
    assert_eq!(second.pod.name(), "web-1");
    assert_eq!(second.revision, Some(1));
    assert_eq!(backend.install_count(), 1);
}

#[test]
fn test_changed_byte_triggers_redeploy() {
    let td = tempfile::tempdir().unwrap();
    let chart_dir = td.path().join("chart");
    chart(&chart_dir);
    let cluster = FakeCluster::new();
    let backend = FakeBackend::new(cluster.clone());
    let conn = connection(&cluster, &backend);
    let cache = ReleaseCache::in_workdir(td.path());
    let opts = options(&chart_dir);

    DeploymentPipeline::new(&conn, &cache)
        .ensure_deployed(&opts)
        .expect("deploy");
    let hash1 = cache.load().unwrap().helm_chart_hash;

    fs::write(chart_dir.join("templates/deployment.yaml"), "kind: Deployment \n").unwrap();
    let d = DeploymentPipeline::new(&conn, &cache)
        .ensure_deployed(&opts)
        .expect("redeploy");
    assert!(d.deployed);
    assert_eq!(d.revision, Some(2));
    assert_eq!(d.pod.name(), "web-2");
    assert_eq!(backend.install_count(), 2);
    assert_ne!(cache.load().unwrap().helm_chart_hash, hash1);
}

#[test]
fn test_force_redeploys_unchanged_chart() {
    let td = tempfile::tempdir().unwrap();
    let chart_dir = td.path().join("chart");
    chart(&chart_dir);
    let cluster = FakeCluster::new();
    let backend = FakeBackend::new(cluster.clone());
    let conn = connection(&cluster, &backend);
    let cache = ReleaseCache::in_workdir(td.path());
    let mut opts = options(&chart_dir);

    DeploymentPipeline::new(&conn, &cache)
        .ensure_deployed(&opts)
        .expect("deploy");
    opts.force = true;
    let d = DeploymentPipeline::new(&conn, &cache)
        .ensure_deployed(&opts)
        .expect("forced");
    assert!(d.deployed);
    assert_eq!(backend.install_count(), 2);
}

#[test]
fn test_missing_pod_triggers_deploy_even_with_cached_hash() {
    let td = tempfile::tempdir().unwrap();
    let chart_dir = td.path().join("chart");
    chart(&chart_dir);
    let cluster = FakeCluster::new();
    let backend = FakeBackend::new(cluster.clone());
    let conn = connection(&cluster, &backend);
    let cache = ReleaseCache::in_workdir(td.path());
    let opts = options(&chart_dir);

    DeploymentPipeline::new(&conn, &cache)
        .ensure_deployed(&opts)
        .expect("deploy");
    cluster.state.lock().unwrap().pods.clear();
    let d = DeploymentPipeline::new(&conn, &cache)
        .ensure_deployed(&opts)
        .expect("deploy again");
    assert!(d.deployed);
    assert_eq!(backend.install_count(), 2);
}

#[test]
fn test_readiness_timeout_leaves_cache_untouched() {
    let td = tempfile::tempdir().unwrap();
    let chart_dir = td.path().join("chart");
    chart(&chart_dir);
    let cluster = FakeCluster::new();
    // A pod of an older revision that never becomes ready
    let mut stale = pod("dev", "web-old", &[("release", "web")], &["app"], false);
    stale
        .metadata
        .annotations
        .insert("revision".to_string(), "0".to_string());
    cluster.add_pod(stale);
    let backend = FakeBackend::without_pods(cluster.clone());
    let conn = connection(&cluster, &backend);
    let cache = ReleaseCache::in_workdir(td.path());

    let err = DeploymentPipeline::new(&conn, &cache)
        .ensure_deployed(&options(&chart_dir))
        .expect_err("must time out");
    assert!(
        matches!(err, DeployError::ReadinessTimeout { revision: 1, .. }),
        "{err}"
    );
    assert_eq!(backend.install_count(), 1);
    let state = cache.load().unwrap();
    assert_eq!(state.helm_chart_hash, None);
    assert_eq!(state.release_revision, None);
}

#[test]
fn test_override_values_carry_images_and_pull_secrets() {
    let td = tempfile::tempdir().unwrap();
    let chart_dir = td.path().join("chart");
    chart(&chart_dir);
    let cluster = FakeCluster::new();
    let backend = FakeBackend::new(cluster.clone());
    let conn = connection(&cluster, &backend);
    let cache = ReleaseCache::in_workdir(td.path());
    let mut opts = options(&chart_dir);
    opts.no_sleep = true;
    opts.images
        .insert("default".to_string(), "registry.example.com/web:abc".to_string());
    opts.pull_secrets = vec!["existing".to_string(), "devspace-auth-registry-example-com".to_string()];

    DeploymentPipeline::new(&conn, &cache)
        .ensure_deployed(&opts)
        .expect("deploy");
    let installs = backend.installs.lock().unwrap();
    let (name, ns, values) = &installs[0];
    assert_eq!(name, "web");
    assert_eq!(ns, "dev");
    assert_eq!(
        values["containers"]["default"]["image"].as_str(),
        Some("registry.example.com/web:abc")
    );
    assert_eq!(
        values["containers"]["default"]["command"].as_sequence().map(Vec::len),
        Some(0)
    );
    let secrets: Vec<&str> = values["pullSecrets"]
        .as_sequence()
        .unwrap()
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert_eq!(secrets, vec!["existing", "devspace-auth-registry-example-com"]);
    assert_eq!(values["replicas"].as_u64(), Some(1));
}

#[test]
fn test_failed_install_leaves_cache_untouched() {
    let td = tempfile::tempdir().unwrap();
    let chart_dir = td.path().join("chart");
    chart(&chart_dir);
    let cluster = FakeCluster::new();
    let backend = FakeBackend::new(cluster.clone());
    let conn = connection(&cluster, &backend);
    let cache = ReleaseCache::in_workdir(td.path());
    let opts = options(&chart_dir);

    DeploymentPipeline::new(&conn, &cache)
        .ensure_deployed(&opts)
        .expect("deploy");
    let before = std::fs::read_to_string(cache.path()).unwrap();

    fs::write(chart_dir.join("values.yaml"), "replicas: 2\n").unwrap();
    backend.fail_install.store(true, Ordering::SeqCst);
    let err = DeploymentPipeline::new(&conn, &cache)
        .ensure_deployed(&opts)
        .expect_err("install fails");
    assert!(matches!(err, DeployError::Install(_)), "{err}");
    assert_eq!(backend.install_count(), 2);
    assert_eq!(std::fs::read_to_string(cache.path()).unwrap(), before);

    // The changed chart is still pending, so the next run deploys again
    backend.fail_install.store(false, Ordering::SeqCst);
    let d = DeploymentPipeline::new(&conn, &cache)
        .ensure_deployed(&opts)
        .expect("retry");
    assert!(d.deployed);
    assert_eq!(d.revision, Some(2));
}
