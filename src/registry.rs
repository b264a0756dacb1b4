#![allow(clippy::module_name_repetitions)]
//! Image references and registry pull secrets.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde_json::json;

use crate::config::{Config, ImageConfig, RegistryConfig};
use crate::errors::ClusterError;
use crate::kube::{ClusterApi, Manifest};

pub const SECRET_PREFIX: &str = "devspace-auth-";
pub const DEFAULT_SECRET_EMAIL: &str = "noreply@devspace-cloud.com";

/// Registry host (with port) of a configured URL: scheme and path are dropped.
pub fn registry_host(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    match url::Url::parse(&with_scheme) {
        Ok(u) => match (u.host_str(), u.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_string(),
            _ => trimmed.to_string(),
        },
        Err(_) => trimmed.to_string(),
    }
}

/// True when the first path component names a registry host.
fn has_registry_host(name: &str) -> bool {
    match name.split_once('/') {
        Some((first, _)) => first.contains('.') || first.contains(':') || first == "localhost",
        None => false,
    }
}

fn has_tag(name: &str) -> bool {
    let last = name.rsplit('/').next().unwrap_or(name);
    last.contains(':') || last.contains('@')
}

/// `<registry host>/<image name>:<tag>`.
///
/// The tag comes from the image config, else `latest`. A name that
/// already carries a registry host is not prefixed; one that already carries a tag keeps it.
/// Docker Hub (`hub.docker.com`) never prefixes.
pub fn image_reference(
    image: &ImageConfig,
    registry: Option<&RegistryConfig>,
) -> String {
    let mut reference = image.name.clone();
    if !has_registry_host(&reference) {
        if let Some(url) = registry.and_then(|r| r.url.as_deref()) {
            let host = registry_host(url);
            if !host.is_empty() && host != "hub.docker.com" {
                reference = format!("{host}/{reference}");
            }
        }
    }
    if !has_tag(&reference) {
        let tag = image.tag.as_deref().filter(|t| !t.is_empty()).unwrap_or("latest");
        reference = format!("{reference}:{tag}");
    }
    reference
}

/// Resolve every declared image to its full reference, keyed by image name.
pub fn image_references(cfg: &Config) -> BTreeMap<String, String> {
    cfg.images
        .iter()
        .map(|(key, img)| {
            let reg = img.registry.as_ref().and_then(|r| cfg.registries.get(r));
            (key.clone(), image_reference(img, reg))
        })
        .collect()
}

pub fn pull_secret_name(registry_url: &str) -> String {
    format!("{SECRET_PREFIX}{}", crate::util::sanitize_dns_label(registry_url))
}

/// Secret names implied by every registry that has a URL.
pub fn implied_pull_secrets(cfg: &Config) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for reg in cfg.registries.values() {
        if let Some(url) = reg.url.as_deref().filter(|u| !u.is_empty()) {
            let name = pull_secret_name(url);
            if !out.contains(&name) {
                out.push(name);
            }
        }
    }
    out
}

pub fn docker_config_json(host: &str, username: &str, password: &str, email: &str) -> String {
    let auth = B64.encode(format!("{username}:{password}"));
    json!({
        "auths": {
            host: {
                "username": username,
                "password": password,
                "email": email,
                "auth": auth
            }
        }
    })
    .to_string()
}

pub fn pull_secret_manifest(
    namespace: &str,
    registry_url: &str,
    username: &str,
    password: &str,
    email: &str,
) -> Manifest {
    let cfg = docker_config_json(&registry_host(registry_url), username, password, email);
    Manifest::new(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "kubernetes.io/dockerconfigjson",
        "metadata": { "name": pull_secret_name(registry_url), "namespace": namespace },
        "data": { ".dockerconfigjson": B64.encode(cfg) }
    }))
}

/// Create or update a pull secret for every registry with a password in `namespace`.
/// Returns the names of the secrets written.
pub fn init_pull_secrets(
    cluster: &dyn ClusterApi,
    cfg: &Config,
    namespace: &str,
) -> Result<Vec<String>, ClusterError> {
    let mut written = Vec::new();
    for (name, reg) in &cfg.registries {
        let Some(auth) = reg.auth.as_ref() else {
            continue;
        };
        let Some(password) = auth.password.as_deref() else {
            continue;
        };
        let url = reg.url.as_deref().unwrap_or("");
        let username = auth.username.as_deref().unwrap_or("");
        let manifest = pull_secret_manifest(namespace, url, username, password, DEFAULT_SECRET_EMAIL);
        tracing::info!(target: "devspace.registry", registry = %name, secret = %manifest.name, "writing pull secret");
        cluster.apply(&manifest).map_err(|e| {
            ClusterError::Failed(format!("Failed to create pull secret for registry {name}: {e}"))
        })?;
        written.push(manifest.name);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryAuth;

    fn img(name: &str, tag: Option<&str>) -> ImageConfig {
        ImageConfig {
            name: name.into(),
            tag: tag.map(str::to_string),
            registry: Some("main".into()),
        }
    }

    fn reg(url: &str) -> RegistryConfig {
        RegistryConfig {
            url: Some(url.into()),
            auth: None,
        }
    }

    #[test]
    fn test_image_reference_uses_config_tag_or_latest() {
        let r = reg("https://registry.example.com/");
        assert_eq!(
            image_reference(&img("team/web", Some("v1")), Some(&r)),
            "registry.example.com/team/web:v1"
        );
        assert_eq!(
            image_reference(&img("team/web", Some("")), Some(&r)),
            "registry.example.com/team/web:latest"
        );
        assert_eq!(image_reference(&img("web", None), None), "web:latest");
    }

    #[test]
    fn test_image_reference_keeps_explicit_host_and_hub() {
        let r = reg("registry.example.com:5000");
        assert_eq!(
            image_reference(&img("localhost/web:dev", None), Some(&r)),
            "localhost/web:dev"
        );
        assert_eq!(
            image_reference(&img("web", None), Some(&r)),
            "registry.example.com:5000/web:latest"
        );
        assert_eq!(
            image_reference(&img("acme/web", None), Some(&reg("hub.docker.com"))),
            "acme/web:latest"
        );
    }

    #[test]
    fn test_pull_secret_names_are_dns_safe_and_deduplicated() {
        assert_eq!(
            pull_secret_name("https://Registry.Example.com:5000"),
            "devspace-auth-https-registry-example-com-5000"
        );
        let mut cfg = Config::default();
        cfg.registries.insert("a".into(), reg("hub.docker.com"));
        cfg.registries.insert("b".into(), reg("hub.docker.com"));
        cfg.registries.insert("c".into(), RegistryConfig::default());
        assert_eq!(implied_pull_secrets(&cfg), vec!["devspace-auth-hub-docker-com".to_string()]);
    }

    #[test]
    fn test_pull_secret_manifest_encodes_docker_config() {
        let m = pull_secret_manifest("dev", "https://registry.example.com", "bob", "s3cret", "a@b.c");
        assert_eq!(m.kind, "Secret");
        assert_eq!(m.namespace.as_deref(), Some("dev"));
        let data = m.body["data"][".dockerconfigjson"].as_str().unwrap();
        let decoded = String::from_utf8(B64.decode(data).unwrap()).unwrap();
        let v: serde_json::Value = serde_json::from_str(&decoded).unwrap();
        assert_eq!(v["auths"]["registry.example.com"]["username"], "bob");
        assert_eq!(
            v["auths"]["registry.example.com"]["auth"],
            B64.encode("bob:s3cret")
        );
    }

    #[test]
    fn test_registries_without_password_get_no_secret() {
        let mut cfg = Config::default();
        cfg.registries.insert(
            "a".into(),
            RegistryConfig {
                url: Some("r.example.com".into()),
                auth: Some(RegistryAuth {
                    username: Some("u".into()),
                    password: None,
                }),
            },
        );
        struct NoCluster;
        impl ClusterApi for NoCluster {
            fn namespace_exists(&self, _: &str) -> Result<bool, ClusterError> { unreachable!() }
            fn create_namespace(&self, _: &str) -> Result<(), ClusterError> { unreachable!() }
            fn service_account_exists(&self, _: &str, _: &str) -> Result<bool, ClusterError> { unreachable!() }
            fn deployment_status(&self, _: &str, _: &str) -> Result<Option<crate::kube::DeploymentStatus>, ClusterError> { unreachable!() }
            fn apply(&self, _: &Manifest) -> Result<(), ClusterError> { panic!("no secret expected") }
            fn list_pods(&self, _: &str, _: &crate::kube::LabelSelector) -> Result<Vec<crate::kube::Pod>, ClusterError> { unreachable!() }
            fn delete(&self, _: &str, _: &str, _: &str) -> Result<(), ClusterError> { unreachable!() }
        }
        assert!(init_pull_secrets(&NoCluster, &cfg, "dev").unwrap().is_empty());
    }
}
