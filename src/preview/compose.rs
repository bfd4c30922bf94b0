//! Container topology generation for one environment.
//!
//! Container names follow `<environment>-<project>-<service>`. The live
//! event listener parses names back to an environment with
//! [`match_container`], so the two must stay in sync.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use super::manifest::Manifest;
use super::models::EnvironmentKey;

/// Generated topology file, consumed by `docker compose`.
pub const COMPOSE_FILE: &str = "docker-compose.yml";

/// Where the checkout is mounted inside the PHP container.
pub const CONTAINER_WEBROOT: &str = "/var/www/html";

pub const PUBLIC_FILES_PATH: &str = "sites/default/files";

pub(crate) const DB_NAME: &str = "drupal";
pub(crate) const DB_USER: &str = "drupal";
pub(crate) const DB_PASSWORD: &str = "drupal";
pub(crate) const DB_ROOT_PASSWORD: &str = "root";

// ── Naming ────────────────────────────────────────────────────────────

pub fn container_name(key: &EnvironmentKey, service: &str) -> String {
    format!("{}-{}", key.container_prefix(), service)
}

/// Resolve a container name to the environment that owns it.
///
/// `known` holds every persisted environment; the longest matching prefix
/// wins so `mr-1-shop` never captures `mr-1-shop-v2-php`'s owner.
pub fn match_container<'a>(name: &str, known: &'a [EnvironmentKey]) -> Option<&'a EnvironmentKey> {
    let name = name.trim_start_matches('/');
    known
        .iter()
        .filter(|key| {
            let prefix = key.container_prefix();
            name.len() > prefix.len() + 1
                && name.starts_with(&prefix)
                && name.as_bytes()[prefix.len()] == b'-'
        })
        .max_by_key(|key| key.container_prefix().len())
}

// ── Env var layering ──────────────────────────────────────────────────

/// Env var sources in increasing precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EnvLayerSource {
    BuiltIn,
    Manifest,
    Project,
    Environment,
}

/// Ordered env var overrides. Later sources win on key collision,
/// regardless of insertion order.
#[derive(Debug, Clone, Default)]
pub struct EnvLayers {
    layers: Vec<(EnvLayerSource, BTreeMap<String, String>)>,
}

impl EnvLayers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: EnvLayerSource, vars: BTreeMap<String, String>) -> Self {
        self.layers.push((source, vars));
        self
    }

    pub fn resolve(&self) -> BTreeMap<String, String> {
        let mut ordered: Vec<&(EnvLayerSource, BTreeMap<String, String>)> =
            self.layers.iter().collect();
        ordered.sort_by_key(|(source, _)| *source);
        let mut out = BTreeMap::new();
        for (_, vars) in ordered {
            out.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        out
    }
}

// ── Topology ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ComposeFile {
    pub name: String,
    pub services: BTreeMap<String, ComposeService>,
    pub volumes: BTreeMap<String, Option<()>>,
    pub networks: BTreeMap<String, ExternalNetwork>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ComposeService {
    pub image: String,
    pub container_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub networks: Vec<String>,
    pub restart: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExternalNetwork {
    pub external: bool,
}

/// Host-wide inputs to topology generation.
#[derive(Debug, Clone)]
pub struct ComposeSettings {
    pub base_image: String,
    pub network: String,
    pub preview_domain: String,
    pub forward_auth: String,
    pub host_uid: u32,
    pub host_gid: u32,
}

impl ComposeSettings {
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        Self {
            base_image: settings.base_image.clone(),
            network: settings.docker_network.clone(),
            preview_domain: settings.preview_domain.clone(),
            forward_auth: settings.forward_auth.clone(),
            host_uid: current_uid(),
            host_gid: current_gid(),
        }
    }

    pub fn domain(&self, key: &EnvironmentKey) -> String {
        format!("{}.{}", key.container_prefix(), self.preview_domain)
    }

    pub fn url(&self, key: &EnvironmentKey) -> String {
        format!("https://{}", self.domain(key))
    }
}

pub fn current_uid() -> u32 {
    #[cfg(unix)]
    {
        unsafe { libc::getuid() }
    }
    #[cfg(not(unix))]
    {
        1000
    }
}

pub fn current_gid() -> u32 {
    #[cfg(unix)]
    {
        unsafe { libc::getgid() }
    }
    #[cfg(not(unix))]
    {
        1000
    }
}

/// What triggered this deploy, baked into the containers' environment.
#[derive(Debug, Clone)]
pub struct PreviewContext {
    pub key: EnvironmentKey,
    pub branch: String,
    pub commit_sha: String,
    pub mr_iid: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ComposeGenerator {
    settings: ComposeSettings,
}

impl ComposeGenerator {
    pub fn new(settings: ComposeSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ComposeSettings {
        &self.settings
    }

    /// Identity and connection variables every environment receives.
    pub fn builtin_env(
        &self,
        ctx: &PreviewContext,
        manifest: &Manifest,
        docroot: &str,
    ) -> BTreeMap<String, String> {
        let key = &ctx.key;
        let mut env = BTreeMap::new();
        let mut set = |k: &str, v: String| {
            env.insert(k.to_string(), v);
        };
        set("HOST_UID", self.settings.host_uid.to_string());
        set("HOST_GID", self.settings.host_gid.to_string());
        set("PREV_IS_PREVIEW", "true".to_string());
        set("PREV_PROJECT_NAME", key.project.clone());
        set("PREV_PREVIEW_NAME", key.name.clone());
        set(
            "PREV_MR_IID",
            ctx.mr_iid.map(|i| i.to_string()).unwrap_or_default(),
        );
        set("PREV_BRANCH", ctx.branch.clone());
        set("PREV_COMMIT_SHA", ctx.commit_sha.clone());
        set("PREV_URL", self.settings.url(key));
        set("PREV_DOMAIN", self.settings.domain(key));
        set("PREV_DB_HOST", container_name(key, "db"));
        set("PREV_DB_NAME", DB_NAME.to_string());
        set("PREV_DB_USER", DB_USER.to_string());
        set("PREV_DB_PASSWORD", DB_PASSWORD.to_string());
        set("PREV_FILE_PUBLIC_PATH", PUBLIC_FILES_PATH.to_string());
        set(
            "PREV_FILE_PRIVATE_PATH",
            format!("{}/private", PUBLIC_FILES_PATH),
        );
        set("PREV_FILE_TEMP_PATH", "/tmp".to_string());
        set(
            "PREV_FILE_TRANSLATIONS_PATH",
            format!("{}/translations", PUBLIC_FILES_PATH),
        );
        set("DOCUMENT_ROOT", format!("{}/{}", CONTAINER_WEBROOT, docroot));
        if manifest.services.redis {
            set("PREV_REDIS_HOST", container_name(key, "redis"));
        }
        if manifest.services.solr {
            set("PREV_SOLR_HOST", container_name(key, "solr"));
            set("PREV_SOLR_CORE", "drupal".to_string());
        }
        env
    }

    /// Build the full topology. `project_env` and `environment_env` are the
    /// operator overrides layered above the manifest's own variables.
    pub fn generate(
        &self,
        ctx: &PreviewContext,
        manifest: &Manifest,
        docroot: &str,
        project_env: BTreeMap<String, String>,
        environment_env: BTreeMap<String, String>,
    ) -> ComposeFile {
        let key = &ctx.key;
        let network = self.settings.network.clone();
        let domain = self.settings.domain(key);

        let environment = EnvLayers::new()
            .with(EnvLayerSource::BuiltIn, self.builtin_env(ctx, manifest, docroot))
            .with(EnvLayerSource::Manifest, manifest.env.clone())
            .with(EnvLayerSource::Project, project_env)
            .with(EnvLayerSource::Environment, environment_env)
            .resolve();

        let labels: BTreeMap<String, String> = [
            ("caddy", domain.clone()),
            ("caddy.reverse_proxy", "{{upstreams 80}}".to_string()),
            ("caddy.forward_auth", self.settings.forward_auth.clone()),
            ("caddy.forward_auth.uri", "/api/auth/verify-preview".to_string()),
            (
                "caddy.forward_auth.header_up",
                "Host {http.request.host}".to_string(),
            ),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let service = |image: String, name: &str| ComposeService {
            image,
            container_name: container_name(key, name),
            command: None,
            volumes: Vec::new(),
            environment: BTreeMap::new(),
            labels: BTreeMap::new(),
            networks: vec![network.clone()],
            restart: "unless-stopped".to_string(),
        };

        let mut services = BTreeMap::new();
        services.insert(
            "php".to_string(),
            ComposeService {
                volumes: vec![format!("./:{}", CONTAINER_WEBROOT)],
                environment,
                labels,
                ..service(
                    format!("{}:php{}", self.settings.base_image, manifest.php_version),
                    "php",
                )
            },
        );
        services.insert(
            "db".to_string(),
            ComposeService {
                volumes: vec!["db_data:/var/lib/mysql".to_string()],
                environment: [
                    ("MYSQL_ROOT_PASSWORD", DB_ROOT_PASSWORD),
                    ("MYSQL_DATABASE", DB_NAME),
                    ("MYSQL_USER", DB_USER),
                    ("MYSQL_PASSWORD", DB_PASSWORD),
                ]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
                ..service(manifest.database.image(), "db")
            },
        );

        let mut volumes = BTreeMap::new();
        volumes.insert("db_data".to_string(), None);

        if manifest.services.redis {
            services.insert(
                "redis".to_string(),
                service("redis:7-alpine".to_string(), "redis"),
            );
        }
        if manifest.services.solr {
            services.insert(
                "solr".to_string(),
                ComposeService {
                    command: Some("solr-precreate drupal".to_string()),
                    volumes: vec!["solr_data:/var/solr".to_string()],
                    ..service("solr:9".to_string(), "solr")
                },
            );
            volumes.insert("solr_data".to_string(), None);
        }

        let mut networks = BTreeMap::new();
        networks.insert(network.clone(), ExternalNetwork { external: true });

        ComposeFile {
            name: key.container_prefix(),
            services,
            volumes,
            networks,
        }
    }
}

/// Write the topology into the environment directory.
pub fn write_compose(dir: &Path, compose: &ComposeFile) -> Result<PathBuf> {
    let path = dir.join(COMPOSE_FILE);
    let yaml = serde_yaml::to_string(compose).context("Failed to serialize compose file")?;
    std::fs::write(&path, yaml).with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::debug!(path = %path.display(), "Wrote compose file");
    Ok(path)
}
