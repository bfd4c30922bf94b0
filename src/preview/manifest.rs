//! Per-project `preview.yml` manifest.
//!
//! A missing file yields defaults; a malformed file logs a warning and
//! yields defaults. Unknown keys are ignored.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_yaml::Value;

pub const MANIFEST_FILE: &str = "preview.yml";

/// Candidate document roots, checked in order when the manifest is silent.
pub const DOCROOT_CANDIDATES: [&str; 2] = ["web", "docroot"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSpec {
    pub engine: String,
    pub version: String,
}

impl DatabaseSpec {
    /// Parse `engine:version`; a bare version means MySQL.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((engine, version)) => Self {
                engine: engine.to_string(),
                version: version.to_string(),
            },
            None => Self {
                engine: "mysql".to_string(),
                version: raw.to_string(),
            },
        }
    }

    pub fn image(&self) -> String {
        format!("{}:{}", self.engine, self.version)
    }
}

impl Default for DatabaseSpec {
    fn default() -> Self {
        Self::parse("mysql:8.0")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuxServices {
    pub redis: bool,
    pub solr: bool,
}

/// Deployment phase of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    New,
    Update,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Update => "update",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployScripts {
    pub new: Option<String>,
    pub update: Option<String>,
}

impl DeployScripts {
    pub fn for_phase(&self, phase: Phase) -> Option<&str> {
        match phase {
            Phase::New => self.new.as_deref(),
            Phase::Update => self.update.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub php_version: String,
    pub database: DatabaseSpec,
    /// `None` means detect from the checkout.
    pub docroot: Option<String>,
    pub services: AuxServices,
    pub env: BTreeMap<String, String>,
    pub deploy: DeployScripts,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            php_version: "8.3".to_string(),
            database: DatabaseSpec::default(),
            docroot: None,
            services: AuxServices::default(),
            env: BTreeMap::new(),
            deploy: DeployScripts::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawManifest {
    php_version: Option<Value>,
    database: Option<Value>,
    mariadb: Option<Value>,
    mysql_version: Option<Value>,
    docroot: Option<Value>,
    services: Option<Value>,
    env: Option<Value>,
    deploy: Option<Value>,
}

/// Render a scalar YAML value as the string the user wrote (`8.3` → "8.3").
fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Service switches accept any scalar: `1`, `"yes"` and `true` all enable.
fn enabled(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "" | "0" | "false" | "no" | "off"
        ),
        _ => false,
    }
}

/// A script entry is a non-empty path; `false`, `null` or empty disables it.
fn script_path(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

impl Manifest {
    /// Parse manifest text, applying defaults for absent keys.
    pub fn parse(text: &str) -> Result<Self, serde_yaml::Error> {
        // An empty document deserializes as unit, not a mapping.
        let raw: RawManifest = if text.trim().is_empty() {
            RawManifest::default()
        } else {
            serde_yaml::from_str::<Option<RawManifest>>(text)?.unwrap_or_default()
        };
        let mut manifest = Self::default();

        if let Some(v) = raw.php_version.as_ref().and_then(scalar) {
            manifest.php_version = v;
        }

        // Unified `database` wins over the legacy spellings.
        if let Some(db) = raw.database.as_ref().and_then(scalar) {
            manifest.database = DatabaseSpec::parse(&db);
        } else if let Some(version) = raw.mariadb.as_ref().and_then(scalar) {
            manifest.database = DatabaseSpec {
                engine: "mariadb".to_string(),
                version,
            };
        } else if let Some(version) = raw.mysql_version.as_ref().and_then(scalar) {
            manifest.database = DatabaseSpec::parse(&version);
        }

        manifest.docroot = raw
            .docroot
            .as_ref()
            .and_then(scalar)
            .filter(|d| !d.is_empty());

        if let Some(Value::Mapping(services)) = &raw.services {
            manifest.services.redis = enabled(services.get("redis"));
            manifest.services.solr = enabled(services.get("solr"));
        }

        if let Some(Value::Mapping(env)) = &raw.env {
            manifest.env = env
                .iter()
                .filter_map(|(k, v)| Some((scalar(k)?, scalar(v)?)))
                .collect();
        }

        if let Some(Value::Mapping(deploy)) = &raw.deploy {
            manifest.deploy.new = script_path(deploy.get("new"));
            manifest.deploy.update = script_path(deploy.get("update"));
        }

        Ok(manifest)
    }

    /// Load `preview.yml` from a checkout. Never fails: problems are logged
    /// and defaults used.
    pub fn load(checkout: &Path) -> Self {
        let path = checkout.join(MANIFEST_FILE);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No manifest, using defaults");
                return Self::default();
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read manifest, using defaults");
                return Self::default();
            }
        };
        match Self::parse(&text) {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to parse manifest, using defaults");
                Self::default()
            }
        }
    }

    /// Declared document root, or the first candidate directory present in
    /// the checkout, or `web`.
    pub fn resolve_docroot(&self, checkout: &Path) -> String {
        if let Some(docroot) = &self.docroot {
            return docroot.clone();
        }
        DOCROOT_CANDIDATES
            .iter()
            .find(|c| checkout.join(c).is_dir())
            .unwrap_or(&DOCROOT_CANDIDATES[0])
            .to_string()
    }
}
