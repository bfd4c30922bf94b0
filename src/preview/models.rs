use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Persisted lifecycle status of an environment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    Creating,
    Active,
    Failed,
}

impl EnvironmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Active => "active",
            Self::Failed => "failed",
        }
    }

    /// Settled environments own a checkout and (possibly) a mount.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Active | Self::Failed)
    }
}

impl FromStr for EnvironmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "active" => Ok(Self::Active),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid environment status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Running,
    Success,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid deployment status: {}", s)),
        }
    }
}

/// Runtime-derived health of an environment's container group. Never
/// persisted; computed on demand from the container runtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContainerHealth {
    Running,
    Stopped,
    Missing,
    Unknown,
}

impl ContainerHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Missing => "missing",
            Self::Unknown => "unknown",
        }
    }
}

/// Identity of an environment: unique `(project, name)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvironmentKey {
    pub project: String,
    pub name: String,
}

impl EnvironmentKey {
    pub fn new(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            name: name.into(),
        }
    }

    /// Prefix shared by every container of this environment.
    pub fn container_prefix(&self) -> String {
        format!("{}-{}", self.name, self.project)
    }
}

impl fmt::Display for EnvironmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Environment {
    pub id: i64,
    pub project: String,
    pub name: String,
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
    pub status: EnvironmentStatus,
    pub url: Option<String>,
    pub path: Option<String>,
    pub mr_iid: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub last_deployed_at: Option<DateTime<Utc>>,
    pub last_deployment_status: Option<DeploymentStatus>,
    pub last_deployment_error: Option<String>,
    pub last_deployment_duration: Option<f64>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub auto_update: bool,
    pub pinned: bool,
    pub env_vars: BTreeMap<String, String>,
}

impl Environment {
    pub fn key(&self) -> EnvironmentKey {
        EnvironmentKey::new(&self.project, &self.name)
    }
}

/// Partial update applied by `upsert_environment`. Only `Some` fields are
/// written; `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvironmentUpdate {
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
    pub status: Option<EnvironmentStatus>,
    pub url: Option<String>,
    pub path: Option<String>,
    pub mr_iid: Option<i64>,
    pub last_deployed_at: Option<DateTime<Utc>>,
    pub last_deployment_status: Option<DeploymentStatus>,
    /// `Some(None)` clears the stored error.
    pub last_deployment_error: Option<Option<String>>,
    pub last_deployment_duration: Option<f64>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub auto_update: Option<bool>,
    pub pinned: Option<bool>,
    pub env_vars: Option<BTreeMap<String, String>>,
}

impl EnvironmentUpdate {
    pub fn status(status: EnvironmentStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    pub id: i64,
    pub environment_id: i64,
    pub status: DeploymentStatus,
    pub log_output: Option<String>,
    pub error: Option<String>,
    pub triggered_by: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
}

/// Deployment row without the (potentially large) log text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentSummary {
    pub id: i64,
    pub environment_id: i64,
    pub status: DeploymentStatus,
    pub error: Option<String>,
    pub triggered_by: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
}

/// Environment joined with its most recent deployment.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EnvironmentListing {
    #[serde(flatten)]
    pub environment: Environment,
    pub latest_deployment: Option<DeploymentSummary>,
}

impl EnvironmentListing {
    /// A pipeline is currently executing against this environment.
    pub fn is_building(&self) -> bool {
        self.latest_deployment
            .as_ref()
            .is_some_and(|d| d.status == DeploymentStatus::Running)
    }
}

// ── Naming ────────────────────────────────────────────────────────────

static INVALID_BRANCH_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9-]").expect("static regex"));
static DASH_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-{3,}").expect("static regex"));

pub fn mr_environment_name(iid: i64) -> String {
    format!("mr-{}", iid)
}

pub fn branch_environment_name(branch: &str) -> String {
    format!("branch-{}", sanitize_branch(branch))
}

/// Make a branch name safe for directory and container names.
///
/// `/` becomes `--` so `feature/x` and `feature-x` stay distinct; anything
/// outside `[A-Za-z0-9-]` is dropped.
pub fn sanitize_branch(branch: &str) -> String {
    let replaced = branch.replace('/', "--");
    let cleaned = INVALID_BRANCH_CHARS.replace_all(&replaced, "");
    let collapsed = DASH_RUNS.replace_all(&cleaned, "--");
    collapsed.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_strings() {
        for s in [
            EnvironmentStatus::Creating,
            EnvironmentStatus::Active,
            EnvironmentStatus::Failed,
        ] {
            assert_eq!(EnvironmentStatus::from_str(s.as_str()).unwrap(), s);
        }
        assert!(EnvironmentStatus::from_str("paused").is_err());
        assert!(DeploymentStatus::from_str("queued").is_err());
    }

    #[test]
    fn test_settled_statuses() {
        assert!(EnvironmentStatus::Active.is_settled());
        assert!(EnvironmentStatus::Failed.is_settled());
        assert!(!EnvironmentStatus::Creating.is_settled());
    }

    #[test]
    fn test_container_prefix_orders_name_first() {
        let key = EnvironmentKey::new("shop", "mr-7");
        assert_eq!(key.container_prefix(), "mr-7-shop");
        assert_eq!(key.to_string(), "shop/mr-7");
    }

    #[test]
    fn test_sanitize_branch() {
        assert_eq!(sanitize_branch("feature/login"), "feature--login");
        assert_eq!(sanitize_branch("fix_bug#12"), "fixbug12");
        assert_eq!(sanitize_branch("a//b"), "a--b");
        assert_eq!(sanitize_branch("-release-"), "release");
        assert_eq!(branch_environment_name("feature/x"), "branch-feature--x");
        assert_eq!(mr_environment_name(7), "mr-7");
    }

    #[test]
    fn test_health_serializes_snake_case() {
        let json = serde_json::to_string(&ContainerHealth::Missing).unwrap();
        assert_eq!(json, "\"missing\"");
    }
}
