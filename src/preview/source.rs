//! Source-control access: shallow clones over HTTPS and branch lookups
//! through the GitLab REST API, both authenticated with one personal
//! access token.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;

use super::process::{self, CommandSpec};

#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Shallow-clone `branch` of `project_path` (`group/project`) into
    /// `dest`, which must not exist or be empty.
    async fn clone_branch(&self, project_path: &str, branch: &str, dest: &Path) -> Result<()>;

    /// Head commit of `branch`, or `None` when the branch does not exist.
    async fn branch_head(&self, project_path: &str, branch: &str) -> Result<Option<String>>;
}

pub struct GitLabSource {
    base_url: String,
    token: Option<String>,
    clone_timeout: Duration,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct BranchResponse {
    commit: BranchCommit,
}

#[derive(Debug, Deserialize)]
struct BranchCommit {
    id: String,
}

impl GitLabSource {
    pub fn new(base_url: impl Into<String>, token: Option<String>, clone_timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            clone_timeout,
            client: reqwest::Client::new(),
        }
    }

    fn token(&self) -> Result<&str> {
        match self.token.as_deref() {
            Some(t) if !t.is_empty() => Ok(t),
            _ => bail!("GitLab token not configured (set GITLAB_TOKEN)"),
        }
    }

    /// `https://oauth2:<token>@<host>/<project_path>.git`
    pub fn clone_url(&self, project_path: &str, token: &str) -> String {
        let (scheme, host) = self
            .base_url
            .split_once("://")
            .unwrap_or(("https", self.base_url.as_str()));
        format!("{}://oauth2:{}@{}/{}.git", scheme, token, host, project_path)
    }

    fn branch_url(&self, project_path: &str, branch: &str) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .with_context(|| format!("Invalid GitLab URL: {}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("GitLab URL cannot be a base: {}", self.base_url))?
            .pop_if_empty()
            .extend([
                "api",
                "v4",
                "projects",
                project_path,
                "repository",
                "branches",
                branch,
            ]);
        Ok(url)
    }
}

#[async_trait]
impl SourceControl for GitLabSource {
    async fn clone_branch(&self, project_path: &str, branch: &str, dest: &Path) -> Result<()> {
        let token = self.token()?;
        let spec = CommandSpec::new("git")
            .args(["clone", "--depth", "1", "--branch", branch])
            .arg(self.clone_url(project_path, token))
            .arg(dest.display().to_string());

        let out = process::run(&spec, self.clone_timeout)
            .await
            .map_err(|e| anyhow::anyhow!(redact(&e.to_string(), token)))?;
        if !out.success() {
            bail!(
                "git clone of {} ({}) failed: {}",
                project_path,
                branch,
                redact(out.output.trim(), token)
            );
        }
        Ok(())
    }

    async fn branch_head(&self, project_path: &str, branch: &str) -> Result<Option<String>> {
        let token = self.token()?;
        let resp = self
            .client
            .get(self.branch_url(project_path, branch)?)
            .header("Authorization", format!("Bearer {}", token))
            .timeout(Duration::from_secs(15))
            .send()
            .await
            .context("Failed to send branch request to GitLab")?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let branch = resp
            .error_for_status()
            .context("GitLab branches API returned error status")?
            .json::<BranchResponse>()
            .await
            .context("Failed to parse branch response from GitLab")?;
        Ok(Some(branch.commit.id))
    }
}

fn redact(text: &str, token: &str) -> String {
    text.replace(token, "***")
}
