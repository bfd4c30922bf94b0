//! Serializes work per environment and owns the checkout step.
//!
//! Each environment key has one async mutex. A webhook-triggered deploy
//! that finds it held is dropped as a duplicate; deletes wait their turn.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::sync::Mutex;

use super::compose::{COMPOSE_FILE, PUBLIC_FILES_PATH, current_gid, current_uid};
use super::manifest::Manifest;
use super::models::{
    DeploymentStatus, Environment, EnvironmentKey, EnvironmentStatus, EnvironmentUpdate,
};
use super::overlay::OVERLAY_DIR;
use super::pipeline::{DeployRequest, Pipeline, RunOutcome};
use super::process;
use super::source::SourceControl;
use super::sync;

pub const CLONE_FAILED_ERROR: &str = "Clone failed (git clone or rsync error, check logs)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started,
    /// Another deploy or delete holds the environment.
    Duplicate,
}

pub struct Coordinator {
    pipeline: Arc<Pipeline>,
    source: Arc<dyn SourceControl>,
    locks: DashMap<EnvironmentKey, Arc<Mutex<()>>>,
}

impl Coordinator {
    pub fn new(pipeline: Arc<Pipeline>, source: Arc<dyn SourceControl>) -> Self {
        Self {
            pipeline,
            source,
            locks: DashMap::new(),
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn source(&self) -> &Arc<dyn SourceControl> {
        &self.source
    }

    fn lock_for(&self, key: &EnvironmentKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn is_busy(&self, key: &EnvironmentKey) -> bool {
        self.locks
            .get(key)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    /// Start a deploy in the background unless one is already in flight for
    /// the same environment.
    pub fn trigger(self: &Arc<Self>, req: DeployRequest) -> TriggerOutcome {
        let Ok(guard) = self.lock_for(&req.key).try_lock_owned() else {
            tracing::info!(
                environment = %req.key,
                branch = %req.branch,
                "Skipping duplicate webhook, deploy already in progress"
            );
            return TriggerOutcome::Duplicate;
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            match this.deploy_locked(&req).await {
                Ok(outcome) => tracing::debug!(environment = %req.key, ?outcome, "Deploy task done"),
                Err(e) => tracing::error!(environment = %req.key, error = %e, "Deploy task failed"),
            }
        });
        TriggerOutcome::Started
    }

    /// Deploy in the foreground, waiting for the environment's lock.
    pub async fn deploy(&self, req: &DeployRequest) -> Result<RunOutcome> {
        let lock = self.lock_for(&req.key);
        let _guard = lock.lock().await;
        self.deploy_locked(req).await
    }

    async fn deploy_locked(&self, req: &DeployRequest) -> Result<RunOutcome> {
        let existing = {
            let key = req.key.clone();
            self.pipeline
                .db()
                .call(move |db| db.get_environment(&key.project, &key.name))
                .await?
        };
        if existing
            .as_ref()
            .is_some_and(|e| e.status == EnvironmentStatus::Creating)
        {
            tracing::warn!(environment = %req.key, "Skipping deploy: already creating");
            return Ok(RunOutcome::Skipped {
                reason: "already creating".to_string(),
            });
        }

        if let Err(e) = self.checkout(req, existing.as_ref()).await {
            tracing::error!(environment = %req.key, branch = %req.branch, error = %format!("{:#}", e), "Checkout failed");
            self.record_checkout_failure(req, existing.is_none()).await?;
            return Ok(RunOutcome::CheckoutFailed {
                error: CLONE_FAILED_ERROR.to_string(),
            });
        }

        self.pipeline.run(req).await
    }

    /// Clone into a scratch directory next to the environment, then mirror
    /// it over the working directory, keeping generated and mounted state.
    async fn checkout(&self, req: &DeployRequest, existing: Option<&Environment>) -> Result<()> {
        let settings = self.pipeline.settings();
        let dest = settings.environment_dir(&req.key.project, &req.key.name);
        let parent = settings.project_dir(&req.key.project);
        tokio::fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;

        let scratch = tempfile::Builder::new()
            .prefix(&format!(".{}-tmp-", req.key.name))
            .tempdir_in(&parent)
            .context("Failed to create clone directory")?;
        tracing::info!(
            environment = %req.key,
            branch = %req.branch,
            scratch = %scratch.path().display(),
            "Cloning"
        );
        self.source
            .clone_branch(&req.project_path, &req.branch, scratch.path())
            .await?;

        let git_dir = scratch.path().join(".git");
        if git_dir.exists() {
            tokio::fs::remove_dir_all(&git_dir)
                .await
                .context("Failed to remove .git from clone")?;
        }

        let update = dest.is_dir() && existing.is_some_and(|e| e.status.is_settled());
        if update {
            self.reclaim(&dest).await;
        }

        let preserve = preserved_paths(&dest, update);
        let src = scratch.path().to_path_buf();
        let target = dest.clone();
        let stats = tokio::task::spawn_blocking(move || sync::mirror(&src, &target, &preserve))
            .await
            .context("Mirror task panicked")??;
        set_mode(&dest, 0o755)?;
        tracing::info!(
            environment = %req.key,
            copied = stats.copied,
            removed = stats.removed,
            "Checkout synced"
        );
        Ok(())
    }

    /// Files written by containers may belong to other users; hand the tree
    /// back to us before mirroring over it.
    async fn reclaim(&self, dest: &Path) {
        let spec = self
            .pipeline
            .runtime()
            .chown_tree(dest, current_uid(), current_gid());
        let limit = self.pipeline.settings().timeouts.chown;
        match process::run(&spec, limit).await {
            Ok(out) if out.success() => {}
            Ok(out) => {
                tracing::warn!(path = %dest.display(), code = ?out.code, "Ownership reset failed")
            }
            Err(e) => tracing::warn!(path = %dest.display(), error = %e, "Ownership reset failed"),
        }
    }

    async fn record_checkout_failure(&self, req: &DeployRequest, is_new: bool) -> Result<()> {
        let settings = self.pipeline.settings();
        let update = EnvironmentUpdate {
            branch: Some(req.branch.clone()),
            commit_sha: Some(req.commit_sha.clone()),
            status: Some(EnvironmentStatus::Failed),
            url: Some(self.pipeline.url(&req.key)),
            path: Some(
                settings
                    .environment_dir(&req.key.project, &req.key.name)
                    .display()
                    .to_string(),
            ),
            mr_iid: req.mr_iid,
            last_deployment_status: Some(DeploymentStatus::Failed),
            last_deployment_error: Some(Some(CLONE_FAILED_ERROR.to_string())),
            auto_update: if is_new { req.auto_update } else { None },
            ..EnvironmentUpdate::default()
        };
        let key = req.key.clone();
        self.pipeline
            .db()
            .call(move |db| db.upsert_environment(&key.project, &key.name, &update))
            .await?;
        self.pipeline.refresh().request();
        Ok(())
    }

    /// Tear down and forget an environment. Returns `false` when there was
    /// nothing to delete.
    pub async fn delete(&self, key: &EnvironmentKey) -> Result<bool> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let settings = self.pipeline.settings();
        let dir = settings.environment_dir(&key.project, &key.name);
        let record = {
            let key = key.clone();
            self.pipeline
                .db()
                .call(move |db| db.get_environment(&key.project, &key.name))
                .await?
        };
        if !dir.exists() && record.is_none() {
            return Ok(false);
        }
        tracing::info!(environment = %key, "Deleting environment");

        if dir.is_dir() {
            let docroot = Manifest::load(&dir).resolve_docroot(&dir);
            self.pipeline.overlay().unmount(&dir, &docroot).await;

            if dir.join(COMPOSE_FILE).is_file() {
                let spec = self.pipeline.runtime().compose_down(&dir);
                match process::run(&spec, settings.timeouts.compose_down).await {
                    Ok(out) if out.success() => {}
                    Ok(out) => tracing::warn!(
                        environment = %key,
                        code = ?out.code,
                        output = %out.output.trim(),
                        "compose down failed"
                    ),
                    Err(e) => tracing::warn!(environment = %key, error = %e, "compose down failed"),
                }
            }
        }

        {
            let key = key.clone();
            self.pipeline
                .db()
                .call(move |db| db.delete_environment(&key.project, &key.name))
                .await?;
        }

        if dir.exists() {
            self.remove_dir(key, &dir).await?;
        }
        self.pipeline.refresh().request();
        tracing::info!(environment = %key, "Environment deleted");
        Ok(true)
    }

    /// Container-created files may be root-owned, so removal goes through a
    /// root helper container first and falls back to a plain recursive
    /// delete for whatever remains.
    async fn remove_dir(&self, key: &EnvironmentKey, dir: &Path) -> Result<()> {
        let spec = self.pipeline.runtime().remove_tree(dir);
        let limit = self.pipeline.settings().timeouts.remove_tree;
        match process::run(&spec, limit).await {
            Ok(out) if out.success() => {}
            Ok(out) => tracing::warn!(environment = %key, code = ?out.code, "Helper removal failed"),
            Err(e) => tracing::warn!(environment = %key, error = %e, "Helper removal failed"),
        }
        if dir.exists() {
            tokio::fs::remove_dir_all(dir)
                .await
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Paths under the working directory that a fresh checkout must not touch.
/// The topology file survives only updates of a settled environment.
fn preserved_paths(dest: &Path, update: bool) -> Vec<PathBuf> {
    let docroot = Manifest::load(dest).resolve_docroot(dest);
    let mut paths = vec![
        PathBuf::from(OVERLAY_DIR),
        Path::new(&docroot).join(PUBLIC_FILES_PATH),
    ];
    if update {
        paths.push(PathBuf::from(COMPOSE_FILE));
    }
    paths
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to chmod {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
