//! Shared base files via per-environment overlay mounts.
//!
//! Each project has one read-only base tree under
//! `<previews>/.base-files/<project>/files`. Every environment mounts an
//! overlay whose lower layer is that tree and whose upper/work layers live
//! in `<env>/.overlay/`, so writes stay private to the environment. The
//! merged view lands where the application expects its public files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::compose::PUBLIC_FILES_PATH;
use super::db::DbHandle;
use super::manifest::Manifest;
use super::models::EnvironmentStatus;
use super::process::{self, CommandSpec};
use crate::errors::OverlayError;

pub const BASE_FILES_DIR: &str = ".base-files";
pub const OVERLAY_DIR: &str = ".overlay";

const MOUNT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayLayout {
    pub lower: PathBuf,
    pub upper: PathBuf,
    pub work: PathBuf,
    pub merged: PathBuf,
}

impl OverlayLayout {
    pub fn mount_options(&self) -> String {
        format!(
            "lowerdir={},upperdir={},workdir={}",
            self.lower.display(),
            self.upper.display(),
            self.work.display()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOutcome {
    Mounted,
    AlreadyMounted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetProvision {
    Mounted,
    AlreadyMounted,
    /// No base tree uploaded yet; an empty directory stands in.
    EmptyDirectory,
}

/// Low-level mount operations.
#[async_trait]
pub trait Mounter: Send + Sync {
    async fn is_mounted(&self, target: &Path) -> bool;
    async fn mount(&self, layout: &OverlayLayout) -> Result<(), String>;
    async fn unmount(&self, target: &Path) -> Result<(), String>;
}

/// `mountpoint` / `sudo mount -t overlay` / `sudo umount`.
pub struct SystemMounter;

#[async_trait]
impl Mounter for SystemMounter {
    async fn is_mounted(&self, target: &Path) -> bool {
        let spec = CommandSpec::new("mountpoint")
            .arg("-q")
            .arg(target.display().to_string());
        matches!(process::run(&spec, MOUNT_TIMEOUT).await, Ok(out) if out.success())
    }

    async fn mount(&self, layout: &OverlayLayout) -> Result<(), String> {
        let spec = CommandSpec::new("sudo")
            .args(["mount", "-t", "overlay", "overlay", "-o"])
            .arg(layout.mount_options())
            .arg(layout.merged.display().to_string());
        match process::run(&spec, MOUNT_TIMEOUT).await {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(out.output.trim().to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn unmount(&self, target: &Path) -> Result<(), String> {
        let spec = CommandSpec::new("sudo")
            .arg("umount")
            .arg(target.display().to_string());
        match process::run(&spec, MOUNT_TIMEOUT).await {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(out.output.trim().to_string()),
            Err(e) => Err(e.to_string()),
        }
    }
}

pub struct OverlayManager {
    previews_base: PathBuf,
    mounter: Arc<dyn Mounter>,
}

impl OverlayManager {
    pub fn new(previews_base: impl Into<PathBuf>, mounter: Arc<dyn Mounter>) -> Self {
        Self {
            previews_base: previews_base.into(),
            mounter,
        }
    }

    pub fn base_dir(&self, project: &str) -> PathBuf {
        self.previews_base
            .join(BASE_FILES_DIR)
            .join(project)
            .join("files")
    }

    pub fn layout(&self, project: &str, env_dir: &Path, docroot: &str) -> OverlayLayout {
        let overlay = env_dir.join(OVERLAY_DIR);
        OverlayLayout {
            lower: self.base_dir(project),
            upper: overlay.join("upper"),
            work: overlay.join("work"),
            merged: env_dir.join(docroot).join(PUBLIC_FILES_PATH),
        }
    }

    /// Mount the project's base tree into the environment. Idempotent: an
    /// existing mount is left alone.
    pub async fn mount(
        &self,
        project: &str,
        env_dir: &Path,
        docroot: &str,
    ) -> Result<MountOutcome, OverlayError> {
        let layout = self.layout(project, env_dir, docroot);
        if !layout.lower.is_dir() {
            return Err(OverlayError::MissingBase {
                project: project.to_string(),
                path: layout.lower,
            });
        }

        std::fs::create_dir_all(&layout.upper)?;
        std::fs::create_dir_all(&layout.work)?;
        std::fs::create_dir_all(&layout.merged)?;

        if self.mounter.is_mounted(&layout.merged).await {
            return Ok(MountOutcome::AlreadyMounted);
        }

        self.mounter
            .mount(&layout)
            .await
            .map_err(|message| OverlayError::Mount {
                path: layout.merged.clone(),
                message,
            })?;
        tracing::info!(
            project,
            merged = %layout.merged.display(),
            lower = %layout.lower.display(),
            "Mounted overlay"
        );
        Ok(MountOutcome::Mounted)
    }

    /// Unmount the environment's overlay if mounted. Failures (typically a
    /// busy mount) are logged, never raised.
    pub async fn unmount(&self, env_dir: &Path, docroot: &str) {
        let merged = env_dir.join(docroot).join(PUBLIC_FILES_PATH);
        if !self.mounter.is_mounted(&merged).await {
            return;
        }
        match self.mounter.unmount(&merged).await {
            Ok(()) => tracing::info!(merged = %merged.display(), "Unmounted overlay"),
            Err(e) => {
                tracing::warn!(merged = %merged.display(), error = %e, "Failed to unmount overlay")
            }
        }
    }

    /// Provision the environment's public files: mount the base tree when
    /// one exists, otherwise create an empty directory so deploys proceed.
    pub async fn ensure_assets(
        &self,
        project: &str,
        env_dir: &Path,
        docroot: &str,
    ) -> Result<AssetProvision, OverlayError> {
        if !self.base_dir(project).is_dir() {
            let merged = env_dir.join(docroot).join(PUBLIC_FILES_PATH);
            std::fs::create_dir_all(&merged)?;
            tracing::info!(project, "No base files uploaded; created empty files directory");
            return Ok(AssetProvision::EmptyDirectory);
        }
        match self.mount(project, env_dir, docroot).await? {
            MountOutcome::Mounted => Ok(AssetProvision::Mounted),
            MountOutcome::AlreadyMounted => Ok(AssetProvision::AlreadyMounted),
        }
    }

    /// Unmount every settled environment of `project`, ahead of replacing
    /// its base tree.
    pub async fn unmount_all(&self, db: &DbHandle, project: &str) -> anyhow::Result<usize> {
        let mut count = 0;
        for target in settled_targets(db, Some(project)).await? {
            self.unmount(&target.path, &target.docroot).await;
            count += 1;
        }
        Ok(count)
    }

    /// Remount every settled environment of `project` that has an overlay.
    pub async fn remount_all(&self, db: &DbHandle, project: &str) -> anyhow::Result<usize> {
        if !self.base_dir(project).is_dir() {
            return Ok(0);
        }
        self.remount(db, Some(project)).await
    }

    /// Rebuild mounts lost across a host or process restart.
    pub async fn remount_all_on_startup(&self, db: &DbHandle) -> anyhow::Result<usize> {
        if !self.previews_base.join(BASE_FILES_DIR).is_dir() {
            return Ok(0);
        }
        let mounted = self.remount(db, None).await?;
        tracing::info!(mounted, "Remounted overlays on startup");
        Ok(mounted)
    }

    async fn remount(&self, db: &DbHandle, project: Option<&str>) -> anyhow::Result<usize> {
        let mut mounted = 0;
        for target in settled_targets(db, project).await? {
            if !target.path.join(OVERLAY_DIR).is_dir() || !self.base_dir(&target.project).is_dir() {
                continue;
            }
            match self.mount(&target.project, &target.path, &target.docroot).await {
                Ok(MountOutcome::Mounted) => mounted += 1,
                Ok(MountOutcome::AlreadyMounted) => {}
                Err(e) => tracing::warn!(
                    project = %target.project,
                    path = %target.path.display(),
                    error = %e,
                    "Failed to remount overlay"
                ),
            }
        }
        Ok(mounted)
    }
}

struct MountTarget {
    project: String,
    path: PathBuf,
    docroot: String,
}

/// Working directories of `active`/`failed` environments, with their
/// resolved document roots.
async fn settled_targets(db: &DbHandle, project: Option<&str>) -> anyhow::Result<Vec<MountTarget>> {
    let project = project.map(str::to_string);
    let envs = db
        .call(move |db| {
            db.list_environments_with_status(
                project.as_deref(),
                &[EnvironmentStatus::Active, EnvironmentStatus::Failed],
            )
        })
        .await?;
    Ok(envs
        .into_iter()
        .filter_map(|e| {
            let path = PathBuf::from(e.path?);
            let docroot = Manifest::load(&path).resolve_docroot(&path);
            Some(MountTarget {
                project: e.project,
                path,
                docroot,
            })
        })
        .collect())
}
