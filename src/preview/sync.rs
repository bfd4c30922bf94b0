//! Mirror a fresh checkout into an environment's working directory.
//!
//! Behaves like `rsync -a --delete src/ dest/` with exclusions: anything in
//! `dest` missing from `src` is removed, except preserved paths and the
//! directories leading to them. Preserved paths are never descended into on
//! either side, which keeps a mounted asset tree out of reach.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MirrorStats {
    pub copied: usize,
    pub removed: usize,
}

pub fn mirror(src: &Path, dest: &Path, preserve: &[PathBuf]) -> Result<MirrorStats> {
    let mut stats = MirrorStats::default();
    fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;

    stats.removed = prune(src, dest, preserve)?;

    for entry in WalkDir::new(src)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !is_preserved(rel(src, e.path()), preserve))
    {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let rel = rel(src, entry.path());
        let target = dest.join(rel);
        let kind = entry.file_type();

        if kind.is_dir() {
            if target.symlink_metadata().is_ok_and(|m| !m.is_dir()) {
                fs::remove_file(&target)?;
            }
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
            continue;
        }

        if let Ok(meta) = target.symlink_metadata() {
            if meta.is_dir() {
                fs::remove_dir_all(&target)?;
            } else if kind.is_symlink() || meta.file_type().is_symlink() {
                fs::remove_file(&target)?;
            }
        }

        if kind.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", rel.display()))?;
        }
        stats.copied += 1;
    }

    normalize_dir_permissions(dest, preserve)?;
    Ok(stats)
}

/// Remove everything in `dest` that `src` lacks. Returns the number of
/// top-most entries removed.
fn prune(src: &Path, dest: &Path, preserve: &[PathBuf]) -> Result<usize> {
    let mut stale: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(dest)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !is_preserved(rel(dest, e.path()), preserve))
    {
        let entry = entry.with_context(|| format!("Failed to walk {}", dest.display()))?;
        let rel = rel(dest, entry.path()).to_path_buf();
        if stale.iter().any(|s| rel.starts_with(s)) {
            continue;
        }
        if src.join(&rel).symlink_metadata().is_ok() || leads_to_preserved(&rel, preserve) {
            continue;
        }
        stale.push(rel);
    }

    for rel in &stale {
        let path = dest.join(rel);
        let removed = match path.symlink_metadata() {
            Ok(m) if m.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        removed.with_context(|| format!("Failed to remove {}", path.display()))?;
    }
    Ok(stale.len())
}

fn rel<'a>(root: &Path, path: &'a Path) -> &'a Path {
    path.strip_prefix(root).unwrap_or(path)
}

fn is_preserved(rel: &Path, preserve: &[PathBuf]) -> bool {
    preserve.iter().any(|p| rel.starts_with(p))
}

fn leads_to_preserved(rel: &Path, preserve: &[PathBuf]) -> bool {
    preserve.iter().any(|p| p.starts_with(rel))
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    let link = fs::read_link(from)?;
    std::os::unix::fs::symlink(&link, to)
        .with_context(|| format!("Failed to link {}", to.display()))
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    fs::copy(from, to)?;
    Ok(())
}

/// Directories must be world-readable for the web server in the container.
fn normalize_dir_permissions(dest: &Path, preserve: &[PathBuf]) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        for entry in WalkDir::new(dest)
            .into_iter()
            .filter_entry(|e| !is_preserved(rel(dest, e.path()), preserve))
        {
            let entry = entry?;
            if entry.file_type().is_dir() {
                fs::set_permissions(entry.path(), fs::Permissions::from_mode(0o755))?;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = (dest, preserve);
    Ok(())
}
