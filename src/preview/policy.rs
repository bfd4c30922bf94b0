//! Operator policy read from the persisted settings table.
//!
//! Keys:
//! - `gitlab_enabled_project_ids`: JSON array of GitLab project ids
//! - `auto_stop_enabled` / `auto_stop_minutes`: global idle-stop gate
//! - `auto_stop_<project>_enabled` / `auto_stop_<project>_minutes`: overrides
//! - `auto_erase_enabled` / `auto_erase_days`: global idle-erase gate
//! - `project_env_<project>`: JSON object of env var overrides

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use chrono::TimeDelta;

use super::db::PreviewDb;

pub const ENABLED_PROJECTS_KEY: &str = "gitlab_enabled_project_ids";
pub const DEFAULT_AUTO_STOP_MINUTES: i64 = 60;
pub const DEFAULT_AUTO_ERASE_DAYS: i64 = 7;
/// One year.
pub const MAX_AUTO_STOP_MINUTES: i64 = 525_600;
/// Ten years.
pub const MAX_AUTO_ERASE_DAYS: i64 = 3_650;

fn is_true(value: Option<&str>) -> bool {
    matches!(value, Some("true") | Some("1"))
}

fn parse_bounded(value: Option<&str>, max: i64) -> Option<i64> {
    value
        .and_then(|v| v.trim().parse().ok())
        .filter(|n| (1..=max).contains(n))
}

/// Stored number, or `default` when it is missing or outside `1..=max`.
fn bounded_or(value: Option<String>, default: i64, max: i64) -> i64 {
    match value {
        None => default,
        Some(raw) => parse_bounded(Some(&raw), max).unwrap_or_else(|| {
            tracing::warn!(value = %raw, max, "Ignoring out-of-range policy value");
            default
        }),
    }
}

fn is_stop_minutes_key(key: &str) -> bool {
    key.starts_with("auto_stop_") && key.ends_with("_minutes")
}

/// Reject values the policy readers cannot use. Keys without a known shape
/// are accepted as-is.
pub fn validate_setting(key: &str, value: &str) -> Result<(), String> {
    if key == ENABLED_PROJECTS_KEY {
        return serde_json::from_str::<Vec<i64>>(value)
            .map(|_| ())
            .map_err(|_| format!("{} must be a JSON array of project ids, e.g. [12, 34]", key));
    }
    let max = if is_stop_minutes_key(key) {
        MAX_AUTO_STOP_MINUTES
    } else if key == "auto_erase_days" {
        MAX_AUTO_ERASE_DAYS
    } else {
        return Ok(());
    };
    match parse_bounded(Some(value), max) {
        Some(_) => Ok(()),
        None => Err(format!("{} must be a whole number between 1 and {}", key, max)),
    }
}

pub fn enabled_project_ids(db: &PreviewDb) -> Result<BTreeSet<i64>> {
    match db.get_setting(ENABLED_PROJECTS_KEY)? {
        Some(raw) if !raw.is_empty() => Ok(serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Ignoring malformed {}", ENABLED_PROJECTS_KEY);
            BTreeSet::new()
        })),
        _ => Ok(BTreeSet::new()),
    }
}

pub fn enable_project(db: &PreviewDb, project_id: i64) -> Result<()> {
    let mut ids = enabled_project_ids(db)?;
    ids.insert(project_id);
    let json = serde_json::to_string(&ids).context("Failed to serialize project ids")?;
    db.set_setting(ENABLED_PROJECTS_KEY, &json)
}

/// Idle threshold after which a project's running containers are stopped,
/// or `None` when idle-stop does not apply to the project.
///
/// The global flag gates everything. A per-project `enabled` key, when
/// present, replaces the global decision and may carry its own minutes.
pub fn idle_stop_threshold(db: &PreviewDb, project: &str) -> Result<Option<TimeDelta>> {
    if !is_true(db.get_setting("auto_stop_enabled")?.as_deref()) {
        return Ok(None);
    }
    let global = bounded_or(
        db.get_setting("auto_stop_minutes")?,
        DEFAULT_AUTO_STOP_MINUTES,
        MAX_AUTO_STOP_MINUTES,
    );

    let minutes = match db.get_setting(&format!("auto_stop_{}_enabled", project))? {
        Some(flag) if !is_true(Some(&flag)) => return Ok(None),
        Some(_) => bounded_or(
            db.get_setting(&format!("auto_stop_{}_minutes", project))?,
            global,
            MAX_AUTO_STOP_MINUTES,
        ),
        None => global,
    };
    Ok(TimeDelta::try_minutes(minutes))
}

/// Idle threshold after which whole environments are erased, or `None`
/// when idle-erase is disabled.
pub fn idle_erase_threshold(db: &PreviewDb) -> Result<Option<TimeDelta>> {
    if !is_true(db.get_setting("auto_erase_enabled")?.as_deref()) {
        return Ok(None);
    }
    let days = bounded_or(
        db.get_setting("auto_erase_days")?,
        DEFAULT_AUTO_ERASE_DAYS,
        MAX_AUTO_ERASE_DAYS,
    );
    Ok(TimeDelta::try_days(days))
}

/// Operator env var overrides applied to every environment of `project`.
pub fn project_env_overrides(db: &PreviewDb, project: &str) -> Result<BTreeMap<String, String>> {
    match db.get_setting(&format!("project_env_{}", project))? {
        Some(raw) => serde_json::from_str(&raw)
            .with_context(|| format!("Invalid project_env_{} JSON", project)),
        None => Ok(BTreeMap::new()),
    }
}
