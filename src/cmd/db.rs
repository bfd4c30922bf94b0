//! Database and mount maintenance for `preview-manager init-db`, `remount`.

use std::sync::Arc;

use anyhow::Result;

use preview_manager::config::Settings;
use preview_manager::preview::overlay::{OverlayManager, SystemMounter};
use preview_manager::preview::server;

pub fn cmd_init_db(settings: &Settings) -> Result<()> {
    server::open_database(settings)?;
    println!("Preview database initialized at {}", settings.db_path.display());
    Ok(())
}

/// Rebuild every overlay mount once, e.g. after a host reboot, then exit.
pub async fn cmd_remount(settings: &Settings) -> Result<()> {
    let db = server::open_database(settings)?;
    let overlay = OverlayManager::new(settings.previews_base.clone(), Arc::new(SystemMounter));
    let mounted = overlay.remount_all_on_startup(&db).await?;
    println!("Remounted {} overlay(s)", mounted);
    Ok(())
}
