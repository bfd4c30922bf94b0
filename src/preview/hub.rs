//! Environment-list fan-out with change detection.
//!
//! Observers subscribe to one broadcast channel of serialized frames. The
//! hub recomputes the full list (persisted state plus live container
//! health) on a fallback interval and whenever a refresh is requested, and
//! broadcasts only when the recomputed [`Snapshot`] differs from the last
//! one sent.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, broadcast};
use tokio_util::sync::CancellationToken;

use super::db::DbHandle;
use super::models::{ContainerHealth, DeploymentSummary, Environment, EnvironmentListing};
use super::runtime::{self, ContainerRuntime};
use super::ws::{WsMessage, encode};
use crate::config::Settings;

const CHANNEL_CAPACITY: usize = 256;

/// Coalescing "recompute soon" signal. Requests made while a recompute is
/// pending collapse into one.
#[derive(Clone, Default)]
pub struct RefreshTrigger {
    notify: Arc<Notify>,
}

impl RefreshTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.notify.notify_one();
    }

    pub async fn requested(&self) {
        self.notify.notified().await;
    }
}

/// One environment as observers see it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentView {
    #[serde(flatten)]
    pub environment: Environment,
    pub latest_deployment: Option<DeploymentSummary>,
    /// A deployment is running right now.
    pub building: bool,
    /// `None` in the fast pass, which does not query the runtime.
    pub container_status: Option<ContainerHealth>,
}

impl EnvironmentView {
    fn from_listing(listing: EnvironmentListing, health: Option<ContainerHealth>) -> Self {
        let building = listing.is_building();
        Self {
            environment: listing.environment,
            latest_deployment: listing.latest_deployment,
            building,
            container_status: health,
        }
    }
}

/// Comparable state of the whole environment list. Two snapshots are equal
/// exactly when observers would render the same thing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub environments: Vec<EnvironmentView>,
}

impl Snapshot {
    pub fn initial_message(&self, checked_at: DateTime<Utc>) -> WsMessage {
        WsMessage::Initial {
            total: self.environments.len(),
            environments: self.environments.clone(),
            checked_at,
        }
    }

    pub fn update_message(&self, checked_at: DateTime<Utc>) -> WsMessage {
        WsMessage::Update {
            total: self.environments.len(),
            environments: self.environments.clone(),
            checked_at,
        }
    }
}

pub struct StatusHub {
    settings: Arc<Settings>,
    db: DbHandle,
    runtime: Arc<dyn ContainerRuntime>,
    refresh: RefreshTrigger,
    tx: broadcast::Sender<String>,
    last: Mutex<Option<Snapshot>>,
}

impl StatusHub {
    pub fn new(
        settings: Arc<Settings>,
        db: DbHandle,
        runtime: Arc<dyn ContainerRuntime>,
        refresh: RefreshTrigger,
    ) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            settings,
            db,
            runtime,
            refresh,
            tx,
            last: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn refresh_trigger(&self) -> RefreshTrigger {
        self.refresh.clone()
    }

    /// Persisted state only.
    pub async fn fast_snapshot(&self) -> Result<Snapshot> {
        let listings = self.db.call(|db| db.list_environments()).await?;
        Ok(Snapshot {
            environments: listings
                .into_iter()
                .map(|l| EnvironmentView::from_listing(l, None))
                .collect(),
        })
    }

    /// Persisted state plus container health, queried for every environment
    /// concurrently.
    pub async fn full_snapshot(&self) -> Result<Snapshot> {
        let listings = self.db.call(|db| db.list_environments()).await?;
        let limit = self.settings.timeouts.health;
        let queries = listings.iter().map(|l| {
            let dir = self.environment_dir(&l.environment);
            let runtime = Arc::clone(&self.runtime);
            async move { runtime::health(runtime.as_ref(), &dir, limit).await }
        });
        let health = join_all(queries).await;
        Ok(Snapshot {
            environments: listings
                .into_iter()
                .zip(health)
                .map(|(l, h)| EnvironmentView::from_listing(l, Some(h)))
                .collect(),
        })
    }

    fn environment_dir(&self, env: &Environment) -> PathBuf {
        env.path
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.settings.environment_dir(&env.project, &env.name))
    }

    /// Broadcast `snapshot` as an update unless it equals the last one sent.
    pub async fn publish_if_changed(&self, snapshot: Snapshot) -> bool {
        let mut last = self.last.lock().await;
        if last.as_ref() == Some(&snapshot) {
            return false;
        }
        let frame = encode(&snapshot.update_message(Utc::now()));
        let receivers = self.tx.send(frame).unwrap_or(0);
        tracing::debug!(
            environments = snapshot.environments.len(),
            receivers,
            "Broadcast status update"
        );
        *last = Some(snapshot);
        true
    }

    /// Recompute and broadcast if anything changed.
    pub async fn check(&self) -> Result<bool> {
        let snapshot = self.full_snapshot().await?;
        Ok(self.publish_if_changed(snapshot).await)
    }

    /// Recompute on every refresh request, or after `interval` without one.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        tracing::info!(interval_secs = interval.as_secs(), "Status check loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.refresh.requested() => {}
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = self.check().await {
                tracing::error!(error = %e, "Status check failed");
            }
        }
        tracing::info!("Status check loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preview::db::PreviewDb;
    use crate::preview::models::{EnvironmentStatus, EnvironmentUpdate};
    use crate::preview::process::CommandSpec;
    use std::path::Path;

    struct IdleRuntime;

    impl ContainerRuntime for IdleRuntime {
        fn compose_up(&self, _: &Path) -> CommandSpec {
            CommandSpec::shell("true")
        }
        fn compose_start(&self, _: &Path) -> CommandSpec {
            CommandSpec::shell("true")
        }
        fn compose_stop(&self, _: &Path) -> CommandSpec {
            CommandSpec::shell("true")
        }
        fn compose_restart(&self, _: &Path) -> CommandSpec {
            CommandSpec::shell("true")
        }
        fn compose_down(&self, _: &Path) -> CommandSpec {
            CommandSpec::shell("true")
        }
        fn compose_ps(&self, _: &Path) -> CommandSpec {
            CommandSpec::shell(r#"echo '[{"State":"running"}]'"#)
        }
        fn exec(&self, _: &str, _: &[String]) -> CommandSpec {
            CommandSpec::shell("true")
        }
        fn db_ping(&self, _: &str) -> CommandSpec {
            CommandSpec::shell("true")
        }
        fn import_dump(&self, _: &Path, _: &str) -> CommandSpec {
            CommandSpec::shell("true")
        }
        fn events(&self) -> CommandSpec {
            CommandSpec::shell("sleep 3600")
        }
        fn remove_tree(&self, _: &Path) -> CommandSpec {
            CommandSpec::shell("true")
        }
        fn chown_tree(&self, _: &Path, _: u32, _: u32) -> CommandSpec {
            CommandSpec::shell("true")
        }
    }

    fn hub(base: &Path) -> (StatusHub, DbHandle) {
        let settings = Settings {
            previews_base: base.to_path_buf(),
            ..Settings::default()
        };
        let db = DbHandle::new(PreviewDb::new_in_memory().unwrap());
        let hub = StatusHub::new(
            Arc::new(settings),
            db.clone(),
            Arc::new(IdleRuntime),
            RefreshTrigger::new(),
        );
        (hub, db)
    }

    #[tokio::test]
    async fn test_unchanged_snapshot_is_not_rebroadcast() {
        let dir = tempfile::tempdir().unwrap();
        let (hub, db) = hub(dir.path());
        db.call(|db| {
            db.upsert_environment("shop", "mr-1", &EnvironmentUpdate::status(EnvironmentStatus::Active))
        })
        .await
        .unwrap();
        let mut rx = hub.subscribe();

        assert!(hub.check().await.unwrap());
        assert!(!hub.check().await.unwrap());

        let frame = rx.recv().await.unwrap();
        assert!(frame.contains("\"type\":\"update\""));
        assert!(frame.contains("\"container_status\":\"missing\""));
        assert!(rx.try_recv().is_err());

        db.call(|db| {
            db.upsert_environment("shop", "mr-1", &EnvironmentUpdate::status(EnvironmentStatus::Failed))
        })
        .await
        .unwrap();
        assert!(hub.check().await.unwrap());
    }

    #[tokio::test]
    async fn test_full_snapshot_queries_live_health() {
        let dir = tempfile::tempdir().unwrap();
        let (hub, db) = hub(dir.path());
        let env_dir = dir.path().join("shop/mr-2");
        std::fs::create_dir_all(&env_dir).unwrap();
        std::fs::write(env_dir.join("docker-compose.yml"), "services: {}\n").unwrap();
        let path = env_dir.display().to_string();
        db.call(move |db| {
            db.upsert_environment(
                "shop",
                "mr-2",
                &EnvironmentUpdate {
                    path: Some(path),
                    ..EnvironmentUpdate::status(EnvironmentStatus::Active)
                },
            )
        })
        .await
        .unwrap();

        let fast = hub.fast_snapshot().await.unwrap();
        assert_eq!(fast.environments[0].container_status, None);
        let full = hub.full_snapshot().await.unwrap();
        assert_eq!(
            full.environments[0].container_status,
            Some(ContainerHealth::Running)
        );
    }

    #[tokio::test]
    async fn test_refresh_requests_coalesce() {
        let trigger = RefreshTrigger::new();
        trigger.request();
        trigger.request();
        trigger.requested().await;
        let second = tokio::time::timeout(Duration::from_millis(20), trigger.requested()).await;
        assert!(second.is_err());
    }
}
