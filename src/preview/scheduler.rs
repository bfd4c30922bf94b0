//! Background lifecycle loops and their supervisor.
//!
//! Idle-stop pauses running container groups nobody has used for a while;
//! idle-erase deletes whole environments after a longer absence. Each tick
//! re-reads policy from the settings table, and a failing tick is logged
//! without ending its loop.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::coordinator::Coordinator;
use super::models::{ContainerHealth, Environment};
use super::policy;
use super::process;
use super::runtime;

// ── Idle decisions ────────────────────────────────────────────────────

/// Last sign of life for idle-stop: the later of last access and last
/// deploy. `None` for an environment that was never deployed or visited;
/// idle-stop leaves those alone.
pub fn stop_reference(env: &Environment) -> Option<DateTime<Utc>> {
    [env.last_accessed_at, env.last_deployed_at]
        .into_iter()
        .flatten()
        .max()
}

/// Last sign of life for idle-erase: the later of last access and creation.
pub fn erase_reference(env: &Environment) -> DateTime<Utc> {
    env.last_accessed_at
        .map_or(env.created_at, |accessed| accessed.max(env.created_at))
}

pub fn idle_stop_due(
    env: &Environment,
    health: ContainerHealth,
    threshold: TimeDelta,
    now: DateTime<Utc>,
) -> bool {
    !env.pinned
        && health == ContainerHealth::Running
        && stop_reference(env).is_some_and(|since| now - since > threshold)
}

pub fn idle_erase_due(env: &Environment, threshold: TimeDelta, now: DateTime<Utc>) -> bool {
    !env.pinned && now - erase_reference(env) > threshold
}

// ── Loops ─────────────────────────────────────────────────────────────

pub struct Lifecycle {
    coordinator: Arc<Coordinator>,
}

impl Lifecycle {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    fn environment_dir(&self, env: &Environment) -> PathBuf {
        env.path.as_deref().map(PathBuf::from).unwrap_or_else(|| {
            self.coordinator
                .pipeline()
                .settings()
                .environment_dir(&env.project, &env.name)
        })
    }

    /// Stop every idle running group. Returns how many were stopped.
    pub async fn idle_stop_tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let pipeline = self.coordinator.pipeline();
        let db = pipeline.db();
        let envs = db
            .call(|db| {
                let mut due = Vec::new();
                for listing in db.list_environments()? {
                    if listing.environment.pinned || listing.is_building() {
                        continue;
                    }
                    if let Some(threshold) =
                        policy::idle_stop_threshold(db, &listing.environment.project)?
                    {
                        due.push((listing.environment, threshold));
                    }
                }
                Ok(due)
            })
            .await?;

        let timeouts = &pipeline.settings().timeouts;
        let mut stopped = 0;
        for (env, threshold) in envs {
            let key = env.key();
            if self.coordinator.is_busy(&key) {
                continue;
            }
            let dir = self.environment_dir(&env);
            let health = runtime::health(pipeline.runtime().as_ref(), &dir, timeouts.health).await;
            if !idle_stop_due(&env, health, threshold, now) {
                continue;
            }
            let idle_minutes = stop_reference(&env).map_or(0, |since| (now - since).num_minutes());
            tracing::info!(environment = %key, idle_minutes, "Stopping idle environment");
            match process::run(&pipeline.runtime().compose_stop(&dir), timeouts.compose_stop).await {
                Ok(out) if out.success() => stopped += 1,
                Ok(out) => tracing::warn!(
                    environment = %key,
                    code = ?out.code,
                    output = %out.output.trim(),
                    "Idle stop failed"
                ),
                Err(e) => tracing::warn!(environment = %key, error = %e, "Idle stop failed"),
            }
        }
        if stopped > 0 {
            pipeline.refresh().request();
        }
        Ok(stopped)
    }

    /// Delete every environment idle past the erase threshold. Returns how
    /// many were deleted.
    pub async fn idle_erase_tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let db = self.coordinator.pipeline().db();
        let Some(threshold) = db.call(|db| policy::idle_erase_threshold(db)).await? else {
            return Ok(0);
        };
        let envs = db
            .call(|db| {
                Ok(db
                    .list_environments()?
                    .into_iter()
                    .filter(|l| !l.is_building())
                    .map(|l| l.environment)
                    .collect::<Vec<_>>())
            })
            .await?;

        let mut erased = 0;
        for env in envs.iter().filter(|e| idle_erase_due(e, threshold, now)) {
            let key = env.key();
            let idle_days = (now - erase_reference(env)).num_days();
            tracing::info!(environment = %key, idle_days, "Erasing idle environment");
            match self.coordinator.delete(&key).await {
                Ok(true) => erased += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(environment = %key, error = %e, "Idle erase failed"),
            }
        }
        Ok(erased)
    }

    pub async fn run_idle_stop(self: Arc<Self>, delay: Duration, every: Duration, cancel: CancellationToken) {
        run_periodic("idle-stop", delay, every, cancel, || {
            let this = Arc::clone(&self);
            async move { this.idle_stop_tick(Utc::now()).await }
        })
        .await;
    }

    pub async fn run_idle_erase(self: Arc<Self>, delay: Duration, every: Duration, cancel: CancellationToken) {
        run_periodic("idle-erase", delay, every, cancel, || {
            let this = Arc::clone(&self);
            async move { this.idle_erase_tick(Utc::now()).await }
        })
        .await;
    }
}

/// Run `tick` after `delay`, then every `every`, until cancelled. Errors
/// are logged and the loop carries on.
async fn run_periodic<F, Fut>(
    name: &'static str,
    delay: Duration,
    every: Duration,
    cancel: CancellationToken,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<usize>>,
{
    tracing::info!(task = name, every_secs = every.as_secs(), "Loop started");
    let mut wait = delay;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        match tick().await {
            Ok(0) => {}
            Ok(acted) => tracing::info!(task = name, acted, "Loop tick acted"),
            Err(e) => tracing::error!(task = name, error = %e, "Loop tick failed"),
        }
        wait = every;
    }
    tracing::info!(task = name, "Loop stopped");
}

// ── Supervisor ────────────────────────────────────────────────────────

/// Owns the long-running background tasks and stops them together.
pub struct Supervisor {
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn<F, Fut>(&mut self, name: &'static str, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task(self.cancel.child_token()));
        self.tasks.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancel every task and wait for each to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                tracing::warn!(task = name, error = %e, "Background task ended abnormally");
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
