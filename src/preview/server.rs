use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use super::api::{self, AppState};
use super::db::{DbHandle, PreviewDb};
use super::events::EventListener;
use super::overlay::SystemMounter;
use super::retry::RetryPolicy;
use super::runtime::DockerCli;
use super::scheduler::{Lifecycle, Supervisor};
use super::source::GitLabSource;
use crate::config::Settings;

/// Build the full application router: REST, webhook, WebSocket channels,
/// and the wake-on-request fallback for preview hosts.
pub fn build_router(state: Arc<AppState>) -> Router {
    let dev_mode = state.settings.dev_mode;
    let app = api::api_router()
        .fallback(api::wake_handler)
        .with_state(state);
    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Open the database, creating its directory, and fail any work a previous
/// process left mid-flight.
pub fn open_database(settings: &Settings) -> Result<DbHandle> {
    if let Some(parent) = settings.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = PreviewDb::new(&settings.db_path).context("Failed to initialize preview database")?;
    let (deployments, environments) = db.recover_interrupted()?;
    if deployments > 0 || environments > 0 {
        tracing::warn!(deployments, environments, "Recovered work interrupted by restart");
    }
    Ok(DbHandle::new(db))
}

/// Production wiring: Docker CLI, GitLab, and real overlay mounts.
pub fn production_state(settings: Settings, db: DbHandle) -> AppState {
    let source = GitLabSource::new(
        settings.gitlab_url.clone(),
        settings.gitlab_token.clone(),
        settings.timeouts.clone,
    );
    AppState::new(
        Arc::new(settings),
        db,
        Arc::new(DockerCli::new()),
        Arc::new(source),
        Arc::new(SystemMounter),
        RetryPolicy::database_ready(),
    )
}

/// Start the background loops: status checks, idle-stop, idle-erase, and
/// the container event listener.
pub fn spawn_background(state: &Arc<AppState>) -> Supervisor {
    let intervals = state.settings.intervals;
    let mut supervisor = Supervisor::new();

    let hub = Arc::clone(&state.hub);
    supervisor.spawn("status-check", move |cancel| hub.run(intervals.status_check, cancel));

    let lifecycle = Arc::new(Lifecycle::new(Arc::clone(&state.coordinator)));
    let idle_stop = Arc::clone(&lifecycle);
    supervisor.spawn("idle-stop", move |cancel| {
        idle_stop.run_idle_stop(intervals.idle_stop_delay, intervals.idle_stop, cancel)
    });
    supervisor.spawn("idle-erase", move |cancel| {
        lifecycle.run_idle_erase(intervals.idle_erase_delay, intervals.idle_erase, cancel)
    });

    let listener = EventListener::new(
        Arc::clone(state.runtime()),
        state.db.clone(),
        state.hub.refresh_trigger(),
        intervals.debounce,
        intervals.reconnect,
        intervals.prefix_refresh,
    );
    supervisor.spawn("container-events", move |cancel| listener.run(cancel));

    tracing::info!(tasks = supervisor.len(), "Background tasks started");
    supervisor
}

/// Run the service until interrupted.
pub async fn start_server(settings: Settings) -> Result<()> {
    let db = open_database(&settings)?;
    let state = Arc::new(production_state(settings, db));

    if let Err(e) = state
        .coordinator
        .pipeline()
        .overlay()
        .remount_all_on_startup(&state.db)
        .await
    {
        tracing::error!(error = %e, "Failed to remount overlays on startup");
    }

    let supervisor = spawn_background(&state);

    let addr = format!("{}:{}", state.settings.host, state.settings.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, domain = %state.settings.preview_domain, "Preview manager listening");

    let app = build_router(Arc::clone(&state));
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    supervisor.shutdown().await;
    tracing::info!("Server shut down gracefully");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preview::fakes::{NoopMounter, StubRuntime, StubSource};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state(dir: &std::path::Path, dev_mode: bool) -> Arc<AppState> {
        let settings = Settings {
            previews_base: dir.to_path_buf(),
            dev_mode,
            ..Settings::default()
        };
        Arc::new(AppState::new(
            Arc::new(settings),
            DbHandle::new(PreviewDb::new_in_memory().unwrap()),
            Arc::new(StubRuntime::running()),
            Arc::new(StubSource::default()),
            Arc::new(NoopMounter),
            RetryPolicy::fixed(1, Duration::from_millis(10)),
        ))
    }

    #[tokio::test]
    async fn test_router_serves_health() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path(), false));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_dev_mode_allows_cors() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path(), true));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("origin", "http://localhost:5173")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.headers().contains_key("access-control-allow-origin"));
    }

    #[test]
    fn test_open_database_recovers_interrupted_work() {
        use crate::preview::models::{EnvironmentStatus, EnvironmentUpdate};

        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            db_path: dir.path().join("nested").join("previews.db"),
            ..Settings::default()
        };
        let handle = open_database(&settings).unwrap();
        {
            let db = handle.lock_sync().unwrap();
            let env = db
                .upsert_environment("shop", "mr-1", &EnvironmentUpdate::status(EnvironmentStatus::Creating))
                .unwrap();
            db.try_create_deployment(env.id, "webhook").unwrap();
        }
        drop(handle);

        let handle = open_database(&settings).unwrap();
        let db = handle.lock_sync().unwrap();
        let env = db.get_environment("shop", "mr-1").unwrap().unwrap();
        assert_eq!(env.status, EnvironmentStatus::Failed);
        assert!(!db.has_running_deployment(env.id).unwrap());
    }

    #[tokio::test]
    async fn test_background_tasks_stop_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), false);
        let supervisor = spawn_background(&state);
        assert_eq!(supervisor.len(), 4);
        tokio::time::timeout(Duration::from_secs(5), supervisor.shutdown())
            .await
            .unwrap();
    }
}
