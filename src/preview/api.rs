use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::actions::{ActionHub, ActionKind, ActionTicket};
use super::coordinator::{Coordinator, TriggerOutcome};
use super::db::DbHandle;
use super::deploy_logs::DeploymentLogs;
use super::hub::{EnvironmentView, RefreshTrigger, StatusHub};
use super::models::{
    ContainerHealth, DeploymentRecord, Environment, EnvironmentKey, EnvironmentUpdate,
    branch_environment_name, sanitize_branch,
};
use super::overlay::{Mounter, OverlayManager};
use super::pipeline::{DeployRequest, Pipeline};
use super::policy;
use super::retry::RetryPolicy;
use super::runtime::{self, ContainerRuntime};
use super::source::SourceControl;
use super::{webhook, ws};
use crate::config::Settings;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: DbHandle,
    pub coordinator: Arc<Coordinator>,
    pub hub: Arc<StatusHub>,
    pub logs: Arc<DeploymentLogs>,
    pub actions: Arc<ActionHub>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire every service around one database and one runtime.
    pub fn new(
        settings: Arc<Settings>,
        db: DbHandle,
        runtime: Arc<dyn ContainerRuntime>,
        source: Arc<dyn SourceControl>,
        mounter: Arc<dyn Mounter>,
        db_retry: RetryPolicy,
    ) -> Self {
        let refresh = RefreshTrigger::new();
        let retention = settings.intervals.retention;
        let logs = Arc::new(DeploymentLogs::new(retention));
        let overlay = Arc::new(OverlayManager::new(settings.previews_base.clone(), mounter));
        let pipeline = Pipeline::new(
            Arc::clone(&settings),
            db.clone(),
            Arc::clone(&runtime),
            overlay,
            Arc::clone(&logs),
            refresh.clone(),
        )
        .with_db_retry(db_retry);
        let coordinator = Arc::new(Coordinator::new(Arc::new(pipeline), source));
        let hub = Arc::new(StatusHub::new(
            Arc::clone(&settings),
            db.clone(),
            runtime,
            refresh.clone(),
        ));
        let actions = Arc::new(ActionHub::new(retention, Some(refresh)));
        Self {
            settings,
            db,
            coordinator,
            hub,
            logs,
            actions,
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        self.coordinator.pipeline().runtime()
    }

    fn environment_dir(&self, env: &Environment) -> PathBuf {
        env.path
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.settings.environment_dir(&env.project, &env.name))
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ListQuery {
    /// Include live container status (slower).
    pub status: Option<bool>,
}

#[derive(Deserialize)]
pub struct UpdateEnvironmentRequest {
    pub pinned: Option<bool>,
    pub auto_update: Option<bool>,
    pub env_vars: Option<std::collections::BTreeMap<String, String>>,
}

#[derive(Deserialize)]
pub struct CreateBranchRequest {
    pub branch: String,
}

#[derive(Deserialize, Default)]
pub struct ActionQuery {
    pub args: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct ActionBody {
    pub args: Option<String>,
}

#[derive(Deserialize)]
pub struct DeploymentsQuery {
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct SettingValue {
    pub value: String,
}

#[derive(Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub output: String,
    pub error: String,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Forbidden(String),
    BadGateway(String),
    Internal(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::NotFound(msg)
            | ApiError::BadRequest(msg)
            | ApiError::Conflict(msg)
            | ApiError::Forbidden(msg)
            | ApiError::BadGateway(msg)
            | ApiError::Internal(msg) => f.write_str(msg),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/previews", get(list_environments))
        .route("/api/previews/{project}/branch", post(create_branch_environment))
        .route(
            "/api/previews/{project}/{name}",
            get(get_environment)
                .patch(update_environment)
                .delete(delete_environment),
        )
        .route("/api/previews/{project}/{name}/rebuild", post(rebuild_environment))
        .route("/api/previews/{project}/{name}/deployments", get(list_deployments))
        .route(
            "/api/previews/{project}/{name}/deployments/{id}",
            get(get_deployment),
        )
        .route("/api/previews/{project}/{name}/{action}", post(run_action))
        .route("/api/settings", get(list_settings))
        .route("/api/settings/{key}", put(put_setting))
        .route("/api/webhooks/gitlab", post(webhook::gitlab_webhook))
        .route("/ws", get(ws::status_ws))
        .route("/ws/deployments/{id}", get(ws::deployment_ws))
        .route(
            "/ws/previews/{project}/{name}/actions/{action}",
            get(ws::action_ws),
        )
}

// ── Helpers ───────────────────────────────────────────────────────────

async fn load_environment(state: &SharedState, key: &EnvironmentKey) -> Result<Environment, ApiError> {
    let lookup = key.clone();
    state
        .db
        .call(move |db| db.get_environment(&lookup.project, &lookup.name))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Preview {} not found", key)))
}

/// Start `action` against an environment, or join the run already in
/// flight for the same pair.
pub async fn start_action(
    state: &SharedState,
    key: &EnvironmentKey,
    action: &str,
    args: Option<&str>,
) -> Result<ActionTicket, ApiError> {
    let kind = match ActionKind::parse(action, args) {
        Some(kind) => kind,
        None if action == "drush" => {
            return Err(ApiError::BadRequest("Missing drush args".to_string()));
        }
        None => return Err(ApiError::NotFound(format!("Unknown action '{}'", action))),
    };
    let env = load_environment(state, key).await?;
    let dir = state.environment_dir(&env);
    if !dir.is_dir() {
        return Err(ApiError::NotFound(format!(
            "Preview directory does not exist: {}",
            dir.display()
        )));
    }
    let url = env
        .url
        .clone()
        .unwrap_or_else(|| state.coordinator.pipeline().url(key));
    let (spec, limit) = kind.command(
        state.runtime().as_ref(),
        &dir,
        key,
        &url,
        &state.settings.timeouts,
    );
    Ok(state.actions.start_or_join(key, &kind, spec, limit))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_environments(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = if query.status.unwrap_or(true) {
        state.hub.full_snapshot().await?
    } else {
        state.hub.fast_snapshot().await?
    };
    Ok(Json(json!({
        "total": snapshot.environments.len(),
        "previews": snapshot.environments,
    })))
}

async fn get_environment(
    State(state): State<SharedState>,
    Path((project, name)): Path<(String, String)>,
) -> Result<Json<EnvironmentView>, ApiError> {
    let key = EnvironmentKey::new(project, name);
    let lookup = key.clone();
    let listing = state
        .db
        .call(move |db| {
            Ok(db
                .list_environments()?
                .into_iter()
                .find(|l| l.environment.key() == lookup))
        })
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Preview {} not found", key)))?;
    let dir = state.environment_dir(&listing.environment);
    let health = runtime::health(
        state.runtime().as_ref(),
        &dir,
        state.settings.timeouts.health,
    )
    .await;
    let building = listing.is_building();
    Ok(Json(EnvironmentView {
        environment: listing.environment,
        latest_deployment: listing.latest_deployment,
        building,
        container_status: Some(health),
    }))
}

async fn update_environment(
    State(state): State<SharedState>,
    Path((project, name)): Path<(String, String)>,
    Json(req): Json<UpdateEnvironmentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let key = EnvironmentKey::new(project, name);
    load_environment(&state, &key).await?;
    let update = EnvironmentUpdate {
        pinned: req.pinned,
        auto_update: req.auto_update,
        env_vars: req.env_vars,
        ..EnvironmentUpdate::default()
    };
    let env = state
        .db
        .call(move |db| db.upsert_environment(&key.project, &key.name, &update))
        .await?;
    state.hub.refresh_trigger().request();
    Ok(Json(env))
}

async fn delete_environment(
    State(state): State<SharedState>,
    Path((project, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let key = EnvironmentKey::new(project, name);
    if !state.coordinator.delete(&key).await? {
        return Err(ApiError::NotFound(format!("Preview {} not found", key)));
    }
    Ok(Json(json!({
        "success": true,
        "message": format!("Preview {} deleted", key),
    })))
}

async fn rebuild_environment(
    State(state): State<SharedState>,
    Path((project, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let key = EnvironmentKey::new(project, name);
    let env = load_environment(&state, &key).await?;
    let Some(branch) = env.branch.clone().filter(|b| !b.is_empty()) else {
        return Err(ApiError::BadRequest(
            "Cannot determine branch for this preview".to_string(),
        ));
    };
    let req = DeployRequest {
        project_path: state.settings.repository_path(&key.project),
        key: key.clone(),
        branch: branch.clone(),
        commit_sha: env.commit_sha.clone().unwrap_or_default(),
        triggered_by: "rebuild".to_string(),
        mr_iid: env.mr_iid,
        auto_update: None,
    };
    if state.coordinator.trigger(req) == TriggerOutcome::Duplicate {
        return Err(ApiError::Conflict(format!(
            "A deploy is already in progress for {}",
            key
        )));
    }
    Ok(Json(ActionResponse {
        success: true,
        output: format!("Rebuild started for {} (branch: {})", key, branch),
        error: String::new(),
    }))
}

async fn create_branch_environment(
    State(state): State<SharedState>,
    Path(project): Path<String>,
    Json(body): Json<CreateBranchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if state.db.call(|db| policy::enabled_project_ids(db)).await?.is_empty() {
        return Err(ApiError::BadRequest("No projects are enabled".to_string()));
    }
    if sanitize_branch(&body.branch).is_empty() {
        return Err(ApiError::BadRequest("Invalid branch name".to_string()));
    }
    let key = EnvironmentKey::new(project, branch_environment_name(&body.branch));
    let lookup = key.clone();
    let exists = state
        .db
        .call(move |db| db.get_environment(&lookup.project, &lookup.name))
        .await?
        .is_some();
    if exists || state.coordinator.is_busy(&key) {
        return Err(ApiError::Conflict(format!(
            "Preview {} already exists for project {}",
            key.name, key.project
        )));
    }

    let project_path = state.settings.repository_path(&key.project);
    let commit_sha = match state
        .coordinator
        .source()
        .branch_head(&project_path, &body.branch)
        .await
    {
        Ok(Some(sha)) => sha,
        Ok(None) => {
            return Err(ApiError::NotFound(format!(
                "Branch '{}' not found",
                body.branch
            )));
        }
        Err(e) => {
            tracing::error!(project = %key.project, branch = %body.branch, error = %e, "Branch lookup failed");
            return Err(ApiError::BadGateway(format!("GitLab API error: {}", e)));
        }
    };

    let req = DeployRequest {
        key: key.clone(),
        project_path,
        branch: body.branch.clone(),
        commit_sha: commit_sha.clone(),
        triggered_by: "api".to_string(),
        mr_iid: None,
        auto_update: Some(false),
    };
    if state.coordinator.trigger(req) == TriggerOutcome::Duplicate {
        return Err(ApiError::Conflict(format!(
            "Preview {} already exists for project {}",
            key.name, key.project
        )));
    }
    Ok(Json(json!({
        "success": true,
        "preview_name": key.name,
        "branch": body.branch,
        "commit_sha": commit_sha,
        "message": format!("Creating preview {} from branch {}", key.name, body.branch),
    })))
}

async fn list_deployments(
    State(state): State<SharedState>,
    Path((project, name)): Path<(String, String)>,
    Query(query): Query<DeploymentsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let key = EnvironmentKey::new(project, name);
    let env = load_environment(&state, &key).await?;
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let deployments = state
        .db
        .call(move |db| db.list_deployments(env.id, limit))
        .await?;
    Ok(Json(json!({
        "total": deployments.len(),
        "deployments": deployments,
    })))
}

async fn get_deployment(
    State(state): State<SharedState>,
    Path((project, name, id)): Path<(String, String, i64)>,
) -> Result<Json<DeploymentRecord>, ApiError> {
    let key = EnvironmentKey::new(project, name);
    let env = load_environment(&state, &key).await?;
    state
        .db
        .call(move |db| db.get_deployment(id))
        .await?
        .filter(|d| d.environment_id == env.id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Deployment {} not found", id)))
}

async fn run_action(
    State(state): State<SharedState>,
    Path((project, name, action)): Path<(String, String, String)>,
    body: Option<Json<ActionBody>>,
) -> Result<impl IntoResponse, ApiError> {
    let key = EnvironmentKey::new(project, name);
    let args = body.and_then(|Json(b)| b.args);
    let ticket = start_action(&state, &key, &action, args.as_deref()).await?;
    let outcome = ticket.outcome().await;
    let error = if outcome.success {
        String::new()
    } else {
        outcome.output.clone()
    };
    Ok(Json(ActionResponse {
        success: outcome.success,
        output: outcome.output,
        error,
    }))
}

async fn list_settings(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let settings = state.db.call(|db| db.all_settings()).await?;
    Ok(Json(settings))
}

async fn put_setting(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    Json(body): Json<SettingValue>,
) -> Result<impl IntoResponse, ApiError> {
    policy::validate_setting(&key, &body.value).map_err(ApiError::BadRequest)?;
    let value = body.value.clone();
    let stored = key.clone();
    state
        .db
        .call(move |db| db.set_setting(&stored, &value))
        .await?;
    tracing::info!(key = %key, "Setting updated");
    Ok(Json(json!({"key": key, "value": body.value})))
}

// ── Wake on request ───────────────────────────────────────────────────

const BUILDING_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><meta http-equiv="refresh" content="10"><title>Building preview...</title></head>
<body><h1>Building preview</h1><p>{name} ({project})</p><p>A deployment is in progress. This page refreshes automatically.</p></body>
</html>"#;

const WAKING_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><meta http-equiv="refresh" content="5"><title>Waking up preview...</title></head>
<body><h1>Waking up preview</h1><p>{name} ({project})</p><p>This page refreshes automatically.</p></body>
</html>"#;

const NOT_FOUND_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><title>Preview not found</title></head>
<body><h1>Preview not found</h1><p>{message}</p></body>
</html>"#;

fn render(page: &str, key: &EnvironmentKey) -> Html<String> {
    Html(
        page.replace("{name}", &key.name)
            .replace("{project}", &key.project),
    )
}

fn not_found_page(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Html(NOT_FOUND_PAGE.replace("{message}", message)),
    )
        .into_response()
}

/// Host part of the `Host` header, lowercased and without the port.
fn request_host(headers: &HeaderMap) -> String {
    headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_ascii_lowercase())
        .unwrap_or_default()
}

/// Requests for a preview host land here when the reverse proxy has no
/// running container to route to. Records the access, then either reports
/// a running build or wakes the containers.
pub async fn wake_handler(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    let host = request_host(&headers);
    let suffix = format!(".{}", state.settings.preview_domain.to_ascii_lowercase());
    if !host.ends_with(&suffix) {
        return (StatusCode::NOT_FOUND, "Not found").into_response();
    }
    match wake(&state, host).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, "Wake request failed");
            e.into_response()
        }
    }
}

async fn wake(state: &SharedState, host: String) -> Result<Response, ApiError> {
    let lookup = host.clone();
    let Some(env) = state
        .db
        .call(move |db| db.find_environment_by_domain(&lookup))
        .await?
    else {
        return Ok(not_found_page(&format!("No preview is deployed at {}", host)));
    };
    let key = env.key();

    let env_id = env.id;
    if state
        .db
        .call(move |db| db.has_running_deployment(env_id))
        .await?
    {
        return Ok(render(BUILDING_PAGE, &key).into_response());
    }

    let dir = state.environment_dir(&env);
    if !dir.is_dir() {
        return Ok(not_found_page("The preview directory no longer exists"));
    }

    {
        let key = key.clone();
        state
            .db
            .call(move |db| db.touch_last_accessed(&key.project, &key.name))
            .await?;
    }

    let health = runtime::health(
        state.runtime().as_ref(),
        &dir,
        state.settings.timeouts.health,
    )
    .await;
    if health != ContainerHealth::Running {
        let ticket = start_action(state, &key, "start", None).await?;
        if ticket.leader {
            tracing::info!(environment = %key, health = health.as_str(), "Waking preview");
        }
    }
    Ok(render(WAKING_PAGE, &key).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preview::db::PreviewDb;
    use crate::preview::fakes::{NoopMounter, StubRuntime, StubSource};
    use crate::preview::models::EnvironmentStatus;
    use crate::preview::policy::ENABLED_PROJECTS_KEY;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct TestApp {
        state: SharedState,
        _dir: tempfile::TempDir,
    }

    impl TestApp {
        fn router(&self) -> Router {
            api_router()
                .fallback(wake_handler)
                .with_state(Arc::clone(&self.state))
        }
    }

    fn test_app_with(runtime: StubRuntime, source: StubSource) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            previews_base: dir.path().join("previews"),
            backups_dir: dir.path().join("backups"),
            gitlab_group: Some("web".to_string()),
            ..Settings::default()
        };
        let state = Arc::new(AppState::new(
            Arc::new(settings),
            DbHandle::new(PreviewDb::new_in_memory().unwrap()),
            Arc::new(runtime),
            Arc::new(source),
            Arc::new(NoopMounter),
            RetryPolicy::fixed(1, std::time::Duration::from_millis(10)),
        ));
        TestApp { state, _dir: dir }
    }

    fn test_app() -> TestApp {
        test_app_with(StubRuntime::running(), StubSource::default())
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(body: Body) -> String {
        let bytes = body.collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn send_json(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn seed(app: &TestApp, project: &str, name: &str, branch: Option<&str>) -> Environment {
        let url = format!("https://{}-{}.{}", name, project, app.state.settings.preview_domain);
        let update = EnvironmentUpdate {
            status: Some(EnvironmentStatus::Active),
            branch: branch.map(str::to_string),
            commit_sha: Some("abc123".to_string()),
            url: Some(url),
            ..EnvironmentUpdate::default()
        };
        let (project, name) = (project.to_string(), name.to_string());
        app.state
            .db
            .call(move |db| db.upsert_environment(&project, &name, &update))
            .await
            .unwrap()
    }

    fn make_env_dir(app: &TestApp, project: &str, name: &str) -> PathBuf {
        let dir = app.state.settings.environment_dir(project, name);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    async fn enable_projects(app: &TestApp) {
        app.state
            .db
            .call(|db| db.set_setting(ENABLED_PROJECTS_KEY, "[42]"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app();
        let response = app.router().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response.into_body()).await, "ok");
    }

    #[tokio::test]
    async fn test_list_environments_without_status() {
        let app = test_app();
        seed(&app, "shop", "mr-1", Some("feature")).await;
        seed(&app, "shop", "mr-2", Some("bugfix")).await;

        let response = app
            .router()
            .oneshot(get("/api/previews?status=false"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["total"], 2);
        assert_eq!(body["previews"][0]["name"], "mr-1");
        assert!(body["previews"][0]["container_status"].is_null());
    }

    #[tokio::test]
    async fn test_list_environments_with_status() {
        let app = test_app();
        seed(&app, "shop", "mr-1", Some("feature")).await;

        let response = app.router().oneshot(get("/api/previews")).await.unwrap();
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["previews"][0]["container_status"], "missing");
    }

    #[tokio::test]
    async fn test_get_missing_environment_is_404() {
        let app = test_app();
        let response = app
            .router()
            .oneshot(get("/api/previews/shop/mr-404"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["error"], "Preview shop/mr-404 not found");
    }

    #[tokio::test]
    async fn test_update_environment_flags() {
        let app = test_app();
        seed(&app, "shop", "mr-1", Some("feature")).await;

        let response = app
            .router()
            .oneshot(send_json(
                "PATCH",
                "/api/previews/shop/mr-1",
                json!({"pinned": true, "auto_update": false}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let env: Environment = body_json(response.into_body()).await;
        assert!(env.pinned);
        assert!(!env.auto_update);
        assert_eq!(env.branch.as_deref(), Some("feature"));
    }

    #[tokio::test]
    async fn test_create_branch_requires_enabled_projects() {
        let app = test_app();
        let response = app
            .router()
            .oneshot(send_json(
                "POST",
                "/api/previews/shop/branch",
                json!({"branch": "feature/x"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["error"], "No projects are enabled");
    }

    #[tokio::test]
    async fn test_create_branch_rejects_unusable_name() {
        let app = test_app();
        enable_projects(&app).await;
        let response = app
            .router()
            .oneshot(send_json(
                "POST",
                "/api/previews/shop/branch",
                json!({"branch": "///"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["error"], "Invalid branch name");
    }

    #[tokio::test]
    async fn test_create_branch_unknown_branch_is_404() {
        let app = test_app();
        enable_projects(&app).await;
        let response = app
            .router()
            .oneshot(send_json(
                "POST",
                "/api/previews/shop/branch",
                json!({"branch": "nope"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["error"], "Branch 'nope' not found");
    }

    #[tokio::test]
    async fn test_create_branch_lookup_failure_is_502() {
        let source = StubSource {
            fail_lookup: true,
            ..StubSource::default()
        };
        let app = test_app_with(StubRuntime::running(), source);
        enable_projects(&app).await;
        let response = app
            .router()
            .oneshot(send_json(
                "POST",
                "/api/previews/shop/branch",
                json!({"branch": "main"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().starts_with("GitLab API error"));
    }

    #[tokio::test]
    async fn test_create_branch_starts_deploy() {
        let app = test_app_with(
            StubRuntime::running(),
            StubSource::with_branch("feature/x", "deadbeef"),
        );
        enable_projects(&app).await;
        let response = app
            .router()
            .oneshot(send_json(
                "POST",
                "/api/previews/shop/branch",
                json!({"branch": "feature/x"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["preview_name"], "branch-feature--x");
        assert_eq!(body["commit_sha"], "deadbeef");
        assert_eq!(
            body["message"],
            "Creating preview branch-feature--x from branch feature/x"
        );
    }

    #[tokio::test]
    async fn test_create_branch_conflict_when_existing() {
        let app = test_app_with(
            StubRuntime::running(),
            StubSource::with_branch("main", "deadbeef"),
        );
        enable_projects(&app).await;
        seed(&app, "shop", "branch-main", Some("main")).await;
        let response = app
            .router()
            .oneshot(send_json(
                "POST",
                "/api/previews/shop/branch",
                json!({"branch": "main"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(
            body["error"],
            "Preview branch-main already exists for project shop"
        );
    }

    #[tokio::test]
    async fn test_rebuild_without_branch_is_400() {
        let app = test_app();
        seed(&app, "shop", "mr-1", None).await;
        let response = app
            .router()
            .oneshot(send_json("POST", "/api/previews/shop/mr-1/rebuild", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["error"], "Cannot determine branch for this preview");
    }

    #[tokio::test]
    async fn test_rebuild_reports_branch() {
        let app = test_app();
        seed(&app, "shop", "mr-1", Some("feature")).await;
        let response = app
            .router()
            .oneshot(send_json("POST", "/api/previews/shop/mr-1/rebuild", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["output"], "Rebuild started for shop/mr-1 (branch: feature)");
    }

    #[tokio::test]
    async fn test_action_runs_against_environment() {
        let app = test_app();
        seed(&app, "shop", "mr-1", Some("feature")).await;
        make_env_dir(&app, "shop", "mr-1");

        let response = app
            .router()
            .oneshot(send_json("POST", "/api/previews/shop/mr-1/stop", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["output"].as_str().unwrap().trim(), "stopped");
        assert_eq!(body["error"], "");
    }

    #[tokio::test]
    async fn test_drush_requires_args() {
        let app = test_app();
        seed(&app, "shop", "mr-1", Some("feature")).await;
        make_env_dir(&app, "shop", "mr-1");

        let response = app
            .router()
            .oneshot(send_json("POST", "/api/previews/shop/mr-1/drush", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .router()
            .oneshot(send_json(
                "POST",
                "/api/previews/shop/mr-1/drush",
                json!({"args": "cr"}),
            ))
            .await
            .unwrap();
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["success"], true);
        assert!(body["output"].as_str().unwrap().contains("drush cr"));
    }

    #[tokio::test]
    async fn test_action_without_directory_is_404() {
        let app = test_app();
        seed(&app, "shop", "mr-1", Some("feature")).await;
        let response = app
            .router()
            .oneshot(send_json("POST", "/api/previews/shop/mr-1/start", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_deployment_must_belong_to_environment() {
        let app = test_app();
        let mine = seed(&app, "shop", "mr-1", Some("feature")).await;
        seed(&app, "shop", "mr-2", Some("other")).await;
        let deployment = app
            .state
            .db
            .call(move |db| db.try_create_deployment(mine.id, "webhook"))
            .await
            .unwrap()
            .unwrap();

        let uri = format!("/api/previews/shop/mr-1/deployments/{}", deployment.id);
        let response = app.router().oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let uri = format!("/api/previews/shop/mr-2/deployments/{}", deployment.id);
        let response = app.router().oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .router()
            .oneshot(get("/api/previews/shop/mr-1/deployments"))
            .await
            .unwrap();
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["deployments"][0]["status"], "running");
    }

    #[tokio::test]
    async fn test_delete_unknown_environment_is_404() {
        let app = test_app();
        let response = app
            .router()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/previews/shop/mr-9")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_settings_validate_enabled_projects() {
        let app = test_app();
        let uri = format!("/api/settings/{}", ENABLED_PROJECTS_KEY);

        let response = app
            .router()
            .oneshot(send_json("PUT", &uri, json!({"value": "shop"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .router()
            .oneshot(send_json("PUT", &uri, json!({"value": "[1, 2]"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.router().oneshot(get("/api/settings")).await.unwrap();
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body[ENABLED_PROJECTS_KEY], "[1, 2]");
    }

    #[tokio::test]
    async fn test_settings_reject_out_of_range_thresholds() {
        let app = test_app();
        for (key, value) in [
            ("auto_erase_days", "9223372036854775807"),
            ("auto_stop_minutes", "0"),
            ("auto_stop_shop_minutes", "-1"),
        ] {
            let response = app
                .router()
                .oneshot(send_json("PUT", &format!("/api/settings/{}", key), json!({"value": value})))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", key);
        }

        let response = app
            .router()
            .oneshot(send_json("PUT", "/api/settings/auto_erase_days", json!({"value": "14"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // The database stays usable after rejected writes.
        let response = app.router().oneshot(get("/api/settings")).await.unwrap();
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["auto_erase_days"], "14");
        assert!(body.get("auto_stop_minutes").is_none());
    }

    fn wake_request(host: &str) -> Request<Body> {
        Request::builder()
            .uri("/")
            .header("host", host)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_wake_unknown_host_is_404() {
        let app = test_app();
        let response = app
            .router()
            .oneshot(wake_request("example.com"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .router()
            .oneshot(wake_request("mr-1-shop.preview.localhost"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_text(response.into_body()).await.contains("Preview not found"));
    }

    #[tokio::test]
    async fn test_wake_during_build_shows_building_page() {
        let app = test_app();
        let env = seed(&app, "shop", "mr-1", Some("feature")).await;
        make_env_dir(&app, "shop", "mr-1");
        app.state
            .db
            .call(move |db| db.try_create_deployment(env.id, "webhook"))
            .await
            .unwrap();

        let response = app
            .router()
            .oneshot(wake_request("mr-1-shop.preview.localhost:443"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let html = body_text(response.into_body()).await;
        assert!(html.contains("content=\"10\""));
        assert!(html.contains("Building preview"));
    }

    #[tokio::test]
    async fn test_wake_starts_stopped_environment() {
        let app = test_app_with(StubRuntime::stopped(), StubSource::default());
        seed(&app, "shop", "mr-1", Some("feature")).await;
        make_env_dir(&app, "shop", "mr-1");

        let response = app
            .router()
            .oneshot(wake_request("mr-1-shop.preview.localhost"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let html = body_text(response.into_body()).await;
        assert!(html.contains("Waking up preview"));
        assert!(html.contains("content=\"5\""));

        let env = app
            .state
            .db
            .call(|db| db.get_environment("shop", "mr-1"))
            .await
            .unwrap()
            .unwrap();
        assert!(env.last_accessed_at.is_some());
    }
}
