//! GitLab merge-request webhook receiver.
//!
//! `open`, `reopen` and `update` deploy `mr-<iid>`; `close` and `merge`
//! delete it. Everything else is acknowledged and ignored. The actual work
//! runs in the background so GitLab gets its answer straight away.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{Json, body::Bytes, extract::State, http::HeaderMap};
use serde::Deserialize;
use serde_json::{Value, json};

use super::api::{ApiError, SharedState};
use super::models::{EnvironmentKey, mr_environment_name};
use super::pipeline::DeployRequest;
use super::policy;

const TOKEN_HEADER: &str = "x-gitlab-token";

#[derive(Debug, Default, Deserialize)]
pub struct MergeRequestEvent {
    #[serde(default)]
    pub object_kind: String,
    #[serde(default)]
    pub project: WebhookProject,
    #[serde(default)]
    pub object_attributes: MergeRequestAttributes,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookProject {
    pub id: Option<i64>,
    pub path_with_namespace: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MergeRequestAttributes {
    pub iid: Option<i64>,
    pub action: Option<String>,
    pub source_branch: Option<String>,
    pub last_commit: Option<LastCommit>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LastCommit {
    pub id: Option<String>,
}

/// What an event asks for, before any per-environment checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookPlan {
    Ignore(String),
    Deploy {
        action: String,
        request: DeployRequest,
    },
    Delete {
        action: String,
        key: EnvironmentKey,
    },
}

/// Map an event to a plan. `enabled` holds the project ids previews are
/// enabled for.
pub fn plan(event: &MergeRequestEvent, enabled: &BTreeSet<i64>) -> WebhookPlan {
    if event.object_kind != "merge_request" {
        return WebhookPlan::Ignore("not a merge_request event".to_string());
    }
    if !event.project.id.is_some_and(|id| enabled.contains(&id)) {
        return WebhookPlan::Ignore("project not enabled".to_string());
    }

    let attrs = &event.object_attributes;
    let action = attrs.action.clone().unwrap_or_default();
    let Some(iid) = attrs.iid else {
        return WebhookPlan::Ignore("missing merge request iid".to_string());
    };
    let project_path = event
        .project
        .path_with_namespace
        .clone()
        .unwrap_or_else(|| "unknown".to_string());
    let project = project_path
        .rsplit('/')
        .next()
        .unwrap_or(&project_path)
        .to_string();
    let key = EnvironmentKey::new(project, mr_environment_name(iid));

    match action.as_str() {
        "open" | "reopen" | "update" => {
            let Some(branch) = attrs.source_branch.clone().filter(|b| !b.is_empty()) else {
                return WebhookPlan::Ignore("missing source branch".to_string());
            };
            let commit_sha = attrs
                .last_commit
                .as_ref()
                .and_then(|c| c.id.clone())
                .unwrap_or_default();
            WebhookPlan::Deploy {
                action,
                request: DeployRequest {
                    key,
                    project_path,
                    branch,
                    commit_sha,
                    triggered_by: "webhook".to_string(),
                    mr_iid: Some(iid),
                    auto_update: None,
                },
            }
        }
        "close" | "merge" => WebhookPlan::Delete { action, key },
        other => WebhookPlan::Ignore(format!("unhandled action: {}", other)),
    }
}

fn ignored(reason: impl Into<String>) -> Json<Value> {
    Json(json!({"status": "ignored", "reason": reason.into()}))
}

pub async fn gitlab_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let Some(secret) = state
        .settings
        .gitlab_webhook_secret
        .as_deref()
        .filter(|s| !s.is_empty())
    else {
        tracing::error!("Webhook received but no webhook secret is configured");
        return Err(ApiError::Internal("Webhook secret not configured".to_string()));
    };
    let token = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok());
    if token != Some(secret) {
        tracing::warn!("Webhook received with invalid token");
        return Err(ApiError::Forbidden("Invalid webhook token".to_string()));
    }

    let event: MergeRequestEvent = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid webhook payload: {}", e)))?;
    let enabled = state.db.call(|db| policy::enabled_project_ids(db)).await?;
    let mr_iid = event.object_attributes.iid;
    let project_path = event.project.path_with_namespace.clone();

    match plan(&event, &enabled) {
        WebhookPlan::Ignore(reason) => {
            tracing::debug!(
                kind = %event.object_kind,
                project_id = ?event.project.id,
                reason = %reason,
                "Ignoring webhook"
            );
            Ok(ignored(reason))
        }
        WebhookPlan::Deploy { action, request } => {
            if action == "update" {
                let key = request.key.clone();
                let existing = state
                    .db
                    .call(move |db| db.get_environment(&key.project, &key.name))
                    .await?;
                if existing.is_some_and(|env| !env.auto_update) {
                    tracing::info!(environment = %request.key, "Skipping update, auto_update disabled");
                    return Ok(ignored("auto_update disabled"));
                }
            }
            tracing::info!(
                environment = %request.key,
                action = %action,
                branch = %request.branch,
                commit = %request.commit_sha,
                "Webhook deploy"
            );
            state.coordinator.trigger(request);
            Ok(Json(json!({
                "status": "ok",
                "action": action,
                "project": project_path,
                "mr_iid": mr_iid,
            })))
        }
        WebhookPlan::Delete { action, key } => {
            tracing::info!(environment = %key, action = %action, "Webhook delete");
            let coordinator = Arc::clone(&state.coordinator);
            tokio::spawn(async move {
                if let Err(e) = coordinator.delete(&key).await {
                    tracing::error!(environment = %key, error = %e, "Failed to delete environment");
                }
            });
            Ok(Json(json!({
                "status": "ok",
                "action": action,
                "project": project_path,
                "mr_iid": mr_iid,
            })))
        }
    }
}
