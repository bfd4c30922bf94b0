//! End-to-end lifecycle scenarios driven through the HTTP router with fake
//! runtime, source control and mounter.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use http_body_util::BodyExt;
use tower::ServiceExt;

use common::{FakeRuntime, FakeSource, Harness, WEBHOOK_SECRET, merge_request_event, webhook_request};
use preview_manager::preview::coordinator::TriggerOutcome;
use preview_manager::preview::models::{
    DeploymentStatus, EnvironmentKey, EnvironmentStatus, EnvironmentUpdate,
};
use preview_manager::preview::pipeline::{DeployRequest, RunOutcome};

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn mr7() -> EnvironmentKey {
    EnvironmentKey::new("shop", "mr-7")
}

/// Seed an environment that has been deployed before, with its working
/// directory on disk.
fn seed_deployed(h: &Harness, auto_update: bool) {
    std::fs::create_dir_all(h.env_dir("shop", "mr-7")).unwrap();
    let update = EnvironmentUpdate {
        branch: Some("feature-x".to_string()),
        commit_sha: Some("abc000".to_string()),
        status: Some(EnvironmentStatus::Active),
        mr_iid: Some(7),
        last_deployed_at: Some(chrono::Utc::now()),
        auto_update: Some(auto_update),
        ..EnvironmentUpdate::default()
    };
    h.state
        .db
        .lock_sync()
        .unwrap()
        .upsert_environment("shop", "mr-7", &update)
        .unwrap();
}

fn deployments(h: &Harness) -> Vec<preview_manager::preview::models::DeploymentSummary> {
    let db = h.state.db.lock_sync().unwrap();
    match db.get_environment("shop", "mr-7").unwrap() {
        Some(env) => db.list_deployments(env.id, 50).unwrap(),
        None => Vec::new(),
    }
}

#[tokio::test]
async fn test_webhook_rejects_bad_token() {
    let h = Harness::new(FakeRuntime::default(), FakeSource::default());
    let event = merge_request_event("open", 7);

    let response = h.router().oneshot(webhook_request(&event, Some("wrong"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["error"], "Invalid webhook token");

    let response = h.router().oneshot(webhook_request(&event, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(h.source.clone_count(), 0);
}

#[tokio::test]
async fn test_webhook_ignores_disabled_project() {
    let h = Harness::new(FakeRuntime::default(), FakeSource::default());
    let mut event = merge_request_event("open", 7);
    event["project"]["id"] = serde_json::json!(999);

    let response = h
        .router()
        .oneshot(webhook_request(&event, Some(WEBHOOK_SECRET)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ignored");
    assert_eq!(body["reason"], "project not enabled");
    assert!(h.environment("shop", "mr-7").is_none());
}

/// Scenario A: `open` creates the environment, which passes through
/// `creating` and ends `active` with exactly one successful deployment.
#[tokio::test]
async fn test_open_creates_active_environment() {
    let runtime = FakeRuntime {
        up_script: "sleep 0.5".to_string(),
        ..FakeRuntime::default()
    };
    let h = Harness::new(runtime, FakeSource::default());

    let response = h
        .router()
        .oneshot(webhook_request(&merge_request_event("open", 7), Some(WEBHOOK_SECRET)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["action"], "open");
    assert_eq!(body["project"], "web/shop");
    assert_eq!(body["mr_iid"], 7);

    let mut saw_creating = false;
    tokio::time::timeout(Duration::from_secs(30), async {
        while h.state.coordinator.is_busy(&mr7()) {
            if h
                .environment("shop", "mr-7")
                .is_some_and(|e| e.status == EnvironmentStatus::Creating)
            {
                saw_creating = true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(saw_creating, "environment never reported creating");

    let env = h.environment("shop", "mr-7").unwrap();
    assert_eq!(env.status, EnvironmentStatus::Active);
    assert_eq!(env.branch.as_deref(), Some("feature-x"));
    assert_eq!(env.commit_sha.as_deref(), Some("abc123"));
    assert_eq!(env.mr_iid, Some(7));
    assert_eq!(env.url.as_deref(), Some("https://mr-7-shop.preview.localhost"));
    assert!(env.last_deployed_at.is_some());

    let records = deployments(&h);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, DeploymentStatus::Success);
    assert_eq!(records[0].triggered_by.as_deref(), Some("webhook"));

    let dir = h.env_dir("shop", "mr-7");
    assert!(dir.join("composer.json").is_file());
    assert!(!dir.join(".git").exists());
    assert!(dir.join("docker-compose.yml").is_file());
    assert!(h.runtime.called("import_dump"));
    assert_eq!(h.source.clones.lock().unwrap()[0], "web/shop@feature-x");
}

/// Scenario B: `update` on an environment with auto-update off is ignored.
#[tokio::test]
async fn test_update_respects_auto_update_opt_out() {
    let h = Harness::new(FakeRuntime::default(), FakeSource::default());
    seed_deployed(&h, false);
    let before = h.environment("shop", "mr-7").unwrap();

    let response = h
        .router()
        .oneshot(webhook_request(&merge_request_event("update", 7), Some(WEBHOOK_SECRET)))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["status"], "ignored");
    assert_eq!(body["reason"], "auto_update disabled");

    assert!(!h.state.coordinator.is_busy(&mr7()));
    assert_eq!(h.source.clone_count(), 0);
    assert!(deployments(&h).is_empty());
    assert_eq!(h.environment("shop", "mr-7").unwrap(), before);
}

/// Scenario C: a second `update` while the first is still running is
/// dropped; only one pipeline runs.
#[tokio::test]
async fn test_duplicate_updates_run_one_pipeline() {
    let source = FakeSource {
        clone_delay: Duration::from_millis(300),
        ..FakeSource::default()
    };
    let h = Harness::new(FakeRuntime::default(), source);
    seed_deployed(&h, true);

    let event = merge_request_event("update", 7);
    let (first, second) = tokio::join!(
        h.router().oneshot(webhook_request(&event, Some(WEBHOOK_SECRET))),
        h.router().oneshot(webhook_request(&event, Some(WEBHOOK_SECRET))),
    );
    assert_eq!(first.unwrap().status(), StatusCode::OK);
    assert_eq!(second.unwrap().status(), StatusCode::OK);

    h.wait_idle(&mr7()).await;
    assert_eq!(h.source.clone_count(), 1);
    let records = deployments(&h);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, DeploymentStatus::Success);
}

#[tokio::test]
async fn test_trigger_reports_duplicate() {
    let source = FakeSource {
        clone_delay: Duration::from_millis(300),
        ..FakeSource::default()
    };
    let h = Harness::new(FakeRuntime::default(), source);
    let req = DeployRequest {
        key: mr7(),
        project_path: "web/shop".to_string(),
        branch: "feature-x".to_string(),
        commit_sha: "abc123".to_string(),
        triggered_by: "webhook".to_string(),
        mr_iid: Some(7),
        auto_update: None,
    };

    assert_eq!(h.state.coordinator.trigger(req.clone()), TriggerOutcome::Started);
    assert_eq!(h.state.coordinator.trigger(req), TriggerOutcome::Duplicate);
    h.wait_idle(&mr7()).await;
}

/// Scenario D: `merge` removes the container group, the persisted state
/// and the working directory.
#[tokio::test]
async fn test_merge_deletes_environment() {
    let h = Harness::new(FakeRuntime::default(), FakeSource::default());
    seed_deployed(&h, true);
    let dir = h.env_dir("shop", "mr-7");
    std::fs::write(dir.join("docker-compose.yml"), "services: {}\n").unwrap();
    std::fs::write(dir.join("index.php"), "<?php").unwrap();

    let response = h
        .router()
        .oneshot(webhook_request(&merge_request_event("merge", 7), Some(WEBHOOK_SECRET)))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["action"], "merge");

    tokio::time::timeout(Duration::from_secs(10), async {
        while h.environment("shop", "mr-7").is_some() || dir.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert!(h.runtime.called("compose_down"));
    assert!(h.runtime.called("remove_tree"));
}

/// Scenario E: an update whose manifest declares a missing script fails at
/// the project-script step, naming the path.
#[tokio::test]
async fn test_missing_declared_script_fails_update() {
    let source = FakeSource::default().with_file(
        "preview.yml",
        "deploy:\n  update: scripts/nonexistent.sh\n",
    );
    let h = Harness::new(FakeRuntime::default(), source);
    seed_deployed(&h, true);

    let req = DeployRequest {
        key: mr7(),
        project_path: "web/shop".to_string(),
        branch: "feature-x".to_string(),
        commit_sha: "def456".to_string(),
        triggered_by: "rebuild".to_string(),
        mr_iid: Some(7),
        auto_update: None,
    };
    let outcome = h.state.coordinator.deploy(&req).await.unwrap();
    let RunOutcome::Failed { deployment_id, error } = outcome else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert!(error.contains("scripts/nonexistent.sh"), "{}", error);

    let env = h.environment("shop", "mr-7").unwrap();
    assert_eq!(env.status, EnvironmentStatus::Failed);
    assert_eq!(env.last_deployment_status, Some(DeploymentStatus::Failed));

    let record = h
        .state
        .db
        .lock_sync()
        .unwrap()
        .get_deployment(deployment_id)
        .unwrap()
        .unwrap();
    assert_eq!(record.status, DeploymentStatus::Failed);
    let log = record.log_output.unwrap_or_default();
    assert!(log.contains("project-deploy-script-update"));
    assert!(!log.contains("import-db"));
    assert!(h.runtime.called("chown_tree"));
}

#[tokio::test]
async fn test_failed_clone_marks_environment_failed() {
    struct BrokenSource;

    #[async_trait::async_trait]
    impl preview_manager::preview::source::SourceControl for BrokenSource {
        async fn clone_branch(&self, _: &str, _: &str, _: &std::path::Path) -> anyhow::Result<()> {
            anyhow::bail!("remote: HTTP Basic: Access denied")
        }
        async fn branch_head(&self, _: &str, _: &str) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
    }

    let h = Harness::new(FakeRuntime::default(), FakeSource::default());
    let coordinator = preview_manager::preview::coordinator::Coordinator::new(
        std::sync::Arc::clone(h.state.coordinator.pipeline()),
        std::sync::Arc::new(BrokenSource),
    );
    let req = DeployRequest {
        key: mr7(),
        project_path: "web/shop".to_string(),
        branch: "feature-x".to_string(),
        commit_sha: "abc123".to_string(),
        triggered_by: "webhook".to_string(),
        mr_iid: Some(7),
        auto_update: None,
    };
    let outcome = coordinator.deploy(&req).await.unwrap();
    assert!(matches!(outcome, RunOutcome::CheckoutFailed { .. }));

    let env = h.environment("shop", "mr-7").unwrap();
    assert_eq!(env.status, EnvironmentStatus::Failed);
    assert!(deployments(&h).is_empty());
}
