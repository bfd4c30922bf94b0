//! Shared fakes and fixtures for the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::Router;
use tempfile::TempDir;

use preview_manager::config::Settings;
use preview_manager::preview::api::{AppState, SharedState};
use preview_manager::preview::db::{DbHandle, PreviewDb};
use preview_manager::preview::models::{Environment, EnvironmentKey};
use preview_manager::preview::overlay::{Mounter, OverlayLayout};
use preview_manager::preview::process::CommandSpec;
use preview_manager::preview::retry::RetryPolicy;
use preview_manager::preview::runtime::ContainerRuntime;
use preview_manager::preview::server;
use preview_manager::preview::source::SourceControl;

pub const WEBHOOK_SECRET: &str = "s3cret";
pub const PROJECT_ID: i64 = 42;

/// Runtime whose commands are harmless shell one-liners. Every command
/// built is recorded by name.
pub struct FakeRuntime {
    pub calls: Mutex<Vec<String>>,
    pub up_script: String,
    pub events_script: String,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            up_script: "true".to_string(),
            events_script: "sleep 3600".to_string(),
        }
    }
}

impl FakeRuntime {
    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    pub fn called(&self, call: &str) -> bool {
        self.calls.lock().unwrap().iter().any(|c| c == call)
    }
}

impl ContainerRuntime for FakeRuntime {
    fn compose_up(&self, _: &Path) -> CommandSpec {
        self.record("compose_up");
        CommandSpec::shell(self.up_script.clone())
    }
    fn compose_start(&self, _: &Path) -> CommandSpec {
        self.record("compose_start");
        CommandSpec::shell("echo started")
    }
    fn compose_stop(&self, _: &Path) -> CommandSpec {
        self.record("compose_stop");
        CommandSpec::shell("echo stopped")
    }
    fn compose_restart(&self, _: &Path) -> CommandSpec {
        self.record("compose_restart");
        CommandSpec::shell("echo restarted")
    }
    fn compose_down(&self, _: &Path) -> CommandSpec {
        self.record("compose_down");
        CommandSpec::shell("true")
    }
    fn compose_ps(&self, _: &Path) -> CommandSpec {
        CommandSpec::shell(r#"echo '[{"State":"running"}]'"#)
    }
    fn exec(&self, _: &str, argv: &[String]) -> CommandSpec {
        self.record("exec");
        CommandSpec::shell(format!("echo {}", argv.join(" ")))
    }
    fn db_ping(&self, _: &str) -> CommandSpec {
        CommandSpec::shell("true")
    }
    fn import_dump(&self, _: &Path, _: &str) -> CommandSpec {
        self.record("import_dump");
        CommandSpec::shell("true")
    }
    fn events(&self) -> CommandSpec {
        CommandSpec::shell(self.events_script.clone())
    }
    fn remove_tree(&self, path: &Path) -> CommandSpec {
        self.record("remove_tree");
        CommandSpec::shell(format!("rm -rf '{}'", path.display()))
    }
    fn chown_tree(&self, _: &Path, _: u32, _: u32) -> CommandSpec {
        self.record("chown_tree");
        CommandSpec::shell("true")
    }
}

/// Source control that "clones" a fixed file set after an optional delay.
#[derive(Default)]
pub struct FakeSource {
    pub files: Vec<(String, String)>,
    pub clone_delay: Duration,
    pub clones: Mutex<Vec<String>>,
}

impl FakeSource {
    pub fn with_file(mut self, path: &str, content: &str) -> Self {
        self.files.push((path.to_string(), content.to_string()));
        self
    }

    pub fn clone_count(&self) -> usize {
        self.clones.lock().unwrap().len()
    }
}

#[async_trait]
impl SourceControl for FakeSource {
    async fn clone_branch(&self, project_path: &str, branch: &str, dest: &Path) -> Result<()> {
        self.clones
            .lock()
            .unwrap()
            .push(format!("{}@{}", project_path, branch));
        if !self.clone_delay.is_zero() {
            tokio::time::sleep(self.clone_delay).await;
        }
        std::fs::create_dir_all(dest.join(".git"))?;
        std::fs::write(dest.join("composer.json"), "{}")?;
        for (path, content) in &self.files {
            let file = dest.join(path);
            if let Some(parent) = file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(file, content)?;
        }
        Ok(())
    }

    async fn branch_head(&self, _: &str, branch: &str) -> Result<Option<String>> {
        Ok((branch == "main").then(|| "0123abcd".to_string()))
    }
}

#[derive(Default)]
pub struct FakeMounter;

#[async_trait]
impl Mounter for FakeMounter {
    async fn is_mounted(&self, _: &Path) -> bool {
        false
    }
    async fn mount(&self, _: &OverlayLayout) -> Result<(), String> {
        Ok(())
    }
    async fn unmount(&self, _: &Path) -> Result<(), String> {
        Ok(())
    }
}

pub struct Harness {
    pub state: SharedState,
    pub runtime: Arc<FakeRuntime>,
    pub source: Arc<FakeSource>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(runtime: FakeRuntime, source: FakeSource) -> Self {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            previews_base: dir.path().join("previews"),
            backups_dir: dir.path().join("backups"),
            deploy_steps_dir: dir.path().join("deploy-steps"),
            gitlab_webhook_secret: Some(WEBHOOK_SECRET.to_string()),
            gitlab_group: Some("web".to_string()),
            ..Settings::default()
        };
        std::fs::create_dir_all(&settings.backups_dir).unwrap();
        std::fs::write(settings.base_dump_path("shop"), b"dump").unwrap();

        let runtime = Arc::new(runtime);
        let source = Arc::new(source);
        let db = DbHandle::new(PreviewDb::new_in_memory().unwrap());
        db.lock_sync()
            .unwrap()
            .set_setting(
                preview_manager::preview::policy::ENABLED_PROJECTS_KEY,
                &format!("[{}]", PROJECT_ID),
            )
            .unwrap();
        let state = Arc::new(AppState::new(
            Arc::new(settings),
            db,
            runtime.clone(),
            source.clone(),
            Arc::new(FakeMounter),
            RetryPolicy::fixed(3, Duration::from_millis(10)),
        ));
        Self {
            state,
            runtime,
            source,
            dir,
        }
    }

    pub fn router(&self) -> Router {
        server::build_router(Arc::clone(&self.state))
    }

    pub fn env_dir(&self, project: &str, name: &str) -> PathBuf {
        self.state.settings.environment_dir(project, name)
    }

    pub fn environment(&self, project: &str, name: &str) -> Option<Environment> {
        self.state
            .db
            .lock_sync()
            .unwrap()
            .get_environment(project, name)
            .unwrap()
    }

    /// Wait until no deploy or delete holds the environment.
    pub async fn wait_idle(&self, key: &EnvironmentKey) {
        tokio::time::timeout(Duration::from_secs(30), async {
            while self.state.coordinator.is_busy(key) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("environment stayed busy");
    }
}

pub fn merge_request_event(action: &str, iid: i64) -> serde_json::Value {
    serde_json::json!({
        "object_kind": "merge_request",
        "project": {"id": PROJECT_ID, "path_with_namespace": "web/shop"},
        "object_attributes": {
            "iid": iid,
            "action": action,
            "source_branch": "feature-x",
            "last_commit": {"id": "abc123"}
        }
    })
}

pub fn webhook_request(body: &serde_json::Value, token: Option<&str>) -> axum::http::Request<axum::body::Body> {
    let mut builder = axum::http::Request::builder()
        .method("POST")
        .uri("/api/webhooks/gitlab")
        .header("content-type", "application/json")
        .header("x-gitlab-event", "Merge Request Hook");
    if let Some(token) = token {
        builder = builder.header("x-gitlab-token", token);
    }
    builder
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}
