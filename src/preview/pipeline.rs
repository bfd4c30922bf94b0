//! Deployment pipeline: one run provisions or refreshes one environment.
//!
//! A run moves the environment `creating → active | failed`. Steps execute
//! strictly in order, each bounded by its own timeout; the first failure
//! aborts the run. The structured log is streamed live while the run
//! progresses and persisted on the deployment record at the end.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc;

use super::compose::{
    CONTAINER_WEBROOT, ComposeGenerator, ComposeSettings, PreviewContext, container_name,
    write_compose,
};
use super::db::DbHandle;
use super::deploy_log::DeployLog;
use super::deploy_logs::DeploymentLogs;
use super::hub::RefreshTrigger;
use super::manifest::{Manifest, Phase};
use super::models::{
    DeploymentStatus, Environment, EnvironmentKey, EnvironmentStatus, EnvironmentUpdate,
};
use super::overlay::{AssetProvision, OverlayManager};
use super::policy;
use super::process::{self, CommandSpec};
use super::retry::{RetryOutcome, RetryPolicy};
use super::runtime::ContainerRuntime;
use crate::config::Settings;
use crate::errors::PipelineError;

/// Longest tail of command output kept in a step failure message.
const FAILURE_OUTPUT_LIMIT: usize = 2000;

/// What to deploy, and on whose behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    pub key: EnvironmentKey,
    /// Source repository path, `group/project`.
    pub project_path: String,
    pub branch: String,
    pub commit_sha: String,
    pub triggered_by: String,
    pub mr_iid: Option<i64>,
    /// Initial `auto_update` for a new environment; `None` keeps the stored
    /// value (or the default).
    pub auto_update: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded { deployment_id: i64 },
    Failed { deployment_id: i64, error: String },
    /// The source could not be fetched; no deployment record exists.
    CheckoutFailed { error: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    VerifyDump,
    GenerateTopology,
    StartContainers,
    WaitForDatabase,
    InstallDependencies,
    ImportDatabase,
    ProvisionAssets,
    CustomScripts,
    ProjectScript,
}

impl Step {
    pub fn plan(phase: Phase) -> &'static [Step] {
        match phase {
            Phase::New => &[
                Step::VerifyDump,
                Step::GenerateTopology,
                Step::StartContainers,
                Step::WaitForDatabase,
                Step::InstallDependencies,
                Step::ImportDatabase,
                Step::ProvisionAssets,
                Step::CustomScripts,
                Step::ProjectScript,
            ],
            Phase::Update => &[
                Step::GenerateTopology,
                Step::StartContainers,
                Step::InstallDependencies,
                Step::CustomScripts,
                Step::ProjectScript,
            ],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Step::VerifyDump => "verify-dump",
            Step::GenerateTopology => "generate-topology",
            Step::StartContainers => "compose-up",
            Step::WaitForDatabase => "wait-for-db",
            Step::InstallDependencies => "composer-install",
            Step::ImportDatabase => "import-db",
            Step::ProvisionAssets => "import-files",
            Step::CustomScripts => "deploy-steps",
            Step::ProjectScript => "project-deploy-script",
        }
    }
}

/// Per-run state threaded through the steps.
struct RunContext {
    key: EnvironmentKey,
    dir: PathBuf,
    phase: Phase,
    branch: String,
    commit_sha: String,
    mr_iid: Option<i64>,
    url: String,
    env_vars: BTreeMap<String, String>,
    manifest: Manifest,
    docroot: String,
    log: DeployLog,
}

pub struct Pipeline {
    settings: Arc<Settings>,
    db: DbHandle,
    runtime: Arc<dyn ContainerRuntime>,
    overlay: Arc<OverlayManager>,
    logs: Arc<DeploymentLogs>,
    refresh: RefreshTrigger,
    generator: ComposeGenerator,
    db_retry: RetryPolicy,
}

impl Pipeline {
    pub fn new(
        settings: Arc<Settings>,
        db: DbHandle,
        runtime: Arc<dyn ContainerRuntime>,
        overlay: Arc<OverlayManager>,
        logs: Arc<DeploymentLogs>,
        refresh: RefreshTrigger,
    ) -> Self {
        let generator = ComposeGenerator::new(ComposeSettings::from_settings(&settings));
        Self {
            settings,
            db,
            runtime,
            overlay,
            logs,
            refresh,
            generator,
            db_retry: RetryPolicy::database_ready(),
        }
    }

    pub fn with_db_retry(mut self, policy: RetryPolicy) -> Self {
        self.db_retry = policy;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn overlay(&self) -> &Arc<OverlayManager> {
        &self.overlay
    }

    pub fn refresh(&self) -> &RefreshTrigger {
        &self.refresh
    }

    pub fn url(&self, key: &EnvironmentKey) -> String {
        self.generator.settings().url(key)
    }

    /// Execute one run. Step failures become a `Failed` outcome; only
    /// bookkeeping failures surface as errors.
    pub async fn run(&self, req: &DeployRequest) -> Result<RunOutcome> {
        let key = req.key.clone();
        let previous = {
            let key = key.clone();
            self.db
                .call(move |db| db.get_environment(&key.project, &key.name))
                .await?
        };
        if previous
            .as_ref()
            .is_some_and(|e| e.status == EnvironmentStatus::Creating)
        {
            tracing::warn!(environment = %key, "Skipping deploy: already creating");
            return Ok(RunOutcome::Skipped {
                reason: "already creating".to_string(),
            });
        }

        let dir = self.settings.environment_dir(&key.project, &key.name);
        let url = self.url(&key);
        let creating = EnvironmentUpdate {
            branch: Some(req.branch.clone()),
            commit_sha: Some(req.commit_sha.clone()),
            status: Some(EnvironmentStatus::Creating),
            url: Some(url.clone()),
            path: Some(dir.display().to_string()),
            mr_iid: req.mr_iid,
            auto_update: if previous.is_none() { req.auto_update } else { None },
            ..EnvironmentUpdate::default()
        };
        let triggered_by = req.triggered_by.clone();
        let started = {
            let key = key.clone();
            self.db
                .call(move |db| {
                    let env = db.upsert_environment(&key.project, &key.name, &creating)?;
                    let deployment = db.try_create_deployment(env.id, &triggered_by)?;
                    Ok((env, deployment))
                })
                .await?
        };
        let (env, deployment) = match started {
            (env, Some(deployment)) => (env, deployment),
            (_, None) => {
                let restore = previous
                    .as_ref()
                    .map_or(EnvironmentStatus::Failed, |e| e.status);
                self.save(&key, EnvironmentUpdate::status(restore)).await?;
                tracing::warn!(environment = %key, "Skipping deploy: a deployment is already running");
                return Ok(RunOutcome::Skipped {
                    reason: "deployment already running".to_string(),
                });
            }
        };

        let deployment_id = deployment.id;
        self.logs.register(deployment_id);
        self.refresh.request();

        let phase = if previous.as_ref().is_none_or(|e| e.last_deployed_at.is_none()) {
            Phase::New
        } else {
            Phase::Update
        };
        tracing::info!(
            environment = %key,
            deployment_id,
            phase = phase.as_str(),
            branch = %req.branch,
            "Deploy started"
        );

        let manifest = Manifest::load(&dir);
        let docroot = manifest.resolve_docroot(&dir);
        let mut ctx = RunContext {
            key: key.clone(),
            dir,
            phase,
            branch: req.branch.clone(),
            commit_sha: req.commit_sha.clone(),
            mr_iid: req.mr_iid,
            url,
            env_vars: env.env_vars.clone(),
            manifest,
            docroot,
            log: DeployLog::new(Some((Arc::clone(&self.logs), deployment_id))),
        };
        ctx.log.header(phase, &key, &req.branch, &req.commit_sha);

        let clock = Instant::now();
        let mut result = Ok(());
        for step in Step::plan(phase) {
            if let Err(e) = self.execute(*step, &mut ctx).await {
                result = Err(e);
                break;
            }
        }
        let elapsed = clock.elapsed();
        let duration = elapsed.as_secs_f64();

        let outcome = match result {
            Ok(()) => {
                ctx.log.summary(true, elapsed, None);
                self.save(
                    &key,
                    EnvironmentUpdate {
                        status: Some(EnvironmentStatus::Active),
                        last_deployed_at: Some(Utc::now()),
                        last_deployment_status: Some(DeploymentStatus::Success),
                        last_deployment_error: Some(None),
                        last_deployment_duration: Some(duration),
                        ..EnvironmentUpdate::default()
                    },
                )
                .await?;
                self.finish(deployment_id, DeploymentStatus::Success, ctx.log.text(), None)
                    .await?;
                tracing::info!(environment = %key, deployment_id, duration, "Deploy succeeded");
                RunOutcome::Succeeded { deployment_id }
            }
            Err(e) => {
                let error = e.to_string();
                ctx.log.summary(false, elapsed, Some(&error));
                self.save(
                    &key,
                    EnvironmentUpdate {
                        status: Some(EnvironmentStatus::Failed),
                        last_deployment_status: Some(DeploymentStatus::Failed),
                        last_deployment_error: Some(Some(error.clone())),
                        last_deployment_duration: Some(duration),
                        ..EnvironmentUpdate::default()
                    },
                )
                .await?;
                self.finish(
                    deployment_id,
                    DeploymentStatus::Failed,
                    ctx.log.text(),
                    Some(error.clone()),
                )
                .await?;
                tracing::error!(environment = %key, deployment_id, error = %error, "Deploy failed");
                RunOutcome::Failed {
                    deployment_id,
                    error,
                }
            }
        };

        let success = matches!(outcome, RunOutcome::Succeeded { .. });
        self.logs.complete(deployment_id, success);
        self.refresh.request();
        Ok(outcome)
    }

    async fn save(&self, key: &EnvironmentKey, update: EnvironmentUpdate) -> Result<Environment> {
        let key = key.clone();
        self.db
            .call(move |db| db.upsert_environment(&key.project, &key.name, &update))
            .await
    }

    async fn finish(
        &self,
        deployment_id: i64,
        status: DeploymentStatus,
        log: String,
        error: Option<String>,
    ) -> Result<()> {
        self.db
            .call(move |db| {
                db.finish_deployment(deployment_id, status, &log, error.as_deref())
                    .map(|_| ())
            })
            .await
    }

    async fn execute(&self, step: Step, ctx: &mut RunContext) -> Result<(), PipelineError> {
        let timeouts = &self.settings.timeouts;
        match step {
            Step::VerifyDump => {
                let started = Instant::now();
                ctx.log.step_start(step.name());
                let dump = self.settings.base_dump_path(&ctx.key.project);
                if !dump.is_file() {
                    ctx.log.step_end(step.name(), started.elapsed(), false, None);
                    return Err(PipelineError::MissingDump { path: dump });
                }
                ctx.log.step_end(
                    step.name(),
                    started.elapsed(),
                    true,
                    Some(&dump.display().to_string()),
                );
                Ok(())
            }
            Step::GenerateTopology => self.generate_topology(ctx).await,
            Step::StartContainers => {
                let spec = self.runtime.compose_up(&ctx.dir);
                self.run_command(ctx, step.name(), spec, timeouts.compose_up)
                    .await
                    .map(drop)
            }
            Step::WaitForDatabase => self.wait_for_database(ctx).await,
            Step::InstallDependencies => {
                let spec = self.php_exec(
                    ctx,
                    &["composer", "install", "--no-interaction", "--no-progress"],
                );
                self.run_command(ctx, step.name(), spec, timeouts.composer)
                    .await
                    .map(drop)
            }
            Step::ImportDatabase => {
                let dump = self.settings.base_dump_path(&ctx.key.project);
                let spec = self
                    .runtime
                    .import_dump(&dump, &container_name(&ctx.key, "db"))
                    .current_dir(&ctx.dir);
                self.run_command(ctx, step.name(), spec, timeouts.import_db)
                    .await
                    .map(drop)
            }
            Step::ProvisionAssets => {
                let started = Instant::now();
                ctx.log.step_start(step.name());
                let provision = self
                    .overlay
                    .ensure_assets(&ctx.key.project, &ctx.dir, &ctx.docroot)
                    .await;
                let note = match &provision {
                    Ok(AssetProvision::EmptyDirectory) => {
                        "No base files found; created an empty files directory".to_string()
                    }
                    Ok(_) => format!(
                        "Mounted overlay (base: {})",
                        self.overlay.base_dir(&ctx.key.project).display()
                    ),
                    Err(e) => e.to_string(),
                };
                ctx.log
                    .step_end(step.name(), started.elapsed(), provision.is_ok(), Some(&note));
                provision.map(drop).map_err(PipelineError::from)
            }
            Step::CustomScripts => self.run_custom_scripts(ctx).await,
            Step::ProjectScript => self.run_project_script(ctx).await,
        }
    }

    async fn generate_topology(&self, ctx: &mut RunContext) -> Result<(), PipelineError> {
        let step = Step::GenerateTopology.name();
        let started = Instant::now();
        ctx.log.step_start(step);

        let project = ctx.key.project.clone();
        let project_env = self
            .db
            .call(move |db| policy::project_env_overrides(db, &project))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(project = %ctx.key.project, error = %e, "Ignoring project env overrides");
                BTreeMap::new()
            });

        let preview = PreviewContext {
            key: ctx.key.clone(),
            branch: ctx.branch.clone(),
            commit_sha: ctx.commit_sha.clone(),
            mr_iid: ctx.mr_iid,
        };
        let compose = self.generator.generate(
            &preview,
            &ctx.manifest,
            &ctx.docroot,
            project_env,
            ctx.env_vars.clone(),
        );
        if let Err(e) = write_compose(&ctx.dir, &compose) {
            ctx.log.step_end(step, started.elapsed(), false, None);
            return Err(e.into());
        }
        let note = format!(
            "php={} db={} docroot={}",
            ctx.manifest.php_version,
            ctx.manifest.database.image(),
            ctx.docroot
        );
        ctx.log.step_end(step, started.elapsed(), true, Some(&note));
        Ok(())
    }

    async fn wait_for_database(&self, ctx: &mut RunContext) -> Result<(), PipelineError> {
        let step = Step::WaitForDatabase.name();
        let started = Instant::now();
        ctx.log.step_start(step);

        let ping = self.runtime.db_ping(&container_name(&ctx.key, "db"));
        let probe_limit = self.settings.timeouts.db_ping;
        let outcome = self
            .db_retry
            .run(|_| {
                let ping = ping.clone();
                async move {
                    match process::run(&ping, probe_limit).await {
                        Ok(out) if out.success() => Some(()),
                        _ => None,
                    }
                }
            })
            .await;

        match outcome {
            RetryOutcome::Ready { attempts, .. } => {
                let note = format!("Database ready after {} attempt(s)", attempts);
                ctx.log.step_end(step, started.elapsed(), true, Some(&note));
                Ok(())
            }
            RetryOutcome::Exhausted { attempts } => {
                let err = PipelineError::DatabaseNotReady { attempts };
                ctx.log
                    .step_end(step, started.elapsed(), false, Some(&err.to_string()));
                Err(err)
            }
        }
    }

    /// Host-side scripts from `<deploy_steps_dir>/<phase>/*.sh`, in name
    /// order. A missing directory means nothing to run.
    async fn run_custom_scripts(&self, ctx: &mut RunContext) -> Result<(), PipelineError> {
        let scripts = discover_scripts(&self.settings.deploy_steps_dir.join(ctx.phase.as_str()));
        if scripts.is_empty() {
            return Ok(());
        }
        tracing::info!(
            environment = %ctx.key,
            count = scripts.len(),
            phase = ctx.phase.as_str(),
            "Running custom deploy steps"
        );
        let env = step_env(ctx);
        for script in scripts {
            let file = script
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default();
            let step = format!("deploy-step-{}/{}", ctx.phase.as_str(), file);
            let spec = CommandSpec::new("bash")
                .arg(script.display().to_string())
                .current_dir(&ctx.dir)
                .envs(&env);
            self.run_command(ctx, &step, spec, self.settings.timeouts.deploy_step)
                .await?;
        }
        Ok(())
    }

    /// Environment-specific override script, else the manifest's script
    /// for this phase, else nothing.
    async fn run_project_script(&self, ctx: &mut RunContext) -> Result<(), PipelineError> {
        let phase = ctx.phase.as_str();
        let limit = self.settings.timeouts.deploy_script;
        let override_rel = format!("scripts/preview/{}/{}-deploy.sh", phase, ctx.key.name);

        if ctx.dir.join(&override_rel).is_file() {
            tracing::info!(environment = %ctx.key, script = %override_rel, "Running environment deploy script");
            let script = format!("{}/{}", CONTAINER_WEBROOT, override_rel);
            let spec = self.php_exec(ctx, &["bash", &script]);
            let step = format!("project-deploy-script-preview-{}", phase);
            return self.run_command(ctx, &step, spec, limit).await.map(drop);
        }

        let Some(declared) = ctx.manifest.deploy.for_phase(ctx.phase).map(str::to_string) else {
            tracing::info!(environment = %ctx.key, phase, "No deploy script configured");
            return Ok(());
        };

        let step = format!("project-deploy-script-{}", phase);
        if !ctx.dir.join(&declared).is_file() {
            let err = PipelineError::MissingScript {
                path: declared,
                phase: phase.to_string(),
            };
            ctx.log.step_start(&step);
            ctx.log
                .step_end(&step, Duration::ZERO, false, Some(&err.to_string()));
            return Err(err);
        }

        let script = format!("{}/{}", CONTAINER_WEBROOT, declared);
        let spec = self.php_exec(ctx, &["bash", &script]);
        self.run_command(ctx, &step, spec, limit).await.map(drop)
    }

    fn php_exec(&self, ctx: &RunContext, argv: &[&str]) -> CommandSpec {
        let argv: Vec<String> = argv.iter().map(|a| a.to_string()).collect();
        self.runtime
            .exec(&container_name(&ctx.key, "php"), &argv)
            .current_dir(&ctx.dir)
    }

    /// Run one command as a logged step, streaming its output into the run
    /// log.
    async fn run_command(
        &self,
        ctx: &mut RunContext,
        step: &str,
        spec: CommandSpec,
        limit: Duration,
    ) -> Result<String, PipelineError> {
        tracing::info!(environment = %ctx.key, step, command = %spec.display(), "Running step");
        ctx.log.step_start(step);
        let started = Instant::now();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let log = &mut ctx.log;
        let forward = async {
            while let Some(line) = rx.recv().await {
                log.line(&line);
            }
        };
        let (result, ()) = tokio::join!(process::run_streaming(&spec, limit, Some(tx)), forward);
        let elapsed = started.elapsed();

        match result {
            Ok(out) if out.success() => {
                ctx.log.step_end(step, elapsed, true, None);
                tracing::info!(environment = %ctx.key, step, secs = elapsed.as_secs(), "Step ok");
                Ok(out.output)
            }
            Ok(out) => {
                ctx.log.step_end(step, elapsed, false, None);
                Err(PipelineError::StepFailed {
                    step: step.to_string(),
                    code: out.code.unwrap_or(-1),
                    output: tail(&out.output, FAILURE_OUTPUT_LIMIT).to_string(),
                })
            }
            Err(e) => {
                let err = PipelineError::from_process(step, e);
                ctx.log.step_end(step, elapsed, false, Some(&err.to_string()));
                Err(err)
            }
        }
    }
}

fn discover_scripts(dir: &Path) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }
    let pattern = dir.join("*.sh");
    let mut scripts: Vec<PathBuf> = match glob::glob(&pattern.to_string_lossy()) {
        Ok(paths) => paths.filter_map(Result::ok).filter(|p| p.is_file()).collect(),
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Invalid deploy step pattern");
            Vec::new()
        }
    };
    scripts.sort();
    scripts
}

/// Variables describing the environment to host-side deploy scripts.
fn step_env(ctx: &RunContext) -> BTreeMap<String, String> {
    [
        ("PREV_PROJECT_NAME", ctx.key.project.clone()),
        ("PREV_PREVIEW_NAME", ctx.key.name.clone()),
        (
            "PREV_MR_IID",
            ctx.mr_iid.map(|i| i.to_string()).unwrap_or_default(),
        ),
        ("PREV_PATH", ctx.dir.display().to_string()),
        ("PREV_URL", ctx.url.clone()),
        ("PREV_CONTAINER_PREFIX", ctx.key.container_prefix()),
        ("PREV_BRANCH", ctx.branch.clone()),
        ("PREV_COMMIT_SHA", ctx.commit_sha.clone()),
        ("PREV_PHASE", ctx.phase.as_str().to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn tail(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
