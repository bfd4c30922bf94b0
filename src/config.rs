use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Name of the optional settings file looked up in the user config dir.
pub const CONFIG_FILE_NAME: &str = "preview-manager.toml";

/// Runtime configuration for the preview manager.
///
/// Built from defaults, then an optional TOML file, then environment
/// variables. Policy that operators change at runtime (enabled projects,
/// idle thresholds) lives in the settings table instead, see
/// [`crate::preview::policy`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub previews_base: PathBuf,
    pub backups_dir: PathBuf,
    pub deploy_steps_dir: PathBuf,
    pub docker_network: String,
    pub base_image: String,
    pub preview_domain: String,
    pub forward_auth: String,
    pub gitlab_url: String,
    pub gitlab_token: Option<String>,
    pub gitlab_webhook_secret: Option<String>,
    pub gitlab_group: Option<String>,
    pub log_format: String,
    pub log_dir: Option<PathBuf>,
    pub dev_mode: bool,
    pub timeouts: StepTimeouts,
    pub intervals: LoopIntervals,
}

/// Per-step limits. A step exceeding its limit is killed and the run fails.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepTimeouts {
    pub compose_up: Duration,
    pub composer: Duration,
    pub import_db: Duration,
    pub drush: Duration,
    pub deploy_script: Duration,
    pub deploy_step: Duration,
    pub db_ping: Duration,
    pub compose_stop: Duration,
    pub compose_start: Duration,
    pub compose_down: Duration,
    pub remove_tree: Duration,
    pub chown: Duration,
    pub clone: Duration,
    pub health: Duration,
    pub login_link: Duration,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            compose_up: Duration::from_secs(300),
            composer: Duration::from_secs(600),
            import_db: Duration::from_secs(600),
            drush: Duration::from_secs(300),
            deploy_script: Duration::from_secs(600),
            deploy_step: Duration::from_secs(300),
            db_ping: Duration::from_secs(5),
            compose_stop: Duration::from_secs(60),
            compose_start: Duration::from_secs(120),
            compose_down: Duration::from_secs(60),
            remove_tree: Duration::from_secs(120),
            chown: Duration::from_secs(60),
            clone: Duration::from_secs(300),
            health: Duration::from_secs(5),
            login_link: Duration::from_secs(30),
        }
    }
}

/// Cadence of the background loops.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopIntervals {
    pub status_check: Duration,
    pub idle_stop_delay: Duration,
    pub idle_stop: Duration,
    pub idle_erase_delay: Duration,
    pub idle_erase: Duration,
    pub debounce: Duration,
    pub reconnect: Duration,
    pub prefix_refresh: Duration,
    pub retention: Duration,
}

impl Default for LoopIntervals {
    fn default() -> Self {
        Self {
            status_check: Duration::from_secs(30),
            idle_stop_delay: Duration::from_secs(30),
            idle_stop: Duration::from_secs(300),
            idle_erase_delay: Duration::from_secs(60),
            idle_erase: Duration::from_secs(3600),
            debounce: Duration::from_secs(2),
            reconnect: Duration::from_secs(3),
            prefix_refresh: Duration::from_secs(60),
            retention: Duration::from_secs(30),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            db_path: PathBuf::from("data/previews.db"),
            previews_base: PathBuf::from("/var/www/previews"),
            backups_dir: PathBuf::from("/backups"),
            deploy_steps_dir: PathBuf::from("scripts/deploy-steps"),
            docker_network: "preview-network".to_string(),
            base_image: "preview-drupal".to_string(),
            preview_domain: "preview.localhost".to_string(),
            forward_auth: "host.docker.internal:8000".to_string(),
            gitlab_url: "https://gitlab.com".to_string(),
            gitlab_token: None,
            gitlab_webhook_secret: None,
            gitlab_group: None,
            log_format: "plain".to_string(),
            log_dir: None,
            dev_mode: false,
            timeouts: StepTimeouts::default(),
            intervals: LoopIntervals::default(),
        }
    }
}

/// Raw TOML structure. Every section and field is optional and overrides
/// the corresponding default only when present.
#[derive(Debug, Default, Deserialize)]
struct SettingsToml {
    server: Option<ServerSection>,
    paths: Option<PathsSection>,
    docker: Option<DockerSection>,
    gitlab: Option<GitLabSection>,
    logging: Option<LoggingSection>,
    timeouts: Option<TimeoutsSection>,
    intervals: Option<IntervalsSection>,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    host: Option<String>,
    port: Option<u16>,
    dev_mode: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct PathsSection {
    db_path: Option<PathBuf>,
    previews_base: Option<PathBuf>,
    backups_dir: Option<PathBuf>,
    deploy_steps_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct DockerSection {
    network: Option<String>,
    base_image: Option<String>,
    preview_domain: Option<String>,
    forward_auth: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitLabSection {
    url: Option<String>,
    token: Option<String>,
    webhook_secret: Option<String>,
    group: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoggingSection {
    format: Option<String>,
    dir: Option<PathBuf>,
}

/// All values in seconds.
#[derive(Debug, Deserialize)]
struct TimeoutsSection {
    compose_up: Option<u64>,
    composer: Option<u64>,
    import_db: Option<u64>,
    drush: Option<u64>,
    deploy_script: Option<u64>,
    deploy_step: Option<u64>,
    db_ping: Option<u64>,
    compose_stop: Option<u64>,
    compose_start: Option<u64>,
    compose_down: Option<u64>,
    remove_tree: Option<u64>,
    chown: Option<u64>,
    clone: Option<u64>,
    health: Option<u64>,
    login_link: Option<u64>,
}

/// All values in seconds.
#[derive(Debug, Deserialize)]
struct IntervalsSection {
    status_check: Option<u64>,
    idle_stop_delay: Option<u64>,
    idle_stop: Option<u64>,
    idle_erase_delay: Option<u64>,
    idle_erase: Option<u64>,
    debounce: Option<u64>,
    reconnect: Option<u64>,
    prefix_refresh: Option<u64>,
    retention: Option<u64>,
}

fn set_secs(target: &mut Duration, value: Option<u64>) {
    if let Some(secs) = value {
        *target = Duration::from_secs(secs);
    }
}

impl Settings {
    /// Resolve settings from defaults, the config file and the environment.
    ///
    /// `explicit` wins over `PREVIEW_CONFIG`, which wins over the file in the
    /// user config dir. A missing implicit file is fine; a missing explicit
    /// file is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut settings = Self::default();

        let from_env = std::env::var_os("PREVIEW_CONFIG").map(PathBuf::from);
        match explicit.map(Path::to_path_buf).or(from_env) {
            Some(path) => settings.apply_file(&path)?,
            None => {
                if let Some(path) = dirs::config_dir().map(|d| d.join(CONFIG_FILE_NAME))
                    && path.exists()
                {
                    settings.apply_file(&path)?;
                }
            }
        }

        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Log what will not work with the credentials currently configured.
    /// Called once logging is up.
    pub fn warn_missing_credentials(&self) {
        if self.gitlab_webhook_secret.is_none() {
            tracing::warn!("GITLAB_WEBHOOK_SECRET not set -- webhook endpoint will reject all events");
        }
        if self.gitlab_token.is_none() {
            tracing::warn!("GITLAB_TOKEN not set -- clones and branch lookups will fail");
        }
    }

    fn apply_file(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        self.apply_toml(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    fn apply_toml(&mut self, content: &str) -> Result<()> {
        let toml: SettingsToml = toml::from_str(content)?;

        if let Some(server) = toml.server {
            if let Some(host) = server.host {
                self.host = host;
            }
            if let Some(port) = server.port {
                self.port = port;
            }
            if let Some(dev_mode) = server.dev_mode {
                self.dev_mode = dev_mode;
            }
        }
        if let Some(paths) = toml.paths {
            if let Some(p) = paths.db_path {
                self.db_path = p;
            }
            if let Some(p) = paths.previews_base {
                self.previews_base = p;
            }
            if let Some(p) = paths.backups_dir {
                self.backups_dir = p;
            }
            if let Some(p) = paths.deploy_steps_dir {
                self.deploy_steps_dir = p;
            }
        }
        if let Some(docker) = toml.docker {
            if let Some(v) = docker.network {
                self.docker_network = v;
            }
            if let Some(v) = docker.base_image {
                self.base_image = v;
            }
            if let Some(v) = docker.preview_domain {
                self.preview_domain = v;
            }
            if let Some(v) = docker.forward_auth {
                self.forward_auth = v;
            }
        }
        if let Some(gitlab) = toml.gitlab {
            if let Some(v) = gitlab.url {
                self.gitlab_url = v;
            }
            if gitlab.token.is_some() {
                self.gitlab_token = gitlab.token;
            }
            if gitlab.webhook_secret.is_some() {
                self.gitlab_webhook_secret = gitlab.webhook_secret;
            }
            if gitlab.group.is_some() {
                self.gitlab_group = gitlab.group;
            }
        }
        if let Some(logging) = toml.logging {
            if let Some(v) = logging.format {
                self.log_format = v;
            }
            if logging.dir.is_some() {
                self.log_dir = logging.dir;
            }
        }
        if let Some(t) = toml.timeouts {
            let d = &mut self.timeouts;
            set_secs(&mut d.compose_up, t.compose_up);
            set_secs(&mut d.composer, t.composer);
            set_secs(&mut d.import_db, t.import_db);
            set_secs(&mut d.drush, t.drush);
            set_secs(&mut d.deploy_script, t.deploy_script);
            set_secs(&mut d.deploy_step, t.deploy_step);
            set_secs(&mut d.db_ping, t.db_ping);
            set_secs(&mut d.compose_stop, t.compose_stop);
            set_secs(&mut d.compose_start, t.compose_start);
            set_secs(&mut d.compose_down, t.compose_down);
            set_secs(&mut d.remove_tree, t.remove_tree);
            set_secs(&mut d.chown, t.chown);
            set_secs(&mut d.clone, t.clone);
            set_secs(&mut d.health, t.health);
            set_secs(&mut d.login_link, t.login_link);
        }
        if let Some(i) = toml.intervals {
            let d = &mut self.intervals;
            set_secs(&mut d.status_check, i.status_check);
            set_secs(&mut d.idle_stop_delay, i.idle_stop_delay);
            set_secs(&mut d.idle_stop, i.idle_stop);
            set_secs(&mut d.idle_erase_delay, i.idle_erase_delay);
            set_secs(&mut d.idle_erase, i.idle_erase);
            set_secs(&mut d.debounce, i.debounce);
            set_secs(&mut d.reconnect, i.reconnect);
            set_secs(&mut d.prefix_refresh, i.prefix_refresh);
            set_secs(&mut d.retention, i.retention);
        }
        Ok(())
    }

    /// Apply environment overrides through `lookup` so tests need not touch
    /// the process environment.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = non_empty("PREVIEW_HOST") {
            self.host = v;
        }
        if let Some(port) = non_empty("PREVIEW_PORT").and_then(|v| v.parse().ok()) {
            self.port = port;
        }
        if let Some(v) = non_empty("PREVIEW_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = non_empty("PREVIEWS_BASE_PATH") {
            self.previews_base = PathBuf::from(v);
        }
        if let Some(v) = non_empty("PREVIEW_BACKUPS_DIR") {
            self.backups_dir = PathBuf::from(v);
        }
        if let Some(v) = non_empty("PREVIEW_DEPLOY_STEPS_DIR") {
            self.deploy_steps_dir = PathBuf::from(v);
        }
        if let Some(v) = non_empty("PREVIEW_DOCKER_NETWORK") {
            self.docker_network = v;
        }
        if let Some(v) = non_empty("PREVIEW_BASE_IMAGE") {
            self.base_image = v;
        }
        if let Some(v) = non_empty("PREVIEW_DOMAIN") {
            self.preview_domain = v;
        }
        if let Some(v) = non_empty("PREVIEW_FORWARD_AUTH") {
            self.forward_auth = v;
        }
        if let Some(v) = non_empty("GITLAB_URL") {
            self.gitlab_url = v;
        }
        if let Some(v) = non_empty("GITLAB_TOKEN") {
            self.gitlab_token = Some(v);
        }
        if let Some(v) = non_empty("GITLAB_WEBHOOK_SECRET") {
            self.gitlab_webhook_secret = Some(v);
        }
        if let Some(v) = non_empty("GITLAB_GROUP") {
            self.gitlab_group = Some(v);
        }
        if let Some(v) = non_empty("LOG_FORMAT") {
            self.log_format = v;
        }
        if let Some(v) = non_empty("PREVIEW_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(v));
        }
    }

    /// Directory holding one checkout per environment of `project`.
    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.previews_base.join(project)
    }

    pub fn environment_dir(&self, project: &str, name: &str) -> PathBuf {
        self.project_dir(project).join(name)
    }

    /// Repository path of `project` on GitLab, `group/project` when a group
    /// is configured.
    pub fn repository_path(&self, project: &str) -> String {
        match self.gitlab_group.as_deref().filter(|g| !g.is_empty()) {
            Some(group) => format!("{}/{}", group.trim_end_matches('/'), project),
            None => project.to_string(),
        }
    }

    /// Gzipped base database dump imported into new environments.
    pub fn base_dump_path(&self, project: &str) -> PathBuf {
        self.backups_dir.join(format!("{}-base.sql.gz", project))
    }
}
