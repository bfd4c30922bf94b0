//! Container runtime adapter.
//!
//! The runtime is driven entirely through external commands. A
//! [`ContainerRuntime`] only describes those commands; [`process`] runs
//! them, so every runtime call gets the same timeout and process-group
//! handling.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::compose::{COMPOSE_FILE, DB_NAME, DB_PASSWORD, DB_ROOT_PASSWORD, DB_USER};
use super::models::ContainerHealth;
use super::process::{self, CommandSpec};

/// Image used for privileged filesystem helpers.
pub const HELPER_IMAGE: &str = "alpine:3.20";

pub trait ContainerRuntime: Send + Sync {
    /// Create and start the group, pulling only missing images.
    fn compose_up(&self, dir: &Path) -> CommandSpec;
    /// Start an existing, stopped group.
    fn compose_start(&self, dir: &Path) -> CommandSpec;
    fn compose_stop(&self, dir: &Path) -> CommandSpec;
    fn compose_restart(&self, dir: &Path) -> CommandSpec;
    /// Remove the group and its volumes.
    fn compose_down(&self, dir: &Path) -> CommandSpec;
    /// List the group's containers as JSON.
    fn compose_ps(&self, dir: &Path) -> CommandSpec;
    fn exec(&self, container: &str, argv: &[String]) -> CommandSpec;
    /// Liveness probe against the database server.
    fn db_ping(&self, db_container: &str) -> CommandSpec;
    /// Stream a gzipped SQL dump into the database container.
    fn import_dump(&self, dump: &Path, db_container: &str) -> CommandSpec;
    /// Long-lived container event stream, one JSON object per line.
    fn events(&self) -> CommandSpec;
    /// Remove `path` recursively as root, via a throwaway container.
    fn remove_tree(&self, path: &Path) -> CommandSpec;
    /// Hand `path` back to `uid:gid`, via a throwaway container.
    fn chown_tree(&self, path: &Path, uid: u32, gid: u32) -> CommandSpec;
}

/// The `docker` CLI with the compose plugin.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }

    fn compose(&self, dir: &Path, args: &[&str]) -> CommandSpec {
        CommandSpec::new(&self.program)
            .arg("compose")
            .args(args.iter().copied())
            .current_dir(dir)
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime for DockerCli {
    fn compose_up(&self, dir: &Path) -> CommandSpec {
        self.compose(dir, &["up", "-d", "--pull", "missing"])
    }

    fn compose_start(&self, dir: &Path) -> CommandSpec {
        self.compose(dir, &["up", "-d"])
    }

    fn compose_stop(&self, dir: &Path) -> CommandSpec {
        self.compose(dir, &["stop"])
    }

    fn compose_restart(&self, dir: &Path) -> CommandSpec {
        self.compose(dir, &["restart"])
    }

    fn compose_down(&self, dir: &Path) -> CommandSpec {
        self.compose(dir, &["down", "-v"])
    }

    fn compose_ps(&self, dir: &Path) -> CommandSpec {
        self.compose(dir, &["ps", "--format", "json"])
    }

    fn exec(&self, container: &str, argv: &[String]) -> CommandSpec {
        CommandSpec::new(&self.program)
            .arg("exec")
            .arg(container)
            .args(argv.iter().cloned())
    }

    fn db_ping(&self, db_container: &str) -> CommandSpec {
        CommandSpec::new(&self.program).args([
            "exec".to_string(),
            db_container.to_string(),
            "mysqladmin".to_string(),
            "ping".to_string(),
            "-h".to_string(),
            "localhost".to_string(),
            "-u".to_string(),
            "root".to_string(),
            format!("-p{}", DB_ROOT_PASSWORD),
        ])
    }

    fn import_dump(&self, dump: &Path, db_container: &str) -> CommandSpec {
        CommandSpec::shell(format!(
            "gunzip -c {} | {} exec -i {} mysql -u {} -p{} {}",
            shell_quote(&dump.display().to_string()),
            self.program,
            shell_quote(db_container),
            DB_USER,
            DB_PASSWORD,
            DB_NAME
        ))
    }

    fn events(&self) -> CommandSpec {
        CommandSpec::new(&self.program).args([
            "events",
            "--filter",
            "type=container",
            "--format",
            "{{json .}}",
        ])
    }

    fn remove_tree(&self, path: &Path) -> CommandSpec {
        CommandSpec::new(&self.program).args([
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{}:/target", path.display()),
            HELPER_IMAGE.to_string(),
            "rm".to_string(),
            "-rf".to_string(),
            "/target".to_string(),
        ])
    }

    fn chown_tree(&self, path: &Path, uid: u32, gid: u32) -> CommandSpec {
        CommandSpec::new(&self.program).args([
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{}:/data", path.display()),
            HELPER_IMAGE.to_string(),
            "chown".to_string(),
            "-R".to_string(),
            format!("{}:{}", uid, gid),
            "/data".to_string(),
        ])
    }
}

/// Single-quote `s` for `sh`.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[derive(Debug, Deserialize)]
struct PsEntry {
    #[serde(rename = "State", default)]
    state: String,
}

/// Interpret `compose ps --format json` output. Compose prints either a
/// JSON array or one object per line depending on its version.
pub fn parse_ps(output: &str) -> ContainerHealth {
    let trimmed = output.trim();
    let entries: Vec<PsEntry> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).unwrap_or_default()
    } else {
        trimmed
            .lines()
            .filter_map(|line| serde_json::from_str(line.trim()).ok())
            .collect()
    };
    if !entries.is_empty() && entries.iter().all(|e| e.state.eq_ignore_ascii_case("running")) {
        ContainerHealth::Running
    } else {
        ContainerHealth::Stopped
    }
}

/// Query the live health of the group in `dir`, never waiting longer than
/// `limit`.
pub async fn health(runtime: &dyn ContainerRuntime, dir: &Path, limit: Duration) -> ContainerHealth {
    if !dir.is_dir() {
        return ContainerHealth::Missing;
    }
    if !dir.join(COMPOSE_FILE).is_file() {
        return ContainerHealth::Stopped;
    }
    match process::run(&runtime.compose_ps(dir), limit).await {
        Ok(out) if out.success() => parse_ps(&out.output),
        Ok(out) => {
            tracing::debug!(dir = %dir.display(), code = ?out.code, "Status query failed");
            ContainerHealth::Unknown
        }
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Status query failed");
            ContainerHealth::Unknown
        }
    }
}
