//! In-process stand-ins for the runtime, source control and mounter used by
//! unit tests.

use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use super::overlay::{Mounter, OverlayLayout};
use super::process::CommandSpec;
use super::runtime::ContainerRuntime;
use super::source::SourceControl;

/// Every command succeeds; `ps` reports the configured state. With
/// `exec_sleep` set, `exec` hangs for that many seconds first.
pub struct StubRuntime {
    pub ps_state: &'static str,
    pub exec_sleep: Option<u64>,
}

impl StubRuntime {
    pub fn running() -> Self {
        Self {
            ps_state: "running",
            exec_sleep: None,
        }
    }

    pub fn stopped() -> Self {
        Self {
            ps_state: "exited",
            exec_sleep: None,
        }
    }

    pub fn hanging_exec(secs: u64) -> Self {
        Self {
            exec_sleep: Some(secs),
            ..Self::running()
        }
    }
}

impl ContainerRuntime for StubRuntime {
    fn compose_up(&self, _: &Path) -> CommandSpec {
        CommandSpec::shell("true")
    }
    fn compose_start(&self, _: &Path) -> CommandSpec {
        CommandSpec::shell("echo started")
    }
    fn compose_stop(&self, _: &Path) -> CommandSpec {
        CommandSpec::shell("echo stopped")
    }
    fn compose_restart(&self, _: &Path) -> CommandSpec {
        CommandSpec::shell("echo restarted")
    }
    fn compose_down(&self, _: &Path) -> CommandSpec {
        CommandSpec::shell("true")
    }
    fn compose_ps(&self, _: &Path) -> CommandSpec {
        CommandSpec::shell(format!(r#"echo '[{{"State":"{}"}}]'"#, self.ps_state))
    }
    fn exec(&self, _: &str, argv: &[String]) -> CommandSpec {
        match self.exec_sleep {
            Some(secs) => CommandSpec::shell(format!("sleep {}; echo {}", secs, argv.join(" "))),
            None => CommandSpec::shell(format!("echo {}", argv.join(" "))),
        }
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
    fn remove_tree(&self, path: &Path) -> CommandSpec {
        CommandSpec::shell(format!("rm -rf '{}'", path.display()))
    }
    fn chown_tree(&self, _: &Path, _: u32, _: u32) -> CommandSpec {
        CommandSpec::shell("true")
    }
}

/// Knows a fixed set of branches and records every clone.
#[derive(Default)]
pub struct StubSource {
    pub branches: Vec<(String, String)>,
    pub fail_lookup: bool,
    pub clones: Mutex<Vec<String>>,
}

impl StubSource {
    pub fn with_branch(branch: &str, sha: &str) -> Self {
        Self {
            branches: vec![(branch.to_string(), sha.to_string())],
            ..Self::default()
        }
    }
}

#[async_trait]
impl SourceControl for StubSource {
    async fn clone_branch(&self, project_path: &str, branch: &str, dest: &Path) -> Result<()> {
        self.clones
            .lock()
            .unwrap()
            .push(format!("{}@{}", project_path, branch));
        std::fs::create_dir_all(dest)?;
        std::fs::write(dest.join("composer.json"), "{}")?;
        Ok(())
    }

    async fn branch_head(&self, _: &str, branch: &str) -> Result<Option<String>> {
        if self.fail_lookup {
            anyhow::bail!("connection refused");
        }
        Ok(self
            .branches
            .iter()
            .find(|(b, _)| b == branch)
            .map(|(_, sha)| sha.clone()))
    }
}

/// Never mounts anything.
pub struct NoopMounter;

#[async_trait]
impl Mounter for NoopMounter {
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
