//! External process execution with hard timeouts.
//!
//! Every command runs in its own process group so a timeout can take down
//! the whole tree (`docker compose` spawns helpers, scripts spawn
//! children). Output is collected line by line from stdout and stderr and
//! can be streamed to a live sink while the command runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::errors::ProcessError;

/// Receiving end for live output lines.
pub type LineSink = mpsc::UnboundedSender<String>;

/// A fully described external command, independent of how it is run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    /// Run `script` through `sh -c`, for pipelines.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Human-readable command line for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    /// Interleaved stdout and stderr lines.
    pub output: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Run a command to completion, failing with [`ProcessError::Timeout`] (and
/// killing the whole process group) when `limit` elapses first.
pub async fn run(spec: &CommandSpec, limit: Duration) -> Result<ProcessOutput, ProcessError> {
    run_streaming(spec, limit, None).await
}

/// Like [`run`], also forwarding each output line to `sink` as it arrives.
pub async fn run_streaming(
    spec: &CommandSpec,
    limit: Duration,
    sink: Option<LineSink>,
) -> Result<ProcessOutput, ProcessError> {
    let mut child = spec.command().spawn().map_err(|source| ProcessError::Spawn {
        program: spec.program.clone(),
        source,
    })?;
    let pid = child.id();
    let mut lines = forward_output(&mut child);

    let work = async {
        let collect = async {
            let mut output = String::new();
            while let Some(line) = lines.recv().await {
                if let Some(sink) = &sink {
                    let _ = sink.send(line.clone());
                }
                output.push_str(&line);
                output.push('\n');
            }
            output
        };
        tokio::join!(collect, child.wait())
    };

    match tokio::time::timeout(limit, work).await {
        Ok((output, status)) => {
            let status = status.map_err(|source| ProcessError::Wait {
                program: spec.program.clone(),
                source,
            })?;
            Ok(ProcessOutput {
                code: status.code(),
                output,
            })
        }
        Err(_) => {
            kill_process_group(pid);
            tracing::warn!(
                command = %spec.display(),
                secs = limit.as_secs(),
                "Command timed out; process group killed"
            );
            Err(ProcessError::Timeout {
                program: spec.display(),
                secs: limit.as_secs(),
            })
        }
    }
}

/// A long-lived child whose output lines are delivered on a channel.
/// Dropping it kills the process group.
pub struct LineStream {
    child: Child,
    pub lines: mpsc::UnboundedReceiver<String>,
}

impl LineStream {
    pub fn spawn(spec: &CommandSpec) -> Result<Self, ProcessError> {
        let mut child = spec.command().spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let lines = forward_output(&mut child);
        Ok(Self { child, lines })
    }
}

impl Drop for LineStream {
    fn drop(&mut self) {
        kill_process_group(self.child.id());
    }
}

fn forward_output(child: &mut Child) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump_lines(stderr, tx));
    }
    rx
}

async fn pump_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).is_err() {
            break;
        }
    }
}

fn kill_process_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // The child was started with process_group(0), so its pid is the pgid.
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}
