//! Structured, human-readable log of one deployment run.
//!
//! Every appended segment is mirrored to the live stream for the run, so
//! the persisted text and what watchers saw are identical.

use std::sync::Arc;
use std::time::Duration;

use super::deploy_logs::DeploymentLogs;
use super::manifest::Phase;
use super::models::EnvironmentKey;

const RULE: &str = "──────────────────────────────────────────────────";

#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub name: String,
    pub duration: Duration,
    pub ok: bool,
}

pub struct DeployLog {
    segments: Vec<String>,
    steps: Vec<StepRecord>,
    live: Option<(Arc<DeploymentLogs>, i64)>,
}

pub fn fmt_duration(d: Duration) -> String {
    let s = d.as_secs();
    if s < 60 {
        format!("{}s", s)
    } else {
        format!("{}m {}s", s / 60, s % 60)
    }
}

impl DeployLog {
    pub fn new(live: Option<(Arc<DeploymentLogs>, i64)>) -> Self {
        Self {
            segments: Vec::new(),
            steps: Vec::new(),
            live,
        }
    }

    pub fn raw(&mut self, text: impl Into<String>) {
        let text = text.into();
        if let Some((logs, id)) = &self.live {
            logs.push(*id, text.clone());
        }
        self.segments.push(text);
    }

    pub fn line(&mut self, line: &str) {
        self.raw(format!("{}\n", line));
    }

    pub fn header(&mut self, phase: Phase, key: &EnvironmentKey, branch: &str, commit_sha: &str) {
        let kind = match phase {
            Phase::New => "NEW",
            Phase::Update => "UPDATE",
        };
        let short: String = commit_sha.chars().take(8).collect();
        self.raw(format!(
            "{RULE}\n  {} deploy: {}\n{RULE}\nBranch: {}  Commit: {}\n",
            kind, key, branch, short
        ));
    }

    pub fn step_start(&mut self, step: &str) {
        self.raw(format!("\n==> {}\n", step));
    }

    pub fn step_end(&mut self, step: &str, elapsed: Duration, ok: bool, note: Option<&str>) {
        if let Some(note) = note.map(str::trim).filter(|n| !n.is_empty()) {
            self.line(note);
        }
        let status = if ok {
            format!("✓ {} completed in {}\n", step, fmt_duration(elapsed))
        } else {
            format!("✗ {} failed after {}\n", step, fmt_duration(elapsed))
        };
        self.raw(status);
        self.steps.push(StepRecord {
            name: step.to_string(),
            duration: elapsed,
            ok,
        });
    }

    /// Closing block listing every step that ran.
    pub fn summary(&mut self, success: bool, total: Duration, error: Option<&str>) {
        let mut out = format!("\n{RULE}\n");
        if success {
            out.push_str(&format!(
                "✓ Deploy completed successfully in {}\n",
                fmt_duration(total)
            ));
        } else {
            out.push_str(&format!("✗ Deploy failed after {}\n", fmt_duration(total)));
            if let Some(error) = error {
                out.push_str(&format!("  Error: {}\n", error));
            }
        }
        if !self.steps.is_empty() {
            out.push_str("\nStep timings:\n");
            for step in &self.steps {
                let icon = if step.ok { "✓" } else { "✗" };
                out.push_str(&format!(
                    "  {} {} {}\n",
                    icon,
                    step.name,
                    fmt_duration(step.duration)
                ));
            }
        }
        out.push_str(RULE);
        out.push('\n');
        self.raw(out);
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn text(&self) -> String {
        self.segments.concat()
    }
}
