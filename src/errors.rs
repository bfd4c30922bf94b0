//! Typed error hierarchy for the preview manager.
//!
//! Three top-level enums cover the three subsystems that surface
//! distinguishable failures to callers:
//! - `ProcessError`: external command spawn, wait and timeout failures
//! - `OverlayError`: shared base-file union mounts
//! - `PipelineError`: deployment pipeline step failures

use std::path::PathBuf;

use thiserror::Error;

/// Marker embedded in every timeout message so operators can tell a hung
/// step from one that exited with an error.
pub const TIMEOUT_MARKER: &str = "TIMEOUT";

/// Errors from running an external process.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TIMEOUT after {secs}s: {program}")]
    Timeout { program: String, secs: u64 },

    #[error("Failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProcessError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors from the overlay filesystem manager.
#[derive(Debug, Error)]
pub enum OverlayError {
    #[error(
        "Base files not found for project '{project}'. Upload the base files to {} first",
        .path.display()
    )]
    MissingBase { project: String, path: PathBuf },

    #[error("Failed to mount overlay at {}: {message}", .path.display())]
    Mount { path: PathBuf, message: String },

    #[error("Failed to prepare overlay directories: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a single deployment pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Base database dump not found: {}", .path.display())]
    MissingDump { path: PathBuf },

    #[error("Deploy script not found: {path} (configured in preview.yml deploy.{phase})")]
    MissingScript { path: String, phase: String },

    #[error("Step '{step}' failed with exit code {code}: {output}")]
    StepFailed {
        step: String,
        code: i32,
        output: String,
    },

    #[error("Step '{step}' TIMEOUT after {secs}s")]
    Timeout { step: String, secs: u64 },

    #[error("Database not ready after {attempts} attempts")]
    DatabaseNotReady { attempts: u32 },

    #[error(transparent)]
    Overlay(#[from] OverlayError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn from_process(step: &str, err: ProcessError) -> Self {
        match err {
            ProcessError::Timeout { secs, .. } => Self::Timeout {
                step: step.to_string(),
                secs,
            },
            other => Self::Other(anyhow::anyhow!("Step '{}': {}", step, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_base_says_where_to_upload() {
        let err = OverlayError::MissingBase {
            project: "shop".to_string(),
            path: PathBuf::from("/var/www/previews/.base-files/shop/files"),
        };
        let msg = err.to_string();
        assert!(msg.contains("'shop'"));
        assert!(msg.contains("Upload the base files to /var/www/previews/.base-files/shop/files"));
    }

    #[test]
    fn test_timeout_messages_carry_marker() {
        let process = ProcessError::Timeout {
            program: "docker".to_string(),
            secs: 300,
        };
        assert!(process.to_string().starts_with("TIMEOUT after 300s"));
        assert!(process.is_timeout());

        let step = PipelineError::from_process("composer-install", process);
        assert!(matches!(step, PipelineError::Timeout { secs: 300, .. }));
        assert!(step.to_string().contains(TIMEOUT_MARKER));
    }

    #[test]
    fn test_missing_script_names_path_and_phase() {
        let err = PipelineError::MissingScript {
            path: "scripts/nonexistent.sh".to_string(),
            phase: "update".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Deploy script not found: scripts/nonexistent.sh (configured in preview.yml deploy.update)"
        );
    }
}
