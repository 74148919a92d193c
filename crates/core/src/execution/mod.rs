//! Execution adapter for the external calculation binary.
//!
//! Validates a job payload, runs the binary as a bounded subprocess and
//! decodes its output into a [`CalculationResult`]. All process handling is
//! pure (no DB access) and lives in `core` so it can be tested in isolation.

pub mod output;
pub mod payload;
pub mod subprocess;

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

use crate::retry::{Failure, FailureKind};

pub use output::{decode_output, CalculationResult, DecodeError, DecodeSource};
pub use payload::{validate_payload, CalculationPayload};

/// Maximum stderr characters carried into an error message.
const MAX_STDERR_IN_ERROR: usize = 2000;

/// Errors from a single execution attempt.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Calculation binary not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Failed to start calculation: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Calculation timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Calculation failed with exit code {exit_code}: {stderr}")]
    ExecutionFailed { exit_code: i32, stderr: String },

    #[error(transparent)]
    OutputDecode(#[from] DecodeError),

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

impl ExecutionError {
    /// Failure category used for retry classification.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidPayload(_) => FailureKind::InvalidPayload,
            Self::NotFound(_) | Self::PermissionDenied(_) | Self::Spawn(_) => FailureKind::Spawn,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::ExecutionFailed { .. } | Self::Io(_) => FailureKind::Execution,
            Self::OutputDecode(_) => FailureKind::OutputParse,
        }
    }

    pub fn to_failure(&self) -> Failure {
        Failure::new(self.kind(), self.to_string())
    }
}

/// Anything that can turn a job payload into a calculation result.
///
/// [`ExecutionAdapter`] is the production implementation; tests substitute
/// in-process fakes.
pub trait CalculationRunner: Send + Sync {
    fn run(
        &self,
        payload: &Value,
    ) -> impl Future<Output = Result<CalculationResult, ExecutionError>> + Send;
}

/// How to invoke the external calculation binary.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub env_vars: Vec<(String, String)>,
    pub working_directory: Option<PathBuf>,
    /// Hard wall-clock limit per execution.
    pub timeout: Duration,
}

/// Runs the calculation binary for one payload.
#[derive(Debug, Clone)]
pub struct ExecutionAdapter {
    config: AdapterConfig,
}

impl ExecutionAdapter {
    pub fn new(config: AdapterConfig) -> Self {
        Self { config }
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Resolve the binary: absolute/relative paths must exist and be
    /// executable; bare names are left to `PATH` lookup at spawn time.
    async fn check_binary(&self) -> Result<(), ExecutionError> {
        let binary = &self.config.binary;
        if binary.components().count() <= 1 {
            return Ok(());
        }

        let display = binary.display().to_string();
        let metadata = tokio::fs::metadata(binary)
            .await
            .map_err(|_| ExecutionError::NotFound(display.clone()))?;

        let mode = metadata.permissions().mode();
        if mode & 0o111 == 0 {
            return Err(ExecutionError::PermissionDenied(format!(
                "{display} is not executable (mode {mode:#o})"
            )));
        }
        Ok(())
    }

    fn build_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.config.binary);
        cmd.args(&self.config.args);
        for (key, value) in &self.config.env_vars {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.config.working_directory {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl CalculationRunner for ExecutionAdapter {
    async fn run(&self, payload: &Value) -> Result<CalculationResult, ExecutionError> {
        validate_payload(payload).map_err(ExecutionError::InvalidPayload)?;
        self.check_binary().await?;

        let mut cmd = self.build_command();
        let output = subprocess::run_command(&mut cmd, payload, self.config.timeout).await?;

        tracing::debug!(
            exit_code = output.exit_code,
            duration_ms = output.duration_ms,
            stdout_bytes = output.stdout.len(),
            "Calculation process exited",
        );

        if output.exit_code != 0 {
            return Err(ExecutionError::ExecutionFailed {
                exit_code: output.exit_code,
                stderr: truncate(&output.stderr, MAX_STDERR_IN_ERROR),
            });
        }

        Ok(decode_output(&output.stdout)?)
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
