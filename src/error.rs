//! Error taxonomy for graph construction, execution and result gathering

use crate::core::{RunResult, StepFailure};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the step runner
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad or missing parameter, or an input reference that resolves to nothing.
    /// Raised before any step executes.
    #[error("{0}")]
    Configuration(String),

    /// An external program exited with a non-zero status
    #[error("step '{step}' failed: `{command}` exited with code {exit_code}")]
    ExternalProcess {
        step: String,
        command: String,
        exit_code: i32,
    },

    /// A step failed for a reason other than a non-zero exit
    #[error("step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    /// Strict gathering found item outputs that were never written
    #[error("incomplete results: {} of {expected} item outputs missing (first missing: {})", missing.len(), missing.first().map(|p| p.display().to_string()).unwrap_or_default())]
    IncompleteResults {
        expected: usize,
        missing: Vec<PathBuf>,
    },

    /// Gathering failed after steps of the run failed; the run result is kept
    #[error("{source} (after {} failed step(s), first: {})", result.failures.len(), result.failures.first().map(|f| f.step.as_str()).unwrap_or_default())]
    GatherFailed {
        result: Box<RunResult>,
        #[source]
        source: Box<PipelineError>,
    },

    /// A required column is absent from a metadata row
    #[error("metadata format error: column '{column}' missing in {}", path.display())]
    MetadataFormat { column: String, path: PathBuf },

    /// A metadata file lacks the named block
    #[error("metadata format error: block '{block}' missing in {}", path.display())]
    MissingBlock { block: String, path: PathBuf },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process `{0}` timed out after {1} seconds")]
    Timeout(String, u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("run state error: {0}")]
    RunState(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn config(message: impl Into<String>) -> Self {
        PipelineError::Configuration(message.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, PipelineError::Configuration(_))
    }

    /// Step failures behind this error, if it carries a run result
    pub fn step_failures(&self) -> &[StepFailure] {
        match self {
            PipelineError::GatherFailed { result, .. } => &result.failures,
            _ => &[],
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for PipelineError {
    fn from(err: serde_yaml::Error) -> Self {
        PipelineError::Configuration(format!("invalid YAML: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
