//! Execution state models

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Run has not started
    Pending,
    /// Run is dispatching steps
    Running,
    /// Every step is satisfied or completed
    Completed,
    /// At least one step failed
    Failed,
    /// Dispatch was stopped through a cancel handle
    Cancelled,
}

/// State of a single step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepState {
    /// Waiting for parents
    Pending,
    /// Handed to a process or the blocking pool
    Running { started_at: DateTime<Utc> },
    /// Outputs already present; not executed this run
    Satisfied,
    /// Executed successfully
    Completed {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    },
    /// Executed and failed
    Failed {
        error: String,
        command: Option<String>,
        exit_code: Option<i32>,
        failed_at: DateTime<Utc>,
    },
    /// Never executed because a parent failed or the run was cancelled
    Aborted { reason: String },
}

impl StepState {
    /// Check if step is in a terminal state
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepState::Pending | StepState::Running { .. })
    }

    /// Satisfied or completed; dependents may run
    pub fn is_success(&self) -> bool {
        matches!(self, StepState::Satisfied | StepState::Completed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            StepState::Pending => "pending",
            StepState::Running { .. } => "running",
            StepState::Satisfied => "satisfied",
            StepState::Completed { .. } => "completed",
            StepState::Failed { .. } => "failed",
            StepState::Aborted { .. } => "aborted",
        }
    }
}

/// Why a step failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step: String,
    pub command: Option<String>,
    pub exit_code: Option<i32>,
    pub message: String,
}

impl StepFailure {
    pub fn into_error(self) -> PipelineError {
        match (self.command, self.exit_code) {
            (Some(command), Some(exit_code)) => PipelineError::ExternalProcess {
                step: self.step,
                command,
                exit_code,
            },
            _ => PipelineError::StepFailed {
                step: self.step,
                message: self.message,
            },
        }
    }
}

/// Final state of one step in a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub name: String,
    pub state: StepState,
}

/// Outcome of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Unique execution ID
    pub run_id: Uuid,

    /// Name the run state is recorded under
    pub run_name: String,

    pub status: RunStatus,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,

    /// Final state of every step, in execution order
    pub steps: Vec<StepReport>,

    /// Failures in the order they were observed
    pub failures: Vec<StepFailure>,

    /// Number of steps actually executed (not satisfied)
    pub executed: usize,
}

impl RunResult {
    fn count(&self, pred: impl Fn(&StepState) -> bool) -> usize {
        self.steps.iter().filter(|s| pred(&s.state)).count()
    }

    pub fn completed_steps(&self) -> usize {
        self.count(|s| matches!(s, StepState::Completed { .. }))
    }

    pub fn satisfied_steps(&self) -> usize {
        self.count(|s| matches!(s, StepState::Satisfied))
    }

    pub fn failed_steps(&self) -> usize {
        self.count(|s| matches!(s, StepState::Failed { .. }))
    }

    pub fn aborted_steps(&self) -> usize {
        self.count(|s| matches!(s, StepState::Aborted { .. }))
    }

    pub fn state_of(&self, name: &str) -> Option<&StepState> {
        self.steps.iter().find(|s| s.name == name).map(|s| &s.state)
    }

    /// Fraction of steps in a terminal state (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 1.0;
        }
        self.count(StepState::is_terminal) as f64 / self.steps.len() as f64
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Err with the first failure, if any
    pub fn into_result(self) -> Result<RunResult> {
        match self.failures.first() {
            Some(failure) => Err(failure.clone().into_error()),
            None if self.status == RunStatus::Cancelled => {
                Err(PipelineError::Internal(format!("run '{}' was cancelled", self.run_name)))
            }
            None => Ok(self),
        }
    }
}
