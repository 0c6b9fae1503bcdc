//! Step executor - runs individual steps

use crate::{
    core::{Step, StepAction, StepContext, StepFailure},
    persistence::StepRecord,
    process::ProcessRunner,
};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

/// Result of executing a step
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Step ran and its declared outputs exist
    Completed {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    },
    /// Step ran and failed
    Failed(StepFailure),
}

/// Executes a single step
pub struct StepExecutor<P> {
    runner: P,
}

impl<P: ProcessRunner> StepExecutor<P> {
    pub fn new(runner: P) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &P {
        &self.runner
    }

    /// Check whether a step can be skipped
    ///
    /// With verify files: all of them exist and the last recorded run of the
    /// step (if any) finished with the same fingerprint. Without verify
    /// files: the step is recorded as finished with the same fingerprint.
    pub fn is_satisfied(step: &Step, prior: Option<&StepRecord>) -> bool {
        if prior.is_some_and(|r| !r.status.is_finished()) {
            debug!("Step {} did not finish last time", step.name);
            return false;
        }
        let same_fingerprint = prior.map(|r| r.fingerprint == step.fingerprint);

        if step.verify_files.is_empty() {
            return prior.is_some_and(|r| r.status.is_finished()) && same_fingerprint == Some(true);
        }

        if same_fingerprint == Some(false) {
            debug!("Step {} changed since its last run", step.name);
            return false;
        }

        step.verify_files.iter().all(|f| f.exists())
    }

    /// Execute a step and return the outcome
    pub async fn execute(&self, step: &Step, context: StepContext) -> StepOutcome {
        info!("Executing step: {}", step.name);
        let started_at = Utc::now();

        let result = match &step.action {
            StepAction::Command(cmd) => {
                debug!("Command for step {}: {}", step.name, cmd);
                match self.runner.run(cmd).await {
                    Ok(output) if output.is_success() => Ok(()),
                    Ok(output) => {
                        let mut message = format!("exited with code {}", output.exit_code);
                        if !output.stderr.is_empty() {
                            message = format!("{}: {}", message, output.stderr);
                        }
                        Err(StepFailure {
                            step: step.name.clone(),
                            command: Some(cmd.to_string()),
                            exit_code: Some(output.exit_code),
                            message,
                        })
                    }
                    Err(e) => Err(StepFailure {
                        step: step.name.clone(),
                        command: Some(cmd.to_string()),
                        exit_code: None,
                        message: e.to_string(),
                    }),
                }
            }
            StepAction::Function { name, func } => {
                debug!("Function for step {}: {}", step.name, name);
                let func = func.clone();
                let joined = tokio::task::spawn_blocking(move || func(&context)).await;
                match joined {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(StepFailure {
                        step: step.name.clone(),
                        command: None,
                        exit_code: None,
                        message: e.to_string(),
                    }),
                    Err(e) => Err(StepFailure {
                        step: step.name.clone(),
                        command: None,
                        exit_code: None,
                        message: format!("{} panicked: {}", name, e),
                    }),
                }
            }
        };

        let result = result.and_then(|()| Self::check_outputs(step));

        match result {
            Ok(()) => {
                info!("Step {} completed", step.name);
                StepOutcome::Completed {
                    started_at,
                    completed_at: Utc::now(),
                }
            }
            Err(failure) => {
                error!("Step {} failed: {}", step.name, failure.message);
                StepOutcome::Failed(failure)
            }
        }
    }

    /// Every declared verify file must exist after a successful run
    fn check_outputs(step: &Step) -> Result<(), StepFailure> {
        match step.verify_files.iter().find(|f| !f.exists()) {
            Some(missing) => Err(StepFailure {
                step: step.name.clone(),
                command: step.action.command().map(|c| c.to_string()),
                exit_code: None,
                message: format!("declared output not produced: {}", missing.display()),
            }),
            None => Ok(()),
        }
    }
}
