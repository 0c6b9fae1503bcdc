//! Main execution engine - drives a step graph to completion

use crate::{
    core::{
        FailurePolicy, RunResult, RunStatus, StepFailure, StepGraph, StepId, StepReport, StepState,
    },
    error::{PipelineError, Result},
    execution::{ExecutionScheduler, SchedulingStrategy, StepExecutor, StepOutcome},
    persistence::{RunState, RunStateStore, StepRecord, StepStatus},
    process::ProcessRunner,
};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Events that can occur during a run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    RunStarted {
        run_id: Uuid,
        run_name: String,
        total_steps: usize,
    },
    StepStarted {
        step: String,
        action: String,
    },
    StepSatisfied {
        step: String,
    },
    StepCompleted {
        step: String,
    },
    StepFailed {
        step: String,
        error: String,
    },
    StepAborted {
        step: String,
        reason: String,
    },
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Stops dispatching new steps; running steps finish normally
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Main execution engine
pub struct ExecutionEngine<P> {
    scheduler: ExecutionScheduler,
    executor: Arc<StepExecutor<P>>,
    policy: FailurePolicy,
    cancel: CancelHandle,
    event_handlers: Mutex<Vec<EventHandler>>,
}

impl<P: ProcessRunner + 'static> ExecutionEngine<P> {
    pub fn new(runner: P, strategy: SchedulingStrategy) -> Self {
        Self {
            scheduler: ExecutionScheduler::new(strategy),
            executor: Arc::new(StepExecutor::new(runner)),
            policy: FailurePolicy::default(),
            cancel: CancelHandle::default(),
            event_handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn runner(&self) -> &P {
        self.executor.runner()
    }

    /// Handle that stops the run between steps
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.event_handlers.lock() {
            handlers.push(Arc::new(handler));
        }
    }

    /// Emit an event to all handlers
    fn emit_event(&self, event: ExecutionEvent) {
        if let Ok(handlers) = self.event_handlers.lock() {
            for handler in handlers.iter() {
                handler(event.clone());
            }
        }
    }

    /// Execute every step of the graph, skipping satisfied ones
    ///
    /// The run state is keyed by the graph name. Step failures do not make
    /// this return `Err`; they are collected in the [`RunResult`].
    pub async fn run(&self, graph: &mut StepGraph, run_state: &dyn RunStateStore) -> Result<RunResult> {
        let run_id = Uuid::new_v4();
        let run_name = graph.name.clone();
        let started_at = Utc::now();

        let prior = run_state
            .load(&run_name)
            .await
            .map_err(|e| PipelineError::RunState(format!("{:#}", e)))?;

        info!("Starting run: {} ({}, {} steps)", run_name, run_id, graph.len());
        self.emit_event(ExecutionEvent::RunStarted {
            run_id,
            run_name: run_name.clone(),
            total_steps: graph.len(),
        });

        let mut tasks: JoinSet<(StepId, StepOutcome)> = JoinSet::new();
        let mut failures = Vec::new();
        let mut executed = 0;
        let mut cancelled = false;

        loop {
            if !cancelled && self.cancel.is_cancelled() {
                warn!("Run {} cancelled; waiting for {} running steps", run_name, tasks.len());
                cancelled = true;
            }

            if !cancelled {
                self.resolve_satisfied(graph, &prior, run_state).await?;

                for id in self.scheduler.next_steps(graph) {
                    let Some(step) = graph.step_mut(id) else {
                        continue;
                    };
                    step.state = StepState::Running { started_at: Utc::now() };
                    let step = step.clone();

                    self.emit_event(ExecutionEvent::StepStarted {
                        step: step.name.clone(),
                        action: step.action.describe(),
                    });

                    let context = graph.context_for(&step);
                    let executor = self.executor.clone();
                    executed += 1;
                    tasks.spawn(async move {
                        let outcome = executor.execute(&step, context).await;
                        (step.id, outcome)
                    });
                }
            }

            // Completions are applied one at a time, here
            match tasks.join_next().await {
                Some(joined) => {
                    let (id, outcome) = joined
                        .map_err(|e| PipelineError::Internal(format!("step task failed: {}", e)))?;
                    self.finish_step(graph, id, outcome, run_state, &mut failures).await?;
                }
                None => break,
            }
        }

        let reason = if cancelled { "run cancelled" } else { "unreachable" };
        for id in graph.pending_steps() {
            self.abort_step(graph, id, reason.to_string(), run_state).await?;
        }

        let status = if cancelled {
            RunStatus::Cancelled
        } else if failures.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };

        info!("Run finished: {} - {:?}", run_name, status);
        self.emit_event(ExecutionEvent::RunFinished { run_id, status });

        let steps = graph
            .execution_order()
            .iter()
            .filter_map(|id| graph.step(*id))
            .map(|s| StepReport {
                name: s.name.clone(),
                state: s.state.clone(),
            })
            .collect();

        Ok(RunResult {
            run_id,
            run_name,
            status,
            started_at,
            finished_at: Utc::now(),
            steps,
            failures,
            executed,
        })
    }

    /// Mark ready steps whose outputs already exist, repeating until no more
    /// become ready
    ///
    /// A step whose parent executed in this run is never satisfied; its
    /// outputs were derived from the parent's previous outputs.
    async fn resolve_satisfied(
        &self,
        graph: &mut StepGraph,
        prior: &RunState,
        run_state: &dyn RunStateStore,
    ) -> Result<()> {
        loop {
            let satisfied: Vec<StepId> = graph
                .ready_steps()
                .into_iter()
                .filter(|id| {
                    !graph.has_rerun_parent(*id)
                        && graph
                            .step(*id)
                            .is_some_and(|s| StepExecutor::<P>::is_satisfied(s, prior.get(&s.name)))
                })
                .collect();

            if satisfied.is_empty() {
                return Ok(());
            }

            for id in satisfied {
                let Some(step) = graph.step_mut(id) else {
                    continue;
                };
                step.state = StepState::Satisfied;
                info!("Step {} already satisfied", step.name);
                let record = StepRecord::new(step.name.clone(), StepStatus::Satisfied, step.fingerprint.clone());
                self.record(&graph.name, &record, run_state).await?;
                self.emit_event(ExecutionEvent::StepSatisfied { step: record.step_name });
            }
        }
    }

    /// Apply a step outcome and, on failure, the failure policy
    async fn finish_step(
        &self,
        graph: &mut StepGraph,
        id: StepId,
        outcome: StepOutcome,
        run_state: &dyn RunStateStore,
        failures: &mut Vec<StepFailure>,
    ) -> Result<()> {
        let Some(step) = graph.step_mut(id) else {
            return Err(PipelineError::Internal(format!("unknown step {}", id)));
        };
        let name = step.name.clone();
        let fingerprint = step.fingerprint.clone();

        match outcome {
            StepOutcome::Completed {
                started_at,
                completed_at,
            } => {
                step.state = StepState::Completed {
                    started_at,
                    completed_at,
                };
                let record = StepRecord::new(name.clone(), StepStatus::Completed, fingerprint);
                self.record(&graph.name, &record, run_state).await?;
                self.emit_event(ExecutionEvent::StepCompleted { step: name });
            }
            StepOutcome::Failed(failure) => {
                step.state = StepState::Failed {
                    error: failure.message.clone(),
                    command: failure.command.clone(),
                    exit_code: failure.exit_code,
                    failed_at: Utc::now(),
                };
                let record = StepRecord::new(name.clone(), StepStatus::Failed, fingerprint);
                self.record(&graph.name, &record, run_state).await?;
                self.emit_event(ExecutionEvent::StepFailed {
                    step: name.clone(),
                    error: failure.message.clone(),
                });
                failures.push(failure);

                let to_abort = match self.policy {
                    FailurePolicy::AbortDependents => graph.dependents_of(id),
                    FailurePolicy::AbortRun => graph.pending_steps(),
                };
                for dependent in to_abort {
                    if graph.step(dependent).is_some_and(|s| s.state == StepState::Pending) {
                        let reason = format!("step '{}' failed", name);
                        self.abort_step(graph, dependent, reason, run_state).await?;
                    }
                }
            }
        }

        Ok(())
    }

    async fn abort_step(
        &self,
        graph: &mut StepGraph,
        id: StepId,
        reason: String,
        run_state: &dyn RunStateStore,
    ) -> Result<()> {
        let Some(step) = graph.step_mut(id) else {
            return Ok(());
        };
        warn!("Aborting step {}: {}", step.name, reason);
        step.state = StepState::Aborted {
            reason: reason.clone(),
        };
        let record = StepRecord::new(step.name.clone(), StepStatus::Aborted, step.fingerprint.clone());
        self.record(&graph.name, &record, run_state).await?;
        self.emit_event(ExecutionEvent::StepAborted {
            step: record.step_name,
            reason,
        });
        Ok(())
    }

    async fn record(&self, run_name: &str, record: &StepRecord, run_state: &dyn RunStateStore) -> Result<()> {
        run_state.record_step(run_name, record).await.map_err(|e| {
            error!("Failed to record state of step {}: {:#}", record.step_name, e);
            PipelineError::RunState(format!("{:#}", e))
        })
    }
}
