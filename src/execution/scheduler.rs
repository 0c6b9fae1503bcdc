//! Execution scheduler - determines which steps to run next

use crate::core::{RunnerConfig, StepGraph, StepId, StrategyKind};

/// Strategy for scheduling step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingStrategy {
    /// Execute steps in dependency order, one at a time
    #[default]
    Sequential,

    /// Execute all ready steps in parallel
    Parallel,

    /// Limited parallelism (max N concurrent steps)
    LimitedParallel(usize),
}

impl SchedulingStrategy {
    pub fn from_config(config: &RunnerConfig) -> Self {
        match (config.strategy, config.max_workers) {
            (StrategyKind::Sequential, _) => SchedulingStrategy::Sequential,
            (StrategyKind::Parallel, Some(n)) => SchedulingStrategy::LimitedParallel(n.max(1)),
            (StrategyKind::Parallel, None) => SchedulingStrategy::Parallel,
        }
    }

    fn capacity(&self) -> usize {
        match self {
            SchedulingStrategy::Sequential => 1,
            SchedulingStrategy::Parallel => usize::MAX,
            SchedulingStrategy::LimitedParallel(max) => (*max).max(1),
        }
    }
}

/// Scheduler for determining which steps to run
#[derive(Debug, Clone)]
pub struct ExecutionScheduler {
    strategy: SchedulingStrategy,
}

impl ExecutionScheduler {
    pub fn new(strategy: SchedulingStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    /// Get the next batch of steps to execute
    ///
    /// Steps without the parallel hint run alone: they wait for running
    /// steps to finish and nothing else starts while they run.
    pub fn next_steps(&self, graph: &StepGraph) -> Vec<StepId> {
        let running = graph.running_steps();
        let mut remaining = self.strategy.capacity().saturating_sub(running.len());

        if remaining == 0 {
            return vec![];
        }

        let exclusive_running = running
            .iter()
            .filter_map(|id| graph.step(*id))
            .any(|s| !s.parallel);
        if exclusive_running {
            return vec![];
        }

        let mut next = Vec::new();
        for id in graph.ready_steps() {
            if remaining == 0 {
                break;
            }
            let Some(step) = graph.step(id) else {
                continue;
            };
            if !step.parallel {
                if running.is_empty() && next.is_empty() {
                    next.push(id);
                }
                break;
            }
            next.push(id);
            remaining -= 1;
        }

        next
    }

    /// Check if there are more steps to run
    pub fn has_more(&self, graph: &StepGraph) -> bool {
        !self.next_steps(graph).is_empty()
    }
}
