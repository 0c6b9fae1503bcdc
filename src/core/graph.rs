//! Step graph construction and traversal

use crate::core::{
    context::StepContext,
    params::ParameterSet,
    paths::RunPaths,
    state::StepState,
    step::{Step, StepId, StepRole},
};
use crate::error::{PipelineError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Collects steps and dependencies, then validates them into a [`StepGraph`]
#[derive(Debug)]
pub struct GraphBuilder {
    name: String,
    paths: RunPaths,
    params: Arc<ParameterSet>,
    steps: Vec<Step>,
}

impl GraphBuilder {
    /// `name` keys the run state of the graph
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            paths: RunPaths::new("."),
            params: Arc::new(ParameterSet::new()),
            steps: Vec::new(),
        }
    }

    pub fn with_paths(mut self, paths: RunPaths) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_params(mut self, params: Arc<ParameterSet>) -> Self {
        self.params = params;
        self
    }

    /// Add a step, returning the id later steps can depend on
    pub fn add_step(&mut self, mut step: Step) -> StepId {
        let id = StepId(self.steps.len());
        step.id = id;
        self.steps.push(step);
        id
    }

    /// Make `child` wait for `parent`
    pub fn add_dependency(&mut self, child: StepId, parent: StepId) -> Result<()> {
        let step = self.steps.get_mut(child.0).ok_or_else(|| {
            PipelineError::config(format!("unknown step {} in dependency", child))
        })?;
        if !step.parents.contains(&parent) {
            step.parents.push(parent);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Validate names and parents, reject cycles and compute the order
    pub fn build(self) -> Result<StepGraph> {
        let mut names = HashSet::new();
        for step in &self.steps {
            if !names.insert(step.name.as_str()) {
                return Err(PipelineError::config(format!(
                    "duplicate step name '{}'",
                    step.name
                )));
            }
            for parent in &step.parents {
                if parent.0 >= self.steps.len() {
                    return Err(PipelineError::config(format!(
                        "step '{}' depends on unknown step {}",
                        step.name, parent
                    )));
                }
                if *parent == step.id {
                    return Err(PipelineError::config(format!(
                        "step '{}' depends on itself",
                        step.name
                    )));
                }
            }
        }

        Self::check_cycles(&self.steps)?;
        let execution_order = Self::topological_sort(&self.steps);

        let by_name = self
            .steps
            .iter()
            .map(|s| (s.name.clone(), s.id))
            .collect();

        debug!("Built graph '{}' with {} steps", self.name, self.steps.len());

        Ok(StepGraph {
            name: self.name,
            paths: self.paths,
            params: self.params,
            steps: self.steps,
            by_name,
            execution_order,
        })
    }

    fn check_cycles(steps: &[Step]) -> Result<()> {
        fn has_cycle(
            id: StepId,
            steps: &[Step],
            visited: &mut HashSet<StepId>,
            stack: &mut HashSet<StepId>,
        ) -> Option<StepId> {
            visited.insert(id);
            stack.insert(id);

            for parent in &steps[id.0].parents {
                if !visited.contains(parent) {
                    if let Some(found) = has_cycle(*parent, steps, visited, stack) {
                        return Some(found);
                    }
                } else if stack.contains(parent) {
                    return Some(*parent);
                }
            }

            stack.remove(&id);
            None
        }

        let mut visited = HashSet::new();
        let mut stack = HashSet::new();

        for step in steps {
            if !visited.contains(&step.id) {
                if let Some(found) = has_cycle(step.id, steps, &mut visited, &mut stack) {
                    return Err(PipelineError::config(format!(
                        "circular dependency involving step '{}'",
                        steps[found.0].name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Depth-first order; insertion order breaks ties
    fn topological_sort(steps: &[Step]) -> Vec<StepId> {
        let mut result = Vec::with_capacity(steps.len());
        let mut visited = HashSet::new();

        for step in steps {
            Self::visit(step.id, steps, &mut visited, &mut result);
        }

        result
    }

    fn visit(id: StepId, steps: &[Step], visited: &mut HashSet<StepId>, result: &mut Vec<StepId>) {
        if !visited.insert(id) {
            return;
        }

        for parent in &steps[id.0].parents {
            Self::visit(*parent, steps, visited, result);
        }

        result.push(id);
    }
}

/// Validated, acyclic set of steps
///
/// The structure is fixed after [`GraphBuilder::build`]; only step states
/// change while a run is in progress.
#[derive(Debug)]
pub struct StepGraph {
    pub name: String,
    paths: RunPaths,
    params: Arc<ParameterSet>,
    steps: Vec<Step>,
    by_name: HashMap<String, StepId>,
    execution_order: Vec<StepId>,
}

impl StepGraph {
    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    pub fn params(&self) -> &Arc<ParameterSet> {
        &self.params
    }

    /// Context handed to the step's function when it runs
    pub fn context_for(&self, step: &Step) -> StepContext {
        StepContext::new(step.name.clone(), self.paths.clone(), self.params.clone())
    }

    pub fn step(&self, id: StepId) -> Option<&Step> {
        self.steps.get(id.0)
    }

    pub fn step_mut(&mut self, id: StepId) -> Option<&mut Step> {
        self.steps.get_mut(id.0)
    }

    pub fn step_by_name(&self, name: &str) -> Option<&Step> {
        self.by_name.get(name).and_then(|id| self.step(*id))
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step ids in topological order
    pub fn execution_order(&self) -> &[StepId] {
        &self.execution_order
    }

    /// Step names in topological order
    pub fn ordered_names(&self) -> Vec<&str> {
        self.execution_order
            .iter()
            .map(|id| self.steps[id.0].name.as_str())
            .collect()
    }

    /// Pending steps whose parents all succeeded, in execution order
    pub fn ready_steps(&self) -> Vec<StepId> {
        self.execution_order
            .iter()
            .copied()
            .filter(|id| {
                let step = &self.steps[id.0];
                step.state == StepState::Pending
                    && step
                        .parents
                        .iter()
                        .all(|p| self.steps[p.0].state.is_success())
            })
            .collect()
    }

    /// Whether a parent of `id` executed in this run
    pub fn has_rerun_parent(&self, id: StepId) -> bool {
        self.steps[id.0]
            .parents
            .iter()
            .any(|p| matches!(self.steps[p.0].state, StepState::Completed { .. }))
    }

    pub fn running_steps(&self) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|s| matches!(s.state, StepState::Running { .. }))
            .map(|s| s.id)
            .collect()
    }

    pub fn pending_steps(&self) -> Vec<StepId> {
        self.execution_order
            .iter()
            .copied()
            .filter(|id| self.steps[id.0].state == StepState::Pending)
            .collect()
    }

    /// Every step that transitively depends on `id`
    pub fn dependents_of(&self, id: StepId) -> Vec<StepId> {
        let mut found: HashSet<StepId> = HashSet::new();
        let mut frontier = vec![id];

        while let Some(current) = frontier.pop() {
            for step in &self.steps {
                if step.parents.contains(&current) && found.insert(step.id) {
                    frontier.push(step.id);
                }
            }
        }

        self.execution_order
            .iter()
            .copied()
            .filter(|s| found.contains(s))
            .collect()
    }

    pub fn steps_with_role(&self, role: StepRole) -> Vec<&Step> {
        self.execution_order
            .iter()
            .map(|id| &self.steps[id.0])
            .filter(|s| s.role == role)
            .collect()
    }

    /// Check if every step reached a terminal state
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.state.is_terminal())
    }
}
