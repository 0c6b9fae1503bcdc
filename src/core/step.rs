//! Step domain model

use crate::core::{command::CommandSpec, context::StepContext, state::StepState};
use crate::error::Result;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Index of a step within its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StepId(pub usize);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Phase a step belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepRole {
    /// Directory creation, input conversion
    Setup,
    /// Work on one input item
    Item,
    /// Collect per-item outputs
    Gather,
    /// Anything after gathering
    Finalize,
}

/// In-process step body
pub type StepFn = Arc<dyn Fn(&StepContext) -> Result<()> + Send + Sync>;

/// What a step does when executed
#[derive(Clone)]
pub enum StepAction {
    /// Run a function on the blocking pool
    Function { name: String, func: StepFn },
    /// Spawn an external program
    Command(CommandSpec),
}

impl StepAction {
    pub fn function<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&StepContext) -> Result<()> + Send + Sync + 'static,
    {
        StepAction::Function {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn command(&self) -> Option<&CommandSpec> {
        match self {
            StepAction::Command(cmd) => Some(cmd),
            StepAction::Function { .. } => None,
        }
    }

    /// Rendered command line, or the function name
    pub fn describe(&self) -> String {
        match self {
            StepAction::Function { name, .. } => format!("{}()", name),
            StepAction::Command(cmd) => cmd.to_string(),
        }
    }
}

impl fmt::Debug for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepAction::Function { name, .. } => f.debug_struct("Function").field("name", name).finish(),
            StepAction::Command(cmd) => f.debug_tuple("Command").field(cmd).finish(),
        }
    }
}

/// A single step in a graph
#[derive(Debug, Clone)]
pub struct Step {
    /// Assigned when the step is added to a graph builder
    pub id: StepId,

    /// Unique step name
    pub name: String,

    pub action: StepAction,

    /// Files the step reads
    pub inputs: Vec<PathBuf>,

    /// Files whose existence means the step has already run
    pub verify_files: Vec<PathBuf>,

    /// Steps that must be terminal before this one starts
    pub parents: Vec<StepId>,

    /// May run concurrently with other steps
    pub parallel: bool,

    pub role: StepRole,

    /// Identifies the work the step does; a change forces re-execution
    pub fingerprint: String,

    /// Runtime state
    pub state: StepState,
}

impl Step {
    pub fn new(name: impl Into<String>, action: StepAction) -> Self {
        let fingerprint = action.describe();
        Step {
            id: StepId(0),
            name: name.into(),
            action,
            inputs: Vec::new(),
            verify_files: Vec::new(),
            parents: Vec::new(),
            parallel: false,
            role: StepRole::Setup,
            fingerprint,
            state: StepState::Pending,
        }
    }

    pub fn command(name: impl Into<String>, cmd: CommandSpec) -> Self {
        Self::new(name, StepAction::Command(cmd))
    }

    pub fn function<F>(name: impl Into<String>, func_name: &str, func: F) -> Self
    where
        F: Fn(&StepContext) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(name, StepAction::function(func_name, func))
    }

    pub fn after(mut self, parent: StepId) -> Self {
        if !self.parents.contains(&parent) {
            self.parents.push(parent);
        }
        self
    }

    pub fn after_all(mut self, parents: impl IntoIterator<Item = StepId>) -> Self {
        for parent in parents {
            self = self.after(parent);
        }
        self
    }

    pub fn verify(mut self, path: impl Into<PathBuf>) -> Self {
        self.verify_files.push(path.into());
        self
    }

    pub fn input(mut self, path: impl Into<PathBuf>) -> Self {
        self.inputs.push(path.into());
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn role(mut self, role: StepRole) -> Self {
        self.role = role;
        self
    }

    /// Fold extra values (such as parameters read by a function step) into
    /// the fingerprint
    pub fn fingerprint_with(mut self, extra: impl fmt::Display) -> Self {
        self.fingerprint = format!("{} [{}]", self.fingerprint, extra);
        self
    }

    pub fn is_interactive(&self) -> bool {
        self.action.command().map(|c| c.interactive).unwrap_or(false)
    }
}
