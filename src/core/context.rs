//! Step context - what an in-process step function can see

use crate::core::params::ParameterSet;
use crate::core::paths::RunPaths;
use std::path::Path;
use std::sync::Arc;

/// Execution context handed to in-process step functions
///
/// Parameters are shared read-only across every step of the run.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Name of the step being executed
    pub step_name: String,

    /// Working directory layout of the run
    pub paths: RunPaths,

    /// Validated protocol parameters
    pub params: Arc<ParameterSet>,
}

impl StepContext {
    pub fn new(step_name: impl Into<String>, paths: RunPaths, params: Arc<ParameterSet>) -> Self {
        Self {
            step_name: step_name.into(),
            paths,
            params,
        }
    }

    pub fn workdir(&self) -> &Path {
        self.paths.root()
    }
}
