//! Run configuration from YAML

use crate::core::params::ParameterSet;
use crate::core::record::{InputSets, RecordSet};
use crate::error::{PipelineError, Result};
use crate::metadata::{labels, MetadataStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// How many steps may run at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// One step at a time, in dependency order
    #[default]
    Sequential,
    /// All ready steps, bounded by `max_workers` when set
    Parallel,
}

/// What happens to the rest of the run when a step fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort transitive dependents; independent branches keep running
    #[default]
    AbortDependents,
    /// Abort every step not yet started
    AbortRun,
}

/// Execution settings shared by all protocols
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub strategy: StrategyKind,

    /// Upper bound on concurrent steps for the parallel strategy
    pub max_workers: Option<usize>,

    pub failure_policy: FailurePolicy,

    /// Fail gathering when any item output is missing
    pub strict_gather: bool,

    /// Environment variable naming the tool installation root
    pub tool_home_env: String,

    /// Explicit tool name to executable overrides
    pub tools: BTreeMap<String, PathBuf>,

    /// Kill external processes running longer than this
    pub process_timeout_secs: Option<u64>,

    /// Run state database; `<workdir>/run_state.db` when unset
    pub state_db: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Sequential,
            max_workers: None,
            failure_policy: FailurePolicy::AbortDependents,
            strict_gather: false,
            tool_home_env: "XMIPP_HOME".to_string(),
            tools: BTreeMap::new(),
            process_timeout_secs: None,
            state_db: None,
        }
    }
}

/// Where to load one input record set from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Metadata file holding the records
    pub metadata: PathBuf,

    /// Block with the record rows
    #[serde(default)]
    pub block: Option<String>,

    /// Column holding each record's file location
    #[serde(default = "default_location_column")]
    pub location: String,

    /// Block whose first row holds shared values such as the sampling rate
    #[serde(default)]
    pub shared_block: Option<String>,
}

fn default_location_column() -> String {
    labels::IMAGE.to_string()
}

/// A protocol launch: which protocol, where, with what
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Registered protocol name
    pub protocol: String,

    /// Working directory of the run
    pub workdir: PathBuf,

    /// Name the run state is recorded under; defaults to the working directory
    #[serde(default)]
    pub run_name: Option<String>,

    #[serde(default)]
    pub params: serde_yaml::Mapping,

    #[serde(default)]
    pub inputs: BTreeMap<String, InputConfig>,

    #[serde(default)]
    pub runner: RunnerConfig,
}

impl RunConfig {
    /// Load run configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse run configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RunConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the run configuration
    pub fn validate(&self) -> Result<()> {
        if self.protocol.trim().is_empty() {
            return Err(PipelineError::config("protocol name is empty"));
        }
        if self.workdir.as_os_str().is_empty() {
            return Err(PipelineError::config("workdir is empty"));
        }
        if self.runner.max_workers == Some(0) {
            return Err(PipelineError::config("max_workers must be at least 1"));
        }
        if self.runner.process_timeout_secs == Some(0) {
            return Err(PipelineError::config("process_timeout_secs must be at least 1"));
        }
        for (name, input) in &self.inputs {
            if input.metadata.as_os_str().is_empty() {
                return Err(PipelineError::config(format!(
                    "input '{}' has no metadata file",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn run_name(&self) -> String {
        self.run_name
            .clone()
            .unwrap_or_else(|| self.workdir.display().to_string())
    }

    /// Parameters as written, not yet validated against a protocol
    pub fn parameter_set(&self) -> Result<ParameterSet> {
        ParameterSet::from_yaml_mapping(&self.params)
    }

    /// Load every configured input record set
    pub fn load_inputs(&self, store: &dyn MetadataStore) -> Result<InputSets> {
        let mut inputs = InputSets::new();
        for (name, input) in &self.inputs {
            let set = RecordSet::load(
                store,
                &input.metadata,
                input.block.as_deref(),
                &input.location,
                input.shared_block.as_deref(),
            )?;
            inputs.insert(name.clone(), set);
        }
        Ok(inputs)
    }
}
