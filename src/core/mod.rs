//! Core domain models
//!
//! Parameters, records, steps and the step graph a protocol builds, plus the
//! run configuration and state types the executor works with.

pub mod command;
pub mod config;
pub mod context;
pub mod graph;
pub mod params;
pub mod paths;
pub mod record;
pub mod state;
pub mod step;

pub use command::CommandSpec;
pub use config::{FailurePolicy, RunConfig, RunnerConfig, StrategyKind};
pub use context::StepContext;
pub use graph::{GraphBuilder, StepGraph};
pub use params::{ParamDecl, ParamKind, ParamValue, ParameterSet};
pub use paths::RunPaths;
pub use record::{InputSets, Record, RecordSet};
pub use state::{RunResult, RunStatus, StepFailure, StepReport, StepState};
pub use step::{Step, StepAction, StepId, StepRole};
