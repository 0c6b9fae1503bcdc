//! Protocol wrappers
//!
//! A protocol declares its parameters, turns validated parameters and input
//! record sets into a [`StepGraph`], and after the run gathers what the steps
//! wrote into output record sets. [`ProtocolRunner`] drives the whole
//! sequence; [`launch`] does it from a [`RunConfig`].

pub mod cryolo;
pub mod downsample;
pub mod rct;
pub mod resolution_3d;
pub mod structure_mapping;

use crate::core::{
    CommandSpec, GraphBuilder, InputSets, ParamDecl, ParameterSet, RecordSet, RunConfig, RunPaths,
    RunResult, RunStatus, Step, StepContext, StepGraph,
};
use crate::error::{PipelineError, Result};
use crate::execution::{ExecutionEngine, SchedulingStrategy};
use crate::gather::GatherMode;
use crate::metadata::{JsonMetadataStore, MetadataStore};
use crate::persistence::RunStateStore;
use crate::process::locator::{EnvToolLocator, IdentityLocator};
use crate::process::subprocess::SubprocessRunner;
use crate::process::{ProcessRunner, ToolLocator};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub use cryolo::CryoloPicking;
pub use downsample::DownsampleMicrographs;
pub use rct::RandomConicalTilt;
pub use resolution_3d::Resolution3D;
pub use structure_mapping::StructureMapping;

/// Output record sets by name
pub type ProtocolOutputs = BTreeMap<String, RecordSet>;

/// Everything a protocol needs to build its graph and gather results
#[derive(Clone)]
pub struct ProtocolContext {
    /// Key of the run state
    pub run_name: String,
    /// Validated parameters
    pub params: Arc<ParameterSet>,
    pub inputs: InputSets,
    pub paths: RunPaths,
    pub tools: Arc<dyn ToolLocator>,
    pub store: Arc<dyn MetadataStore>,
    pub gather_mode: GatherMode,
}

impl std::fmt::Debug for ProtocolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolContext")
            .field("run_name", &self.run_name)
            .field("params", &self.params)
            .field("inputs", &self.inputs)
            .field("paths", &self.paths)
            .field("gather_mode", &self.gather_mode)
            .finish_non_exhaustive()
    }
}

impl ProtocolContext {
    /// Validate `params` against the protocol's declarations and checks
    ///
    /// Every problem is reported at once as a configuration error, before
    /// any graph exists.
    pub fn for_protocol(
        protocol: &dyn Protocol,
        run_name: impl Into<String>,
        paths: RunPaths,
        params: &ParameterSet,
        inputs: InputSets,
    ) -> Result<Self> {
        let params = params.validate(&protocol.params())?;

        let problems = protocol.validate(&params, &inputs);
        if !problems.is_empty() {
            return Err(PipelineError::config(problems.join("; ")));
        }

        Ok(Self {
            run_name: run_name.into(),
            params: Arc::new(params),
            inputs,
            paths,
            tools: Arc::new(IdentityLocator),
            store: Arc::new(JsonMetadataStore::new()),
            gather_mode: GatherMode::default(),
        })
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolLocator>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_gather_mode(mut self, mode: GatherMode) -> Self {
        self.gather_mode = mode;
        self
    }

    /// Builder named after the run, so run state lookups use the run name
    pub fn graph_builder(&self) -> GraphBuilder {
        GraphBuilder::new(&self.run_name)
            .with_paths(self.paths.clone())
            .with_params(self.params.clone())
    }

    /// Command for a tool, resolved now and run from the working directory
    pub fn command(&self, tool: &str) -> Result<CommandSpec> {
        let program = self.tools.locate(tool)?;
        Ok(CommandSpec::new(program).working_dir(self.paths.root()))
    }

    /// Creates the run directories; satisfied once they exist
    pub fn setup_step(&self) -> Step {
        Step::function("create_dirs", "create_dirs", |ctx: &StepContext| {
            ctx.paths.create_dirs()?;
            Ok(())
        })
        .verify(self.paths.extra_dir())
        .verify(self.paths.tmp_dir())
    }
}

/// A processing protocol
pub trait Protocol: Send + Sync {
    /// Registry name
    fn name(&self) -> &'static str;

    /// Declared parameters
    fn params(&self) -> Vec<ParamDecl>;

    /// Checks beyond parameter kinds; each message is one problem
    fn validate(&self, _params: &ParameterSet, _inputs: &InputSets) -> Vec<String> {
        Vec::new()
    }

    /// Steps of the run in dependency order
    fn build_graph(&self, ctx: &ProtocolContext) -> Result<StepGraph>;

    /// Output record sets from whatever the run produced
    fn gather(&self, _ctx: &ProtocolContext, _result: &RunResult) -> Result<ProtocolOutputs> {
        Ok(ProtocolOutputs::new())
    }

    /// Human readable lines describing the run
    fn summary(&self, _ctx: &ProtocolContext, result: &RunResult) -> Vec<String> {
        vec![format!(
            "{}: {} steps completed, {} already satisfied, {} failed",
            self.name(),
            result.completed_steps(),
            result.satisfied_steps(),
            result.failed_steps()
        )]
    }
}

/// All registered protocol names
pub fn names() -> &'static [&'static str] {
    &[
        downsample::NAME,
        resolution_3d::NAME,
        structure_mapping::NAME,
        cryolo::NAME,
        rct::NAME,
    ]
}

/// Look up a protocol by its registry name
pub fn by_name(name: &str) -> Option<Box<dyn Protocol>> {
    match name {
        downsample::NAME => Some(Box::new(DownsampleMicrographs)),
        resolution_3d::NAME => Some(Box::new(Resolution3D)),
        structure_mapping::NAME => Some(Box::new(StructureMapping)),
        cryolo::NAME => Some(Box::new(CryoloPicking)),
        rct::NAME => Some(Box::new(RandomConicalTilt)),
        _ => None,
    }
}

/// What a protocol run left behind
#[derive(Debug)]
pub struct ProtocolRun {
    pub result: RunResult,
    pub outputs: ProtocolOutputs,
    pub summary: Vec<String>,
}

/// Builds, executes and gathers protocols
pub struct ProtocolRunner<P> {
    engine: ExecutionEngine<P>,
    run_state: Arc<dyn RunStateStore>,
}

impl<P: ProcessRunner + 'static> ProtocolRunner<P> {
    pub fn new(engine: ExecutionEngine<P>, run_state: Arc<dyn RunStateStore>) -> Self {
        Self { engine, run_state }
    }

    pub fn engine(&self) -> &ExecutionEngine<P> {
        &self.engine
    }

    pub fn run_state(&self) -> &Arc<dyn RunStateStore> {
        &self.run_state
    }

    /// Build the graph, execute it and gather the outputs
    ///
    /// Step failures are reported in [`ProtocolRun::result`]; gathering
    /// still runs over the partial outputs unless the run was cancelled.
    /// When gathering then fails, the error keeps the run result.
    pub async fn run(&self, protocol: &dyn Protocol, ctx: &ProtocolContext) -> Result<ProtocolRun> {
        let mut graph = protocol.build_graph(ctx)?;
        info!(
            "Protocol {} built {} steps for run {}",
            protocol.name(),
            graph.len(),
            ctx.run_name
        );

        let result = self.engine.run(&mut graph, self.run_state.as_ref()).await?;

        let outputs = if result.status == RunStatus::Cancelled {
            warn!("Run {} cancelled; nothing gathered", ctx.run_name);
            ProtocolOutputs::new()
        } else {
            match protocol.gather(ctx, &result) {
                Ok(outputs) => outputs,
                Err(err) if !result.failures.is_empty() => {
                    return Err(PipelineError::GatherFailed {
                        result: Box::new(result),
                        source: Box::new(err),
                    })
                }
                Err(err) => return Err(err),
            }
        };

        let summary = protocol.summary(ctx, &result);
        for line in &summary {
            info!("{}", line);
        }

        Ok(ProtocolRun {
            result,
            outputs,
            summary,
        })
    }
}

/// Open the run state named by the configuration
///
/// Without `state_db` the state lives in `<workdir>/run_state.db`, so a
/// relaunch skips finished steps; interactive steps have no output to
/// check and rely on it. Without the sqlite feature the state is in memory.
pub async fn open_run_state(
    config: &crate::core::RunnerConfig,
    workdir: &Path,
) -> Result<Arc<dyn RunStateStore>> {
    match &config.state_db {
        #[cfg(feature = "sqlite")]
        None => {
            let store = crate::persistence::SqliteRunStateStore::in_workdir(workdir)
                .await
                .map_err(|e| PipelineError::RunState(format!("{:#}", e)))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "sqlite"))]
        None => {
            warn!(
                "No sqlite feature; run state for {} is kept in memory",
                workdir.display()
            );
            Ok(Arc::new(crate::persistence::InMemoryRunState::new()))
        }
        #[cfg(feature = "sqlite")]
        Some(path) => {
            let store = crate::persistence::SqliteRunStateStore::new(path)
                .await
                .map_err(|e| PipelineError::RunState(format!("{:#}", e)))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "sqlite"))]
        Some(path) => Err(PipelineError::config(format!(
            "state_db {} needs the sqlite feature",
            path.display()
        ))),
    }
}

/// Run a protocol as described by a run configuration
pub async fn launch(config: &RunConfig) -> Result<ProtocolRun> {
    config.validate()?;

    let protocol = by_name(&config.protocol).ok_or_else(|| {
        PipelineError::config(format!(
            "unknown protocol '{}' (known: {})",
            config.protocol,
            names().join(", ")
        ))
    })?;

    let store: Arc<dyn MetadataStore> = Arc::new(JsonMetadataStore::new());
    let inputs = config.load_inputs(store.as_ref())?;
    let tools = EnvToolLocator::new(config.runner.tool_home_env.clone())
        .with_overrides(config.runner.tools.clone());
    let mode = if config.runner.strict_gather {
        GatherMode::Strict
    } else {
        GatherMode::Lenient
    };

    let ctx = ProtocolContext::for_protocol(
        protocol.as_ref(),
        config.run_name(),
        RunPaths::new(PathBuf::from(&config.workdir)),
        &config.parameter_set()?,
        inputs,
    )?
    .with_tools(Arc::new(tools))
    .with_store(store)
    .with_gather_mode(mode);

    let runner = SubprocessRunner::new().with_timeout(config.runner.process_timeout_secs);
    let engine = ExecutionEngine::new(runner, SchedulingStrategy::from_config(&config.runner))
        .with_failure_policy(config.runner.failure_policy);

    let run_state = open_run_state(&config.runner, &config.workdir).await?;
    ProtocolRunner::new(engine, run_state).run(protocol.as_ref(), &ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_knows_every_name() {
        for name in names() {
            let protocol = by_name(name).unwrap();
            assert_eq!(protocol.name(), *name);
        }
        assert!(by_name("ml2d").is_none());
    }

    #[test]
    fn test_validation_messages_become_configuration_error() {
        let protocol = DownsampleMicrographs;
        let params = ParameterSet::new()
            .with("input_micrographs", crate::core::ParamValue::Reference("mics".into()))
            .with("downsample_factor", crate::core::ParamValue::Float(0.5));
        let inputs = InputSets::new().with("mics", RecordSet::new());

        let err = ProtocolContext::for_protocol(&protocol, "run", RunPaths::new("/w"), &params, inputs)
            .err()
            .unwrap();
        assert!(err.is_configuration());
        assert_eq!(err.to_string(), "Downsampling must be larger than 1");
    }

    #[tokio::test]
    async fn test_launch_unknown_protocol() {
        let config = RunConfig::from_yaml("protocol: ml2d\nworkdir: /w\n").unwrap();
        let err = launch(&config).await.unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("unknown protocol 'ml2d'"));
    }

    #[test]
    fn test_command_runs_in_workdir() {
        let ctx = ProtocolContext::for_protocol(
            &Resolution3D,
            "run",
            RunPaths::new("/work/res"),
            &ParameterSet::new()
                .with("input_volume", crate::core::ParamValue::Path("/data/v.vol".into()))
                .with("sampling_rate", crate::core::ParamValue::Float(1.0))
                .with("do_fsc", crate::core::ParamValue::Bool(false)),
            InputSets::new(),
        )
        .unwrap();
        let cmd = ctx.command("xmipp_volume_structure_factor").unwrap();
        assert_eq!(cmd.working_dir.as_deref(), Some(std::path::Path::new("/work/res")));
        assert_eq!(cmd.program_name(), "xmipp_volume_structure_factor");
    }
}
