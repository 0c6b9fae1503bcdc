//! Test utility functions for cryoflow scenarios

#![allow(dead_code)]

use async_trait::async_trait;
use cryoflow::core::{InputSets, ParamValue, ParameterSet, Record, RecordSet, RunPaths, RunStatus, StepState};
use cryoflow::error::Result;
use cryoflow::execution::{ExecutionEngine, ExecutionEvent, SchedulingStrategy};
use cryoflow::metadata::labels;
use cryoflow::persistence::{InMemoryRunState, RunStateStore};
use cryoflow::process::{ProcessOutput, ProcessRunner};
use cryoflow::protocols::{Protocol, ProtocolContext, ProtocolRun, ProtocolRunner};
use cryoflow::CommandSpec;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Flags whose value names a file the program writes
const OUTPUT_FLAGS: [&str; 3] = ["-o", "--apply", "-doc"];

/// Process runner that records every command and writes the files named
/// after output flags instead of running anything
#[derive(Clone, Default)]
pub struct MockRunner {
    calls: Arc<Mutex<Vec<CommandSpec>>>,
    fail_patterns: Arc<Vec<String>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands whose rendered arguments contain any pattern exit with 1
    pub fn failing_on(patterns: &[&str]) -> Self {
        Self {
            calls: Arc::default(),
            fail_patterns: Arc::new(patterns.iter().map(|p| p.to_string()).collect()),
        }
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Number of invocations of a program, by file name
    pub fn calls_to(&self, program: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.program_name() == program)
            .count()
    }
}

#[async_trait]
impl ProcessRunner for MockRunner {
    async fn run(&self, command: &CommandSpec) -> Result<ProcessOutput> {
        self.calls.lock().unwrap().push(command.clone());

        let rendered = command.argument_string();
        if self.fail_patterns.iter().any(|p| rendered.contains(p.as_str())) {
            return Ok(ProcessOutput {
                exit_code: 1,
                stderr: "mock failure".to_string(),
            });
        }

        for flag in OUTPUT_FLAGS {
            if let Some(path) = command.value_of(flag) {
                let path = Path::new(path);
                // Output directories are written into, not replaced
                if path.is_dir() {
                    continue;
                }
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, b"")?;
            }
        }

        Ok(ProcessOutput::success())
    }
}

/// Protocol runner around a mock, with its own in-memory run state
pub fn runner(mock: MockRunner, strategy: SchedulingStrategy) -> ProtocolRunner<MockRunner> {
    let state: Arc<dyn RunStateStore> = Arc::new(InMemoryRunState::new());
    ProtocolRunner::new(ExecutionEngine::new(mock, strategy), state)
}

/// Record events of a runner's engine
pub fn record_events(runner: &ProtocolRunner<MockRunner>) -> Arc<Mutex<Vec<ExecutionEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    runner.engine().add_event_handler(move |event| {
        sink.lock().unwrap().push(event);
    });
    events
}

/// Micrographs `<dir>/raw/<name>.tif` with sampling rate 1.4
pub fn micrographs(dir: &Path, names: &[&str]) -> RecordSet {
    let mut set = RecordSet::from_records(
        names
            .iter()
            .enumerate()
            .map(|(i, name)| Record::new(i as u64 + 1, dir.join("raw").join(format!("{}.tif", name))))
            .collect(),
    )
    .unwrap();
    set.set_shared(labels::SAMPLING_RATE, 1.4);
    set
}

/// Volumes `/data/vol<i>.vol` with sampling rate 2.0
pub fn volumes(n: u64) -> RecordSet {
    let mut set = RecordSet::from_records(
        (1..=n)
            .map(|i| Record::new(i, PathBuf::from(format!("/data/vol{}.vol", i))))
            .collect(),
    )
    .unwrap();
    set.set_shared(labels::SAMPLING_RATE, 2.0);
    set
}

/// Validated context for the downsampling protocol
pub fn downsample_context(workdir: &Path, set: RecordSet, factor: f64) -> Result<ProtocolContext> {
    let protocol = cryoflow::protocols::DownsampleMicrographs;
    let params = ParameterSet::new()
        .with("input_micrographs", ParamValue::Reference("micrographs".into()))
        .with("downsample_factor", ParamValue::Float(factor));
    ProtocolContext::for_protocol(
        &protocol,
        "downsample",
        RunPaths::new(workdir),
        &params,
        InputSets::new().with("micrographs", set),
    )
}

pub async fn run_protocol(
    runner: &ProtocolRunner<MockRunner>,
    protocol: &dyn Protocol,
    ctx: &ProtocolContext,
) -> Result<ProtocolRun> {
    runner.run(protocol, ctx).await
}

pub fn assert_run_completed(run: &ProtocolRun) {
    assert_eq!(
        run.result.status,
        RunStatus::Completed,
        "run failed: {:?}",
        run.result.failures
    );
}

pub fn assert_step_state(run: &ProtocolRun, step: &str, expected: &str) {
    let state = run
        .result
        .state_of(step)
        .unwrap_or_else(|| panic!("step '{}' not in run", step));
    assert_eq!(state.label(), expected, "unexpected state of '{}': {:?}", step, state);
}

pub fn all_satisfied(run: &ProtocolRun) -> bool {
    run.result
        .steps
        .iter()
        .all(|s| matches!(s.state, StepState::Satisfied))
}

/// Positions of `StepStarted` / `StepCompleted` events by step name
pub fn event_index(events: &[ExecutionEvent], step: &str, started: bool) -> Option<usize> {
    events.iter().position(|e| match e {
        ExecutionEvent::StepStarted { step: s, .. } if started => s == step,
        ExecutionEvent::StepCompleted { step: s } if !started => s == step,
        _ => false,
    })
}
