//! cryoflow - step runner for cryo-EM processing protocols
//!
//! Protocols build a graph of steps that call external image-processing
//! programs or in-process functions; the execution engine runs the graph,
//! skipping work that is already done, and the gatherer turns the files the
//! steps wrote into output record sets.

pub mod core;
pub mod error;
pub mod execution;
pub mod gather;
pub mod logging;
pub mod metadata;
pub mod persistence;
pub mod process;
pub mod protocols;

// Re-export commonly used types
pub use crate::core::{
    CommandSpec, GraphBuilder, InputSets, ParamDecl, ParamValue, ParameterSet, Record, RecordSet,
    RunConfig, RunResult, RunStatus, Step, StepGraph, StepState,
};
pub use error::{PipelineError, Result};
pub use execution::{ExecutionEngine, ExecutionEvent, SchedulingStrategy};
pub use gather::{GatherMode, ResultGatherer};
pub use protocols::{launch, Protocol, ProtocolContext, ProtocolRunner};
