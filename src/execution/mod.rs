//! Step graph execution

pub mod engine;
pub mod executor;
pub mod scheduler;

pub use engine::{CancelHandle, EventHandler, ExecutionEngine, ExecutionEvent};
pub use executor::{StepExecutor, StepOutcome};
pub use scheduler::{ExecutionScheduler, SchedulingStrategy};
