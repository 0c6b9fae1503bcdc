//! External program invocation
//!
//! Steps never spawn processes directly; they go through a [`ProcessRunner`]
//! so tests can substitute a recording runner, and through a [`ToolLocator`]
//! so program paths are resolved once, at graph build time.

pub mod locator;
pub mod subprocess;

use crate::core::CommandSpec;
use crate::error::Result;
use async_trait::async_trait;
use std::path::PathBuf;

pub use locator::{EnvToolLocator, IdentityLocator};
pub use subprocess::SubprocessRunner;

/// Result of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit status; -1 when terminated by a signal
    pub exit_code: i32,

    /// Captured standard error (empty for interactive commands)
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success() -> Self {
        Self {
            exit_code: 0,
            stderr: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Trait for running external commands - allows for different implementations
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run the command to completion. A non-zero exit is reported in the
    /// output, not as an error; errors mean the process could not run.
    async fn run(&self, command: &CommandSpec) -> Result<ProcessOutput>;
}

/// Resolves tool names to executables
pub trait ToolLocator: Send + Sync {
    fn locate(&self, tool: &str) -> Result<PathBuf>;
}
