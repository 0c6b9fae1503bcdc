//! Subprocess runner backed by `tokio::process`

use crate::core::CommandSpec;
use crate::error::{PipelineError, Result};
use crate::process::{ProcessOutput, ProcessRunner};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Runs commands as child processes
#[derive(Debug, Clone, Default)]
pub struct SubprocessRunner {
    /// Kill the child after this many seconds
    timeout_secs: Option<u64>,
}

impl SubprocessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout_secs: Option<u64>) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    fn build(spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(spec.argv()).envs(&spec.env).kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        if spec.interactive {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }
        cmd
    }
}

#[async_trait]
impl ProcessRunner for SubprocessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput> {
        debug!("Spawning: {}", spec);

        let child = Self::build(spec).spawn().map_err(|e| PipelineError::Spawn {
            program: spec.program.display().to_string(),
            source: e,
        })?;

        // Interactive programs wait on the user, never on a timer
        let output = match self.timeout_secs.filter(|_| !spec.interactive) {
            Some(secs) => timeout(Duration::from_secs(secs), child.wait_with_output())
                .await
                .map_err(|_| PipelineError::Timeout(spec.to_string(), secs))??,
            None => child.wait_with_output().await?,
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if exit_code != 0 {
            warn!("{} exited with code {}: {}", spec.program_name(), exit_code, stderr);
        } else {
            debug!("{} finished", spec.program_name());
        }

        Ok(ProcessOutput { exit_code, stderr })
    }
}
