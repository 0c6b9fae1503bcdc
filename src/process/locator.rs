//! Tool lookup

use crate::error::{PipelineError, Result};
use crate::process::ToolLocator;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use tracing::debug;

/// Resolves tools from explicit overrides, then `$<home_env>/bin/<tool>`,
/// then `PATH`
#[derive(Debug, Clone)]
pub struct EnvToolLocator {
    home_env: String,
    overrides: BTreeMap<String, PathBuf>,
}

impl EnvToolLocator {
    pub fn new(home_env: impl Into<String>) -> Self {
        Self {
            home_env: home_env.into(),
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_overrides(mut self, overrides: BTreeMap<String, PathBuf>) -> Self {
        self.overrides.extend(overrides);
        self
    }

    pub fn with_override(mut self, tool: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.overrides.insert(tool.into(), path.into());
        self
    }
}

impl Default for EnvToolLocator {
    fn default() -> Self {
        Self::new("XMIPP_HOME")
    }
}

impl ToolLocator for EnvToolLocator {
    fn locate(&self, tool: &str) -> Result<PathBuf> {
        if let Some(path) = self.overrides.get(tool) {
            return Ok(path.clone());
        }

        if let Some(home) = env::var_os(&self.home_env) {
            let candidate = PathBuf::from(home).join("bin").join(tool);
            if candidate.is_file() {
                debug!("Resolved {} under ${}: {}", tool, self.home_env, candidate.display());
                return Ok(candidate);
            }
        }

        which::which(tool).map_err(|_| {
            PipelineError::config(format!(
                "tool '{}' not found (checked overrides, ${}/bin and PATH)",
                tool, self.home_env
            ))
        })
    }
}

/// Leaves tool names unresolved; the OS searches `PATH` when spawning
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityLocator;

impl ToolLocator for IdentityLocator {
    fn locate(&self, tool: &str) -> Result<PathBuf> {
        Ok(PathBuf::from(tool))
    }
}
