//! Run state: which steps of a named run already finished
//!
//! The executor consults the run state before executing a step and records
//! every terminal transition, so an interrupted or repeated run only does the
//! work that is still missing.

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteRunStateStore;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Recorded outcome of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Satisfied,
    Completed,
    Failed,
    Aborted,
}

impl StepStatus {
    /// Satisfied or completed
    pub fn is_finished(&self) -> bool {
        matches!(self, StepStatus::Satisfied | StepStatus::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Satisfied => "Satisfied",
            StepStatus::Completed => "Completed",
            StepStatus::Failed => "Failed",
            StepStatus::Aborted => "Aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Satisfied" => Some(StepStatus::Satisfied),
            "Completed" => Some(StepStatus::Completed),
            "Failed" => Some(StepStatus::Failed),
            "Aborted" => Some(StepStatus::Aborted),
            _ => None,
        }
    }
}

/// Last recorded transition of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_name: String,
    pub status: StepStatus,
    /// Fingerprint of the step when the record was written
    pub fingerprint: String,
    pub updated_at: DateTime<Utc>,
}

impl StepRecord {
    pub fn new(step_name: impl Into<String>, status: StepStatus, fingerprint: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            status,
            fingerprint: fingerprint.into(),
            updated_at: Utc::now(),
        }
    }
}

/// Step records of one run, keyed by step name
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub run_name: String,
    pub steps: HashMap<String, StepRecord>,
}

impl RunState {
    pub fn new(run_name: impl Into<String>) -> Self {
        Self {
            run_name: run_name.into(),
            steps: HashMap::new(),
        }
    }

    pub fn get(&self, step_name: &str) -> Option<&StepRecord> {
        self.steps.get(step_name)
    }
}

/// Trait for run state backends
#[async_trait::async_trait]
pub trait RunStateStore: Send + Sync {
    /// Load every step record of a run; empty when the run is unknown
    async fn load(&self, run_name: &str) -> Result<RunState>;

    /// Insert or replace the record of one step
    async fn record_step(&self, run_name: &str, record: &StepRecord) -> Result<()>;

    /// List all run names
    async fn list_runs(&self) -> Result<Vec<String>>;

    /// Forget a run
    async fn clear_run(&self, run_name: &str) -> Result<()>;
}

/// In-memory run state (for testing or ephemeral use)
pub struct InMemoryRunState {
    runs: tokio::sync::RwLock<HashMap<String, HashMap<String, StepRecord>>>,
}

impl InMemoryRunState {
    pub fn new() -> Self {
        Self {
            runs: tokio::sync::RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryRunState {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RunStateStore for InMemoryRunState {
    async fn load(&self, run_name: &str) -> Result<RunState> {
        let runs = self.runs.read().await;
        Ok(RunState {
            run_name: run_name.to_string(),
            steps: runs.get(run_name).cloned().unwrap_or_default(),
        })
    }

    async fn record_step(&self, run_name: &str, record: &StepRecord) -> Result<()> {
        let mut runs = self.runs.write().await;
        runs.entry(run_name.to_string())
            .or_default()
            .insert(record.step_name.clone(), record.clone());
        Ok(())
    }

    async fn list_runs(&self) -> Result<Vec<String>> {
        let runs = self.runs.read().await;
        let mut names: Vec<String> = runs.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn clear_run(&self, run_name: &str) -> Result<()> {
        self.runs.write().await.remove(run_name);
        Ok(())
    }
}
