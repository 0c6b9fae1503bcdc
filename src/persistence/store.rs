//! SQLite-based run state store

use crate::persistence::{RunState, RunStateStore, StepRecord, StepStatus};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

/// File name of the run state database inside a working directory
pub const DEFAULT_DB_NAME: &str = "run_state.db";

/// SQLite run state store
pub struct SqliteRunStateStore {
    pool: SqlitePool,
}

impl SqliteRunStateStore {
    /// Open (creating if needed) the database at `db_path`
    pub async fn new(db_path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
            .context("Invalid database path")?
            .create_if_missing(true);
        Self::connect(options).await
    }

    /// Private database that lives as long as the store
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("Invalid in-memory database options")?;
        Self::connect(options).await
    }

    /// Store kept next to the outputs of a run, at `<workdir>/run_state.db`
    pub async fn in_workdir(workdir: &Path) -> Result<Self> {
        std::fs::create_dir_all(workdir)
            .with_context(|| format!("Failed to create {}", workdir.display()))?;
        Self::new(&workdir.join(DEFAULT_DB_NAME)).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self> {
        // One connection: every `:memory:` connection is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS step_state (
                run_name TEXT NOT NULL,
                step_name TEXT NOT NULL,
                status TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (run_name, step_name)
            );

            CREATE INDEX IF NOT EXISTS idx_step_state_run ON step_state(run_name);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize schema")?;

        Ok(())
    }

    /// Convert DateTime<Utc> to NaiveDateTime for SQLite
    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    /// Convert NaiveDateTime to DateTime<Utc>
    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }
}

#[async_trait::async_trait]
impl RunStateStore for SqliteRunStateStore {
    async fn load(&self, run_name: &str) -> Result<RunState> {
        let rows = sqlx::query(
            r#"
            SELECT step_name, status, fingerprint, updated_at
            FROM step_state
            WHERE run_name = ?1
            "#,
        )
        .bind(run_name)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load run state")?;

        let mut state = RunState::new(run_name);
        for row in rows {
            let status: String = row.get("status");
            let record = StepRecord {
                step_name: row.get("step_name"),
                status: StepStatus::parse(&status)
                    .ok_or_else(|| anyhow!("Unknown step status '{}'", status))?,
                fingerprint: row.get("fingerprint"),
                updated_at: Self::from_naive(row.get("updated_at")),
            };
            state.steps.insert(record.step_name.clone(), record);
        }

        Ok(state)
    }

    async fn record_step(&self, run_name: &str, record: &StepRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO step_state
            (run_name, step_name, status, fingerprint, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(run_name)
        .bind(&record.step_name)
        .bind(record.status.as_str())
        .bind(&record.fingerprint)
        .bind(Self::to_naive(record.updated_at))
        .execute(&self.pool)
        .await
        .context("Failed to record step state")?;

        Ok(())
    }

    async fn list_runs(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT run_name
            FROM step_state
            ORDER BY run_name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list runs")?;

        Ok(rows.iter().map(|row| row.get("run_name")).collect())
    }

    async fn clear_run(&self, run_name: &str) -> Result<()> {
        sqlx::query("DELETE FROM step_state WHERE run_name = ?1")
            .bind(run_name)
            .execute(&self.pool)
            .await
            .context("Failed to clear run")?;

        Ok(())
    }
}
