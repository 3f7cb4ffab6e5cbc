//! Checkpoint persistence for run state
//!
//! Checkpoints are append-only per run: every write carries the next sequence number and
//! `load` returns the latest one.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    FromRow, SqlitePool,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    workflow::{RunState, RunStatus},
    DeckflowError, Result,
};

/// Serialized snapshot of a run taken between stage transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: Uuid,
    pub sequence: u64,
    pub status: RunStatus,
    pub taken_at: DateTime<Utc>,
    pub state: RunState,
}

impl Checkpoint {
    /// Snapshot the state, advancing its checkpoint sequence
    pub fn capture(state: &mut RunState) -> Self {
        let sequence = state.next_checkpoint_sequence();
        Self {
            run_id: state.run_id,
            sequence,
            status: state.status(),
            taken_at: Utc::now(),
            state: state.clone(),
        }
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: Checkpoint) -> Result<()>;

    /// Latest checkpoint of a run
    async fn load(&self, run_id: Uuid) -> Result<Checkpoint>;

    /// Every checkpoint of a run in write order
    async fn history(&self, run_id: Uuid) -> Result<Vec<Checkpoint>>;
}

/// Process-local store, used by tests and one-shot runs
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<Uuid, Vec<Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<()> {
        let mut checkpoints = self.checkpoints.write().await;
        checkpoints.entry(checkpoint.run_id).or_default().push(checkpoint);
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Checkpoint> {
        let checkpoints = self.checkpoints.read().await;
        checkpoints
            .get(&run_id)
            .and_then(|history| history.iter().max_by_key(|c| c.sequence))
            .cloned()
            .ok_or(DeckflowError::CheckpointNotFound(run_id))
    }

    async fn history(&self, run_id: Uuid) -> Result<Vec<Checkpoint>> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints.get(&run_id).cloned().unwrap_or_default())
    }
}

#[derive(Debug, FromRow)]
struct CheckpointRow {
    run_id: Uuid,
    sequence: i64,
    status: String,
    state_json: String,
    taken_at: DateTime<Utc>,
}

impl CheckpointRow {
    fn into_checkpoint(self) -> Result<Checkpoint> {
        let state: RunState = serde_json::from_str(&self.state_json)?;
        tracing::trace!("[CHECKPOINT] Decoded {} checkpoint {} for run {}", self.status, self.sequence, self.run_id);
        Ok(Checkpoint {
            run_id: self.run_id,
            sequence: self.sequence.max(0) as u64,
            status: state.status(),
            taken_at: self.taken_at,
            state,
        })
    }
}

/// Durable store backed by a sqlite table of append-only rows
#[derive(Debug, Clone)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// Wrap an existing pool, creating the table if needed
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        bootstrap_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Open (or create) a database file
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        tracing::info!("[CHECKPOINT] Opened checkpoint database at {}", path.display());
        Self::new(pool).await
    }

    /// Private in-memory database
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::new(pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs whose latest checkpoint is not terminal
    pub async fn unfinished_runs(&self) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT c.run_id, c.status FROM run_checkpoints c
            WHERE c.sequence = (
                SELECT MAX(sequence) FROM run_checkpoints WHERE run_id = c.run_id
            )
            ORDER BY c.taken_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter(|(_, status)| status != RunStatus::Completed.as_str() && status != RunStatus::Failed.as_str())
            .map(|(run_id, _)| run_id)
            .collect())
    }
}

async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS run_checkpoints (
            run_id BLOB NOT NULL,
            sequence INTEGER NOT NULL,
            status TEXT NOT NULL,
            state_json TEXT NOT NULL,
            taken_at TEXT NOT NULL,
            PRIMARY KEY (run_id, sequence)
        );
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<()> {
        let state_json = serde_json::to_string(&checkpoint.state)?;

        sqlx::query(
            r#"
            INSERT INTO run_checkpoints (run_id, sequence, status, state_json, taken_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(checkpoint.run_id)
        .bind(checkpoint.sequence as i64)
        .bind(checkpoint.status.as_str())
        .bind(state_json)
        .bind(checkpoint.taken_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "[CHECKPOINT] Saved checkpoint {} ({}) for run {}",
            checkpoint.sequence,
            checkpoint.status,
            checkpoint.run_id
        );
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Checkpoint> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT run_id, sequence, status, state_json, taken_at
            FROM run_checkpoints
            WHERE run_id = ?1
            ORDER BY sequence DESC
            LIMIT 1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(DeckflowError::CheckpointNotFound(run_id))?;

        row.into_checkpoint()
    }

    async fn history(&self, run_id: Uuid) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT run_id, sequence, status, state_json, taken_at
            FROM run_checkpoints
            WHERE run_id = ?1
            ORDER BY sequence ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CheckpointRow::into_checkpoint).collect()
    }
}
