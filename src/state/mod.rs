//! Durable state store.
//!
//! An embedded SQLite database under `.wave/state.db` is the only durable
//! surface of the engine. The store exposes two connection modes: a
//! single-connection writer for the executor (WAL journaling, busy
//! timeout, foreign keys enforced) and a larger read-only pool
//! (`query_only=ON`) for concurrent dashboard-style queries. Matrix
//! workers serialize their writes through the single writer.
//!
//! The schema is migration-managed; see [`migrations`].

pub mod migrations;

use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::error::WaveError;
use crate::events::Event;
use crate::types::{RunId, RunStatus, StepStatus};

/// SQLite busy timeout under write contention.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Read-only pool size for dashboard-style queries.
const READER_POOL_SIZE: u32 = 8;

// ============================================================================
// RECORDS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub pipeline_name: String,
    pub status: RunStatus,
    pub input: String,
    pub current_step: Option<String>,
    pub total_tokens: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub run_id: String,
    pub step_id: String,
    pub state: StepStatus,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub workspace_path: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub id: i64,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub step_id: Option<String>,
    pub state: String,
    pub persona: Option<String>,
    pub message: String,
    pub tokens_used: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactRecord {
    pub id: i64,
    pub run_id: String,
    pub step_id: String,
    pub name: String,
    pub path: String,
    pub artifact_type: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancellationRecord {
    pub run_id: String,
    pub requested_at: DateTime<Utc>,
    pub force: bool,
}

// ============================================================================
// LISTING FILTERS & CURSOR
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub pipeline: Option<String>,
    pub status: Option<RunStatus>,
    pub tag: Option<String>,
    pub older_than: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub step: Option<String>,
    pub errors_only: bool,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: u32,
}

/// Opaque keyset cursor over `(started_at DESC, run_id DESC)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub started_at: DateTime<Utc>,
    pub run_id: String,
}

impl Cursor {
    pub fn encode(&self) -> String {
        // Struct field order makes the JSON deterministic, so
        // decode-then-encode round-trips byte-for-byte.
        BASE64.encode(serde_json::to_string(self).unwrap_or_default())
    }

    pub fn decode(token: &str) -> Result<Self, WaveError> {
        let bytes = BASE64
            .decode(token)
            .map_err(|e| WaveError::state_store(format!("invalid cursor: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| WaveError::state_store(format!("invalid cursor: {e}")))
    }
}

// ============================================================================
// STORE
// ============================================================================

pub struct StateStore {
    writer: SqlitePool,
    reader: SqlitePool,
}

impl StateStore {
    /// Open (creating if missing) the store at `path` and bring the schema
    /// up to date per the environment's migration settings.
    pub async fn open(path: &Path) -> Result<Self, WaveError> {
        Self::open_with(path, &migrations::MigrationSettings::from_env()).await
    }

    pub async fn open_with(
        path: &Path,
        settings: &migrations::MigrationSettings,
    ) -> Result<Self, WaveError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer_options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);
        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(writer_options)
            .await?;

        migrations::apply(&writer, settings).await?;

        let reader_options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true)
            .pragma("query_only", "ON");
        let reader = SqlitePoolOptions::new()
            .max_connections(READER_POOL_SIZE)
            .connect_with(reader_options)
            .await?;

        Ok(Self { writer, reader })
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    pub async fn create_run(
        &self,
        run_id: &RunId,
        pipeline_name: &str,
        input: &str,
        tags: &[String],
    ) -> Result<RunRecord, WaveError> {
        let record = RunRecord {
            run_id: run_id.to_string(),
            pipeline_name: pipeline_name.to_string(),
            status: RunStatus::Pending,
            input: input.to_string(),
            current_step: None,
            total_tokens: 0,
            started_at: Utc::now(),
            completed_at: None,
            cancelled_at: None,
            error_message: None,
            tags: tags.to_vec(),
        };
        sqlx::query(
            "INSERT INTO pipeline_run \
             (run_id, pipeline_name, status, input, total_tokens, started_at, tags_json) \
             VALUES (?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(&record.run_id)
        .bind(&record.pipeline_name)
        .bind(record.status.as_str())
        .bind(&record.input)
        .bind(record.started_at.to_rfc3339())
        .bind(serde_json::to_string(&record.tags).unwrap_or_else(|_| "[]".into()))
        .execute(&self.writer)
        .await?;
        Ok(record)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, WaveError> {
        let row = sqlx::query("SELECT * FROM pipeline_run WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.reader)
            .await?;
        row.map(|r| run_from_row(&r)).transpose()
    }

    /// Transition the run's status. Terminal transitions are idempotent:
    /// once `completed`/`failed`/`cancelled` is recorded, later calls
    /// leave status and timestamps untouched.
    pub async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> Result<(), WaveError> {
        let current = self
            .get_run(run_id)
            .await?
            .ok_or_else(|| WaveError::state_store(format!("unknown run '{run_id}'")))?;
        if current.status.is_terminal() {
            return Ok(());
        }

        let now = Utc::now().to_rfc3339();
        let completed_at = status.is_terminal().then_some(now.clone());
        let cancelled_at = (status == RunStatus::Cancelled).then_some(now);

        sqlx::query(
            "UPDATE pipeline_run SET status = ?, \
             completed_at = COALESCE(completed_at, ?), \
             cancelled_at = COALESCE(cancelled_at, ?), \
             error_message = COALESCE(?, error_message) \
             WHERE run_id = ?",
        )
        .bind(status.as_str())
        .bind(completed_at)
        .bind(cancelled_at)
        .bind(error_message)
        .bind(run_id)
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    /// Explicitly reopen a run for `resume`. This is the only operation
    /// that moves a terminal run back to `running`; ordinary status
    /// updates never un-terminate a record.
    pub async fn reopen_run(&self, run_id: &str) -> Result<(), WaveError> {
        sqlx::query(
            "UPDATE pipeline_run SET status = 'running', \
             completed_at = NULL, cancelled_at = NULL, error_message = NULL \
             WHERE run_id = ?",
        )
        .bind(run_id)
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    pub async fn set_current_step(
        &self,
        run_id: &str,
        step_id: Option<&str>,
    ) -> Result<(), WaveError> {
        sqlx::query("UPDATE pipeline_run SET current_step = ? WHERE run_id = ?")
            .bind(step_id)
            .bind(run_id)
            .execute(&self.writer)
            .await?;
        Ok(())
    }

    /// Cumulative tokens are monotone non-decreasing: only deltas are
    /// added, never absolute writes.
    pub async fn add_tokens(&self, run_id: &str, delta: u64) -> Result<(), WaveError> {
        sqlx::query("UPDATE pipeline_run SET total_tokens = total_tokens + ? WHERE run_id = ?")
            .bind(delta as i64)
            .bind(run_id)
            .execute(&self.writer)
            .await?;
        Ok(())
    }

    /// Keyset-paginated listing over `(started_at DESC, run_id DESC)`.
    pub async fn list_runs(
        &self,
        filter: &RunFilter,
        cursor: Option<&Cursor>,
        limit: u32,
    ) -> Result<(Vec<RunRecord>, Option<Cursor>), WaveError> {
        let mut sql = String::from("SELECT * FROM pipeline_run WHERE 1=1");
        if filter.pipeline.is_some() {
            sql.push_str(" AND pipeline_name = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.tag.is_some() {
            sql.push_str(" AND tags_json LIKE ?");
        }
        if filter.older_than.is_some() {
            sql.push_str(" AND started_at < ?");
        }
        if cursor.is_some() {
            sql.push_str(" AND (started_at < ? OR (started_at = ? AND run_id < ?))");
        }
        sql.push_str(" ORDER BY started_at DESC, run_id DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(pipeline) = &filter.pipeline {
            query = query.bind(pipeline);
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(tag) = &filter.tag {
            query = query.bind(format!("%\"{tag}\"%"));
        }
        if let Some(older) = filter.older_than {
            query = query.bind(older.to_rfc3339());
        }
        if let Some(cursor) = cursor {
            let ts = cursor.started_at.to_rfc3339();
            query = query.bind(ts.clone()).bind(ts).bind(&cursor.run_id);
        }
        query = query.bind(limit as i64 + 1);

        let rows = query.fetch_all(&self.reader).await?;
        let mut records: Vec<RunRecord> = rows
            .iter()
            .map(run_from_row)
            .collect::<Result<_, _>>()?;

        let next = if records.len() > limit as usize {
            records.truncate(limit as usize);
            records.last().map(|last| Cursor {
                started_at: last.started_at,
                run_id: last.run_id.clone(),
            })
        } else {
            None
        };
        Ok((records, next))
    }

    /// Delete a run; events, artifacts, steps, and cancellation cascade
    /// through foreign keys.
    pub async fn delete_run(&self, run_id: &str) -> Result<bool, WaveError> {
        let result = sqlx::query("DELETE FROM pipeline_run WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.writer)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------

    pub async fn upsert_step(&self, record: &StepRecord) -> Result<(), WaveError> {
        sqlx::query(
            "INSERT INTO step_state \
             (run_id, step_id, state, retry_count, started_at, completed_at, updated_at, \
              workspace_path, error_message) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (run_id, step_id) DO UPDATE SET \
             state = excluded.state, retry_count = excluded.retry_count, \
             started_at = COALESCE(step_state.started_at, excluded.started_at), \
             completed_at = excluded.completed_at, updated_at = excluded.updated_at, \
             workspace_path = COALESCE(excluded.workspace_path, step_state.workspace_path), \
             error_message = excluded.error_message",
        )
        .bind(&record.run_id)
        .bind(&record.step_id)
        .bind(record.state.as_str())
        .bind(record.retry_count as i64)
        .bind(record.started_at.map(|t| t.to_rfc3339()))
        .bind(record.completed_at.map(|t| t.to_rfc3339()))
        .bind(record.updated_at.to_rfc3339())
        .bind(&record.workspace_path)
        .bind(&record.error_message)
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    pub async fn get_step(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> Result<Option<StepRecord>, WaveError> {
        let row = sqlx::query("SELECT * FROM step_state WHERE run_id = ? AND step_id = ?")
            .bind(run_id)
            .bind(step_id)
            .fetch_optional(&self.reader)
            .await?;
        row.map(|r| step_from_row(&r)).transpose()
    }

    pub async fn get_steps(&self, run_id: &str) -> Result<Vec<StepRecord>, WaveError> {
        let rows = sqlx::query("SELECT * FROM step_state WHERE run_id = ? ORDER BY step_id")
            .bind(run_id)
            .fetch_all(&self.reader)
            .await?;
        rows.iter().map(step_from_row).collect()
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Append one event. The log is append-only; nothing ever updates or
    /// deletes individual rows.
    pub async fn record_event(&self, event: &Event) -> Result<(), WaveError> {
        sqlx::query(
            "INSERT INTO event_log \
             (run_id, timestamp, step_id, state, persona, message, tokens_used, duration_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.run_id)
        .bind(event.timestamp.to_rfc3339())
        .bind(&event.step_id)
        .bind(&event.state)
        .bind(&event.persona)
        .bind(&event.message)
        .bind(event.tokens_used as i64)
        .bind(event.duration_ms as i64)
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    pub async fn list_events(
        &self,
        run_id: &str,
        filter: &EventFilter,
    ) -> Result<Vec<EventRecord>, WaveError> {
        let mut sql = String::from("SELECT * FROM event_log WHERE run_id = ?");
        if filter.step.is_some() {
            sql.push_str(" AND step_id = ?");
        }
        if filter.errors_only {
            sql.push_str(" AND state IN ('step_failed', 'step_retrying', 'pipeline_failed')");
        }
        if filter.since.is_some() {
            sql.push_str(" AND timestamp >= ?");
        }
        sql.push_str(" ORDER BY timestamp, id");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ? OFFSET ?");
        }

        let mut query = sqlx::query(&sql).bind(run_id);
        if let Some(step) = &filter.step {
            query = query.bind(step);
        }
        if let Some(since) = filter.since {
            query = query.bind(since.to_rfc3339());
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit as i64).bind(filter.offset as i64);
        }

        let rows = query.fetch_all(&self.reader).await?;
        rows.iter().map(event_from_row).collect()
    }

    // ------------------------------------------------------------------
    // Artifacts
    // ------------------------------------------------------------------

    /// Register an artifact; addressed exclusively by (run, step, name).
    pub async fn register_artifact(
        &self,
        run_id: &str,
        step_id: &str,
        name: &str,
        path: &str,
        artifact_type: &str,
        size_bytes: u64,
    ) -> Result<(), WaveError> {
        sqlx::query(
            "INSERT INTO artifact (run_id, step_id, name, path, type, size_bytes, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (run_id, step_id, name) DO UPDATE SET \
             path = excluded.path, type = excluded.type, \
             size_bytes = excluded.size_bytes, created_at = excluded.created_at",
        )
        .bind(run_id)
        .bind(step_id)
        .bind(name)
        .bind(path)
        .bind(artifact_type)
        .bind(size_bytes as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    pub async fn get_artifact(
        &self,
        run_id: &str,
        step_id: &str,
        name: &str,
    ) -> Result<Option<ArtifactRecord>, WaveError> {
        let row = sqlx::query(
            "SELECT * FROM artifact WHERE run_id = ? AND step_id = ? AND name = ?",
        )
        .bind(run_id)
        .bind(step_id)
        .bind(name)
        .fetch_optional(&self.reader)
        .await?;
        row.map(|r| artifact_from_row(&r)).transpose()
    }

    pub async fn list_artifacts(&self, run_id: &str) -> Result<Vec<ArtifactRecord>, WaveError> {
        let rows = sqlx::query("SELECT * FROM artifact WHERE run_id = ? ORDER BY step_id, name")
            .bind(run_id)
            .fetch_all(&self.reader)
            .await?;
        rows.iter().map(artifact_from_row).collect()
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    /// At most one flag per run; a later force request upgrades an
    /// existing non-force one.
    pub async fn request_cancellation(&self, run_id: &str, force: bool) -> Result<(), WaveError> {
        sqlx::query(
            "INSERT INTO cancellation (run_id, requested_at, force) VALUES (?, ?, ?) \
             ON CONFLICT (run_id) DO UPDATE SET \
             force = MAX(cancellation.force, excluded.force)",
        )
        .bind(run_id)
        .bind(Utc::now().to_rfc3339())
        .bind(force as i64)
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    pub async fn get_cancellation(
        &self,
        run_id: &str,
    ) -> Result<Option<CancellationRecord>, WaveError> {
        let row = sqlx::query("SELECT * FROM cancellation WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.reader)
            .await?;
        row.map(|r| {
            Ok(CancellationRecord {
                run_id: r.get("run_id"),
                requested_at: parse_ts(&r.get::<String, _>("requested_at"))?,
                force: r.get::<i64, _>("force") != 0,
            })
        })
        .transpose()
    }

    /// Cleared on resume so an old request does not cancel the new attempt.
    pub async fn clear_cancellation(&self, run_id: &str) -> Result<(), WaveError> {
        sqlx::query("DELETE FROM cancellation WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.writer)
            .await?;
        Ok(())
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn parse_ts(text: &str) -> Result<DateTime<Utc>, WaveError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| WaveError::state_store(format!("bad timestamp '{text}': {e}")))
}

fn parse_ts_opt(text: Option<String>) -> Result<Option<DateTime<Utc>>, WaveError> {
    text.map(|t| parse_ts(&t)).transpose()
}

fn run_from_row(row: &SqliteRow) -> Result<RunRecord, WaveError> {
    let status_text: String = row.get("status");
    let status = RunStatus::parse(&status_text)
        .ok_or_else(|| WaveError::state_store(format!("bad run status '{status_text}'")))?;
    let tags_json: String = row.get("tags_json");
    Ok(RunRecord {
        run_id: row.get("run_id"),
        pipeline_name: row.get("pipeline_name"),
        status,
        input: row.get("input"),
        current_step: row.get("current_step"),
        total_tokens: row.get::<i64, _>("total_tokens") as u64,
        started_at: parse_ts(&row.get::<String, _>("started_at"))?,
        completed_at: parse_ts_opt(row.get("completed_at"))?,
        cancelled_at: parse_ts_opt(row.get("cancelled_at"))?,
        error_message: row.get("error_message"),
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
    })
}

fn step_from_row(row: &SqliteRow) -> Result<StepRecord, WaveError> {
    let state_text: String = row.get("state");
    let state = StepStatus::parse(&state_text)
        .ok_or_else(|| WaveError::state_store(format!("bad step state '{state_text}'")))?;
    Ok(StepRecord {
        run_id: row.get("run_id"),
        step_id: row.get("step_id"),
        state,
        retry_count: row.get::<i64, _>("retry_count") as u32,
        started_at: parse_ts_opt(row.get("started_at"))?,
        completed_at: parse_ts_opt(row.get("completed_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
        workspace_path: row.get("workspace_path"),
        error_message: row.get("error_message"),
    })
}

fn event_from_row(row: &SqliteRow) -> Result<EventRecord, WaveError> {
    Ok(EventRecord {
        id: row.get("id"),
        run_id: row.get("run_id"),
        timestamp: parse_ts(&row.get::<String, _>("timestamp"))?,
        step_id: row.get("step_id"),
        state: row.get("state"),
        persona: row.get("persona"),
        message: row.get("message"),
        tokens_used: row.get::<i64, _>("tokens_used") as u64,
        duration_ms: row.get::<i64, _>("duration_ms") as u64,
    })
}

fn artifact_from_row(row: &SqliteRow) -> Result<ArtifactRecord, WaveError> {
    Ok(ArtifactRecord {
        id: row.get("id"),
        run_id: row.get("run_id"),
        step_id: row.get("step_id"),
        name: row.get("name"),
        path: row.get("path"),
        artifact_type: row.get("type"),
        size_bytes: row.get::<i64, _>("size_bytes") as u64,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
    })
}
