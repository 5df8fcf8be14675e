//! Embedded schema migrations.
//!
//! Every schema change is a numbered migration with a description and a
//! checksum; each is applied in its own transaction and recorded in
//! `schema_migrations`. Integrity validation compares the stored checksum
//! against a normalized hash of the known migration source, so drift
//! between a database and the binary that opens it is detected even when
//! no migration needs to run.
//!
//! Behavior is gated by environment variables:
//!
//! | Variable | Default | Effect |
//! |----------|---------|--------|
//! | `WAVE_MIGRATION_ENABLED` | true | disable all migration handling |
//! | `WAVE_AUTO_MIGRATE` | true | apply pending migrations on open |
//! | `WAVE_SKIP_MIGRATION_VALIDATION` | false | skip checksum comparison |
//! | `WAVE_MAX_MIGRATION_VERSION` | 0 | cap applied versions (0 = no cap) |

use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};

use crate::error::WaveError;

pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
}

/// Migration history. 0001 predates the current engine and carries the
/// legacy `pipeline_state` table, kept for forward compatibility; new
/// runs are tracked exclusively in `pipeline_run` + `step_state`.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "legacy pipeline_state table",
        sql: r#"
CREATE TABLE IF NOT EXISTS pipeline_state (
    pipeline_id TEXT PRIMARY KEY,
    status      TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
"#,
    },
    Migration {
        version: 2,
        description: "run tracking: pipeline_run, step_state, event_log, artifact",
        sql: r#"
CREATE TABLE IF NOT EXISTS pipeline_run (
    run_id        TEXT PRIMARY KEY,
    pipeline_name TEXT NOT NULL,
    status        TEXT NOT NULL,
    input         TEXT NOT NULL DEFAULT '',
    current_step  TEXT,
    total_tokens  INTEGER NOT NULL DEFAULT 0,
    started_at    TEXT NOT NULL,
    completed_at  TEXT,
    cancelled_at  TEXT,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_pipeline_run_listing
    ON pipeline_run (started_at DESC, run_id DESC);

CREATE TABLE IF NOT EXISTS step_state (
    run_id         TEXT NOT NULL REFERENCES pipeline_run(run_id) ON DELETE CASCADE,
    step_id        TEXT NOT NULL,
    state          TEXT NOT NULL,
    retry_count    INTEGER NOT NULL DEFAULT 0,
    started_at     TEXT,
    completed_at   TEXT,
    updated_at     TEXT NOT NULL,
    workspace_path TEXT,
    error_message  TEXT,
    PRIMARY KEY (run_id, step_id)
);

CREATE TABLE IF NOT EXISTS event_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id      TEXT NOT NULL REFERENCES pipeline_run(run_id) ON DELETE CASCADE,
    timestamp   TEXT NOT NULL,
    step_id     TEXT,
    state       TEXT NOT NULL,
    persona     TEXT,
    message     TEXT NOT NULL,
    tokens_used INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_event_log_run
    ON event_log (run_id, timestamp, id);

CREATE TABLE IF NOT EXISTS artifact (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id     TEXT NOT NULL REFERENCES pipeline_run(run_id) ON DELETE CASCADE,
    step_id    TEXT NOT NULL,
    name       TEXT NOT NULL,
    path       TEXT NOT NULL,
    type       TEXT NOT NULL,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE (run_id, step_id, name)
);
"#,
    },
    Migration {
        version: 3,
        description: "cancellation flags and run tags",
        sql: r#"
CREATE TABLE IF NOT EXISTS cancellation (
    run_id       TEXT PRIMARY KEY REFERENCES pipeline_run(run_id) ON DELETE CASCADE,
    requested_at TEXT NOT NULL,
    force        INTEGER NOT NULL DEFAULT 0
);

ALTER TABLE pipeline_run ADD COLUMN tags_json TEXT NOT NULL DEFAULT '[]';
"#,
    },
];

/// Normalized SHA-256 over a migration's SQL: per-line trim, blank lines
/// dropped, so formatting-only edits do not read as drift.
pub fn checksum(sql: &str) -> String {
    let mut hasher = Sha256::new();
    for line in sql.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Environment-derived migration behavior.
#[derive(Debug, Clone)]
pub struct MigrationSettings {
    pub enabled: bool,
    pub auto_migrate: bool,
    pub skip_validation: bool,
    /// 0 means no cap.
    pub max_version: i64,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_migrate: true,
            skip_validation: false,
            max_version: 0,
        }
    }
}

impl MigrationSettings {
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("WAVE_MIGRATION_ENABLED", true),
            auto_migrate: env_bool("WAVE_AUTO_MIGRATE", true),
            skip_validation: env_bool("WAVE_SKIP_MIGRATION_VALIDATION", false),
            max_version: std::env::var("WAVE_MAX_MIGRATION_VERSION")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        }
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Apply pending migrations and validate applied ones. Returns the number
/// of migrations applied in this call.
pub async fn apply(pool: &SqlitePool, settings: &MigrationSettings) -> Result<usize, WaveError> {
    if !settings.enabled {
        tracing::debug!("migrations disabled via WAVE_MIGRATION_ENABLED");
        return Ok(0);
    }

    sqlx::raw_sql(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version     INTEGER PRIMARY KEY,
    description TEXT NOT NULL,
    applied_at  TEXT NOT NULL,
    checksum    TEXT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    let mut applied = 0;
    for migration in MIGRATIONS {
        if settings.max_version > 0 && migration.version > settings.max_version {
            break;
        }

        let recorded: Option<String> =
            sqlx::query("SELECT checksum FROM schema_migrations WHERE version = ?")
                .bind(migration.version)
                .fetch_optional(pool)
                .await?
                .map(|row| row.get::<String, _>("checksum"));

        match recorded {
            Some(stored) => {
                if !settings.skip_validation && stored != checksum(migration.sql) {
                    return Err(WaveError::state_store(format!(
                        "migration {:04} checksum drift: database has {stored}, binary expects {}",
                        migration.version,
                        checksum(migration.sql)
                    )));
                }
            }
            None => {
                if !settings.auto_migrate {
                    return Err(WaveError::state_store(format!(
                        "migration {:04} is pending and WAVE_AUTO_MIGRATE is off",
                        migration.version
                    )));
                }
                let mut tx = pool.begin().await?;
                sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;
                sqlx::query(
                    "INSERT INTO schema_migrations (version, description, applied_at, checksum) \
                     VALUES (?, ?, ?, ?)",
                )
                .bind(migration.version)
                .bind(migration.description)
                .bind(chrono::Utc::now().to_rfc3339())
                .bind(checksum(migration.sql))
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applied migration"
                );
                applied += 1;
            }
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_pool() -> SqlitePool {
        sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[test]
    fn versions_are_strictly_increasing() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }

    #[test]
    fn checksum_ignores_formatting_only_changes() {
        let a = "CREATE TABLE t (a TEXT);\n";
        let b = "  CREATE TABLE t (a TEXT);  \n\n";
        assert_eq!(checksum(a), checksum(b));
        assert_ne!(checksum(a), checksum("CREATE TABLE t (b TEXT);"));
    }

    #[tokio::test]
    async fn applies_all_migrations_once() {
        let pool = memory_pool().await;
        let settings = MigrationSettings::default();

        let first = apply(&pool, &settings).await.unwrap();
        assert_eq!(first, MIGRATIONS.len());

        // Second call validates checksums and applies nothing.
        let second = apply(&pool, &settings).await.unwrap();
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn max_version_caps_application() {
        let pool = memory_pool().await;
        let settings = MigrationSettings {
            max_version: 1,
            ..Default::default()
        };
        assert_eq!(apply(&pool, &settings).await.unwrap(), 1);

        // Raising the cap applies the rest.
        let settings = MigrationSettings::default();
        assert_eq!(apply(&pool, &settings).await.unwrap(), MIGRATIONS.len() - 1);
    }

    #[tokio::test]
    async fn checksum_drift_is_detected() {
        let pool = memory_pool().await;
        apply(&pool, &MigrationSettings::default()).await.unwrap();

        sqlx::query("UPDATE schema_migrations SET checksum = 'tampered' WHERE version = 2")
            .execute(&pool)
            .await
            .unwrap();

        let err = apply(&pool, &MigrationSettings::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("drift"));

        // Skip-validation lets a drifted database open anyway.
        let settings = MigrationSettings {
            skip_validation: true,
            ..Default::default()
        };
        apply(&pool, &settings).await.unwrap();
    }

    #[tokio::test]
    async fn pending_without_auto_migrate_errors() {
        let pool = memory_pool().await;
        let settings = MigrationSettings {
            auto_migrate: false,
            ..Default::default()
        };
        let err = apply(&pool, &settings).await.unwrap_err();
        assert!(err.to_string().contains("pending"));
    }

    #[tokio::test]
    async fn disabled_migrations_do_nothing() {
        let pool = memory_pool().await;
        let settings = MigrationSettings {
            enabled: false,
            ..Default::default()
        };
        assert_eq!(apply(&pool, &settings).await.unwrap(), 0);
    }
}
