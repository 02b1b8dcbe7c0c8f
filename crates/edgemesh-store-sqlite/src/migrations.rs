//! Idempotent, versioned schema migrations (spec §6, §11), applied at
//! construction time before any store operation is accepted. Mirrors the
//! `schema_migrations`-table discipline of `db/migrate.py` in the original
//! implementation: each migration is keyed by a stable version string and
//! applied at most once.

use edgemesh_core::CoreResult;
use sqlx::SqlitePool;

use crate::error::map_sqlx_error;

/// `(version, sql)` pairs, applied in order. Append new migrations to the
/// end; never edit or reorder an already-shipped entry.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_create_nodes",
        r#"
        CREATE TABLE IF NOT EXISTS nodes (
            node_id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            ip TEXT NOT NULL,
            port INTEGER NOT NULL,
            capabilities TEXT NOT NULL,
            metrics TEXT NOT NULL,
            policy TEXT NOT NULL,
            status TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "0002_create_jobs",
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            job_type TEXT NOT NULL,
            status TEXT NOT NULL,
            payload_ref TEXT,
            assigned_node_id TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            total_tasks INTEGER NOT NULL DEFAULT 0,
            queued_tasks INTEGER NOT NULL DEFAULT 0,
            running_tasks INTEGER NOT NULL DEFAULT 0,
            completed_tasks INTEGER NOT NULL DEFAULT 0,
            failed_tasks INTEGER NOT NULL DEFAULT 0,
            total_retries INTEGER NOT NULL DEFAULT 0,
            assigned_nodes TEXT NOT NULL DEFAULT '[]',
            avg_task_duration_ms REAL,
            throughput_tasks_per_minute REAL
        )
        "#,
    ),
    (
        "0003_create_tasks",
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            task_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL,
            assigned_node_id TEXT,
            retries INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL,
            lease_expires_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_job_id ON tasks (job_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_queued ON tasks (status, created_at)
            WHERE status = 'QUEUED';
        CREATE INDEX IF NOT EXISTS idx_tasks_lease ON tasks (status, lease_expires_at)
            WHERE status = 'RUNNING';
        "#,
    ),
    (
        "0004_create_results",
        r#"
        CREATE TABLE IF NOT EXISTS results (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            node_id TEXT NOT NULL,
            success INTEGER NOT NULL,
            output TEXT,
            duration_ms INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_results_task_id ON results (task_id);
        CREATE INDEX IF NOT EXISTS idx_results_node_id ON results (node_id);
        CREATE INDEX IF NOT EXISTS idx_results_created_at ON results (created_at);
        "#,
    ),
];

pub async fn apply_migrations(pool: &SqlitePool) -> CoreResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(map_sqlx_error)?;

    for (version, sql) in MIGRATIONS {
        let already_applied: Option<(String,)> =
            sqlx::query_as("SELECT version FROM schema_migrations WHERE version = ?")
                .bind(version)
                .fetch_optional(pool)
                .await
                .map_err(map_sqlx_error)?;

        if already_applied.is_some() {
            continue;
        }

        let mut tx = pool.begin().await.map_err(map_sqlx_error)?;
        for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }
        sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, datetime('now'))")
            .bind(version)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;

        tracing::info!(version, "applied schema migration");
    }

    Ok(())
}
