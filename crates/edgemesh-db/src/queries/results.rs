//! Database query functions for the append-only `results` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::models::{TaskResult, TaskType};

/// Append a result row. Never updates: retries and duplicate reports each
/// get their own row.
pub async fn insert_result(
    conn: &mut SqliteConnection,
    task_id: Uuid,
    node_id: &str,
    success: bool,
    output: Option<&serde_json::Value>,
    duration_ms: i64,
    now: DateTime<Utc>,
) -> Result<TaskResult> {
    let result = sqlx::query_as::<_, TaskResult>(
        "INSERT INTO results (task_id, node_id, success, output, duration_ms, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(node_id)
    .bind(success)
    .bind(output.map(Json))
    .bind(duration_ms)
    .bind(now)
    .fetch_one(conn)
    .await
    .context("failed to insert result")?;

    Ok(result)
}

/// All results for a task, in submission order.
pub async fn list_results_for_task(
    conn: &mut SqliteConnection,
    task_id: Uuid,
) -> Result<Vec<TaskResult>> {
    let results = sqlx::query_as::<_, TaskResult>(
        "SELECT * FROM results WHERE task_id = ?1 ORDER BY created_at ASC, id ASC",
    )
    .bind(task_id)
    .fetch_all(conn)
    .await
    .context("failed to list results for task")?;

    Ok(results)
}

/// Count result rows for a task.
pub async fn count_results_for_task(conn: &mut SqliteConnection, task_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM results WHERE task_id = ?1")
        .bind(task_id)
        .fetch_one(conn)
        .await
        .context("failed to count results for task")?;

    Ok(row.0)
}

/// One row per recorded result, joined with the task type, for the
/// execution metrics aggregation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResultStat {
    pub task_type: TaskType,
    pub success: bool,
    pub duration_ms: i64,
}

/// Every result's `(task_type, success, duration_ms)` triple.
pub async fn list_result_stats(conn: &mut SqliteConnection) -> Result<Vec<ResultStat>> {
    let stats = sqlx::query_as::<_, ResultStat>(
        "SELECT t.task_type, r.success, r.duration_ms \
         FROM results r \
         JOIN tasks t ON t.id = r.task_id \
         ORDER BY r.created_at ASC, r.id ASC",
    )
    .fetch_all(conn)
    .await
    .context("failed to list result stats")?;

    Ok(stats)
}
