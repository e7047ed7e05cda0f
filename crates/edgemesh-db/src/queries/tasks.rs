//! Database query functions for the `tasks` table.
//!
//! Mutations are guarded by the current status in the WHERE clause
//! (optimistic locking): a zero row count means another writer got there
//! first, never partial state.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::models::{Task, TaskType};

/// Insert a new task row with status `queued` and zero retries.
pub async fn insert_task(
    conn: &mut SqliteConnection,
    id: Uuid,
    job_id: Uuid,
    task_type: TaskType,
    payload: &serde_json::Value,
    max_retries: i64,
    now: DateTime<Utc>,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (id, job_id, task_type, payload, status, retries, max_retries, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, 'queued', 0, ?5, ?6, ?6) \
         RETURNING *",
    )
    .bind(id)
    .bind(job_id)
    .bind(task_type)
    .bind(Json(payload))
    .bind(max_retries)
    .bind(now)
    .fetch_one(conn)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?1")
        .bind(id)
        .fetch_optional(conn)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks for a given job, in insertion order.
///
/// Tasks created in one transaction share a timestamp, so the implicit
/// rowid is the tiebreak that preserves insertion order.
pub async fn list_tasks_for_job(conn: &mut SqliteConnection, job_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE job_id = ?1 ORDER BY created_at ASC, rowid ASC",
    )
    .bind(job_id)
    .fetch_all(conn)
    .await
    .context("failed to list tasks for job")?;

    Ok(tasks)
}

/// All `queued` tasks across jobs, oldest first. This is the dispatch scan
/// order; the rowid tiebreak keeps it deterministic and in insertion order
/// for tasks sharing a timestamp.
pub async fn list_queued_tasks(conn: &mut SqliteConnection) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = 'queued' ORDER BY created_at ASC, rowid ASC",
    )
    .fetch_all(conn)
    .await
    .context("failed to list queued tasks")?;

    Ok(tasks)
}

/// Claim a queued task for a node: `queued -> running` with a fresh lease.
///
/// `started_at` is only set on the first attempt (COALESCE). Returns the
/// number of rows affected; 0 means the task was no longer `queued`.
pub async fn claim_task(
    conn: &mut SqliteConnection,
    task_id: Uuid,
    node_id: &str,
    lease_expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'running', \
             assigned_node_id = ?1, \
             lease_expires_at = ?2, \
             started_at = COALESCE(started_at, ?3), \
             updated_at = ?3 \
         WHERE id = ?4 AND status = 'queued'",
    )
    .bind(node_id)
    .bind(lease_expires_at)
    .bind(now)
    .bind(task_id)
    .execute(conn)
    .await
    .context("failed to claim task")?;

    Ok(result.rows_affected())
}

/// Terminal success: `running -> succeeded`, lease cleared.
pub async fn succeed_task(
    conn: &mut SqliteConnection,
    task_id: Uuid,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'succeeded', \
             lease_expires_at = NULL, \
             error = NULL, \
             completed_at = ?1, \
             updated_at = ?1 \
         WHERE id = ?2 AND status = 'running'",
    )
    .bind(now)
    .bind(task_id)
    .execute(conn)
    .await
    .context("failed to mark task succeeded")?;

    Ok(result.rows_affected())
}

/// Failed attempt with retry budget left: back to `queued`, retry counter
/// bumped, assignment and lease cleared.
pub async fn requeue_task(
    conn: &mut SqliteConnection,
    task_id: Uuid,
    error: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'queued', \
             retries = retries + 1, \
             assigned_node_id = NULL, \
             lease_expires_at = NULL, \
             error = ?1, \
             updated_at = ?2 \
         WHERE id = ?3 AND status = 'running'",
    )
    .bind(error)
    .bind(now)
    .bind(task_id)
    .execute(conn)
    .await
    .context("failed to requeue task")?;

    Ok(result.rows_affected())
}

/// Terminal failure: `running -> failed` after the retry budget is spent.
pub async fn fail_task(
    conn: &mut SqliteConnection,
    task_id: Uuid,
    error: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'failed', \
             lease_expires_at = NULL, \
             error = ?1, \
             completed_at = ?2, \
             updated_at = ?2 \
         WHERE id = ?3 AND status = 'running'",
    )
    .bind(error)
    .bind(now)
    .bind(task_id)
    .execute(conn)
    .await
    .context("failed to mark task failed")?;

    Ok(result.rows_affected())
}

/// Terminally fail every still-`queued` task of a job (operator cancel).
/// Returns the number of tasks affected.
pub async fn fail_queued_tasks_for_job(
    conn: &mut SqliteConnection,
    job_id: Uuid,
    error: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'failed', \
             error = ?1, \
             completed_at = ?2, \
             updated_at = ?2 \
         WHERE job_id = ?3 AND status = 'queued'",
    )
    .bind(error)
    .bind(now)
    .bind(job_id)
    .execute(conn)
    .await
    .context("failed to cancel queued tasks")?;

    Ok(result.rows_affected())
}

/// Running tasks whose lease has expired at `now`, oldest lease first.
pub async fn list_expired_leases(
    conn: &mut SqliteConnection,
    now: DateTime<Utc>,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status = 'running' \
           AND lease_expires_at IS NOT NULL \
           AND lease_expires_at <= ?1 \
         ORDER BY lease_expires_at ASC, id ASC",
    )
    .bind(now)
    .fetch_all(conn)
    .await
    .context("failed to list expired leases")?;

    Ok(tasks)
}
