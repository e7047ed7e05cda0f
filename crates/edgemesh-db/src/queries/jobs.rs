//! Database query functions for the `jobs` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::models::{Job, JobStatus, TaskType};

/// Insert a new job row with status `queued`.
pub async fn insert_job(
    conn: &mut SqliteConnection,
    id: Uuid,
    job_type: TaskType,
    now: DateTime<Utc>,
) -> Result<Job> {
    let job = sqlx::query_as::<_, Job>(
        "INSERT INTO jobs (id, job_type, status, created_at, updated_at) \
         VALUES (?1, ?2, 'queued', ?3, ?3) \
         RETURNING *",
    )
    .bind(id)
    .bind(job_type)
    .bind(now)
    .fetch_one(conn)
    .await
    .context("failed to insert job")?;

    Ok(job)
}

/// Fetch a job by its ID.
pub async fn get_job(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Job>> {
    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?1")
        .bind(id)
        .fetch_optional(conn)
        .await
        .context("failed to fetch job")?;

    Ok(job)
}

/// List jobs, newest first, with optional filters.
///
/// The node filter matches jobs with any task that node currently holds or
/// has ever reported a result for.
pub async fn list_jobs(
    conn: &mut SqliteConnection,
    status: Option<JobStatus>,
    job_type: Option<TaskType>,
    node_id: Option<&str>,
) -> Result<Vec<Job>> {
    let jobs = sqlx::query_as::<_, Job>(
        "SELECT j.* FROM jobs j \
         WHERE (?1 IS NULL OR j.status = ?1) \
           AND (?2 IS NULL OR j.job_type = ?2) \
           AND (?3 IS NULL OR EXISTS ( \
               SELECT 1 FROM tasks t \
               LEFT JOIN results r ON r.task_id = t.id \
               WHERE t.job_id = j.id \
                 AND (t.assigned_node_id = ?3 OR r.node_id = ?3) \
           )) \
         ORDER BY j.created_at DESC, j.id DESC",
    )
    .bind(status)
    .bind(job_type)
    .bind(node_id)
    .fetch_all(conn)
    .await
    .context("failed to list jobs")?;

    Ok(jobs)
}

/// Update a job's status. `started_at` and `completed_at` are only ever set
/// once (COALESCE keeps the first value).
///
/// Returns the number of rows affected (0 means the job does not exist).
pub async fn update_job_status(
    conn: &mut SqliteConnection,
    id: Uuid,
    status: JobStatus,
    error: Option<&str>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE jobs \
         SET status = ?1, \
             error = ?2, \
             started_at = COALESCE(started_at, ?3), \
             completed_at = COALESCE(completed_at, ?4), \
             updated_at = ?5 \
         WHERE id = ?6",
    )
    .bind(status)
    .bind(error)
    .bind(started_at)
    .bind(completed_at)
    .bind(now)
    .bind(id)
    .execute(conn)
    .await
    .context("failed to update job status")?;

    Ok(result.rows_affected())
}

/// Task counts by status for one job, plus the retry total and how many
/// tasks have ever started. Everything the derived progress view needs.
#[derive(Debug, Clone, Default)]
pub struct JobProgress {
    pub queued: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub total: i64,
    pub total_retries: i64,
    pub started: i64,
}

impl JobProgress {
    /// Whether every task has reached a terminal status.
    pub fn all_terminal(&self) -> bool {
        self.total > 0 && self.succeeded + self.failed == self.total
    }
}

/// Get a progress summary for a given job.
pub async fn get_job_progress(conn: &mut SqliteConnection, job_id: Uuid) -> Result<JobProgress> {
    let rows: Vec<(String, i64, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) AS cnt, COALESCE(SUM(retries), 0) AS retries \
         FROM tasks \
         WHERE job_id = ?1 \
         GROUP BY status",
    )
    .bind(job_id)
    .fetch_all(&mut *conn)
    .await
    .context("failed to get job progress")?;

    let mut progress = JobProgress::default();
    for (status, count, retries) in &rows {
        match status.as_str() {
            "queued" => progress.queued = *count,
            "running" => progress.running = *count,
            "succeeded" => progress.succeeded = *count,
            "failed" => progress.failed = *count,
            _ => {}
        }
        progress.total += count;
        progress.total_retries += retries;
    }

    let (started,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks WHERE job_id = ?1 AND started_at IS NOT NULL",
    )
    .bind(job_id)
    .fetch_one(conn)
    .await
    .context("failed to count started tasks")?;
    progress.started = started;

    Ok(progress)
}

/// Distinct nodes that ran (reported a result for) or currently hold any
/// task of the job.
pub async fn get_assigned_nodes(
    conn: &mut SqliteConnection,
    job_id: Uuid,
) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT DISTINCT r.node_id AS node_id \
         FROM results r \
         JOIN tasks t ON t.id = r.task_id \
         WHERE t.job_id = ?1 \
         UNION \
         SELECT DISTINCT assigned_node_id AS node_id \
         FROM tasks \
         WHERE job_id = ?1 AND assigned_node_id IS NOT NULL \
         ORDER BY node_id",
    )
    .bind(job_id)
    .fetch_all(conn)
    .await
    .context("failed to get assigned nodes")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}
