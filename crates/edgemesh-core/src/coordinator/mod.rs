//! The coordinator: sole gatekeeper of the store.
//!
//! Every operation validates its input first, then runs its reads and
//! writes under a single transaction, and publishes change notifications
//! only after the transaction commits. No lock is held across network I/O;
//! callers hand in `now` explicitly so tests can drive a controlled clock.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use edgemesh_db::models::{
    Capabilities, Job, JobStatus, MetricsSample, Node, NodeMetric, NodePolicy, NodeStatus, Task,
    TaskStatus, TaskType,
};
use edgemesh_db::queries::jobs::JobProgress;
use edgemesh_db::queries::{jobs as job_db, nodes as node_db, results as result_db, tasks as task_db};

use crate::bus::EventBus;
use crate::error::{CoordError, Result};
use crate::scheduler;

/// Synthetic task error recorded when a lease runs out.
pub const LEASE_EXPIRED_ERROR: &str = "lease_expired";

/// Synthetic task error recorded when an operator cancels the owning job.
pub const CANCELLED_ERROR: &str = "cancelled";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Timing knobs for staleness and leasing.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// A node is stale once `now - last_seen` reaches this many seconds.
    pub node_stale_seconds: u64,
    /// How long a claimed task is leased before it is reclaimable.
    pub task_lease_seconds: u64,
}

impl CoordinatorConfig {
    pub const DEFAULT_NODE_STALE_SECONDS: u64 = 15;
    pub const DEFAULT_TASK_LEASE_SECONDS: u64 = 30;

    /// Build a config from the environment (`NODE_STALE_SECONDS`,
    /// `TASK_LEASE_SECONDS`), falling back to the defaults.
    pub fn from_env() -> Self {
        Self {
            node_stale_seconds: env_u64("NODE_STALE_SECONDS", Self::DEFAULT_NODE_STALE_SECONDS),
            task_lease_seconds: env_u64("TASK_LEASE_SECONDS", Self::DEFAULT_TASK_LEASE_SECONDS),
        }
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::seconds(self.node_stale_seconds as i64)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::seconds(self.task_lease_seconds as i64)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_stale_seconds: Self::DEFAULT_NODE_STALE_SECONDS,
            task_lease_seconds: Self::DEFAULT_TASK_LEASE_SECONDS,
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Agent bring-up payload.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeRegistration {
    pub node_id: String,
    pub display_name: String,
    pub ip: String,
    pub port: u16,
    pub capabilities: Capabilities,
    /// When absent, a previously stored policy is preserved; brand-new
    /// nodes get the defaults.
    #[serde(default)]
    pub policy: Option<NodePolicy>,
}

/// One task in a job submission.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    pub payload: serde_json::Value,
    #[serde(default)]
    pub max_retries: Option<i64>,
}

/// Filters for [`Coordinator::list_jobs`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobFilter {
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub task_type: Option<TaskType>,
    #[serde(default)]
    pub node_id: Option<String>,
}

/// A job with its derived progress fields.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub total_retries: i64,
    pub assigned_nodes: Vec<String>,
}

/// Node detail, optionally with its recent metrics history.
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    #[serde(flatten)]
    pub node: Node,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_history: Option<Vec<NodeMetric>>,
}

/// How a submitted result was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultAck {
    /// The result drove the task's state.
    Recorded,
    /// Late or duplicate report: appended to history, task untouched.
    Stale,
}

/// Aggregate cluster counts for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSummary {
    pub nodes_total: i64,
    pub nodes_online: i64,
    pub nodes_stale: i64,
    pub nodes_offline: i64,
    pub nodes_unknown: i64,
    pub inflight_total: i64,
    /// Eligible-node count per task type (GPU not required).
    pub eligible_by_type: BTreeMap<TaskType, i64>,
}

/// Duration aggregates over recorded results.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DurationSummary {
    pub count: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub mean_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
}

/// Execution metrics report, overall and per task type.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionMetrics {
    pub overall: DurationSummary,
    pub by_type: BTreeMap<TaskType, DurationSummary>,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Coordination engine over the store and the event bus.
///
/// Constructed once at startup and passed explicitly to handlers and
/// monitors.
#[derive(Clone)]
pub struct Coordinator {
    pool: SqlitePool,
    bus: EventBus,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(pool: SqlitePool, bus: EventBus, config: CoordinatorConfig) -> Self {
        Self { pool, bus, config }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // -----------------------------------------------------------------
    // Nodes
    // -----------------------------------------------------------------

    /// Register (or re-register) a node. New nodes come up `online` with
    /// the default policy; re-registration preserves a stored policy
    /// unless the registration carries one explicitly.
    pub async fn register_node(
        &self,
        registration: &NodeRegistration,
        now: DateTime<Utc>,
    ) -> Result<Node> {
        validate_registration(registration)?;
        if let Some(policy) = &registration.policy {
            validate_policy(policy)?;
        }

        let mut tx = self.pool.begin().await?;
        let existing = node_db::get_node(&mut tx, &registration.node_id).await?;
        let policy = registration
            .policy
            .clone()
            .or_else(|| existing.map(|n| n.policy.0))
            .unwrap_or_default();

        let node = node_db::upsert_node(
            &mut tx,
            &registration.node_id,
            &registration.display_name,
            &registration.ip,
            i64::from(registration.port),
            &registration.capabilities,
            &policy,
            now,
        )
        .await?;
        tx.commit().await?;

        tracing::info!(node_id = %node.node_id, "node registered");
        self.bus.publish_node_update(&node.node_id);
        Ok(node)
    }

    /// Record a heartbeat: refresh the metrics sample and `last_seen`,
    /// force the node back `online`, and append to the metrics history.
    pub async fn heartbeat(
        &self,
        node_id: &str,
        metrics: &MetricsSample,
        now: DateTime<Utc>,
    ) -> Result<Node> {
        // The coordinator clock is authoritative for sample age.
        let mut sample = metrics.clone();
        sample.recorded_at = now;

        let mut tx = self.pool.begin().await?;
        let rows = node_db::record_heartbeat(&mut tx, node_id, &sample, now).await?;
        if rows == 0 {
            return Err(CoordError::not_found(format!("node {node_id} not found")));
        }
        node_db::insert_metric_sample(&mut tx, node_id, &sample).await?;
        let node = node_db::get_node(&mut tx, node_id)
            .await?
            .ok_or_else(|| CoordError::not_found(format!("node {node_id} not found")))?;
        tx.commit().await?;

        self.bus.publish_node_update(node_id);
        Ok(node)
    }

    /// Replace a node's policy. Takes effect on the very next `pull_task`.
    pub async fn set_policy(
        &self,
        node_id: &str,
        policy: &NodePolicy,
        now: DateTime<Utc>,
    ) -> Result<Node> {
        validate_policy(policy)?;

        let mut tx = self.pool.begin().await?;
        let rows = node_db::update_policy(&mut tx, node_id, policy, now).await?;
        if rows == 0 {
            return Err(CoordError::not_found(format!("node {node_id} not found")));
        }
        let node = node_db::get_node(&mut tx, node_id)
            .await?
            .ok_or_else(|| CoordError::not_found(format!("node {node_id} not found")))?;
        tx.commit().await?;

        tracing::info!(node_id, "node policy replaced");
        self.bus.publish_node_update(node_id);
        Ok(node)
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        let mut conn = self.pool.acquire().await?;
        Ok(node_db::list_nodes(&mut conn).await?)
    }

    /// Node detail, with up to `history_limit` recent metrics samples when
    /// `include_history` is set.
    pub async fn get_node(
        &self,
        node_id: &str,
        include_history: bool,
        history_limit: i64,
    ) -> Result<NodeView> {
        let mut conn = self.pool.acquire().await?;
        let node = node_db::get_node(&mut conn, node_id)
            .await?
            .ok_or_else(|| CoordError::not_found(format!("node {node_id} not found")))?;
        let metrics_history = if include_history {
            Some(node_db::list_metric_history(&mut conn, node_id, history_limit.max(0)).await?)
        } else {
            None
        };
        Ok(NodeView {
            node,
            metrics_history,
        })
    }

    /// Flip every `online` node unseen for the stale threshold to `stale`.
    /// Returns the IDs that changed. Idempotent.
    pub async fn sweep_stale_nodes(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let cutoff = now - self.config.stale_threshold();
        let mut tx = self.pool.begin().await?;
        let swept = node_db::mark_stale_nodes(&mut tx, cutoff, now).await?;
        tx.commit().await?;

        for node_id in &swept {
            tracing::info!(node_id, "node went stale");
            self.bus.publish_node_update(node_id);
        }
        Ok(swept)
    }

    // -----------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------

    /// Create a job and all of its task rows atomically.
    pub async fn create_job(
        &self,
        job_type: TaskType,
        tasks: &[TaskSpec],
        now: DateTime<Utc>,
    ) -> Result<JobView> {
        if tasks.is_empty() {
            return Err(CoordError::bad_request("a job needs at least one task"));
        }
        for spec in tasks {
            if spec.max_retries.is_some_and(|r| r < 0) {
                return Err(CoordError::bad_request("max_retries must be >= 0"));
            }
        }

        let mut tx = self.pool.begin().await?;
        let job = job_db::insert_job(&mut tx, Uuid::new_v4(), job_type, now).await?;
        for spec in tasks {
            task_db::insert_task(
                &mut tx,
                Uuid::new_v4(),
                job.id,
                job_type,
                &spec.payload,
                spec.max_retries.unwrap_or(2),
                now,
            )
            .await?;
        }
        let view = job_view(&mut tx, job).await?;
        tx.commit().await?;

        tracing::info!(job_id = %view.job.id, tasks = tasks.len(), "job created");
        self.bus.publish_job_update(view.job.id);
        Ok(view)
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobView>> {
        let mut conn = self.pool.acquire().await?;
        let jobs = job_db::list_jobs(
            &mut conn,
            filter.status,
            filter.task_type,
            filter.node_id.as_deref(),
        )
        .await?;

        let mut views = Vec::with_capacity(jobs.len());
        for job in jobs {
            views.push(job_view(&mut conn, job).await?);
        }
        Ok(views)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<JobView> {
        let mut conn = self.pool.acquire().await?;
        let job = job_db::get_job(&mut conn, job_id)
            .await?
            .ok_or_else(|| CoordError::not_found(format!("job {job_id} not found")))?;
        job_view(&mut conn, job).await
    }

    /// Tasks of a job, in insertion order.
    pub async fn get_job_tasks(&self, job_id: Uuid) -> Result<Vec<Task>> {
        let mut conn = self.pool.acquire().await?;
        if job_db::get_job(&mut conn, job_id).await?.is_none() {
            return Err(CoordError::not_found(format!("job {job_id} not found")));
        }
        Ok(task_db::list_tasks_for_job(&mut conn, job_id).await?)
    }

    /// Operator-driven cancel. Terminal and sticky: still-queued tasks are
    /// failed with a `cancelled` error, running leases finish naturally
    /// but can no longer change the job's status.
    pub async fn cancel_job(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<JobView> {
        let mut tx = self.pool.begin().await?;
        let job = job_db::get_job(&mut tx, job_id)
            .await?
            .ok_or_else(|| CoordError::not_found(format!("job {job_id} not found")))?;
        if job.status.is_terminal() {
            return Err(CoordError::conflict(format!(
                "job {job_id} is already {}",
                job.status
            )));
        }

        task_db::fail_queued_tasks_for_job(&mut tx, job_id, CANCELLED_ERROR, now).await?;
        job_db::update_job_status(
            &mut tx,
            job_id,
            JobStatus::Cancelled,
            Some("cancelled by operator"),
            None,
            Some(now),
            now,
        )
        .await?;
        let job = job_db::get_job(&mut tx, job_id)
            .await?
            .ok_or_else(|| CoordError::not_found(format!("job {job_id} not found")))?;
        let view = job_view(&mut tx, job).await?;
        tx.commit().await?;

        tracing::info!(job_id = %job_id, "job cancelled");
        self.bus.publish_job_update(job_id);
        Ok(view)
    }

    // -----------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------

    /// Leased task pull.
    ///
    /// Under one transaction: load the caller, snapshot all nodes, scan
    /// queued tasks oldest-first, and claim the first task for which the
    /// caller heads the eligibility ranking. The policy is evaluated
    /// atomically with the claim, so a just-tightened cap or a
    /// just-gone-stale node cannot be claimed against. Returns `None`
    /// when no work is available for this caller.
    pub async fn pull_task(&self, node_id: &str, now: DateTime<Utc>) -> Result<Option<Task>> {
        let mut tx = self.pool.begin().await?;

        let Some(caller) = node_db::get_node(&mut tx, node_id).await? else {
            return Ok(None);
        };
        if caller.status != NodeStatus::Online {
            return Ok(None);
        }

        let snapshot = node_db::list_nodes(&mut tx).await?;
        let candidates = task_db::list_queued_tasks(&mut tx).await?;
        let stale_threshold = self.config.stale_threshold();

        for task in &candidates {
            let requires_gpu = scheduler::payload_requires_gpu(&task.payload);
            let ranked = scheduler::eligible_nodes(
                task.task_type,
                requires_gpu,
                now,
                &snapshot,
                stale_threshold,
            );
            // The caller wins only if it is first in line for this task.
            if ranked.first().map(|n| n.node_id.as_str()) != Some(node_id) {
                continue;
            }

            let lease_expires_at = now + self.config.lease_duration();
            let rows =
                task_db::claim_task(&mut tx, task.id, node_id, lease_expires_at, now).await?;
            if rows == 0 {
                continue;
            }

            // First claim of a queued job starts it.
            let job = job_db::get_job(&mut tx, task.job_id)
                .await?
                .ok_or_else(|| CoordError::not_found(format!("job {} not found", task.job_id)))?;
            if job.status == JobStatus::Queued {
                job_db::update_job_status(
                    &mut tx,
                    job.id,
                    JobStatus::Running,
                    None,
                    Some(now),
                    None,
                    now,
                )
                .await?;
            }

            let claimed = task_db::get_task(&mut tx, task.id)
                .await?
                .ok_or_else(|| CoordError::not_found(format!("task {} not found", task.id)))?;
            tx.commit().await?;

            tracing::debug!(task_id = %claimed.id, node_id, "task leased");
            self.bus.publish_job_update(claimed.job_id);
            return Ok(Some(claimed));
        }

        Ok(None)
    }

    /// Record a task result.
    ///
    /// The result row is always appended. The task itself only moves when
    /// it is still `running` and assigned to the reporter; anything else
    /// is a late or duplicate report and is acknowledged as `stale`.
    pub async fn submit_result(
        &self,
        task_id: Uuid,
        node_id: &str,
        success: bool,
        output: Option<&serde_json::Value>,
        duration_ms: i64,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(ResultAck, Task)> {
        if duration_ms < 0 {
            return Err(CoordError::bad_request("duration_ms must be >= 0"));
        }

        let mut tx = self.pool.begin().await?;
        let task = task_db::get_task(&mut tx, task_id)
            .await?
            .ok_or_else(|| CoordError::not_found(format!("task {task_id} not found")))?;

        result_db::insert_result(&mut tx, task_id, node_id, success, output, duration_ms, now)
            .await?;

        let owns_task = task.status == TaskStatus::Running
            && task.assigned_node_id.as_deref() == Some(node_id);
        if !owns_task {
            tx.commit().await?;
            tracing::debug!(task_id = %task_id, node_id, "stale result recorded");
            return Ok((ResultAck::Stale, task));
        }

        if success {
            task_db::succeed_task(&mut tx, task_id, now).await?;
        } else {
            let message = error.unwrap_or("task failed");
            if task.retries < task.max_retries {
                task_db::requeue_task(&mut tx, task_id, message, now).await?;
            } else {
                task_db::fail_task(&mut tx, task_id, message, now).await?;
            }
        }

        recompute_job_status(&mut tx, task.job_id, now).await?;
        let task = task_db::get_task(&mut tx, task_id)
            .await?
            .ok_or_else(|| CoordError::not_found(format!("task {task_id} not found")))?;
        tx.commit().await?;

        self.bus.publish_job_update(task.job_id);
        Ok((ResultAck::Recorded, task))
    }

    /// Treat every expired lease as a failed attempt (synthetic
    /// `lease_expired` error). Returns the affected job IDs.
    pub async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await?;
        let expired = task_db::list_expired_leases(&mut tx, now).await?;
        if expired.is_empty() {
            return Ok(Vec::new());
        }

        let mut affected_jobs = BTreeSet::new();
        for task in &expired {
            if task.retries < task.max_retries {
                task_db::requeue_task(&mut tx, task.id, LEASE_EXPIRED_ERROR, now).await?;
            } else {
                task_db::fail_task(&mut tx, task.id, LEASE_EXPIRED_ERROR, now).await?;
            }
            affected_jobs.insert(task.job_id);
        }
        for job_id in &affected_jobs {
            recompute_job_status(&mut tx, *job_id, now).await?;
        }
        tx.commit().await?;

        tracing::info!(tasks = expired.len(), "reclaimed expired leases");
        for job_id in &affected_jobs {
            self.bus.publish_job_update(*job_id);
        }
        Ok(affected_jobs.into_iter().collect())
    }

    // -----------------------------------------------------------------
    // Read-only views
    // -----------------------------------------------------------------

    /// Aggregate node counts plus per-type eligibility, from one snapshot.
    pub async fn cluster_summary(&self, now: DateTime<Utc>) -> Result<ClusterSummary> {
        let mut conn = self.pool.acquire().await?;
        let snapshot = node_db::list_nodes(&mut conn).await?;

        let mut summary = ClusterSummary {
            nodes_total: snapshot.len() as i64,
            nodes_online: 0,
            nodes_stale: 0,
            nodes_offline: 0,
            nodes_unknown: 0,
            inflight_total: 0,
            eligible_by_type: BTreeMap::new(),
        };
        for node in &snapshot {
            match node.status {
                NodeStatus::Online => summary.nodes_online += 1,
                NodeStatus::Stale => summary.nodes_stale += 1,
                NodeStatus::Offline => summary.nodes_offline += 1,
                NodeStatus::Unknown => summary.nodes_unknown += 1,
            }
            if let Some(metrics) = node.metrics.as_deref() {
                summary.inflight_total += metrics.inflight;
            }
        }

        let stale_threshold = self.config.stale_threshold();
        for task_type in TaskType::ALL {
            let eligible =
                scheduler::eligible_nodes(task_type, false, now, &snapshot, stale_threshold);
            summary
                .eligible_by_type
                .insert(task_type, eligible.len() as i64);
        }
        Ok(summary)
    }

    /// Ordered eligibility list for a hypothetical task. Read-only dry
    /// run: no state change, no events.
    pub async fn simulate_schedule(
        &self,
        task_type: TaskType,
        requires_gpu: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<Node>> {
        let mut conn = self.pool.acquire().await?;
        let snapshot = node_db::list_nodes(&mut conn).await?;
        let ranked = scheduler::eligible_nodes(
            task_type,
            requires_gpu,
            now,
            &snapshot,
            self.config.stale_threshold(),
        );
        Ok(ranked.into_iter().cloned().collect())
    }

    /// Success counts and duration aggregates over all recorded results.
    pub async fn execution_metrics(&self) -> Result<ExecutionMetrics> {
        let mut conn = self.pool.acquire().await?;
        let stats = result_db::list_result_stats(&mut conn).await?;

        let mut by_type: BTreeMap<TaskType, Vec<&result_db::ResultStat>> = BTreeMap::new();
        for stat in &stats {
            by_type.entry(stat.task_type).or_default().push(stat);
        }

        Ok(ExecutionMetrics {
            overall: summarize(stats.iter()),
            by_type: by_type
                .into_iter()
                .map(|(task_type, group)| (task_type, summarize(group.into_iter())))
                .collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Derivation helpers
// ---------------------------------------------------------------------------

/// Derive a job's status from its task counts.
///
/// - every task terminal and none failed -> `completed`
/// - every task terminal and any failed  -> `failed`
/// - any task ever started               -> `running`
/// - otherwise                           -> `queued`
pub fn derive_job_status(progress: &JobProgress) -> JobStatus {
    if progress.all_terminal() {
        if progress.failed > 0 {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        }
    } else if progress.started > 0 {
        JobStatus::Running
    } else {
        JobStatus::Queued
    }
}

/// Recompute and persist the derived status of a job after one of its
/// tasks moved. `cancelled` is sticky and never overwritten.
async fn recompute_job_status(
    conn: &mut sqlx::SqliteConnection,
    job_id: Uuid,
    now: DateTime<Utc>,
) -> Result<()> {
    let job = job_db::get_job(conn, job_id)
        .await?
        .ok_or_else(|| CoordError::not_found(format!("job {job_id} not found")))?;
    if job.status == JobStatus::Cancelled {
        return Ok(());
    }

    let progress = job_db::get_job_progress(conn, job_id).await?;
    let derived = derive_job_status(&progress);

    let error = match derived {
        JobStatus::Failed => Some(format!(
            "{} of {} tasks failed",
            progress.failed, progress.total
        )),
        _ => None,
    };
    let started_at = (derived == JobStatus::Running).then_some(now);
    let completed_at = derived.is_terminal().then_some(now);

    job_db::update_job_status(
        conn,
        job_id,
        derived,
        error.as_deref(),
        started_at,
        completed_at,
        now,
    )
    .await?;
    Ok(())
}

/// Assemble a [`JobView`] with the derived progress fields.
async fn job_view(conn: &mut sqlx::SqliteConnection, job: Job) -> Result<JobView> {
    let progress = job_db::get_job_progress(conn, job.id).await?;
    let assigned_nodes = job_db::get_assigned_nodes(conn, job.id).await?;
    Ok(JobView {
        job,
        total_tasks: progress.total,
        completed_tasks: progress.succeeded,
        total_retries: progress.total_retries,
        assigned_nodes,
    })
}

fn summarize<'a>(stats: impl Iterator<Item = &'a result_db::ResultStat>) -> DurationSummary {
    let mut durations: Vec<i64> = Vec::new();
    let mut summary = DurationSummary::default();
    for stat in stats {
        summary.count += 1;
        if stat.success {
            summary.succeeded += 1;
        } else {
            summary.failed += 1;
        }
        durations.push(stat.duration_ms);
    }
    if durations.is_empty() {
        return summary;
    }

    durations.sort_unstable();
    summary.mean_ms = durations.iter().sum::<i64>() as f64 / durations.len() as f64;
    summary.median_ms = percentile(&durations, 50.0);
    summary.p95_ms = percentile(&durations, 95.0);
    summary
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[i64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1] as f64
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate_registration(registration: &NodeRegistration) -> Result<()> {
    if registration.node_id.trim().is_empty() {
        return Err(CoordError::bad_request("node_id must not be empty"));
    }
    if registration.display_name.trim().is_empty() {
        return Err(CoordError::bad_request("display_name must not be empty"));
    }
    if registration.ip.trim().is_empty() {
        return Err(CoordError::bad_request("ip must not be empty"));
    }
    if registration.port == 0 {
        return Err(CoordError::bad_request("port must not be zero"));
    }
    Ok(())
}

fn validate_policy(policy: &NodePolicy) -> Result<()> {
    if policy.max_concurrent < 0 {
        return Err(CoordError::bad_request("max_concurrent must be >= 0"));
    }
    for (name, value) in [
        ("cpu_ceiling", policy.cpu_ceiling),
        ("ram_ceiling", policy.ram_ceiling),
    ] {
        if !(0.0..=100.0).contains(&value) {
            return Err(CoordError::bad_request(format!(
                "{name} must be within [0, 100]"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(queued: i64, running: i64, succeeded: i64, failed: i64, started: i64) -> JobProgress {
        JobProgress {
            queued,
            running,
            succeeded,
            failed,
            total: queued + running + succeeded + failed,
            total_retries: 0,
            started,
        }
    }

    #[test]
    fn derive_queued_before_any_start() {
        assert_eq!(derive_job_status(&progress(3, 0, 0, 0, 0)), JobStatus::Queued);
    }

    #[test]
    fn derive_running_once_started() {
        assert_eq!(derive_job_status(&progress(2, 1, 0, 0, 1)), JobStatus::Running);
        // A requeued task keeps its started_at, so the job stays running.
        assert_eq!(derive_job_status(&progress(3, 0, 0, 0, 1)), JobStatus::Running);
    }

    #[test]
    fn derive_completed_when_all_succeed() {
        assert_eq!(
            derive_job_status(&progress(0, 0, 3, 0, 3)),
            JobStatus::Completed
        );
    }

    #[test]
    fn derive_failed_when_any_task_failed() {
        assert_eq!(derive_job_status(&progress(0, 0, 2, 1, 3)), JobStatus::Failed);
    }

    #[test]
    fn derive_running_while_siblings_remain() {
        // One task already failed terminally but a sibling is still going.
        assert_eq!(derive_job_status(&progress(0, 1, 1, 1, 3)), JobStatus::Running);
    }

    #[test]
    fn percentile_nearest_rank() {
        let sorted = [10, 20, 30, 40, 50, 60, 70, 80, 90, 100];
        assert_eq!(percentile(&sorted, 50.0), 50.0);
        assert_eq!(percentile(&sorted, 95.0), 100.0);
        assert_eq!(percentile(&sorted, 100.0), 100.0);
        assert_eq!(percentile(&[42], 50.0), 42.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn policy_validation_bounds() {
        let mut policy = NodePolicy::default();
        assert!(validate_policy(&policy).is_ok());

        policy.max_concurrent = -1;
        assert!(validate_policy(&policy).is_err());

        policy.max_concurrent = 0;
        policy.cpu_ceiling = 101.0;
        assert!(validate_policy(&policy).is_err());

        policy.cpu_ceiling = 100.0;
        policy.ram_ceiling = -0.5;
        assert!(validate_policy(&policy).is_err());
    }

    #[test]
    fn registration_validation() {
        let registration = NodeRegistration {
            node_id: "".into(),
            display_name: "node".into(),
            ip: "10.0.0.1".into(),
            port: 9000,
            capabilities: Capabilities {
                cpu_cores: 4,
                ram_total_mb: 8192,
                gpu: None,
                supported_task_types: vec![],
            },
            policy: None,
        };
        assert!(validate_registration(&registration).is_err());
    }
}
