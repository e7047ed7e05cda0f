use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a worker node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Stale,
    Offline,
    Unknown,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Online => "online",
            Self::Stale => "stale",
            Self::Offline => "offline",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl FromStr for NodeStatus {
    type Err = NodeStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "stale" => Ok(Self::Stale),
            "offline" => Ok(Self::Offline),
            "unknown" => Ok(Self::Unknown),
            other => Err(NodeStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`NodeStatus`] string.
#[derive(Debug, Clone)]
pub struct NodeStatusParseError(pub String);

impl fmt::Display for NodeStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node status: {:?}", self.0)
    }
}

impl std::error::Error for NodeStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether this status is terminal (no further transitions).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = JobStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(JobStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`JobStatus`] string.
#[derive(Debug, Clone)]
pub struct JobStatusParseError(pub String);

impl fmt::Display for JobStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid job status: {:?}", self.0)
    }
}

impl std::error::Error for JobStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    /// Whether this status is terminal (no further transitions).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Class of work a job (and its tasks) belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Inference,
    Embeddings,
    Indexing,
    Tokenization,
    Preprocessing,
}

impl TaskType {
    /// All known task types, in a stable order.
    pub const ALL: [TaskType; 5] = [
        Self::Inference,
        Self::Embeddings,
        Self::Indexing,
        Self::Tokenization,
        Self::Preprocessing,
    ];
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Inference => "inference",
            Self::Embeddings => "embeddings",
            Self::Indexing => "indexing",
            Self::Tokenization => "tokenization",
            Self::Preprocessing => "preprocessing",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskType {
    type Err = TaskTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inference" => Ok(Self::Inference),
            "embeddings" => Ok(Self::Embeddings),
            "indexing" => Ok(Self::Indexing),
            "tokenization" => Ok(Self::Tokenization),
            "preprocessing" => Ok(Self::Preprocessing),
            other => Err(TaskTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskType`] string.
#[derive(Debug, Clone)]
pub struct TaskTypeParseError(pub String);

impl fmt::Display for TaskTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task type: {:?}", self.0)
    }
}

impl std::error::Error for TaskTypeParseError {}

// ---------------------------------------------------------------------------
// JSON column types
// ---------------------------------------------------------------------------

/// Static facts a node declares at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub cpu_cores: u32,
    pub ram_total_mb: u64,
    #[serde(default)]
    pub gpu: Option<GpuCapability>,
    #[serde(default)]
    pub supported_task_types: Vec<TaskType>,
}

/// GPU presence and model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuCapability {
    pub model: String,
}

/// The last dynamic resource sample a node reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    pub cpu_pct: f64,
    pub ram_pct: f64,
    #[serde(default)]
    pub gpu_pct: Option<f64>,
    pub inflight: i64,
    /// Stamped with the coordinator clock when the heartbeat is recorded.
    #[serde(default = "Utc::now")]
    pub recorded_at: DateTime<Utc>,
}

/// Operator-controlled caps narrowing a node's eligibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePolicy {
    #[serde(default = "NodePolicy::default_accepted_task_types")]
    pub accepted_task_types: Vec<TaskType>,
    #[serde(default = "NodePolicy::default_max_concurrent")]
    pub max_concurrent: i64,
    #[serde(default = "NodePolicy::default_ceiling")]
    pub cpu_ceiling: f64,
    #[serde(default = "NodePolicy::default_ceiling")]
    pub ram_ceiling: f64,
}

impl NodePolicy {
    fn default_accepted_task_types() -> Vec<TaskType> {
        TaskType::ALL.to_vec()
    }

    fn default_max_concurrent() -> i64 {
        1
    }

    fn default_ceiling() -> f64 {
        100.0
    }
}

impl Default for NodePolicy {
    fn default() -> Self {
        Self {
            accepted_task_types: Self::default_accepted_task_types(),
            max_concurrent: Self::default_max_concurrent(),
            cpu_ceiling: Self::default_ceiling(),
            ram_ceiling: Self::default_ceiling(),
        }
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A worker node registered with the coordinator.
///
/// `node_id` is agent-chosen and stable across agent restarts.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Node {
    pub node_id: String,
    pub display_name: String,
    pub ip: String,
    pub port: i64,
    pub status: NodeStatus,
    pub capabilities: Json<Capabilities>,
    pub metrics: Option<Json<MetricsSample>>,
    pub policy: Json<NodePolicy>,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A job -- a user-submitted unit of work decomposed into tasks.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: Uuid,
    pub job_type: TaskType,
    pub status: JobStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A task -- the smallest unit the scheduler dispatches.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub job_id: Uuid,
    pub task_type: TaskType,
    pub payload: Json<serde_json::Value>,
    pub status: TaskStatus,
    pub assigned_node_id: Option<String>,
    pub retries: i64,
    pub max_retries: i64,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One submitted result for a task attempt. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskResult {
    pub id: i64,
    pub task_id: Uuid,
    pub node_id: String,
    pub success: bool,
    pub output: Option<Json<serde_json::Value>>,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// One historical metrics sample, appended per heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NodeMetric {
    pub id: i64,
    pub node_id: String,
    pub cpu_pct: f64,
    pub ram_pct: f64,
    pub gpu_pct: Option<f64>,
    pub inflight: i64,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
