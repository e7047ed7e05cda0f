//! Integration tests for lease expiry recovery, the retry budget, and
//! idempotent result recording.

use chrono::{DateTime, Duration, Utc};
use tempfile::TempDir;

use edgemesh_core::bus::EventBus;
use edgemesh_core::coordinator::{
    Coordinator, CoordinatorConfig, NodeRegistration, ResultAck, TaskSpec, LEASE_EXPIRED_ERROR,
};
use edgemesh_core::error::CoordError;
use edgemesh_db::models::{
    Capabilities, JobStatus, MetricsSample, TaskStatus, TaskType,
};
use edgemesh_test_utils::create_test_db;

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

async fn setup() -> (Coordinator, TempDir) {
    let (pool, dir) = create_test_db().await;
    let coordinator = Coordinator::new(pool, EventBus::new(), CoordinatorConfig::default());
    (coordinator, dir)
}

async fn bring_up(coordinator: &Coordinator, node_id: &str, now: DateTime<Utc>) {
    coordinator
        .register_node(
            &NodeRegistration {
                node_id: node_id.to_owned(),
                display_name: format!("worker {node_id}"),
                ip: "192.168.1.30".to_owned(),
                port: 9200,
                capabilities: Capabilities {
                    cpu_cores: 4,
                    ram_total_mb: 8192,
                    gpu: None,
                    supported_task_types: TaskType::ALL.to_vec(),
                },
                policy: None,
            },
            now,
        )
        .await
        .expect("register should succeed");
    heartbeat(coordinator, node_id, now).await;
}

async fn heartbeat(coordinator: &Coordinator, node_id: &str, now: DateTime<Utc>) {
    coordinator
        .heartbeat(
            node_id,
            &MetricsSample {
                cpu_pct: 10.0,
                ram_pct: 30.0,
                gpu_pct: None,
                inflight: 0,
                recorded_at: now,
            },
            now,
        )
        .await
        .expect("heartbeat should succeed");
}

fn one_task(max_retries: Option<i64>) -> Vec<TaskSpec> {
    vec![TaskSpec {
        payload: serde_json::json!({}),
        max_retries,
    }]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn expired_lease_requeues_with_retry_bump() {
    let (coordinator, _dir) = setup().await;
    let now = Utc::now();
    bring_up(&coordinator, "n1", now).await;

    coordinator
        .create_job(TaskType::Preprocessing, &one_task(None), now)
        .await
        .unwrap();
    let claimed = coordinator.pull_task("n1", now).await.unwrap().unwrap();

    // Just before expiry nothing happens.
    let lease_end = claimed.lease_expires_at.expect("claimed task has a lease");
    let early = coordinator
        .reclaim_expired_leases(lease_end - Duration::seconds(1))
        .await
        .unwrap();
    assert!(early.is_empty());

    // One second past the lease the task is reclaimed.
    let late = lease_end + Duration::seconds(1);
    let affected = coordinator.reclaim_expired_leases(late).await.unwrap();
    assert_eq!(affected, vec![claimed.job_id]);

    let tasks = coordinator.get_job_tasks(claimed.job_id).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Queued);
    assert_eq!(tasks[0].retries, 1);
    assert!(tasks[0].assigned_node_id.is_none());
    assert!(tasks[0].lease_expires_at.is_none());
    assert_eq!(tasks[0].error.as_deref(), Some(LEASE_EXPIRED_ERROR));

    // Reclaim is idempotent: nothing left to sweep.
    assert!(coordinator.reclaim_expired_leases(late).await.unwrap().is_empty());

    // The same node may re-claim after a fresh heartbeat.
    heartbeat(&coordinator, "n1", late).await;
    let reclaimed = coordinator.pull_task("n1", late).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, claimed.id);
    assert_eq!(reclaimed.retries, 1);
}

#[tokio::test]
async fn retry_budget_exhaustion_fails_task_and_job() {
    let (coordinator, _dir) = setup().await;
    let mut now = Utc::now();
    bring_up(&coordinator, "n1", now).await;

    coordinator
        .create_job(TaskType::Embeddings, &one_task(Some(2)), now)
        .await
        .unwrap();

    // Three attempts: two requeues, then terminal failure.
    for attempt in 0..3 {
        heartbeat(&coordinator, "n1", now).await;
        let task = coordinator.pull_task("n1", now).await.unwrap().unwrap();
        assert_eq!(task.retries, attempt);

        let (ack, task) = coordinator
            .submit_result(task.id, "n1", false, None, 25, Some("worker oom"), now)
            .await
            .unwrap();
        assert_eq!(ack, ResultAck::Recorded);

        if attempt < 2 {
            assert_eq!(task.status, TaskStatus::Queued);
            assert_eq!(task.retries, attempt + 1);
        } else {
            assert_eq!(task.status, TaskStatus::Failed);
            assert_eq!(task.retries, 2);
        }
        now += Duration::seconds(1);
    }

    let jobs = coordinator
        .list_jobs(&Default::default())
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job.status, JobStatus::Failed);
    assert_eq!(jobs[0].total_retries, 2);
    assert!(jobs[0].job.error.as_deref().unwrap().contains("1 of 1 tasks failed"));

    // A fourth attempt never happens: the task is no longer queued.
    heartbeat(&coordinator, "n1", now).await;
    assert!(coordinator.pull_task("n1", now).await.unwrap().is_none());
}

#[tokio::test]
async fn result_from_non_owner_is_stale_and_appended() {
    let (coordinator, _dir) = setup().await;
    let now = Utc::now();
    bring_up(&coordinator, "n1", now).await;

    coordinator
        .create_job(TaskType::Indexing, &one_task(None), now)
        .await
        .unwrap();
    let claimed = coordinator.pull_task("n1", now).await.unwrap().unwrap();

    // A node that never held the lease reports: history only.
    let (ack, task) = coordinator
        .submit_result(claimed.id, "n2", true, None, 10, None, now)
        .await
        .unwrap();
    assert_eq!(ack, ResultAck::Stale);
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.assigned_node_id.as_deref(), Some("n1"));

    // The owner's result still lands normally afterwards.
    let (ack, task) = coordinator
        .submit_result(claimed.id, "n1", true, None, 42, None, now)
        .await
        .unwrap();
    assert_eq!(ack, ResultAck::Recorded);
    assert_eq!(task.status, TaskStatus::Succeeded);

    // A duplicate success for the terminal task stays historical.
    let (ack, task) = coordinator
        .submit_result(claimed.id, "n1", true, None, 42, None, now)
        .await
        .unwrap();
    assert_eq!(ack, ResultAck::Stale);
    assert_eq!(task.status, TaskStatus::Succeeded);

    // All three reports were appended.
    let metrics = coordinator.execution_metrics().await.unwrap();
    assert_eq!(metrics.overall.count, 3);
    assert_eq!(metrics.overall.succeeded, 3);
}

#[tokio::test]
async fn result_for_unknown_task_is_not_found() {
    let (coordinator, _dir) = setup().await;
    let now = Utc::now();

    let err = coordinator
        .submit_result(uuid::Uuid::new_v4(), "n1", true, None, 5, None, now)
        .await
        .expect_err("unknown task should fail");
    assert!(matches!(err, CoordError::NotFound(_)));
}

#[tokio::test]
async fn reclaimed_task_can_move_to_another_node() {
    let (coordinator, _dir) = setup().await;
    let now = Utc::now();
    bring_up(&coordinator, "n1", now).await;

    coordinator
        .create_job(TaskType::Tokenization, &one_task(None), now)
        .await
        .unwrap();
    let claimed = coordinator.pull_task("n1", now).await.unwrap().unwrap();

    let late = claimed.lease_expires_at.unwrap() + Duration::seconds(1);
    coordinator.reclaim_expired_leases(late).await.unwrap();

    // A second node shows up and wins the requeued task.
    bring_up(&coordinator, "n0", late).await;
    let moved = coordinator.pull_task("n0", late).await.unwrap().unwrap();
    assert_eq!(moved.id, claimed.id);
    assert_eq!(moved.assigned_node_id.as_deref(), Some("n0"));

    // The old holder's late failure report no longer moves the task.
    let (ack, task) = coordinator
        .submit_result(moved.id, "n1", false, None, 99, Some("late"), late)
        .await
        .unwrap();
    assert_eq!(ack, ResultAck::Stale);
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.retries, 1);
}
