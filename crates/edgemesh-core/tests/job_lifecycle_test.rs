//! Integration tests for job lifecycle: derived status and progress,
//! operator cancel, summaries, and bus notifications.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use edgemesh_core::bus::EventBus;
use edgemesh_core::coordinator::{
    Coordinator, CoordinatorConfig, JobFilter, NodeRegistration, TaskSpec,
};
use edgemesh_core::error::CoordError;
use edgemesh_db::models::{
    Capabilities, JobStatus, MetricsSample, NodeStatus, TaskStatus, TaskType,
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
                ip: "192.168.1.40".to_owned(),
                port: 9300,
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

fn specs(count: usize) -> Vec<TaskSpec> {
    (0..count)
        .map(|i| TaskSpec {
            payload: serde_json::json!({"index": i}),
            max_retries: None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn job_walks_queued_running_completed() {
    let (coordinator, _dir) = setup().await;
    let now = Utc::now();
    bring_up(&coordinator, "n1", now).await;

    let created = coordinator
        .create_job(TaskType::Embeddings, &specs(2), now)
        .await
        .unwrap();
    assert_eq!(created.job.status, JobStatus::Queued);
    assert_eq!(created.completed_tasks, 0);
    assert!(created.assigned_nodes.is_empty());

    // Progress is monotone: completed_tasks only ever grows.
    let mut last_completed = 0;
    for _ in 0..2 {
        let task = coordinator.pull_task("n1", now).await.unwrap().unwrap();
        let running = coordinator.get_job(created.job.id).await.unwrap();
        assert_eq!(running.job.status, JobStatus::Running);
        assert!(running.job.started_at.is_some());

        coordinator
            .submit_result(task.id, "n1", true, Some(&serde_json::json!({"ok": true})), 30, None, now)
            .await
            .unwrap();
        let view = coordinator.get_job(created.job.id).await.unwrap();
        assert!(view.completed_tasks >= last_completed);
        last_completed = view.completed_tasks;
    }

    let done = coordinator.get_job(created.job.id).await.unwrap();
    assert_eq!(done.job.status, JobStatus::Completed);
    assert_eq!(done.completed_tasks, 2);
    assert!(done.job.completed_at.is_some());
    assert_eq!(done.assigned_nodes, vec!["n1".to_string()]);
}

#[tokio::test]
async fn get_job_unknown_is_not_found() {
    let (coordinator, _dir) = setup().await;
    let err = coordinator
        .get_job(uuid::Uuid::new_v4())
        .await
        .expect_err("unknown job should fail");
    assert!(matches!(err, CoordError::NotFound(_)));

    let err = coordinator
        .get_job_tasks(uuid::Uuid::new_v4())
        .await
        .expect_err("unknown job should fail");
    assert!(matches!(err, CoordError::NotFound(_)));
}

#[tokio::test]
async fn heartbeat_for_unknown_node_is_not_found() {
    let (coordinator, _dir) = setup().await;
    let err = coordinator
        .heartbeat(
            "ghost",
            &MetricsSample {
                cpu_pct: 0.0,
                ram_pct: 0.0,
                gpu_pct: None,
                inflight: 0,
                recorded_at: Utc::now(),
            },
            Utc::now(),
        )
        .await
        .expect_err("unknown node should fail");
    assert!(matches!(err, CoordError::NotFound(_)));
}

#[tokio::test]
async fn cancel_fails_queued_tasks_and_sticks() {
    let (coordinator, _dir) = setup().await;
    let now = Utc::now();
    bring_up(&coordinator, "n1", now).await;

    let created = coordinator
        .create_job(TaskType::Preprocessing, &specs(3), now)
        .await
        .unwrap();
    let running = coordinator.pull_task("n1", now).await.unwrap().unwrap();

    let cancelled = coordinator.cancel_job(created.job.id, now).await.unwrap();
    assert_eq!(cancelled.job.status, JobStatus::Cancelled);

    let tasks = coordinator.get_job_tasks(created.job.id).await.unwrap();
    let queued_now_failed: Vec<_> = tasks.iter().filter(|t| t.id != running.id).collect();
    assert_eq!(queued_now_failed.len(), 2);
    for task in queued_now_failed {
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("cancelled"));
    }

    // The running lease finishes naturally but cannot resurrect the job.
    coordinator
        .submit_result(running.id, "n1", true, None, 12, None, now)
        .await
        .unwrap();
    let after = coordinator.get_job(created.job.id).await.unwrap();
    assert_eq!(after.job.status, JobStatus::Cancelled);

    // Cancelling a terminal job conflicts.
    let err = coordinator
        .cancel_job(created.job.id, now)
        .await
        .expect_err("second cancel should fail");
    assert!(matches!(err, CoordError::Conflict(_)));
}

#[tokio::test]
async fn list_jobs_filters_by_status_type_and_node() {
    let (coordinator, _dir) = setup().await;
    let now = Utc::now();
    bring_up(&coordinator, "n1", now).await;

    let embed = coordinator
        .create_job(TaskType::Embeddings, &specs(1), now)
        .await
        .unwrap();
    coordinator
        .create_job(TaskType::Inference, &specs(1), now)
        .await
        .unwrap();

    let task = coordinator.pull_task("n1", now).await.unwrap().unwrap();
    assert_eq!(task.job_id, embed.job.id);

    let by_type = coordinator
        .list_jobs(&JobFilter {
            task_type: Some(TaskType::Embeddings),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_type.len(), 1);
    assert_eq!(by_type[0].job.id, embed.job.id);

    let by_status = coordinator
        .list_jobs(&JobFilter {
            status: Some(JobStatus::Running),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_status.len(), 1);
    assert_eq!(by_status[0].job.id, embed.job.id);

    let by_node = coordinator
        .list_jobs(&JobFilter {
            node_id: Some("n1".to_owned()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_node.len(), 1);

    let nobody = coordinator
        .list_jobs(&JobFilter {
            node_id: Some("n9".to_owned()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(nobody.is_empty());
}

#[tokio::test]
async fn cluster_summary_counts_and_eligibility() {
    let (coordinator, _dir) = setup().await;
    let now = Utc::now();
    bring_up(&coordinator, "n1", now).await;
    bring_up(&coordinator, "n2", now).await;

    // Leave n2 headroom so its inflight load keeps it eligible.
    coordinator
        .set_policy(
            "n2",
            &edgemesh_db::models::NodePolicy {
                max_concurrent: 5,
                ..Default::default()
            },
            now,
        )
        .await
        .unwrap();

    // One node drops off the map.
    let later = now + coordinator.config().stale_threshold();
    coordinator
        .heartbeat(
            "n2",
            &MetricsSample {
                cpu_pct: 10.0,
                ram_pct: 30.0,
                gpu_pct: None,
                inflight: 3,
                recorded_at: later,
            },
            later,
        )
        .await
        .unwrap();
    coordinator.sweep_stale_nodes(later).await.unwrap();

    let summary = coordinator.cluster_summary(later).await.unwrap();
    assert_eq!(summary.nodes_total, 2);
    assert_eq!(summary.nodes_online, 1);
    assert_eq!(summary.nodes_stale, 1);
    assert_eq!(summary.inflight_total, 3);
    for task_type in TaskType::ALL {
        // Only n2 is online and fresh, and it accepts everything.
        assert_eq!(summary.eligible_by_type.get(&task_type), Some(&1));
    }

    let nodes = coordinator.list_nodes().await.unwrap();
    let n1 = nodes.iter().find(|n| n.node_id == "n1").unwrap();
    assert_eq!(n1.status, NodeStatus::Stale);
}

#[tokio::test]
async fn execution_metrics_aggregates_by_type() {
    let (coordinator, _dir) = setup().await;
    let now = Utc::now();
    bring_up(&coordinator, "n1", now).await;

    coordinator
        .create_job(TaskType::Embeddings, &specs(1), now)
        .await
        .unwrap();
    let task = coordinator.pull_task("n1", now).await.unwrap().unwrap();
    coordinator
        .submit_result(task.id, "n1", true, None, 100, None, now)
        .await
        .unwrap();

    let metrics = coordinator.execution_metrics().await.unwrap();
    assert_eq!(metrics.overall.count, 1);
    assert_eq!(metrics.overall.succeeded, 1);
    assert_eq!(metrics.overall.failed, 0);
    assert_eq!(metrics.overall.mean_ms, 100.0);
    assert_eq!(metrics.overall.median_ms, 100.0);
    assert_eq!(metrics.overall.p95_ms, 100.0);

    let embed = metrics
        .by_type
        .get(&TaskType::Embeddings)
        .expect("embeddings bucket should exist");
    assert_eq!(embed.count, 1);
    assert!(!metrics.by_type.contains_key(&TaskType::Inference));
}

#[tokio::test]
async fn every_created_job_is_announced_on_the_bus() {
    let (coordinator, _dir) = setup().await;
    let now = Utc::now();
    let mut rx = coordinator.bus().subscribe_jobs();

    let mut created = HashSet::new();
    for _ in 0..20 {
        let view = coordinator
            .create_job(TaskType::Embeddings, &specs(1), now)
            .await
            .unwrap();
        created.insert(view.job.id);
    }

    let mut announced = HashSet::new();
    while announced.len() < created.len() {
        let update = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("bus should deliver updates")
            .expect("bus should stay open");
        announced.insert(update.job_id);
    }
    assert_eq!(announced, created);
}

#[tokio::test]
async fn registration_keeps_policy_unless_replaced() {
    let (coordinator, _dir) = setup().await;
    let now = Utc::now();

    let mut registration = NodeRegistration {
        node_id: "n1".to_owned(),
        display_name: "worker n1".to_owned(),
        ip: "192.168.1.40".to_owned(),
        port: 9300,
        capabilities: Capabilities {
            cpu_cores: 4,
            ram_total_mb: 8192,
            gpu: None,
            supported_task_types: TaskType::ALL.to_vec(),
        },
        policy: None,
    };
    coordinator.register_node(&registration, now).await.unwrap();

    let tightened = edgemesh_db::models::NodePolicy {
        max_concurrent: 7,
        ..Default::default()
    };
    coordinator.set_policy("n1", &tightened, now).await.unwrap();

    // Restarted agent re-registers without a policy: the cap survives.
    let node = coordinator.register_node(&registration, now).await.unwrap();
    assert_eq!(node.policy.max_concurrent, 7);

    // An explicit policy in the registration replaces it.
    registration.policy = Some(Default::default());
    let node = coordinator.register_node(&registration, now).await.unwrap();
    assert_eq!(node.policy.max_concurrent, 1);
}
