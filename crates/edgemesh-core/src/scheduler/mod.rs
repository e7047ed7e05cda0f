//! Pure scheduling policy.
//!
//! Decides which nodes may run a task of a given type and in what order,
//! from a snapshot of node rows. No I/O: the dispatcher evaluates this
//! inside its claim transaction and the simulator evaluates it read-only,
//! so both always agree on the winner for a given snapshot.

use chrono::{DateTime, Duration, Utc};

use edgemesh_db::models::{Node, NodeStatus, TaskType};

/// Whether a task payload demands a GPU-equipped node.
///
/// The payload is otherwise opaque; only the `requires_gpu` key is
/// consulted, defaulting to false when absent or not a boolean.
pub fn payload_requires_gpu(payload: &serde_json::Value) -> bool {
    payload
        .get("requires_gpu")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// Whether a single node is eligible to run a task of `task_type` right now.
pub fn is_eligible(
    node: &Node,
    task_type: TaskType,
    requires_gpu: bool,
    now: DateTime<Utc>,
    stale_threshold: Duration,
) -> bool {
    // Online and fresh: a node the staleness sweep has not caught up with
    // yet is still ineligible.
    if node.status != NodeStatus::Online || now - node.last_seen >= stale_threshold {
        return false;
    }

    if !node.policy.accepted_task_types.contains(&task_type) {
        return false;
    }

    // A node that has never heartbeated has no load sample to judge by.
    let Some(metrics) = node.metrics.as_deref() else {
        return false;
    };

    if metrics.inflight >= node.policy.max_concurrent {
        return false;
    }

    if metrics.cpu_pct > node.policy.cpu_ceiling || metrics.ram_pct > node.policy.ram_ceiling {
        return false;
    }

    if requires_gpu && node.capabilities.gpu.is_none() {
        return false;
    }

    true
}

/// Eligible nodes for a task type, least-loaded first.
///
/// Ordering key: ascending `(inflight, cpu_pct, ram_pct, node_id)`. The
/// trailing `node_id` breaks ties deterministically.
pub fn eligible_nodes<'a>(
    task_type: TaskType,
    requires_gpu: bool,
    now: DateTime<Utc>,
    snapshot: &'a [Node],
    stale_threshold: Duration,
) -> Vec<&'a Node> {
    let mut eligible: Vec<&Node> = snapshot
        .iter()
        .filter(|node| is_eligible(node, task_type, requires_gpu, now, stale_threshold))
        .collect();

    eligible.sort_by(|a, b| {
        // is_eligible already required a metrics sample.
        let (am, bm) = (a.metrics.as_deref().unwrap(), b.metrics.as_deref().unwrap());
        am.inflight
            .cmp(&bm.inflight)
            .then(
                am.cpu_pct
                    .partial_cmp(&bm.cpu_pct)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(
                am.ram_pct
                    .partial_cmp(&bm.ram_pct)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.node_id.cmp(&b.node_id))
    });

    eligible
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sqlx::types::Json;

    use edgemesh_db::models::{Capabilities, GpuCapability, MetricsSample, NodePolicy};

    fn stale_threshold() -> Duration {
        Duration::seconds(15)
    }

    fn test_node(node_id: &str, inflight: i64, cpu_pct: f64) -> Node {
        let now = Utc::now();
        Node {
            node_id: node_id.to_owned(),
            display_name: node_id.to_owned(),
            ip: "10.0.0.1".to_owned(),
            port: 9000,
            status: NodeStatus::Online,
            capabilities: Json(Capabilities {
                cpu_cores: 8,
                ram_total_mb: 16_384,
                gpu: None,
                supported_task_types: TaskType::ALL.to_vec(),
            }),
            metrics: Some(Json(MetricsSample {
                cpu_pct,
                ram_pct: 40.0,
                gpu_pct: None,
                inflight,
                recorded_at: now,
            })),
            policy: Json(NodePolicy {
                max_concurrent: 4,
                ..NodePolicy::default()
            }),
            last_seen: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn requires_gpu_defaults_to_false() {
        assert!(!payload_requires_gpu(&serde_json::json!({})));
        assert!(!payload_requires_gpu(&serde_json::json!({"requires_gpu": "yes"})));
        assert!(payload_requires_gpu(&serde_json::json!({"requires_gpu": true})));
    }

    #[test]
    fn fresh_online_node_is_eligible() {
        let node = test_node("n1", 0, 10.0);
        assert!(is_eligible(
            &node,
            TaskType::Embeddings,
            false,
            Utc::now(),
            stale_threshold()
        ));
    }

    #[test]
    fn stale_status_is_ineligible() {
        let mut node = test_node("n1", 0, 10.0);
        node.status = NodeStatus::Stale;
        assert!(!is_eligible(
            &node,
            TaskType::Embeddings,
            false,
            Utc::now(),
            stale_threshold()
        ));
    }

    #[test]
    fn online_but_unseen_past_threshold_is_ineligible() {
        // The sweep has not flipped the status yet, but freshness is
        // checked against last_seen directly.
        let mut node = test_node("n1", 0, 10.0);
        node.last_seen = Utc::now() - Duration::seconds(20);
        assert!(!is_eligible(
            &node,
            TaskType::Embeddings,
            false,
            Utc::now(),
            stale_threshold()
        ));
    }

    #[test]
    fn unaccepted_task_type_is_ineligible() {
        let mut node = test_node("n1", 0, 10.0);
        node.policy.0.accepted_task_types = vec![TaskType::Inference];
        assert!(!is_eligible(
            &node,
            TaskType::Embeddings,
            false,
            Utc::now(),
            stale_threshold()
        ));
    }

    #[test]
    fn node_without_metrics_is_ineligible() {
        let mut node = test_node("n1", 0, 10.0);
        node.metrics = None;
        assert!(!is_eligible(
            &node,
            TaskType::Embeddings,
            false,
            Utc::now(),
            stale_threshold()
        ));
    }

    #[test]
    fn concurrency_cap_is_enforced() {
        let mut node = test_node("n1", 4, 10.0);
        assert!(!is_eligible(
            &node,
            TaskType::Embeddings,
            false,
            Utc::now(),
            stale_threshold()
        ));
        node.policy.0.max_concurrent = 0;
        node.metrics.as_mut().unwrap().0.inflight = 0;
        assert!(!is_eligible(
            &node,
            TaskType::Embeddings,
            false,
            Utc::now(),
            stale_threshold()
        ));
    }

    #[test]
    fn resource_ceilings_are_enforced() {
        let mut node = test_node("n1", 0, 95.0);
        node.policy.0.cpu_ceiling = 90.0;
        assert!(!is_eligible(
            &node,
            TaskType::Embeddings,
            false,
            Utc::now(),
            stale_threshold()
        ));

        let mut node = test_node("n2", 0, 10.0);
        node.policy.0.ram_ceiling = 30.0;
        assert!(!is_eligible(
            &node,
            TaskType::Embeddings,
            false,
            Utc::now(),
            stale_threshold()
        ));
    }

    #[test]
    fn gpu_requirement_filters_gpuless_nodes() {
        let mut with_gpu = test_node("n1", 0, 10.0);
        with_gpu.capabilities.0.gpu = Some(GpuCapability {
            model: "RTX 4090".to_owned(),
        });
        let without_gpu = test_node("n2", 0, 10.0);

        let snapshot = vec![with_gpu, without_gpu];
        let ranked = eligible_nodes(
            TaskType::Inference,
            true,
            Utc::now(),
            &snapshot,
            stale_threshold(),
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].node_id, "n1");
    }

    #[test]
    fn ordering_is_least_loaded_first() {
        let snapshot = vec![
            test_node("n1", 2, 10.0),
            test_node("n2", 0, 50.0),
            test_node("n3", 0, 20.0),
        ];
        let ranked = eligible_nodes(
            TaskType::Embeddings,
            false,
            Utc::now(),
            &snapshot,
            stale_threshold(),
        );
        let ids: Vec<&str> = ranked.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["n3", "n2", "n1"]);
    }

    #[test]
    fn node_id_breaks_ties_deterministically() {
        let snapshot = vec![
            test_node("nb", 1, 10.0),
            test_node("na", 1, 10.0),
        ];
        let ranked = eligible_nodes(
            TaskType::Embeddings,
            false,
            Utc::now(),
            &snapshot,
            stale_threshold(),
        );
        let ids: Vec<&str> = ranked.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["na", "nb"]);
    }
}
