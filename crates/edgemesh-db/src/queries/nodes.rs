//! Database query functions for the `nodes` and `node_metrics` tables.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::SqliteConnection;

use crate::models::{Capabilities, MetricsSample, Node, NodeMetric, NodePolicy};

/// Insert or replace a node row.
///
/// On conflict the declared fields are replaced and the node is forced back
/// to `online`, but `created_at` and the last metrics sample are preserved.
/// The caller decides which policy to write (registration may omit one, in
/// which case the previously stored policy is passed back in).
pub async fn upsert_node(
    conn: &mut SqliteConnection,
    node_id: &str,
    display_name: &str,
    ip: &str,
    port: i64,
    capabilities: &Capabilities,
    policy: &NodePolicy,
    now: DateTime<Utc>,
) -> Result<Node> {
    let node = sqlx::query_as::<_, Node>(
        "INSERT INTO nodes (node_id, display_name, ip, port, status, capabilities, policy, last_seen, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, 'online', ?5, ?6, ?7, ?7, ?7) \
         ON CONFLICT (node_id) DO UPDATE SET \
             display_name = excluded.display_name, \
             ip = excluded.ip, \
             port = excluded.port, \
             status = 'online', \
             capabilities = excluded.capabilities, \
             policy = excluded.policy, \
             last_seen = excluded.last_seen, \
             updated_at = excluded.updated_at \
         RETURNING *",
    )
    .bind(node_id)
    .bind(display_name)
    .bind(ip)
    .bind(port)
    .bind(Json(capabilities))
    .bind(Json(policy))
    .bind(now)
    .fetch_one(conn)
    .await
    .context("failed to upsert node")?;

    Ok(node)
}

/// Fetch a single node by ID.
pub async fn get_node(conn: &mut SqliteConnection, node_id: &str) -> Result<Option<Node>> {
    let node = sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE node_id = ?1")
        .bind(node_id)
        .fetch_optional(conn)
        .await
        .context("failed to fetch node")?;

    Ok(node)
}

/// List all nodes, ordered by ID for a stable view.
pub async fn list_nodes(conn: &mut SqliteConnection) -> Result<Vec<Node>> {
    let nodes = sqlx::query_as::<_, Node>("SELECT * FROM nodes ORDER BY node_id ASC")
        .fetch_all(conn)
        .await
        .context("failed to list nodes")?;

    Ok(nodes)
}

/// Record a heartbeat: replace the metrics sample, refresh `last_seen`, and
/// force the node back to `online` whatever its prior status.
///
/// Returns the number of rows affected (0 means the node does not exist).
pub async fn record_heartbeat(
    conn: &mut SqliteConnection,
    node_id: &str,
    metrics: &MetricsSample,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE nodes \
         SET metrics = ?1, status = 'online', last_seen = ?2, updated_at = ?2 \
         WHERE node_id = ?3",
    )
    .bind(Json(metrics))
    .bind(now)
    .bind(node_id)
    .execute(conn)
    .await
    .context("failed to record heartbeat")?;

    Ok(result.rows_affected())
}

/// Replace a node's policy.
///
/// Returns the number of rows affected (0 means the node does not exist).
pub async fn update_policy(
    conn: &mut SqliteConnection,
    node_id: &str,
    policy: &NodePolicy,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE nodes SET policy = ?1, updated_at = ?2 WHERE node_id = ?3",
    )
    .bind(Json(policy))
    .bind(now)
    .bind(node_id)
    .execute(conn)
    .await
    .context("failed to update node policy")?;

    Ok(result.rows_affected())
}

/// Flip every `online` node whose `last_seen` is at or before `cutoff` to
/// `stale`. Returns the IDs of the nodes that changed.
///
/// Set-based and idempotent: a second sweep with no intervening heartbeat
/// matches nothing.
pub async fn mark_stale_nodes(
    conn: &mut SqliteConnection,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let ids: Vec<(String,)> = sqlx::query_as(
        "UPDATE nodes \
         SET status = 'stale', updated_at = ?2 \
         WHERE status = 'online' AND last_seen <= ?1 \
         RETURNING node_id",
    )
    .bind(cutoff)
    .bind(now)
    .fetch_all(conn)
    .await
    .context("failed to mark stale nodes")?;

    Ok(ids.into_iter().map(|(id,)| id).collect())
}

/// Append a metrics sample to the node's history.
pub async fn insert_metric_sample(
    conn: &mut SqliteConnection,
    node_id: &str,
    metrics: &MetricsSample,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO node_metrics (node_id, cpu_pct, ram_pct, gpu_pct, inflight, recorded_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(node_id)
    .bind(metrics.cpu_pct)
    .bind(metrics.ram_pct)
    .bind(metrics.gpu_pct)
    .bind(metrics.inflight)
    .bind(metrics.recorded_at)
    .execute(conn)
    .await
    .context("failed to insert metric sample")?;

    Ok(())
}

/// Most recent metrics samples for a node, newest first.
pub async fn list_metric_history(
    conn: &mut SqliteConnection,
    node_id: &str,
    limit: i64,
) -> Result<Vec<NodeMetric>> {
    let samples = sqlx::query_as::<_, NodeMetric>(
        "SELECT * FROM node_metrics \
         WHERE node_id = ?1 \
         ORDER BY recorded_at DESC, id DESC \
         LIMIT ?2",
    )
    .bind(node_id)
    .bind(limit)
    .fetch_all(conn)
    .await
    .context("failed to list metric history")?;

    Ok(samples)
}
