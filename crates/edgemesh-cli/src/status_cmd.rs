//! `edgemesh status` command: show cluster and job state in the terminal.

use anyhow::Result;

use edgemesh_core::coordinator::{Coordinator, JobFilter};
use edgemesh_db::models::NodeStatus;

/// Print a cluster overview followed by the job list.
pub async fn run_status(coordinator: &Coordinator) -> Result<()> {
    let summary = coordinator.cluster_summary(chrono::Utc::now()).await?;

    println!(
        "Nodes: {} total ({} online, {} stale, {} offline, {} unknown), {} tasks inflight",
        summary.nodes_total,
        summary.nodes_online,
        summary.nodes_stale,
        summary.nodes_offline,
        summary.nodes_unknown,
        summary.inflight_total,
    );
    println!("Eligible nodes by task type:");
    for (task_type, count) in &summary.eligible_by_type {
        println!("  {task_type}: {count}");
    }
    println!();

    let nodes = coordinator.list_nodes().await?;
    if !nodes.is_empty() {
        println!("{:<24} {:<10} {:<18} {:>8}", "NODE", "STATUS", "ADDRESS", "INFLIGHT");
        println!("{}", "-".repeat(64));
        for node in &nodes {
            let status_icon = match node.status {
                NodeStatus::Online => "+",
                NodeStatus::Stale => "?",
                NodeStatus::Offline => "!",
                NodeStatus::Unknown => " ",
            };
            let inflight = node
                .metrics
                .as_deref()
                .map(|m| m.inflight.to_string())
                .unwrap_or_else(|| "-".to_owned());
            println!(
                "[{}] {:<20} {:<10} {:<18} {:>8}",
                status_icon,
                node.node_id,
                node.status,
                format!("{}:{}", node.ip, node.port),
                inflight,
            );
        }
        println!();
    }

    let jobs = coordinator.list_jobs(&JobFilter::default()).await?;
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<14} {:<12} {:>10} {:>8}",
        "ID", "TYPE", "STATUS", "PROGRESS", "RETRIES"
    );
    println!("{}", "-".repeat(88));
    for job in &jobs {
        println!(
            "{:<38} {:<14} {:<12} {:>10} {:>8}",
            job.job.id,
            job.job.job_type.to_string(),
            job.job.status.to_string(),
            format!("{}/{}", job.completed_tasks, job.total_tasks),
            job.total_retries,
        );
    }

    Ok(())
}
