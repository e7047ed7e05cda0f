//! Background monitor loops: node staleness and lease expiry.
//!
//! Each loop ticks on its own period, calls the matching coordinator
//! operation with the current wall clock, logs failures, and keeps going.
//! The operations are set-based and idempotent, so a missed tick never
//! builds a backlog. Both loops stop on the shared cancellation token.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::coordinator::Coordinator;

/// Periods for the two scan loops.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub stale_scan_period: Duration,
    pub lease_scan_period: Duration,
}

impl MonitorConfig {
    pub const DEFAULT_STALE_SCAN_SECONDS: u64 = 5;
    pub const DEFAULT_LEASE_SCAN_SECONDS: u64 = 3;

    /// Build from the environment (`STALE_SCAN_SECONDS`,
    /// `LEASE_SCAN_SECONDS`), falling back to the defaults.
    pub fn from_env() -> Self {
        Self {
            stale_scan_period: Duration::from_secs(env_u64(
                "STALE_SCAN_SECONDS",
                Self::DEFAULT_STALE_SCAN_SECONDS,
            )),
            lease_scan_period: Duration::from_secs(env_u64(
                "LEASE_SCAN_SECONDS",
                Self::DEFAULT_LEASE_SCAN_SECONDS,
            )),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            stale_scan_period: Duration::from_secs(Self::DEFAULT_STALE_SCAN_SECONDS),
            lease_scan_period: Duration::from_secs(Self::DEFAULT_LEASE_SCAN_SECONDS),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Spawn both monitor loops. They run until `cancel` fires; the returned
/// handles let the caller await a clean stop at shutdown.
pub fn spawn_monitors(
    coordinator: Arc<Coordinator>,
    config: MonitorConfig,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(stale_scan_loop(
            Arc::clone(&coordinator),
            config.stale_scan_period,
            cancel.clone(),
        )),
        tokio::spawn(lease_scan_loop(
            coordinator,
            config.lease_scan_period,
            cancel,
        )),
    ]
}

async fn stale_scan_loop(
    coordinator: Arc<Coordinator>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("stale scan stopping");
                break;
            }
            _ = interval.tick() => {
                match coordinator.sweep_stale_nodes(Utc::now()).await {
                    Ok(swept) if !swept.is_empty() => {
                        tracing::info!(count = swept.len(), "stale scan flipped nodes");
                    }
                    Ok(_) => {}
                    // A monitor never crashes the process.
                    Err(err) => tracing::warn!(error = %err, "stale scan failed"),
                }
            }
        }
    }
}

async fn lease_scan_loop(
    coordinator: Arc<Coordinator>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("lease scan stopping");
                break;
            }
            _ = interval.tick() => {
                match coordinator.reclaim_expired_leases(Utc::now()).await {
                    Ok(jobs) if !jobs.is_empty() => {
                        tracing::info!(jobs = jobs.len(), "lease scan reclaimed tasks");
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "lease scan failed"),
                }
            }
        }
    }
}
