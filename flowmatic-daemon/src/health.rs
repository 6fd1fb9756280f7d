//! Aggregated health check reporting.
//!
//! Each loaded rule is reported as one component, derived from the status
//! of its targets. The overall daemon status is the worst status among all
//! enabled components.
//!
//! # Aggregation Rule
//!
//! - All Healthy -> Healthy
//! - Any Degraded, none Unhealthy -> Degraded(reason)
//! - Any Unhealthy -> Unhealthy(reason)

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use flowmatic_engine::{Engine, EngineStats, RuleInfo, TargetStatus};

/// Health of a component or of the whole daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Still processing, but part of the work is lost.
    Degraded(String),
    /// Not producing any output.
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy(_))
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded(reason) => write!(f, "degraded: {reason}"),
            Self::Unhealthy(reason) => write!(f, "unhealthy: {reason}"),
        }
    }
}

/// Aggregated health report for the entire daemon.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonHealth {
    /// Overall daemon health status (worst of all components).
    pub status: HealthStatus,
    /// Daemon uptime in seconds since start.
    pub uptime_secs: u64,
    /// Per-rule health reports.
    pub components: Vec<ComponentHealth>,
    /// Engine counters at the time of the check.
    pub stats: EngineStats,
}

/// Health status for a single component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    /// Component name (`rule:<name>`).
    pub name: String,
    /// Disabled components are reported but never affect the aggregate.
    pub enabled: bool,
    pub status: HealthStatus,
}

/// Derive the health of one rule from its targets.
///
/// A rule whose targets all failed is unhealthy; a rule with some failed
/// targets is degraded. Rules without targets only count matches and are
/// always healthy.
pub fn rule_health(rule: &RuleInfo) -> ComponentHealth {
    let failed: Vec<String> = rule
        .targets
        .iter()
        .filter(|t| t.status == TargetStatus::Failed)
        .map(|t| format!("{} {}", t.kind, t.id))
        .collect();

    let status = if failed.is_empty() {
        HealthStatus::Healthy
    } else if failed.len() == rule.targets.len() {
        HealthStatus::Unhealthy(format!("all targets failed ({})", failed.join(", ")))
    } else {
        HealthStatus::Degraded(format!("failed targets: {}", failed.join(", ")))
    };

    ComponentHealth {
        name: format!("rule:{}", rule.name),
        enabled: rule.enabled,
        status,
    }
}

/// Aggregate multiple component health statuses into a single status.
///
/// Returns the worst status found: Unhealthy > Degraded > Healthy.
/// Only considers enabled components.
pub fn aggregate_status(components: &[ComponentHealth]) -> HealthStatus {
    let mut worst = HealthStatus::Healthy;
    let mut reasons = Vec::new();

    for component in components.iter().filter(|c| c.enabled) {
        match &component.status {
            HealthStatus::Healthy => {}
            HealthStatus::Degraded(reason) => {
                reasons.push(format!("{}: {}", component.name, reason));
                if !worst.is_unhealthy() {
                    worst = HealthStatus::Degraded(String::new());
                }
            }
            HealthStatus::Unhealthy(reason) => {
                reasons.push(format!("{}: {}", component.name, reason));
                worst = HealthStatus::Unhealthy(String::new());
            }
        }
    }

    match worst {
        HealthStatus::Healthy => HealthStatus::Healthy,
        HealthStatus::Degraded(_) => HealthStatus::Degraded(reasons.join("; ")),
        HealthStatus::Unhealthy(_) => HealthStatus::Unhealthy(reasons.join("; ")),
    }
}

/// Build a health report from the current engine state.
pub fn check_engine(engine: &Engine, uptime_secs: u64) -> DaemonHealth {
    let components: Vec<ComponentHealth> = engine.list_rules().iter().map(rule_health).collect();
    DaemonHealth {
        status: aggregate_status(&components),
        uptime_secs,
        components,
        stats: engine.stats(),
    }
}

/// Spawn a background task that periodically checks engine health
/// and logs the aggregated result whenever it changes.
///
/// The task exits when `cancel` is triggered.
pub fn spawn_health_check_task(
    engine: Arc<Engine>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let started = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last = HealthStatus::Healthy;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let health = check_engine(&engine, started.elapsed().as_secs());
                    if health.status != last {
                        match &health.status {
                            HealthStatus::Healthy => tracing::info!("daemon health restored"),
                            HealthStatus::Degraded(reason) => {
                                tracing::warn!(reason = %reason, "daemon health degraded");
                            }
                            HealthStatus::Unhealthy(reason) => {
                                tracing::error!(reason = %reason, "daemon unhealthy");
                            }
                        }
                        last = health.status;
                    } else {
                        tracing::debug!(
                            frames_processed = health.stats.frames_processed,
                            conntrack_entries = health.stats.conntrack_entries,
                            "health check tick"
                        );
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::debug!("health check task shutting down");
                    break;
                }
            }
        }
    })
}
