//! Node Health
//!
//! Liveness and readiness of a cache node, plus a detailed report built
//! from engine state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::CacheStats;

/// Queue depth past which the node reports itself degraded
pub const QUEUE_BACKLOG_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum HealthStatus {
    Healthy,
    /// Serving, but with reduced reach or a backlog
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// Result of one named check
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub name: &'static str,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthCheckResult {
    fn healthy(name: &'static str) -> Self {
        Self {
            name,
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    fn with(name: &'static str, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            name,
            status,
            message: Some(message.into()),
        }
    }
}

/// Full health report
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Worst status across all checks
    pub status: HealthStatus,
    pub checks: Vec<HealthCheckResult>,
    pub version: String,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

impl HealthResponse {
    pub fn new(checks: Vec<HealthCheckResult>, uptime: Duration) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            checks,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime.as_secs(),
            timestamp: Utc::now(),
        }
    }
}

/// Liveness and readiness flags for one node
pub struct HealthCheck {
    start_time: Instant,
    live: AtomicBool,
    ready: AtomicBool,
}

impl HealthCheck {
    /// Live but not yet ready
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Relaxed);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Evaluate the node against current engine state
    pub fn report(&self, engine_running: bool, stats: &CacheStats) -> HealthResponse {
        let mut checks = Vec::with_capacity(4);

        checks.push(if self.is_ready() {
            HealthCheckResult::healthy("readiness")
        } else {
            HealthCheckResult::with("readiness", HealthStatus::Unhealthy, "not accepting requests")
        });

        checks.push(if engine_running {
            HealthCheckResult::healthy("workers")
        } else {
            HealthCheckResult::with("workers", HealthStatus::Unhealthy, "worker pools stopped")
        });

        checks.push(if stats.peers == 0 {
            HealthCheckResult::with("peers", HealthStatus::Degraded, "no peers registered")
        } else {
            HealthCheckResult::healthy("peers")
        });

        let backlog = stats.delivery_queue + stats.region_queue + stats.client_queue;
        checks.push(if backlog > QUEUE_BACKLOG_THRESHOLD {
            HealthCheckResult::with(
                "queues",
                HealthStatus::Degraded,
                format!("{} items queued", backlog),
            )
        } else {
            HealthCheckResult::healthy("queues")
        });

        HealthResponse::new(checks, self.uptime())
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
