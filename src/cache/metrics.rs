//! Cache Metrics Collection
//!
//! Lock-free counters for the resolution pipeline, plus an exponential
//! moving average of how long a miss takes to resolve.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Memory tier
    hits: AtomicU64,
    misses: AtomicU64,
    folded_joins: AtomicU64,
    invalid_requests: AtomicU64,

    // Durable store
    upstream_requests: AtomicU64,
    store_resolved: AtomicU64,
    store_unresolved: AtomicU64,

    // Peers
    peer_lookups: AtomicU64,
    peer_hits: AtomicU64,
    peer_misses: AtomicU64,
    peer_errors: AtomicU64,

    // Delivery
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,

    // Writes
    puts: AtomicU64,
    duplicate_puts: AtomicU64,

    // Time from first miss to resolution (microseconds, EMA)
    miss_latency_us: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $get:ident, $field:ident) => {
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_hit, hits, hits);
    counter!(record_miss, misses, misses);
    counter!(record_folded_join, folded_joins, folded_joins);
    counter!(record_invalid_request, invalid_requests, invalid_requests);
    counter!(record_upstream_request, upstream_requests, upstream_requests);
    counter!(record_store_resolved, store_resolved, store_resolved);
    counter!(record_store_unresolved, store_unresolved, store_unresolved);
    counter!(record_peer_lookup, peer_lookups, peer_lookups);
    counter!(record_peer_hit, peer_hits, peer_hits);
    counter!(record_peer_miss, peer_misses, peer_misses);
    counter!(record_peer_error, peer_errors, peer_errors);
    counter!(record_delivery, deliveries, deliveries);
    counter!(record_delivery_failure, delivery_failures, delivery_failures);
    counter!(record_put, puts, puts);
    counter!(record_duplicate_put, duplicate_puts, duplicate_puts);

    /// Count several failed peer calls at once
    pub fn record_peer_errors(&self, n: u64) {
        if n > 0 {
            self.peer_errors.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Memory-tier hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Record time from first miss to resolution
    pub fn record_miss_latency(&self, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = self.miss_latency_us.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if self
                .miss_latency_us
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn miss_latency(&self) -> Duration {
        Duration::from_micros(self.miss_latency_us.load(Ordering::Relaxed))
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            folded_joins: self.folded_joins(),
            invalid_requests: self.invalid_requests(),
            upstream_requests: self.upstream_requests(),
            store_resolved: self.store_resolved(),
            store_unresolved: self.store_unresolved(),
            peer_lookups: self.peer_lookups(),
            peer_hits: self.peer_hits(),
            peer_misses: self.peer_misses(),
            peer_errors: self.peer_errors(),
            deliveries: self.deliveries(),
            delivery_failures: self.delivery_failures(),
            puts: self.puts(),
            duplicate_puts: self.duplicate_puts(),
            miss_latency_ms: self.miss_latency().as_secs_f64() * 1000.0,
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.folded_joins,
            &self.invalid_requests,
            &self.upstream_requests,
            &self.store_resolved,
            &self.store_unresolved,
            &self.peer_lookups,
            &self.peer_hits,
            &self.peer_misses,
            &self.peer_errors,
            &self.deliveries,
            &self.delivery_failures,
            &self.puts,
            &self.duplicate_puts,
            &self.miss_latency_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub folded_joins: u64,
    pub invalid_requests: u64,

    pub upstream_requests: u64,
    pub store_resolved: u64,
    pub store_unresolved: u64,

    pub peer_lookups: u64,
    pub peer_hits: u64,
    pub peer_misses: u64,
    pub peer_errors: u64,

    pub deliveries: u64,
    pub delivery_failures: u64,

    pub puts: u64,
    pub duplicate_puts: u64,

    /// Average time after a cache miss until resolution
    pub miss_latency_ms: f64,
}

// =============================================================================
// Tests
// =============================================================================
