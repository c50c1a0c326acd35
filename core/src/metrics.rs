// ABOUTME: Global metrics counters for the Prometheus endpoint
// ABOUTME: Incremented by the allocation engine, index and registry; rendered by the API

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide registry counters.
pub struct Metrics {
    // === Allocation ===
    /// Nodes that bootstrapped with a fresh id/token
    pub instances_created: AtomicU64,
    /// Ids taken over by a replacement host
    pub instances_replaced: AtomicU64,
    /// Re-registrations of an already registered host
    pub instances_unchanged: AtomicU64,
    /// Records removed through delete
    pub instances_deleted: AtomicU64,
    /// Token candidates rejected because another node held them
    pub token_retries: AtomicU64,
    /// Creates that ran out of token candidates
    pub allocation_exhausted: AtomicU64,
    /// Calls that failed with a conflict
    pub conflicts: AtomicU64,
    /// Calls that failed because the store was unreachable or slow
    pub store_unavailable: AtomicU64,

    // === Membership index ===
    pub index_hits: AtomicU64,
    pub index_misses: AtomicU64,
    /// Snapshots rebuilt by the background refresher
    pub index_rebuilds: AtomicU64,
}

impl Metrics {
    const fn new() -> Self {
        Self {
            instances_created: AtomicU64::new(0),
            instances_replaced: AtomicU64::new(0),
            instances_unchanged: AtomicU64::new(0),
            instances_deleted: AtomicU64::new(0),
            token_retries: AtomicU64::new(0),
            allocation_exhausted: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            store_unavailable: AtomicU64::new(0),
            index_hits: AtomicU64::new(0),
            index_misses: AtomicU64::new(0),
            index_rebuilds: AtomicU64::new(0),
        }
    }

    pub fn inc_created(&self) {
        self.instances_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_replaced(&self) {
        self.instances_replaced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_unchanged(&self) {
        self.instances_unchanged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_deleted(&self) {
        self.instances_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_token_retry(&self) {
        self.token_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_index_hit(&self) {
        self.index_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_index_miss(&self) {
        self.index_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_index_rebuild(&self) {
        self.index_rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed call under the matching failure counter.
    pub fn record_error(&self, err: &crate::Error) {
        let counter = match err {
            crate::Error::Conflict(_) => &self.conflicts,
            crate::Error::AllocationExhausted { .. } => &self.allocation_exhausted,
            crate::Error::Unavailable(_) => &self.store_unavailable,
            crate::Error::NotFound { .. } | crate::Error::InvalidArgument(_) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Format all metrics as Prometheus text
    pub fn to_prometheus(&self) -> String {
        let series: [(&str, &str, &str, &AtomicU64); 11] = [
            (
                "ringkeeper_instances_created_total",
                "counter",
                "Nodes registered with a newly allocated id and token",
                &self.instances_created,
            ),
            (
                "ringkeeper_instances_replaced_total",
                "counter",
                "Ids taken over by a replacement host",
                &self.instances_replaced,
            ),
            (
                "ringkeeper_instances_unchanged_total",
                "counter",
                "Idempotent re-registrations",
                &self.instances_unchanged,
            ),
            (
                "ringkeeper_instances_deleted_total",
                "counter",
                "Membership records deleted",
                &self.instances_deleted,
            ),
            (
                "ringkeeper_token_retries_total",
                "counter",
                "Token candidates lost to another node",
                &self.token_retries,
            ),
            (
                "ringkeeper_allocation_exhausted_total",
                "counter",
                "Creates that exhausted every token candidate",
                &self.allocation_exhausted,
            ),
            (
                "ringkeeper_conflicts_total",
                "counter",
                "Calls rejected with a conflict",
                &self.conflicts,
            ),
            (
                "ringkeeper_store_unavailable_total",
                "counter",
                "Calls failed by an unreachable or slow store",
                &self.store_unavailable,
            ),
            (
                "ringkeeper_index_hits_total",
                "counter",
                "Reads served from a cached snapshot",
                &self.index_hits,
            ),
            (
                "ringkeeper_index_misses_total",
                "counter",
                "Reads that loaded from the store",
                &self.index_misses,
            ),
            (
                "ringkeeper_index_rebuilds_total",
                "counter",
                "Snapshots rebuilt by the background refresher",
                &self.index_rebuilds,
            ),
        ];

        let mut output = String::new();
        for (i, (name, kind, help, value)) in series.iter().enumerate() {
            if i > 0 {
                output.push('\n');
            }
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} {kind}");
            let _ = writeln!(output, "{name} {}", value.load(Ordering::Relaxed));
        }
        output
    }
}

/// Global metrics instance
pub static METRICS: Metrics = Metrics::new();
