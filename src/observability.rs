//! Logging is ambient via `tracing` throughout the crate; this module is the
//! pluggable half of observability — a `MetricsSink` trait applications can
//! implement to forward counters to whatever backend they run (Prometheus,
//! StatsD, ...), plus the snapshot/report types `Stack` exposes directly.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Receives counter increments as the stack runs. The concrete backend
/// (Prometheus, StatsD, a log line, ...) is the application's concern; this
/// crate only defines the interface and calls it.
pub trait MetricsSink: Send + Sync {
    fn dialog_created(&self) {}
    fn dialog_terminated(&self) {}
    fn transaction_timeout(&self) {}
    fn transaction_transport_failure(&self) {}
    fn callback_panic(&self) {}
    fn id_pool_hit(&self) {}
    fn id_pool_miss(&self) {}
}

/// No-op sink used when the application doesn't supply one, and as the test
/// double that records what it was told so assertions can check it.
#[derive(Debug, Default)]
pub struct NoopMetricsSink {
    panics: AtomicU64,
}

impl MetricsSink for NoopMetricsSink {
    fn callback_panic(&self) {
        self.panics.fetch_add(1, Ordering::Relaxed);
    }
}

impl NoopMetricsSink {
    pub fn panics(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }
}

/// Internal counters the stack keeps regardless of whether an application
/// `MetricsSink` is attached; `Stack::metrics()` snapshots these.
#[derive(Debug, Default)]
pub struct Counters {
    pub dialogs_created: AtomicU64,
    pub dialogs_terminated: AtomicU64,
    pub transactions_timed_out: AtomicU64,
    pub transport_failures: AtomicU64,
    pub callback_panics: AtomicU64,
    pub id_pool_hits: AtomicU64,
    pub id_pool_misses: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            dialogs_created: self.dialogs_created.load(Ordering::Relaxed),
            dialogs_terminated: self.dialogs_terminated.load(Ordering::Relaxed),
            transactions_timed_out: self.transactions_timed_out.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
            callback_panics: self.callback_panics.load(Ordering::Relaxed),
            id_pool_hits: self.id_pool_hits.load(Ordering::Relaxed),
            id_pool_misses: self.id_pool_misses.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for Counters {
    fn dialog_created(&self) {
        self.dialogs_created.fetch_add(1, Ordering::Relaxed);
    }
    fn dialog_terminated(&self) {
        self.dialogs_terminated.fetch_add(1, Ordering::Relaxed);
    }
    fn transaction_timeout(&self) {
        self.transactions_timed_out.fetch_add(1, Ordering::Relaxed);
    }
    fn transaction_transport_failure(&self) {
        self.transport_failures.fetch_add(1, Ordering::Relaxed);
    }
    fn callback_panic(&self) {
        self.callback_panics.fetch_add(1, Ordering::Relaxed);
    }
    fn id_pool_hit(&self) {
        self.id_pool_hits.fetch_add(1, Ordering::Relaxed);
    }
    fn id_pool_miss(&self) {
        self.id_pool_misses.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`Counters`], returned by `Stack::metrics()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub dialogs_created: u64,
    pub dialogs_terminated: u64,
    pub transactions_timed_out: u64,
    pub transport_failures: u64,
    pub callback_panics: u64,
    pub id_pool_hits: u64,
    pub id_pool_misses: u64,
}

impl CountersSnapshot {
    /// Renders the snapshot as JSON for applications that expose it on a
    /// metrics/health endpoint rather than forwarding it through a
    /// [`MetricsSink`].
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("CountersSnapshot fields are all plain integers")
    }
}

/// Returned by `Stack::health_check()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub live_dialogs: usize,
    pub live_transactions: usize,
    pub oldest_transaction_age_ms: Option<u64>,
    pub id_pool_fill_percent: u8,
}

impl HealthReport {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("HealthReport fields are all plain integers")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_snapshot_serializes_every_field() {
        let snapshot = CountersSnapshot { dialogs_created: 3, id_pool_misses: 1, ..Default::default() };
        let json = snapshot.to_json();
        assert_eq!(json["dialogs_created"], 3);
        assert_eq!(json["id_pool_misses"], 1);
        assert_eq!(json["transport_failures"], 0);
    }

    #[test]
    fn health_report_serializes_optional_fields() {
        let report = HealthReport { live_dialogs: 2, live_transactions: 1, oldest_transaction_age_ms: None, id_pool_fill_percent: 50 };
        let json = report.to_json();
        assert!(json["oldest_transaction_age_ms"].is_null());
        assert_eq!(json["id_pool_fill_percent"], 50);
    }
}
