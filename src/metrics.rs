use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{FailureEnvelope, FailureKind};
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineMetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub transport_calls: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub dedup_joins: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub network_errors: u64,
    pub http_status_errors: u64,
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct PipelineMetrics {
    inner: Arc<PipelineMetricsInner>,
}

#[derive(Debug, Default)]
struct PipelineMetricsInner {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    transport_calls: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    dedup_joins: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    network_errors: AtomicU64,
    http_status_errors: AtomicU64,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

impl PipelineMetrics {
    pub(crate) fn record_request_started(&self) {
        self.inner.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transport_call(&self) {
        self.inner.transport_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dedup_join(&self) {
        self.inner.dedup_joins.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one failed transport attempt by kind.
    pub(crate) fn record_attempt_failure(&self, failure: &FailureEnvelope) {
        let counter = match failure.kind {
            FailureKind::Timeout => &self.inner.timeouts,
            FailureKind::Network => &self.inner.network_errors,
            FailureKind::HttpStatus => &self.inner.http_status_errors,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_request_completed<T>(&self, result: &Result<T, FailureEnvelope>) {
        match result {
            Ok(_) => {
                self.inner
                    .requests_succeeded
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(failure) => {
                self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
                let mut error_counts = lock_unpoisoned(&self.inner.error_counts);
                *error_counts.entry(failure.code()).or_insert(0) += 1;
            }
        }
    }

    pub(crate) fn snapshot(&self) -> PipelineMetricsSnapshot {
        PipelineMetricsSnapshot {
            requests_started: self.inner.requests_started.load(Ordering::Relaxed),
            requests_succeeded: self.inner.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: self.inner.requests_failed.load(Ordering::Relaxed),
            transport_calls: self.inner.transport_calls.load(Ordering::Relaxed),
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.inner.cache_misses.load(Ordering::Relaxed),
            dedup_joins: self.inner.dedup_joins.load(Ordering::Relaxed),
            retries: self.inner.retries.load(Ordering::Relaxed),
            timeouts: self.inner.timeouts.load(Ordering::Relaxed),
            network_errors: self.inner.network_errors.load(Ordering::Relaxed),
            http_status_errors: self.inner.http_status_errors.load(Ordering::Relaxed),
            error_counts: lock_unpoisoned(&self.inner.error_counts).clone(),
        }
    }
}
