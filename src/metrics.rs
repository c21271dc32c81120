use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Counters for defense decisions
#[derive(Clone)]
pub struct Metrics {
    pub requests_rate_limited: Arc<AtomicU64>,
    pub wait_timeouts: Arc<AtomicU64>,
    pub csrf_tokens_issued: Arc<AtomicU64>,
    pub csrf_failures: Arc<AtomicU64>,
    pub panics_recovered: Arc<AtomicU64>,
    pub visitors_evicted: Arc<AtomicU64>,
    pub tokens_evicted: Arc<AtomicU64>,
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            requests_rate_limited: Arc::new(AtomicU64::new(0)),
            wait_timeouts: Arc::new(AtomicU64::new(0)),
            csrf_tokens_issued: Arc::new(AtomicU64::new(0)),
            csrf_failures: Arc::new(AtomicU64::new(0)),
            panics_recovered: Arc::new(AtomicU64::new(0)),
            visitors_evicted: Arc::new(AtomicU64::new(0)),
            tokens_evicted: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    pub fn inc_rate_limited(&self) {
        self.requests_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_wait_timeouts(&self) {
        self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tokens_issued(&self) {
        self.csrf_tokens_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_csrf_failures(&self) {
        self.csrf_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_panics_recovered(&self) {
        self.panics_recovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_visitors_evicted(&self, n: usize) {
        self.visitors_evicted.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_tokens_evicted(&self, n: usize) {
        self.tokens_evicted.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Takes a snapshot of the counters. Live map sizes are supplied by the caller since
    /// reading them requires the owning locks.
    pub fn get_snapshot(&self, active_visitors: usize, active_csrf_tokens: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_rate_limited: self.requests_rate_limited.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
            csrf_tokens_issued: self.csrf_tokens_issued.load(Ordering::Relaxed),
            csrf_failures: self.csrf_failures.load(Ordering::Relaxed),
            panics_recovered: self.panics_recovered.load(Ordering::Relaxed),
            visitors_evicted: self.visitors_evicted.load(Ordering::Relaxed),
            tokens_evicted: self.tokens_evicted.load(Ordering::Relaxed),
            active_visitors,
            active_csrf_tokens,
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub requests_rate_limited: u64,
    pub wait_timeouts: u64,
    pub csrf_tokens_issued: u64,
    pub csrf_failures: u64,
    pub panics_recovered: u64,
    pub visitors_evicted: u64,
    pub tokens_evicted: u64,
    pub active_visitors: usize,
    pub active_csrf_tokens: usize,
    pub uptime_seconds: u64,
}
