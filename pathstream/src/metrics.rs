//! Explicit request accounting.
//!
//! A [`RequestMetrics`] is created by the caller and attached to a client,
//! engine or stream. Nothing in the crate keeps process-wide counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RequestMetrics {
    range_reads: AtomicU64,
    appends: AtomicU64,
    flushes: AtomicU64,
    properties_requests: AtomicU64,
    bytes_read: AtomicU64,
    bytes_appended: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub range_reads: u64,
    pub appends: u64,
    pub flushes: u64,
    pub properties_requests: u64,
    pub bytes_read: u64,
    pub bytes_appended: u64,
}

impl RequestMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_range_read(&self) {
        self.range_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_append(&self) {
        self.appends.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts bytes the service acknowledged, not bytes sent.
    pub fn record_bytes_appended(&self, bytes: u64) {
        self.bytes_appended.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_properties_request(&self) {
        self.properties_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn appends(&self) -> u64 {
        self.appends.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn range_reads(&self) -> u64 {
        self.range_reads.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            range_reads: self.range_reads.load(Ordering::Relaxed),
            appends: self.appends.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            properties_requests: self.properties_requests.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_appended: self.bytes_appended.load(Ordering::Relaxed),
        }
    }
}
