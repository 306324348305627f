//! Messenger Metrics
//!
//! Lock-free counters for call and connection lifecycle events plus a bounded
//! round-trip latency sample window. One sink may be shared by many messengers.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Metrics sink handed to the messenger builder
#[derive(Debug, Default)]
pub struct MessengerMetrics {
    outbound_calls_queued: AtomicU64,
    outbound_calls_succeeded: AtomicU64,
    outbound_calls_failed: AtomicU64,
    outbound_calls_timed_out: AtomicU64,
    inbound_calls_received: AtomicU64,
    inbound_calls_rejected: AtomicU64,
    connections_accepted: AtomicU64,
    connections_established: AtomicU64,
    connections_closed: AtomicU64,
    connections_rejected: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    latency: Mutex<LatencyTracker>,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub outbound_calls_queued: u64,
    pub outbound_calls_succeeded: u64,
    pub outbound_calls_failed: u64,
    pub outbound_calls_timed_out: u64,
    pub inbound_calls_received: u64,
    pub inbound_calls_rejected: u64,
    pub connections_accepted: u64,
    pub connections_established: u64,
    pub connections_closed: u64,
    pub connections_rejected: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub avg_call_latency_us: u64,
    pub p95_call_latency_us: u64,
    pub p99_call_latency_us: u64,
}

impl MessengerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_call_queued(&self) {
        self.outbound_calls_queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a terminal outcome of an outbound call
    pub(crate) fn record_call_finished(&self, success: bool, timed_out: bool, elapsed: Duration) {
        if success {
            self.outbound_calls_succeeded.fetch_add(1, Ordering::Relaxed);
            // Only successful round trips say anything about latency
            if let Some(mut tracker) = self.latency.try_lock() {
                tracker.record(elapsed.as_micros() as u64);
            }
        } else if timed_out {
            self.outbound_calls_timed_out.fetch_add(1, Ordering::Relaxed);
        } else {
            self.outbound_calls_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn record_inbound_call(&self) {
        self.inbound_calls_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_inbound_rejected(&self) {
        self.inbound_calls_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_bytes_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_bytes_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = self.latency.lock();

        MetricsSnapshot {
            outbound_calls_queued: self.outbound_calls_queued.load(Ordering::Relaxed),
            outbound_calls_succeeded: self.outbound_calls_succeeded.load(Ordering::Relaxed),
            outbound_calls_failed: self.outbound_calls_failed.load(Ordering::Relaxed),
            outbound_calls_timed_out: self.outbound_calls_timed_out.load(Ordering::Relaxed),
            inbound_calls_received: self.inbound_calls_received.load(Ordering::Relaxed),
            inbound_calls_rejected: self.inbound_calls_rejected.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            avg_call_latency_us: latency.average(),
            p95_call_latency_us: latency.percentile(95),
            p99_call_latency_us: latency.percentile(99),
        }
    }
}

/// Latency percentile tracker over a circular sample window
#[derive(Debug)]
struct LatencyTracker {
    samples: Vec<u64>,
    position: usize,
    total_samples: u64,
    sum: u64,
}

impl LatencyTracker {
    const SAMPLE_SIZE: usize = 1000;

    fn record(&mut self, latency_us: u64) {
        self.sum = self.sum.saturating_add(latency_us);
        self.total_samples += 1;

        if self.samples.len() < Self::SAMPLE_SIZE {
            self.samples.push(latency_us);
        } else {
            self.samples[self.position] = latency_us;
            self.position = (self.position + 1) % Self::SAMPLE_SIZE;
        }
    }

    fn average(&self) -> u64 {
        if self.total_samples > 0 {
            self.sum / self.total_samples
        } else {
            0
        }
    }

    fn percentile(&self, p: usize) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }

        let mut sorted = self.samples.clone();
        sorted.sort_unstable();

        let index = ((sorted.len() - 1) * p) / 100;
        sorted[index]
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self {
            samples: Vec::with_capacity(Self::SAMPLE_SIZE),
            position: 0,
            total_samples: 0,
            sum: 0,
        }
    }
}
