//! Observability and Metrics
//!
//! This module provides metrics collection for monitoring transport health:
//! packet and byte throughput, drops at the checksum gate, message delivery,
//! fragmentation and connection churn.
//!
//! Uses atomic counters so a snapshot can be taken through a shared reference.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for one transport stack
#[derive(Debug)]
pub struct Metrics {
    /// Datagrams handed to the transport
    pub packets_sent: AtomicU64,
    /// Datagrams accepted from the transport
    pub packets_received: AtomicU64,
    /// Datagrams dropped (bad checksum, duplicate, malformed)
    pub packets_dropped: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Total bytes received
    pub bytes_received: AtomicU64,
    /// Messages packed into outgoing packets
    pub messages_sent: AtomicU64,
    /// Messages delivered to the application
    pub messages_received: AtomicU64,
    /// Reliable messages positively acknowledged
    pub reliable_acked: AtomicU64,
    /// Fragment packets sent
    pub fragments_sent: AtomicU64,
    /// Fragment packets received
    pub fragments_received: AtomicU64,
    /// Inbound fragmented transfers abandoned for another sender
    pub transfers_dropped: AtomicU64,
    /// Node connections observed
    pub connections_total: AtomicU64,
    /// Node disconnections observed
    pub disconnections_total: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            reliable_acked: AtomicU64::new(0),
            fragments_sent: AtomicU64::new(0),
            fragments_received: AtomicU64::new(0),
            transfers_dropped: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            disconnections_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a packet sent
    pub fn packet_sent(&self, byte_count: u64) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a packet received
    pub fn packet_received(&self, byte_count: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a dropped packet
    pub fn packet_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_packed(&self, count: u64) {
        self.messages_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn message_delivered(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reliable_message_acked(&self) {
        self.reliable_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fragment_sent(&self) {
        self.fragments_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fragment_received(&self) {
        self.fragments_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an inbound transfer abandoned mid-assembly
    pub fn transfer_dropped(&self) {
        self.transfers_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn node_connected(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn node_disconnected(&self) {
        self.disconnections_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            reliable_acked: self.reliable_acked.load(Ordering::Relaxed),
            fragments_sent: self.fragments_sent.load(Ordering::Relaxed),
            fragments_received: self.fragments_received.load(Ordering::Relaxed),
            transfers_dropped: self.transfers_dropped.load(Ordering::Relaxed),
            connections_total: self.connections_total.load(Ordering::Relaxed),
            disconnections_total: self.disconnections_total.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            packets_sent = snapshot.packets_sent,
            packets_received = snapshot.packets_received,
            packets_dropped = snapshot.packets_dropped,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            reliable_acked = snapshot.reliable_acked,
            fragments_sent = snapshot.fragments_sent,
            fragments_received = snapshot.fragments_received,
            transfers_dropped = snapshot.transfers_dropped,
            connections_total = snapshot.connections_total,
            disconnections_total = snapshot.disconnections_total,
            uptime_seconds = snapshot.uptime_seconds,
            "Transport metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub reliable_acked: u64,
    pub fragments_sent: u64,
    pub fragments_received: u64,
    pub transfers_dropped: u64,
    pub connections_total: u64,
    pub disconnections_total: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_us = duration.as_micros() as u64,
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.packet_sent(100);
        metrics.packet_sent(20);
        metrics.packet_dropped();
        metrics.transfer_dropped();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.packets_sent, 2);
        assert_eq!(snapshot.bytes_sent, 120);
        assert_eq!(snapshot.packets_dropped, 1);
        assert_eq!(snapshot.transfers_dropped, 1);
        assert_eq!(snapshot.packets_received, 0);
    }
}
