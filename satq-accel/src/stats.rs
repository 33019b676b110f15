//! Operation counters for the accelerator facade.
//!
//! Counters are plain atomics so hot paths never take a lock; the snapshot
//! is advisory and may tear across fields under concurrent updates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct AccelStats {
    crypto_ops: AtomicU64,
    compression_ops: AtomicU64,
    packet_ops: AtomicU64,
    total_bytes: AtomicU64,
    total_processing_micros: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub crypto_ops: u64,
    pub compression_ops: u64,
    pub packet_ops: u64,
    pub total_bytes: u64,
    pub total_processing_ms: f64,
}

impl StatsSnapshot {
    pub fn total_ops(&self) -> u64 {
        self.crypto_ops + self.compression_ops + self.packet_ops
    }

    pub fn average_processing_ms(&self) -> f64 {
        let ops = self.total_ops();
        if ops == 0 {
            0.0
        } else {
            self.total_processing_ms / ops as f64
        }
    }
}

impl AccelStats {
    pub fn record_crypto(&self) {
        self.crypto_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compression(&self) {
        self.compression_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_packet(&self) {
        self.packet_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_processing(&self, bytes: u64, elapsed: Duration) {
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.total_processing_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            crypto_ops: self.crypto_ops.load(Ordering::Relaxed),
            compression_ops: self.compression_ops.load(Ordering::Relaxed),
            packet_ops: self.packet_ops.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            total_processing_ms: self.total_processing_micros.load(Ordering::Relaxed) as f64
                / 1000.0,
        }
    }

    pub fn log(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            crypto_ops = snapshot.crypto_ops,
            compression_ops = snapshot.compression_ops,
            packet_ops = snapshot.packet_ops,
            total_bytes = snapshot.total_bytes,
            avg_processing_ms = format_args!("{:.2}", snapshot.average_processing_ms()),
            "acceleration statistics"
        );
    }
}
