//! Per-pipe counters
//!
//! Updated from both the transport callback thread and the polling thread,
//! so every field is an independent relaxed atomic.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipeStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    delivered_packets: AtomicU64,
    delivered_bytes: AtomicU64,
    packet_errors: AtomicU64,
    steals: AtomicU64,
    starved: AtomicU64,
    out_of_order: AtomicU64,
    stalls: AtomicU64,
}

/// Point-in-time copy of [`PipeStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipeStatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub delivered_packets: u64,
    pub delivered_bytes: u64,
    pub packet_errors: u64,
    pub steals: u64,
    pub starved: u64,
    pub out_of_order: u64,
    pub stalls: u64,
}

impl PipeStats {
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, bytes: usize) {
        self.delivered_packets.fetch_add(1, Ordering::Relaxed);
        self.delivered_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_packet_error(&self) {
        self.packet_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_steal(&self) {
        self.steals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_starved(&self) {
        self.starved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out_of_order(&self) {
        self.out_of_order.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipeStatsSnapshot {
        PipeStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            delivered_packets: self.delivered_packets.load(Ordering::Relaxed),
            delivered_bytes: self.delivered_bytes.load(Ordering::Relaxed),
            packet_errors: self.packet_errors.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
            starved: self.starved.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
        }
    }
}

impl PipeStatsSnapshot {
    /// Counter increase since `earlier`
    pub fn since(&self, earlier: &PipeStatsSnapshot) -> PipeStatsSnapshot {
        PipeStatsSnapshot {
            submitted: self.submitted.saturating_sub(earlier.submitted),
            completed: self.completed.saturating_sub(earlier.completed),
            delivered_packets: self
                .delivered_packets
                .saturating_sub(earlier.delivered_packets),
            delivered_bytes: self.delivered_bytes.saturating_sub(earlier.delivered_bytes),
            packet_errors: self.packet_errors.saturating_sub(earlier.packet_errors),
            steals: self.steals.saturating_sub(earlier.steals),
            starved: self.starved.saturating_sub(earlier.starved),
            out_of_order: self.out_of_order.saturating_sub(earlier.out_of_order),
            stalls: self.stalls.saturating_sub(earlier.stalls),
        }
    }
}
