//! # Protocol statistics
//!
//! Per-session counters for observability — not a spec module in its own
//! right, but every state machine in this crate feeds one of these the
//! same way the teacher's state machines feed `SenderStats`/`ReceiverStats`.

use quanta::Instant;
use serde::Serialize;

// ─── Sender Stats ───────────────────────────────────────────────────────────

/// Aggregate sender-side (transmit window + rate regulator) statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStats {
    /// Original data packets sent (ODATA).
    pub odata_sent: u64,
    /// Retransmitted data packets sent (RDATA).
    pub rdata_sent: u64,
    /// Total payload bytes sent (ODATA + RDATA, excludes parity/control).
    pub bytes_sent: u64,
    /// Proactive or on-demand parity packets sent.
    pub parity_sent: u64,
    /// NAKs received from downstream peers.
    pub naks_received: u64,
    /// NCFs sent in response to NAKs.
    pub ncfs_sent: u64,
    /// SPMs sent (ambient heartbeat).
    pub spms_sent: u64,
    /// Times the rate regulator returned `WOULDBLOCK`.
    pub rate_limited: u64,
}

impl SenderStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retransmission overhead: RDATA as a fraction of all data sent.
    pub fn retransmit_ratio(&self) -> f64 {
        let total = self.odata_sent + self.rdata_sent;
        if total == 0 {
            0.0
        } else {
            self.rdata_sent as f64 / total as f64
        }
    }
}

// ─── Receiver Stats ─────────────────────────────────────────────────────────

/// Aggregate receiver-side (per-peer receive window) statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    /// Data packets received (ODATA + RDATA), including duplicates.
    pub packets_received: u64,
    /// Payload bytes delivered to the application.
    pub bytes_delivered: u64,
    /// APDUs/TSDUs delivered in order.
    pub apdus_delivered: u64,
    /// NAKs sent for missing sqns.
    pub naks_sent: u64,
    /// NCFs received confirming an outstanding NAK.
    pub ncfs_received: u64,
    /// Data blocks recovered via FEC reconstruction rather than RDATA.
    pub fec_recoveries: u64,
    /// RESET events surfaced (unrecoverable loss or SPM foreclosure).
    pub resets: u64,
    /// Peers that have aged out of the peer table.
    pub peers_expired: u64,
}

impl ReceiverStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of delivered APDUs that required FEC recovery rather than
    /// arriving (or being retransmitted) intact.
    pub fn fec_recovery_rate(&self) -> f64 {
        if self.apdus_delivered == 0 {
            0.0
        } else {
            self.fec_recoveries as f64 / self.apdus_delivered as f64
        }
    }
}

// ─── Rate Counter ───────────────────────────────────────────────────────────

/// Windowed rate counter for computing bytes/sec or packets/sec.
pub struct RateCounter {
    samples: Vec<(Instant, u64)>,
    window: std::time::Duration,
}

impl RateCounter {
    pub fn new(window: std::time::Duration) -> Self {
        RateCounter {
            samples: Vec::with_capacity(128),
            window,
        }
    }

    pub fn record(&mut self, value: u64) {
        let now = Instant::now();
        self.samples.push((now, value));
        self.cleanup();
    }

    /// Sum of values in window, per second.
    pub fn rate(&self) -> f64 {
        let now = Instant::now();
        let cutoff = now - self.window;
        let sum: u64 = self
            .samples
            .iter()
            .filter(|(t, _)| *t >= cutoff)
            .map(|(_, v)| v)
            .sum();
        sum as f64 / self.window.as_secs_f64()
    }

    pub fn count_in_window(&self) -> u64 {
        let cutoff = Instant::now() - self.window;
        self.samples
            .iter()
            .filter(|(t, _)| *t >= cutoff)
            .map(|(_, v)| v)
            .sum()
    }

    fn cleanup(&mut self) {
        let cutoff = Instant::now() - self.window;
        self.samples.retain(|(t, _)| *t >= cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sender_retransmit_ratio_zero_when_no_data_sent() {
        let stats = SenderStats::new();
        assert_eq!(stats.retransmit_ratio(), 0.0);
    }

    #[test]
    fn sender_retransmit_ratio_correct() {
        let mut stats = SenderStats::new();
        stats.odata_sent = 90;
        stats.rdata_sent = 10;
        assert!((stats.retransmit_ratio() - 0.10).abs() < 0.001);
    }

    #[test]
    fn receiver_fec_recovery_rate() {
        let mut stats = ReceiverStats::new();
        stats.apdus_delivered = 100;
        stats.fec_recoveries = 5;
        assert!((stats.fec_recovery_rate() - 0.05).abs() < 0.001);
    }

    #[test]
    fn receiver_fec_recovery_rate_zero_div() {
        let stats = ReceiverStats::new();
        assert_eq!(stats.fec_recovery_rate(), 0.0);
    }

    #[test]
    fn rate_counter_basic() {
        let mut counter = RateCounter::new(Duration::from_secs(1));
        counter.record(1000);
        counter.record(2000);
        assert!(counter.rate() > 0.0);
    }

    #[test]
    fn rate_counter_count_in_window() {
        let mut counter = RateCounter::new(Duration::from_secs(10));
        counter.record(100);
        counter.record(200);
        counter.record(300);
        assert_eq!(counter.count_in_window(), 600);
    }

    #[test]
    fn stats_serialize_to_json() {
        let mut stats = SenderStats::new();
        stats.odata_sent = 5;
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"odata_sent\":5"));
    }
}
