//! # Session Statistics
//!
//! Snapshots of the session, reassembly and congestion counters. All of them
//! serialize with serde so a consumer can log or export them as JSON.

use quanta::Instant;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

// ─── Session Stats ──────────────────────────────────────────────────────────

/// Datagram-level counters kept by the session state machine.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    /// Datagrams handed to the session.
    pub datagrams_in: u64,
    /// Datagrams the session asked to transmit.
    pub datagrams_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Control messages decoded from DATA chunks.
    pub messages_in: u64,
    pub messages_out: u64,
    /// Datagrams whose tag did not verify.
    pub auth_failures: u64,
    /// Datagrams dropped for reusing an accepted key position.
    pub replays_dropped: u64,
    /// Malformed or unexpected datagrams and messages dropped.
    pub protocol_errors: u64,
    /// Handshake requests resent after a timeout or protocol error.
    pub handshake_retries: u64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share of inbound datagrams that were dropped as invalid.
    pub fn drop_ratio(&self) -> f64 {
        if self.datagrams_in == 0 {
            0.0
        } else {
            let dropped = self.protocol_errors + self.replays_dropped + self.auth_failures;
            dropped as f64 / self.datagrams_in as f64
        }
    }
}

// ─── Reassembly Stats ───────────────────────────────────────────────────────

/// Counters kept by the reassembly buffer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReassemblyStats {
    pub shards_accepted: u64,
    /// Shards for an index already held by their block group.
    pub duplicates: u64,
    /// Shards for block groups already retired or behind the watermark.
    pub late_shards: u64,
    /// Shards whose parameters disagree with their block group.
    pub malformed_shards: u64,
    /// Frames delivered with every data shard received.
    pub frames_complete: u64,
    /// Frames delivered after FEC rebuilt at least one data shard.
    pub frames_recovered: u64,
    /// Frames delivered or reported with missing data.
    pub frames_lossy: u64,
    /// Block groups retired by the retention sweep.
    pub groups_retired: u64,
    /// FEC decodes that could not rebuild the group.
    pub fec_failures: u64,
    /// Data shards rebuilt by FEC.
    pub shards_recovered: u64,
    /// Block groups currently open.
    pub open_groups: u64,
}

impl ReassemblyStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share of delivered frames that needed FEC.
    pub fn recovery_ratio(&self) -> f64 {
        let delivered = self.frames_complete + self.frames_recovered;
        if delivered == 0 {
            0.0
        } else {
            self.frames_recovered as f64 / delivered as f64
        }
    }
}

// ─── Congestion Stats ───────────────────────────────────────────────────────

/// Rolling congestion counters and the current bitrate recommendation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CongestionStats {
    /// Packets the peer sent in the reported windows.
    pub packets_expected: u64,
    pub packets_received: u64,
    /// Smoothed loss ratio (0.0-1.0).
    pub loss_ratio: f64,
    /// Smoothed RTT in ms.
    pub srtt_ms: f64,
    /// RTT variance in ms.
    pub rttvar_ms: f64,
    /// SRTT + 4·RTTVAR in ms, the deadline a lost reply is assumed after.
    pub rto_ms: f64,
    pub rtt_samples: u64,
    /// Negotiated lower bound in kbps.
    pub min_bitrate: u32,
    /// Negotiated upper bound in kbps.
    pub max_bitrate: u32,
    /// Current recommendation in kbps.
    pub target_bitrate: u32,
    /// Bandwidth measured during the Senkusha probe, in kbps.
    pub effective_bandwidth: u32,
    /// Inbound payload rate in kbps.
    pub measured_bitrate: u32,
}

impl CongestionStats {
    /// Loss over the whole session (unsmoothed).
    pub fn cumulative_loss(&self) -> f64 {
        if self.packets_expected == 0 {
            0.0
        } else {
            let lost = self.packets_expected.saturating_sub(self.packets_received);
            lost as f64 / self.packets_expected as f64
        }
    }
}

// ─── Rate Counter ───────────────────────────────────────────────────────────

/// Windowed rate counter for bytes/sec or packets/sec.
///
/// Times are passed in so the counter stays deterministic under test.
#[derive(Debug, Clone)]
pub struct RateCounter {
    /// Recent samples: (timestamp, value).
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
}

impl RateCounter {
    pub fn new(window: Duration) -> Self {
        RateCounter {
            samples: VecDeque::with_capacity(128),
            window,
        }
    }

    /// Record a sample taken at `now`.
    pub fn record(&mut self, now: Instant, value: u64) {
        self.samples.push_back((now, value));
        self.cleanup(now);
    }

    /// Sum of values in the window per second.
    pub fn rate(&self, now: Instant) -> f64 {
        self.count_in_window(now) as f64 / self.window.as_secs_f64()
    }

    /// Total within the window ending at `now`.
    pub fn count_in_window(&self, now: Instant) -> u64 {
        self.samples
            .iter()
            .filter(|(t, _)| now.saturating_duration_since(*t) <= self.window)
            .map(|(_, v)| v)
            .sum()
    }

    fn cleanup(&mut self, now: Instant) {
        while let Some((t, _)) = self.samples.front() {
            if now.saturating_duration_since(*t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

// ─── EWMA ───────────────────────────────────────────────────────────────────

/// Exponentially weighted moving average.
#[derive(Debug, Clone)]
pub struct Ewma {
    /// Smoothing factor (0.0 - 1.0). Higher = more responsive.
    alpha: f64,
    value: f64,
    /// Whether the first sample has been applied.
    initialized: bool,
}

impl Ewma {
    /// Create a new EWMA with the given smoothing factor.
    ///
    /// Factors outside `[0, 1]` are clamped; configuration rejects them
    /// before they get here.
    pub fn new(alpha: f64) -> Self {
        Ewma {
            alpha: alpha.clamp(0.0, 1.0),
            value: 0.0,
            initialized: false,
        }
    }

    /// Update with a new sample and return the smoothed value.
    pub fn update(&mut self, sample: f64) -> f64 {
        if !self.initialized {
            self.value = sample;
            self.initialized = true;
        } else {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Reset to uninitialized state.
    pub fn reset(&mut self) {
        self.value = 0.0;
        self.initialized = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── SessionStats Tests ─────────────────────────────────────────────

    #[test]
    fn session_drop_ratio() {
        let mut stats = SessionStats::new();
        assert_eq!(stats.drop_ratio(), 0.0);
        stats.datagrams_in = 100;
        stats.protocol_errors = 3;
        stats.replays_dropped = 2;
        assert!((stats.drop_ratio() - 0.05).abs() < 1e-9);
    }

    // ─── ReassemblyStats Tests ──────────────────────────────────────────

    #[test]
    fn reassembly_recovery_ratio() {
        let mut stats = ReassemblyStats::new();
        assert_eq!(stats.recovery_ratio(), 0.0);
        stats.frames_complete = 9;
        stats.frames_recovered = 1;
        assert!((stats.recovery_ratio() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn reassembly_stats_serialization() {
        let stats = ReassemblyStats {
            frames_recovered: 4,
            fec_failures: 1,
            ..Default::default()
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"frames_recovered\":4"));
        assert!(json.contains("\"fec_failures\":1"));
    }

    // ─── CongestionStats Tests ──────────────────────────────────────────

    #[test]
    fn congestion_cumulative_loss() {
        let stats = CongestionStats {
            packets_expected: 200,
            packets_received: 190,
            ..Default::default()
        };
        assert!((stats.cumulative_loss() - 0.05).abs() < 1e-9);
        assert_eq!(CongestionStats::default().cumulative_loss(), 0.0);
    }

    // ─── EWMA Tests ────────────────────────────────────────────────────

    #[test]
    fn ewma_first_sample_sets_value() {
        let mut ewma = Ewma::new(0.125);
        assert!(!ewma.is_initialized());
        ewma.update(100.0);
        assert_eq!(ewma.value(), 100.0);
    }

    #[test]
    fn ewma_smooths_toward_new_value() {
        let mut ewma = Ewma::new(0.5);
        ewma.update(100.0);
        let v = ewma.update(200.0);
        assert!((v - 150.0).abs() < 0.001, "EWMA 0.5 should average: got {v}");
    }

    #[test]
    fn ewma_reset() {
        let mut ewma = Ewma::new(0.5);
        ewma.update(100.0);
        ewma.reset();
        assert_eq!(ewma.value(), 0.0);
        ewma.update(50.0);
        assert_eq!(ewma.value(), 50.0);
    }

    // ─── RateCounter Tests ──────────────────────────────────────────────

    #[test]
    fn rate_counter_expires_old_samples() {
        let t0 = Instant::now();
        let mut counter = RateCounter::new(Duration::from_secs(1));
        counter.record(t0, 1000);
        counter.record(t0 + Duration::from_millis(500), 2000);
        assert_eq!(counter.count_in_window(t0 + Duration::from_millis(600)), 3000);

        counter.record(t0 + Duration::from_millis(1800), 500);
        assert_eq!(counter.count_in_window(t0 + Duration::from_millis(1800)), 500);
        assert!((counter.rate(t0 + Duration::from_millis(1800)) - 500.0).abs() < 1e-9);
    }
}
