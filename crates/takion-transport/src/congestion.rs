//! # Congestion Monitor
//!
//! Advisory loss and RTT tracking that turns reported loss windows into a
//! target bitrate for the console. The console owns the encoder, so the
//! monitor only recommends; the value travels in INFO and CONNECTIONQUALITY.
//!
//! ## Backoff curve
//!
//! ```text
//!   smoothed loss > high_loss   →  target × decrease_factor
//!   smoothed loss < low_loss    →  target + increase_step × (max − min)
//!   otherwise                   →  hold
//! ```
//!
//! The target is always clamped to the negotiated `[min_bitrate, bitrate]`
//! and, once the Senkusha probe has run, to the measured effective bandwidth.

use quanta::Instant;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

use crate::message::ConnectionQualityPayload;
use crate::packet::StreamKind;
use crate::stats::{CongestionStats, Ewma, RateCounter};

// ─── Configuration ──────────────────────────────────────────────────────────

/// Tuning knobs for the monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct CongestionConfig {
    /// EWMA factor applied to each loss window.
    pub loss_alpha: f64,
    /// Loss windows kept for the aggregate ratio.
    pub window_len: usize,
    /// Smoothed loss above which the target backs off.
    pub high_loss: f64,
    /// Smoothed loss below which the target climbs.
    pub low_loss: f64,
    /// Multiplicative backoff.
    pub decrease_factor: f64,
    /// Additive climb, as a share of the negotiated range.
    pub increase_step: f64,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        CongestionConfig {
            loss_alpha: 0.25,
            window_len: 32,
            high_loss: 0.10,
            low_loss: 0.02,
            decrease_factor: 0.85,
            increase_step: 0.05,
        }
    }
}

// ─── RTT Tracker ──────────────────────────────────────────────────────────

/// Smoothed RTT from request/response round trips (RFC 6298).
#[derive(Debug, Clone)]
pub struct RttTracker {
    srtt_us: f64,
    rttvar_us: f64,
    min_rtt_us: f64,
    max_rtt_us: f64,
    sample_count: u64,
}

impl RttTracker {
    pub fn new() -> Self {
        RttTracker {
            srtt_us: 0.0,
            rttvar_us: 0.0,
            min_rtt_us: f64::MAX,
            max_rtt_us: 0.0,
            sample_count: 0,
        }
    }

    /// Fold one round trip into the estimate. Returns the new SRTT in µs.
    pub fn record(&mut self, rtt: Duration) -> f64 {
        let rtt_us = rtt.as_micros() as f64;
        self.sample_count += 1;
        self.min_rtt_us = self.min_rtt_us.min(rtt_us);
        self.max_rtt_us = self.max_rtt_us.max(rtt_us);

        if self.sample_count == 1 {
            self.srtt_us = rtt_us;
            self.rttvar_us = rtt_us / 2.0;
        } else {
            // α = 1/8, β = 1/4
            self.rttvar_us = 0.75 * self.rttvar_us + 0.25 * (self.srtt_us - rtt_us).abs();
            self.srtt_us = 0.875 * self.srtt_us + 0.125 * rtt_us;
        }
        self.srtt_us
    }

    pub fn srtt_us(&self) -> f64 {
        self.srtt_us
    }

    pub fn rttvar_us(&self) -> f64 {
        self.rttvar_us
    }

    /// Minimum RTT in µs, 0 before the first sample.
    pub fn min_rtt_us(&self) -> f64 {
        if self.sample_count == 0 {
            0.0
        } else {
            self.min_rtt_us
        }
    }

    pub fn max_rtt_us(&self) -> f64 {
        self.max_rtt_us
    }

    /// RTO = SRTT + 4·RTTVAR, clamped to [1 ms, 60 s].
    pub fn rto(&self) -> Duration {
        let rto = self.srtt_us + 4.0 * self.rttvar_us;
        Duration::from_micros(rto.clamp(1_000.0, 60_000_000.0) as u64)
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }
}

impl Default for RttTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Loss Window ────────────────────────────────────────────────────────────

/// One reported span of packet indices for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossWindow {
    pub stream: StreamKind,
    /// First packet index of the span.
    pub start: u32,
    /// Last packet index of the span, inclusive.
    pub end: u32,
    pub received: u32,
}

impl LossWindow {
    /// Packets the peer sent in the span.
    pub fn expected(&self) -> u32 {
        self.end.wrapping_sub(self.start).wrapping_add(1)
    }

    pub fn lost(&self) -> u32 {
        self.expected().saturating_sub(self.received)
    }
}

// ─── Monitor ────────────────────────────────────────────────────────────────

/// Loss/RTT estimator and bitrate recommender for one session.
#[derive(Debug)]
pub struct CongestionMonitor {
    config: CongestionConfig,
    rtt: RttTracker,
    loss: Ewma,
    windows: VecDeque<LossWindow>,
    packets_expected: u64,
    packets_received: u64,
    min_bitrate: u32,
    max_bitrate: u32,
    target_bitrate: u32,
    effective_bandwidth: u32,
    inbound: RateCounter,
    last_inbound_kbps: u32,
}

impl CongestionMonitor {
    /// Create a monitor bounded by `[min_bitrate, bitrate]` (kbps).
    pub fn new(config: CongestionConfig, min_bitrate: u32, bitrate: u32) -> Self {
        let (min_bitrate, max_bitrate) = ordered(min_bitrate, bitrate);
        CongestionMonitor {
            loss: Ewma::new(config.loss_alpha),
            windows: VecDeque::with_capacity(config.window_len),
            config,
            rtt: RttTracker::new(),
            packets_expected: 0,
            packets_received: 0,
            min_bitrate,
            max_bitrate,
            target_bitrate: max_bitrate,
            effective_bandwidth: 0,
            inbound: RateCounter::new(Duration::from_secs(1)),
            last_inbound_kbps: 0,
        }
    }

    /// Replace the bounds with the values the peer's INFO settled on.
    pub fn set_bounds(&mut self, min_bitrate: u32, bitrate: u32) {
        let (min_bitrate, max_bitrate) = ordered(min_bitrate, bitrate);
        self.min_bitrate = min_bitrate;
        self.max_bitrate = max_bitrate;
        self.target_bitrate = self.clamp(self.target_bitrate);
        debug!(min_bitrate, max_bitrate, target = self.target_bitrate, "bitrate bounds set");
    }

    /// Seed the estimate with the Senkusha bandwidth probe result (kbps).
    pub fn set_effective_bandwidth(&mut self, kbps: u32) {
        self.effective_bandwidth = kbps;
        self.target_bitrate = self.clamp(self.target_bitrate);
    }

    /// Record a loss window for `stream`: packet indices `start..=end`, of
    /// which `received` arrived.
    pub fn record_loss(&mut self, stream: StreamKind, start: u32, end: u32, received: u32) {
        let window = LossWindow {
            stream,
            start,
            end,
            received,
        };
        let expected = window.expected();
        if expected == 0 {
            return;
        }
        let ratio = window.lost() as f64 / expected as f64;
        let smoothed = self.loss.update(ratio);

        self.packets_expected += expected as u64;
        self.packets_received += received.min(expected) as u64;
        if self.windows.len() == self.config.window_len.max(1) {
            self.windows.pop_front();
        }
        self.windows.push_back(window);

        let before = self.target_bitrate;
        let range = self.max_bitrate - self.min_bitrate;
        let next = if smoothed > self.config.high_loss {
            (self.target_bitrate as f64 * self.config.decrease_factor) as u32
        } else if smoothed < self.config.low_loss {
            let step = ((range as f64 * self.config.increase_step) as u32).max(1);
            self.target_bitrate.saturating_add(step)
        } else {
            self.target_bitrate
        };
        self.target_bitrate = self.clamp(next);

        if self.target_bitrate != before {
            debug!(
                ?stream,
                loss = smoothed,
                from = before,
                to = self.target_bitrate,
                "target bitrate changed"
            );
        }
    }

    /// Feed one request/response round trip.
    pub fn record_rtt(&mut self, sample: Duration) {
        self.rtt.record(sample);
    }

    /// Account inbound AV payload for the measured bitrate.
    pub fn record_payload(&mut self, now: Instant, bytes: usize) {
        self.inbound.record(now, bytes as u64);
        self.last_inbound_kbps = (self.inbound.rate(now) * 8.0 / 1000.0) as u32;
    }

    /// Current recommendation in kbps.
    pub fn target_bitrate(&self) -> u32 {
        self.target_bitrate
    }

    pub fn min_bitrate(&self) -> u32 {
        self.min_bitrate
    }

    pub fn max_bitrate(&self) -> u32 {
        self.max_bitrate
    }

    pub fn effective_bandwidth(&self) -> u32 {
        self.effective_bandwidth
    }

    /// Smoothed loss ratio.
    pub fn loss_ratio(&self) -> f64 {
        self.loss.value()
    }

    /// Aggregate loss over the retained windows.
    pub fn window_loss(&self) -> f64 {
        let expected: u64 = self.windows.iter().map(|w| w.expected() as u64).sum();
        if expected == 0 {
            return 0.0;
        }
        let lost: u64 = self.windows.iter().map(|w| w.lost() as u64).sum();
        lost as f64 / expected as f64
    }

    pub fn rtt(&self) -> &RttTracker {
        &self.rtt
    }

    /// Body of the periodic CONNECTIONQUALITY report.
    pub fn quality_report(&self) -> ConnectionQualityPayload {
        ConnectionQualityPayload {
            target_bitrate: Some(self.target_bitrate),
            upstream_bitrate: Some(self.last_inbound_kbps),
            upstream_loss: Some(self.loss.value() as f32),
            disable_upstream_audio: Some(false),
            rtt: Some(self.rtt.srtt_us() / 1000.0),
            loss: Some(self.packets_expected.saturating_sub(self.packets_received)),
        }
    }

    pub fn stats(&self) -> CongestionStats {
        CongestionStats {
            packets_expected: self.packets_expected,
            packets_received: self.packets_received,
            loss_ratio: self.loss.value(),
            srtt_ms: self.rtt.srtt_us() / 1000.0,
            rttvar_ms: self.rtt.rttvar_us() / 1000.0,
            rto_ms: self.rtt.rto().as_secs_f64() * 1000.0,
            rtt_samples: self.rtt.sample_count(),
            min_bitrate: self.min_bitrate,
            max_bitrate: self.max_bitrate,
            target_bitrate: self.target_bitrate,
            effective_bandwidth: self.effective_bandwidth,
            measured_bitrate: self.last_inbound_kbps,
        }
    }

    fn clamp(&self, bitrate: u32) -> u32 {
        let mut upper = self.max_bitrate;
        if self.effective_bandwidth > 0 {
            upper = upper.min(self.effective_bandwidth.max(self.min_bitrate));
        }
        bitrate.clamp(self.min_bitrate, upper)
    }
}

fn ordered(a: u32, b: u32) -> (u32, u32) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
