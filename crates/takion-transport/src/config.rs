//! # Session Configuration
//!
//! TOML-loadable settings for one streaming session. The raw input is all
//! optional fields; `resolve` fills defaults and validates.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::congestion::CongestionConfig;
use crate::crypto::CryptoContext;
use crate::launch::{Resolution, CLIENT_VERSION, FPS_30, FPS_60};
use crate::reassembly::ReassemblyConfig;

pub const CONFIG_VERSION: u32 = 1;

/// MTU requested when the probe has not run.
pub const DEFAULT_MTU: u32 = 1454;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

// ─── Raw input ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfigInput {
    pub version: u32,
    pub stream: StreamConfigInput,
    pub handshake: HandshakeConfigInput,
    pub timers: TimerConfigInput,
    pub reassembly: ReassemblyConfigInput,
    pub congestion: CongestionConfigInput,
    pub crypto: CryptoConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StreamConfigInput {
    pub resolution: Option<String>,
    pub max_fps: Option<u32>,
    pub bitrate: Option<u32>,
    pub min_bitrate: Option<u32>,
    pub mtu: Option<u32>,
    pub rtt_ms: Option<u32>,
    pub client_version: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HandshakeConfigInput {
    pub timeout_ms: Option<u64>,
    pub attempts: Option<u32>,
    pub senkusha_timeout_ms: Option<u64>,
    pub senkusha_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimerConfigInput {
    pub heartbeat_ms: Option<u64>,
    pub timestamp_ms: Option<u64>,
    pub congestion_ms: Option<u64>,
    pub quality_ms: Option<u64>,
    pub inactivity_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfigInput {
    pub retention_frames: Option<u32>,
    pub max_open_groups: Option<usize>,
    pub deliver_lossy: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CongestionConfigInput {
    pub loss_alpha: Option<f64>,
    pub window_len: Option<usize>,
    pub high_loss: Option<f64>,
    pub low_loss: Option<f64>,
    pub decrease_factor: Option<f64>,
    pub increase_step: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CryptoConfigInput {
    pub replay_window: Option<usize>,
}

// ─── Resolved ───────────────────────────────────────────────────────────────

/// What the client asks the console for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub resolution: Resolution,
    pub max_fps: u32,
    /// Upper bitrate bound in kbps.
    pub bitrate: u32,
    /// Lower bitrate bound in kbps.
    pub min_bitrate: u32,
    pub mtu: u32,
    pub rtt_ms: u32,
    pub client_version: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let resolution = Resolution::R720p;
        StreamConfig {
            resolution,
            max_fps: FPS_60,
            bitrate: resolution.bitrate(),
            min_bitrate: resolution.bitrate() / 4,
            mtu: DEFAULT_MTU,
            rtt_ms: 1,
            client_version: CLIENT_VERSION,
        }
    }
}

/// Bounded-attempt budgets for the handshake phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Wait for a reply before resending INIT, COOKIE, BIG or INFO.
    pub timeout: Duration,
    pub attempts: u32,
    /// Wait for each Senkusha reply.
    pub senkusha_timeout: Duration,
    pub senkusha_attempts: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        HandshakeConfig {
            timeout: Duration::from_secs(1),
            attempts: 5,
            senkusha_timeout: Duration::from_millis(500),
            senkusha_attempts: 3,
        }
    }
}

/// Periodic work while streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerConfig {
    pub heartbeat: Duration,
    pub timestamp: Duration,
    /// Loss windows and CONGESTION datagrams.
    pub congestion: Duration,
    pub quality: Duration,
    /// Silence from the peer that ends the session.
    pub inactivity: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        TimerConfig {
            heartbeat: Duration::from_secs(1),
            timestamp: Duration::from_secs(1),
            congestion: Duration::from_millis(200),
            quality: Duration::from_secs(2),
            inactivity: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub version: u32,
    pub stream: StreamConfig,
    pub handshake: HandshakeConfig,
    pub timers: TimerConfig,
    pub reassembly: ReassemblyConfig,
    pub congestion: CongestionConfig,
    pub replay_window: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            version: CONFIG_VERSION,
            stream: StreamConfig::default(),
            handshake: HandshakeConfig::default(),
            timers: TimerConfig::default(),
            reassembly: ReassemblyConfig::default(),
            congestion: CongestionConfig::default(),
            replay_window: CryptoContext::DEFAULT_REPLAY_WINDOW,
        }
    }
}

fn millis(
    value: Option<u64>,
    default: Duration,
    field: &'static str,
) -> Result<Duration, ConfigError> {
    match value {
        Some(0) => Err(invalid(field, "must be greater than zero")),
        Some(ms) => Ok(Duration::from_millis(ms)),
        None => Ok(default),
    }
}

fn positive<T: PartialOrd + Default + Copy>(
    value: Option<T>,
    default: T,
    field: &'static str,
) -> Result<T, ConfigError> {
    let v = value.unwrap_or(default);
    if v > T::default() {
        Ok(v)
    } else {
        Err(invalid(field, "must be greater than zero"))
    }
}

fn ratio(value: Option<f64>, default: f64, field: &'static str) -> Result<f64, ConfigError> {
    let v = value.unwrap_or(default);
    if (0.0..=1.0).contains(&v) {
        Ok(v)
    } else {
        Err(invalid(field, format!("{v} is outside [0, 1]")))
    }
}

impl SessionConfigInput {
    pub fn resolve(self) -> Result<SessionConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let defaults = SessionConfig::default();

        let resolution = match self.stream.resolution.as_deref() {
            Some(name) => name.parse::<Resolution>().map_err(|e| invalid("stream.resolution", e))?,
            None => defaults.stream.resolution,
        };
        let max_fps = self.stream.max_fps.unwrap_or(defaults.stream.max_fps);
        if max_fps != FPS_30 && max_fps != FPS_60 {
            return Err(invalid("stream.max_fps", format!("{max_fps} is not 30 or 60")));
        }
        let bitrate = positive(self.stream.bitrate, resolution.bitrate(), "stream.bitrate")?;
        let min_bitrate = self.stream.min_bitrate.unwrap_or(bitrate / 4);
        if min_bitrate > bitrate {
            return Err(invalid(
                "stream.min_bitrate",
                format!("{min_bitrate} exceeds bitrate {bitrate}"),
            ));
        }
        let mtu = self.stream.mtu.unwrap_or(defaults.stream.mtu);
        if !(576..=65_507).contains(&mtu) {
            return Err(invalid("stream.mtu", format!("{mtu} is outside [576, 65507]")));
        }
        let stream = StreamConfig {
            resolution,
            max_fps,
            bitrate,
            min_bitrate,
            mtu,
            rtt_ms: self.stream.rtt_ms.unwrap_or(defaults.stream.rtt_ms),
            client_version: self.stream.client_version.unwrap_or(defaults.stream.client_version),
        };

        let h = self.handshake;
        let handshake = HandshakeConfig {
            timeout: millis(h.timeout_ms, defaults.handshake.timeout, "handshake.timeout_ms")?,
            attempts: positive(h.attempts, defaults.handshake.attempts, "handshake.attempts")?,
            senkusha_timeout: millis(
                h.senkusha_timeout_ms,
                defaults.handshake.senkusha_timeout,
                "handshake.senkusha_timeout_ms",
            )?,
            senkusha_attempts: positive(
                h.senkusha_attempts,
                defaults.handshake.senkusha_attempts,
                "handshake.senkusha_attempts",
            )?,
        };

        let t = self.timers;
        let timers = TimerConfig {
            heartbeat: millis(t.heartbeat_ms, defaults.timers.heartbeat, "timers.heartbeat_ms")?,
            timestamp: millis(t.timestamp_ms, defaults.timers.timestamp, "timers.timestamp_ms")?,
            congestion: millis(
                t.congestion_ms,
                defaults.timers.congestion,
                "timers.congestion_ms",
            )?,
            quality: millis(t.quality_ms, defaults.timers.quality, "timers.quality_ms")?,
            inactivity: millis(
                t.inactivity_ms,
                defaults.timers.inactivity,
                "timers.inactivity_ms",
            )?,
        };

        let r = self.reassembly;
        let reassembly = ReassemblyConfig {
            retention_frames: r
                .retention_frames
                .unwrap_or(defaults.reassembly.retention_frames),
            max_open_groups: positive(
                r.max_open_groups,
                defaults.reassembly.max_open_groups,
                "reassembly.max_open_groups",
            )?,
            deliver_lossy: r.deliver_lossy.unwrap_or(defaults.reassembly.deliver_lossy),
        };

        let c = self.congestion;
        let dc = &defaults.congestion;
        let congestion = CongestionConfig {
            loss_alpha: ratio(c.loss_alpha, dc.loss_alpha, "congestion.loss_alpha")?,
            window_len: positive(c.window_len, dc.window_len, "congestion.window_len")?,
            high_loss: ratio(c.high_loss, dc.high_loss, "congestion.high_loss")?,
            low_loss: ratio(c.low_loss, dc.low_loss, "congestion.low_loss")?,
            decrease_factor: ratio(
                c.decrease_factor,
                dc.decrease_factor,
                "congestion.decrease_factor",
            )?,
            increase_step: ratio(c.increase_step, dc.increase_step, "congestion.increase_step")?,
        };
        if congestion.low_loss > congestion.high_loss {
            return Err(invalid("congestion.low_loss", "exceeds congestion.high_loss"));
        }

        let replay_window = positive(
            self.crypto.replay_window,
            defaults.replay_window,
            "crypto.replay_window",
        )?;

        Ok(SessionConfig {
            version,
            stream,
            handshake,
            timers,
            reassembly,
            congestion,
            replay_window,
        })
    }
}

impl SessionConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(SessionConfig::default());
        }
        let parsed: SessionConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }
}
