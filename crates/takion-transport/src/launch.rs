//! # Launch Spec
//!
//! The JSON document the client embeds in BIG to tell the console what to
//! stream: resolution, frame rate, bitrate and network figures, plus a block
//! of fixed application constants the console expects verbatim.
//!
//! The document is minified, NUL-terminated, optionally XOR-masked with a
//! keystream from the control connection, and finally base64-encoded.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Client protocol version sent in BIG.
pub const CLIENT_VERSION: u32 = 9;

/// Session id the console accepts in the launch spec.
pub const LAUNCH_SESSION_ID: &str = "sessionId4321";

pub const FPS_30: u32 = 30;
pub const FPS_60: u32 = 60;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("launch spec serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("launch spec mask is {actual} bytes, need {needed}")]
    MaskTooShort { needed: usize, actual: usize },
}

// ─── Resolution presets ─────────────────────────────────────────────────────

/// Stream resolution presets with their default bitrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "360p")]
    R360p,
    #[serde(rename = "540p")]
    R540p,
    #[serde(rename = "720p")]
    R720p,
    #[serde(rename = "1080p")]
    R1080p,
}

impl Resolution {
    pub const ALL: [Resolution; 4] = [
        Resolution::R360p,
        Resolution::R540p,
        Resolution::R720p,
        Resolution::R1080p,
    ];

    pub fn width(self) -> u32 {
        match self {
            Resolution::R360p => 640,
            Resolution::R540p => 960,
            Resolution::R720p => 1280,
            Resolution::R1080p => 1920,
        }
    }

    pub fn height(self) -> u32 {
        match self {
            Resolution::R360p => 360,
            Resolution::R540p => 540,
            Resolution::R720p => 720,
            Resolution::R1080p => 1080,
        }
    }

    /// Default bitrate in kbps.
    pub fn bitrate(self) -> u32 {
        match self {
            Resolution::R360p => 2000,
            Resolution::R540p => 6000,
            Resolution::R720p | Resolution::R1080p => 10_000,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Resolution::R360p => "360p",
            Resolution::R540p => "540p",
            Resolution::R720p => "720p",
            Resolution::R1080p => "1080p",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Resolution::ALL
            .into_iter()
            .find(|r| r.name() == wanted)
            .ok_or_else(|| format!("unknown resolution preset {s:?}"))
    }
}

// ─── Document ───────────────────────────────────────────────────────────────

/// Values the client chooses per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchParams {
    pub resolution: Resolution,
    pub max_fps: u32,
    /// Requested bitrate in kbps.
    pub bitrate: u32,
    pub mtu: u32,
    /// RTT estimate in ms.
    pub rtt_ms: u32,
    /// The ECDH handshake key, embedded base64-encoded.
    pub handshake_key: [u8; 16],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LaunchSpec<'a> {
    session_id: &'a str,
    stream_resolutions: [StreamResolution; 1],
    network: Network,
    slot_id: u32,
    app_specification: AppSpecification,
    konan: Konan,
    request_game_specification: RequestGameSpecification,
    user_profile: UserProfile,
    adaptive_stream_mode: &'a str,
    video_codec: &'a str,
    dynamic_range: &'a str,
    handshake_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamResolution {
    resolution: Dimensions,
    max_fps: u32,
    score: u32,
}

#[derive(Serialize)]
struct Dimensions {
    width: u32,
    height: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Network {
    bw_kbps_sent: u32,
    bw_loss: f64,
    mtu: u32,
    rtt: u32,
    ports: [u16; 2],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AppSpecification {
    min_fps: u32,
    min_bandwidth: u32,
    ext_title_id: &'static str,
    version: u32,
    time_limit: u32,
    start_timeout: u32,
    afk_timeout: u32,
    afk_timeout_disconnect: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Konan {
    ps3_access_token: &'static str,
    ps3_refresh_token: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestGameSpecification {
    model: &'static str,
    platform: &'static str,
    audio_channels: &'static str,
    language: &'static str,
    accept_button: &'static str,
    connected_controllers: [&'static str; 3],
    yuv_coefficient: &'static str,
    video_encoder_profile: &'static str,
    audio_encoder_profile: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UserProfile {
    online_id: &'static str,
    np_id: &'static str,
    region: &'static str,
    languages_used: [&'static str; 2],
}

const BW_LOSS: f64 = 0.001;

impl LaunchParams {
    fn document(&self) -> LaunchSpec<'static> {
        LaunchSpec {
            session_id: LAUNCH_SESSION_ID,
            stream_resolutions: [StreamResolution {
                resolution: Dimensions {
                    width: self.resolution.width(),
                    height: self.resolution.height(),
                },
                max_fps: self.max_fps,
                score: 10,
            }],
            network: Network {
                bw_kbps_sent: self.bitrate,
                bw_loss: BW_LOSS,
                mtu: self.mtu,
                rtt: self.rtt_ms,
                ports: [53, 2053],
            },
            slot_id: 1,
            app_specification: AppSpecification {
                min_fps: 30,
                min_bandwidth: 0,
                ext_title_id: "ps3",
                version: 1,
                time_limit: 1,
                start_timeout: 100,
                afk_timeout: 100,
                afk_timeout_disconnect: 100,
            },
            konan: Konan {
                ps3_access_token: "accessToken",
                ps3_refresh_token: "refreshToken",
            },
            request_game_specification: RequestGameSpecification {
                model: "bravia_tv",
                platform: "android",
                audio_channels: "5.1",
                language: "sp",
                accept_button: "X",
                connected_controllers: ["xinput", "ds3", "ds4"],
                yuv_coefficient: "bt709",
                video_encoder_profile: "hw4.1",
                audio_encoder_profile: "audio1",
            },
            user_profile: UserProfile {
                online_id: "psnId",
                np_id: "npId",
                region: "US",
                languages_used: ["en", "jp"],
            },
            adaptive_stream_mode: "resize",
            video_codec: "avc",
            dynamic_range: "HDR",
            handshake_key: STANDARD.encode(self.handshake_key),
        }
    }

    /// Minified JSON with a trailing NUL.
    pub fn to_json(&self) -> Result<Vec<u8>, LaunchError> {
        let json = serde_json::to_string(&self.document())?;
        // The console parses the loss figure with six decimals.
        let json = json.replacen("\"bwLoss\":0.001,", "\"bwLoss\":0.001000,", 1);
        let mut out = json.into_bytes();
        out.push(0);
        Ok(out)
    }

    /// The value of BIG's `launch_spec` field.
    ///
    /// `mask` is the control connection's keystream; the document is XORed
    /// with it before base64 encoding. Without a mask the document is encoded
    /// as is.
    pub fn encode(&self, mask: Option<&[u8]>) -> Result<String, LaunchError> {
        let mut doc = self.to_json()?;
        if let Some(mask) = mask {
            if mask.len() < doc.len() {
                return Err(LaunchError::MaskTooShort {
                    needed: doc.len(),
                    actual: mask.len(),
                });
            }
            for (b, k) in doc.iter_mut().zip(mask) {
                *b ^= k;
            }
        }
        Ok(STANDARD.encode(doc))
    }
}
