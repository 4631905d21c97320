//! Bridge configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::{BridgeError, Result};

/// Configuration for one bridge session.
///
/// Covers all four pipeline stages: the RFB client (address, credentials, read
/// deadline), the frame scheduler (target rate, forced-refresh interval), the
/// encoder (bitrate, keyframe cadence) and the WebRTC transport (STUN servers).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// VNC server address, `host:port`.
    pub vnc_addr: String,

    /// Password for VNC authentication. `None` selects the None security type
    /// when the server offers it.
    pub password: Option<String>,

    /// Target output frame rate in Hz.
    pub frame_rate: u32,

    /// A keyframe is emitted at least once every this many encoded frames.
    pub keyframe_interval: u32,

    /// With no framebuffer changes, a repeat frame is forced after this long
    /// so the encoder periodically re-synchronizes downstream.
    pub refresh_interval: Duration,

    /// Encoder target bitrate in bits per second.
    pub target_bitrate: u64,

    /// Deadline applied to every RFB network read. Expiry tears the session
    /// down as a connection error.
    pub read_timeout: Duration,

    /// Depth of the bounded Frame→Encoder and Sample→Transport hand-off
    /// queues. When full, the oldest entry is dropped.
    pub queue_depth: usize,

    /// STUN server URLs for ICE gathering.
    pub stun_servers: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            vnc_addr: "127.0.0.1:5900".to_string(),
            password: None,
            frame_rate: 30,
            keyframe_interval: 10,
            refresh_interval: Duration::from_secs(2),
            target_bitrate: 90_000,
            read_timeout: Duration::from_secs(10),
            queue_depth: 4,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl BridgeConfig {
    /// Duration of one scheduler tick (`1/frame_rate`).
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate as f64)
    }

    /// Validate the configuration before a session starts.
    pub fn validate(&self) -> Result<()> {
        if self.vnc_addr.is_empty() {
            return Err(BridgeError::connection("VNC address is empty"));
        }
        if self.frame_rate == 0 {
            return Err(BridgeError::encoder_init("frame rate must be non-zero"));
        }
        if self.keyframe_interval == 0 {
            return Err(BridgeError::encoder_init("keyframe interval must be non-zero"));
        }
        if self.queue_depth == 0 {
            return Err(BridgeError::encoder_init("queue depth must be non-zero"));
        }
        if self.refresh_interval < self.tick_interval() {
            return Err(BridgeError::encoder_init(
                "refresh interval must be at least one scheduler tick",
            ));
        }
        Ok(())
    }
}
