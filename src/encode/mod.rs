//! Video encoding pipeline.
//!
//! [`EncoderPipeline`] owns keyframe cadence, resize handling and sequence
//! numbering; the codec itself sits behind the [`VideoEncoder`] trait so the
//! rest of the bridge (and its tests) never touch libvpx directly.

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::framebuffer::Frame;
use crate::{BridgeError, Result};

pub mod yuv;

#[cfg(feature = "vpx")]
mod vp8;
#[cfg(feature = "vpx")]
pub use vp8::Vp8Encoder;

/// Compressed output of one [`VideoEncoder::encode`] call.
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    pub data: Bytes,
    pub keyframe: bool,
}

/// One transmit-ready video sample.
///
/// `sequence` is assigned to transmitted samples only, so it is gap-free even
/// when frames are dropped upstream; drops surface as `pts` discontinuities.
#[derive(Debug, Clone)]
pub struct EncodedSample {
    pub sequence: u64,
    pub pts: Duration,
    pub keyframe: bool,
    pub data: Bytes,
}

/// A stateful video codec.
///
/// Implementations may buffer internally and return `None` until output is
/// available. `force_keyframe` is a hard requirement, not a hint.
pub trait VideoEncoder: Send {
    fn encode(&mut self, frame: &Frame, force_keyframe: bool) -> Result<Option<EncodedPayload>>;

    /// Rebuild codec state for a new resolution. The next encoded frame must
    /// be a keyframe.
    fn reconfigure(&mut self, width: u16, height: u16) -> Result<()>;
}

/// Drives a [`VideoEncoder`] with the bridge's cadence rules.
pub struct EncoderPipeline<E> {
    encoder: E,
    keyframe_interval: u32,
    width: u16,
    height: u16,
    // frames accepted since the last forced keyframe; 0 means the next
    // frame must be one
    since_keyframe: u32,
    next_sequence: u64,
}

impl<E: VideoEncoder> EncoderPipeline<E> {
    pub fn new(encoder: E, width: u16, height: u16, keyframe_interval: u32) -> Self {
        Self {
            encoder,
            keyframe_interval: keyframe_interval.max(1),
            width,
            height,
            since_keyframe: 0,
            next_sequence: 0,
        }
    }

    /// Encode one frame, applying resize and keyframe policy.
    ///
    /// Per-frame codec failures are logged and absorbed (the frame is
    /// dropped); only unrecoverable errors such as a failed reconfigure
    /// propagate.
    pub fn process(&mut self, frame: &Frame) -> Result<Option<EncodedSample>> {
        if frame.width != self.width || frame.height != self.height {
            info!(
                from = format!("{}x{}", self.width, self.height),
                to = format!("{}x{}", frame.width, frame.height),
                "resolution changed, rebuilding encoder"
            );
            self.encoder.reconfigure(frame.width, frame.height)?;
            self.width = frame.width;
            self.height = frame.height;
            self.since_keyframe = 0;
        }

        let force_keyframe = frame.force_keyframe || self.since_keyframe == 0;

        let payload = match self.encoder.encode(frame, force_keyframe) {
            Ok(payload) => payload,
            Err(e @ BridgeError::EncodeFrame { .. }) => {
                warn!(error = %e, "dropping frame after encode failure");
                // Cadence is not advanced, so the retry keyframes if this did
                if !force_keyframe {
                    self.since_keyframe += 1;
                }
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        self.since_keyframe = if force_keyframe {
            1
        } else {
            self.since_keyframe + 1
        };
        if self.since_keyframe >= self.keyframe_interval {
            self.since_keyframe = 0;
        }

        Ok(payload.map(|payload| {
            let sample = EncodedSample {
                sequence: self.next_sequence,
                pts: frame.pts,
                keyframe: payload.keyframe,
                data: payload.data,
            };
            self.next_sequence += 1;
            debug!(
                sequence = sample.sequence,
                keyframe = sample.keyframe,
                bytes = sample.data.len(),
                "encoded sample"
            );
            sample
        }))
    }
}
