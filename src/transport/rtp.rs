//! RTP timing for the outgoing video track.
//!
//! The WebRTC stack packetizes samples itself; what it needs from us is a
//! duration per sample. Durations derive from pts deltas, so upstream frame
//! drops stretch the previous sample instead of shifting the whole timeline.

use std::time::Duration;

/// 90 kHz RTP video clock.
pub const CLOCK_RATE: u32 = 90_000;

/// Converts a stream pts into RTP clock ticks (wrapping, as on the wire).
pub fn ticks(pts: Duration) -> u32 {
    (pts.as_nanos() * CLOCK_RATE as u128 / 1_000_000_000) as u32
}

/// Tracks pts deltas across transmitted samples.
#[derive(Debug)]
pub struct RtpClock {
    nominal: Duration,
    last_pts: Option<Duration>,
}

/// Timing decision for one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleTiming {
    pub duration: Duration,
    /// The pts gap exceeded the nominal frame interval, meaning frames were
    /// dropped upstream.
    pub discontinuity: bool,
}

impl RtpClock {
    pub fn new(frame_rate: u32) -> Self {
        Self { nominal: Duration::from_secs(1) / frame_rate.max(1), last_pts: None }
    }

    /// Compute the duration to attach to the sample at `pts`.
    ///
    /// The first sample gets the nominal interval. Non-monotonic pts is
    /// clamped to nominal rather than producing a zero or negative duration.
    pub fn advance(&mut self, pts: Duration) -> SampleTiming {
        let timing = match self.last_pts {
            None => SampleTiming { duration: self.nominal, discontinuity: false },
            Some(last) if pts > last => {
                let delta = pts - last;
                SampleTiming {
                    duration: delta,
                    discontinuity: delta > self.nominal + self.nominal / 2,
                }
            }
            Some(_) => SampleTiming { duration: self.nominal, discontinuity: false },
        };
        self.last_pts = Some(pts);
        timing
    }
}
