//! Fixed-cadence frame scheduler.
//!
//! Ticks at the configured frame rate and snapshots the framebuffer when it
//! is dirty. Clean ticks emit nothing until the refresh interval elapses,
//! after which the current content is re-sent with a forced keyframe so late
//! joiners and lossy paths recover on static screens.
//!
//! Frames go out over a bounded broadcast channel: when the encoder falls
//! behind, the oldest queued frames are dropped first and the receiver
//! observes how many it lost.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::framebuffer::{Frame, SharedFramebuffer};

/// What a tick decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickAction {
    Skip,
    Emit { force_keyframe: bool },
}

/// Pure emit/skip policy, separated from timers so it can be tested directly.
#[derive(Debug)]
struct TickPolicy {
    refresh_interval: Duration,
    last_emit: Option<Duration>,
}

impl TickPolicy {
    fn new(refresh_interval: Duration) -> Self {
        Self { refresh_interval, last_emit: None }
    }

    fn decide(&mut self, pts: Duration, dirty: bool) -> TickAction {
        if dirty {
            self.last_emit = Some(pts);
            return TickAction::Emit { force_keyframe: false };
        }
        match self.last_emit {
            // Nothing painted yet, there is no frame worth repeating
            None => TickAction::Skip,
            Some(last) if pts.saturating_sub(last) >= self.refresh_interval => {
                self.last_emit = Some(pts);
                TickAction::Emit { force_keyframe: true }
            }
            Some(_) => TickAction::Skip,
        }
    }
}

/// Snapshot cadence driver.
pub struct Scheduler {
    framebuffer: SharedFramebuffer,
    frames: broadcast::Sender<Frame>,
    tick_interval: Duration,
    policy: TickPolicy,
}

impl Scheduler {
    pub fn new(
        framebuffer: SharedFramebuffer,
        frames: broadcast::Sender<Frame>,
        tick_interval: Duration,
        refresh_interval: Duration,
    ) -> Self {
        Self { framebuffer, frames, tick_interval, policy: TickPolicy::new(refresh_interval) }
    }

    /// Tick until cancelled. pts is time elapsed since this call.
    pub async fn run(mut self, cancel: CancellationToken) {
        let start = Instant::now();
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let pts = start.elapsed();
            match self.policy.decide(pts, self.framebuffer.is_dirty()) {
                TickAction::Skip => trace!(?pts, "clean tick"),
                TickAction::Emit { force_keyframe } => {
                    let frame = self.framebuffer.snapshot(pts, force_keyframe);
                    trace!(?pts, force_keyframe, "frame scheduled");
                    // No receiver means the encoder is gone; keep ticking,
                    // shutdown arrives via the token
                    let _ = self.frames.send(frame);
                }
            }
        }
    }
}
