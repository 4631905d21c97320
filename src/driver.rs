//! Task wiring for one bridge session.
//!
//! The driver owns the background tasks (RFB decode loop, scheduler, encoder,
//! control forwarder) and the cancellation token that links their lifetimes.
//! Any terminal event cancels the token; every task treats cancellation as a
//! clean stop, so shutdown converges from whichever side it starts.

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::control::ControlEvent;
use crate::encode::{EncodedSample, EncoderPipeline, VideoEncoder};
use crate::framebuffer::SharedFramebuffer;
use crate::rfb::{RfbSender, RfbSession};
use crate::scheduler::Scheduler;

/// Running bridge tasks. Dropping the driver cancels them.
pub struct Driver {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Driver {
    /// Spawn the pipeline around a streaming RFB session.
    ///
    /// Returns the driver and the stream of transmit-ready samples. `control`
    /// feeds viewer input back to the VNC server.
    pub fn spawn<E>(
        config: &BridgeConfig,
        session: RfbSession,
        encoder: E,
        control: mpsc::Receiver<ControlEvent>,
    ) -> (Self, ReceiverStream<EncodedSample>)
    where
        E: VideoEncoder + 'static,
    {
        let cancel = CancellationToken::new();
        let framebuffer = SharedFramebuffer::new(session.width(), session.height());
        let (frames_tx, frames_rx) = broadcast::channel(config.queue_depth.max(1));
        let (samples_tx, samples_rx) = mpsc::channel(config.queue_depth.max(1));

        let pipeline = EncoderPipeline::new(
            encoder,
            session.width(),
            session.height(),
            config.keyframe_interval,
        );

        let scheduler = Scheduler::new(
            framebuffer.clone(),
            frames_tx,
            config.tick_interval(),
            config.refresh_interval,
        );

        let rfb_sender = session.sender();
        let tasks = vec![
            Self::spawn_rfb(session, framebuffer, cancel.clone()),
            tokio::spawn(scheduler.run(cancel.clone())),
            Self::spawn_encoder(pipeline, frames_rx, samples_tx, cancel.clone()),
            Self::spawn_control(control, rfb_sender, cancel.clone()),
        ];

        (Self { cancel, tasks }, ReceiverStream::new(samples_rx))
    }

    /// Token linking every task in this session; cancelling it stops them.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop all tasks and wait for them to finish. Idempotent.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("bridge driver stopped");
    }

    fn spawn_rfb(
        session: RfbSession,
        framebuffer: SharedFramebuffer,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            // Session end is terminal for the whole bridge
            if let Err(e) = session.run(framebuffer, cancel.clone()).await {
                warn!(error = %e, "RFB session ended");
            }
            cancel.cancel();
        })
    }

    fn spawn_encoder<E>(
        mut pipeline: EncoderPipeline<E>,
        mut frames: broadcast::Receiver<crate::framebuffer::Frame>,
        samples: mpsc::Sender<EncodedSample>,
        cancel: CancellationToken,
    ) -> JoinHandle<()>
    where
        E: VideoEncoder + 'static,
    {
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = frames.recv() => match frame {
                        Ok(frame) => frame,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(dropped = n, "encoder behind, oldest frames dropped");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };

                match pipeline.process(&frame) {
                    Ok(Some(sample)) => {
                        if samples.send(sample).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "encoder pipeline failed");
                        cancel.cancel();
                        break;
                    }
                }
            }
        })
    }

    fn spawn_control(
        mut control: mpsc::Receiver<ControlEvent>,
        sender: RfbSender,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = control.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if let Err(e) = sender.send_control_event(&event).await {
                    warn!(error = %e, "input forwarding failed, stopping bridge");
                    cancel.cancel();
                    break;
                }
            }
        })
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
