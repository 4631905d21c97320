//! VNC-to-WebRTC bridging library.
//!
//! fbcast connects to a VNC server as an RFB client, maintains the remote
//! framebuffer locally, encodes it to VP8 at a fixed cadence and streams the
//! result over a WebRTC video track. Viewer input arrives on a WebRTC data
//! channel and is forwarded back as RFB pointer and key events.
//!
//! # Architecture
//!
//! - **RFB session** ([`rfb`]): handshake, rectangle decoding, input events
//! - **Framebuffer** ([`framebuffer`]): current RGBA desktop state
//! - **Scheduler** ([`scheduler`]): fixed-rate snapshots, refresh repeats
//! - **Encoder** ([`encode`]): VP8 pipeline with keyframe cadence
//! - **Transport** ([`transport`]): peer connection, video track, control channel
//!
//! [`Bridge`] wires them together for the common case.
//!
//! # Example
//!
//! ```rust,no_run
//! use fbcast::{Bridge, BridgeConfig};
//! # use fbcast::encode::{EncodedPayload, VideoEncoder};
//! # use fbcast::framebuffer::Frame;
//! # struct NullEncoder;
//! # impl VideoEncoder for NullEncoder {
//! #     fn encode(&mut self, _: &Frame, _: bool) -> fbcast::Result<Option<EncodedPayload>> {
//! #         Ok(None)
//! #     }
//! #     fn reconfigure(&mut self, _: u16, _: u16) -> fbcast::Result<()> { Ok(()) }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfig {
//!         vnc_addr: "127.0.0.1:5900".into(),
//!         ..Default::default()
//!     };
//!     let bridge = Bridge::connect_with_encoder(config, |_w, _h| Ok(NullEncoder)).await?;
//!
//!     let offer_sdp = /* from the viewer's signalling channel */
//!     # String::new();
//!     let answer_sdp = bridge.accept_offer(offer_sdp).await?;
//!     /* return answer_sdp to the viewer, then let the bridge run */
//!     # let _ = answer_sdp;
//!
//!     bridge.closed().cancelled().await;
//!     bridge.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod control;
pub mod driver;
pub mod encode;
mod error;
pub mod framebuffer;
pub mod rfb;
pub mod scheduler;
#[cfg(test)]
pub mod test_utils;
pub mod transport;


use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use crate::config::BridgeConfig;
pub use crate::control::ControlEvent;
pub use crate::driver::Driver;
pub use crate::encode::VideoEncoder;
pub use crate::error::{BridgeError, Result};
pub use crate::transport::TransportSession;

/// One VNC desktop bridged to one WebRTC peer.
pub struct Bridge {
    driver: Driver,
    transport: Arc<TransportSession>,
    forwarder: JoinHandle<()>,
}

impl Bridge {
    /// Connect to the VNC server and assemble the full pipeline.
    ///
    /// `encoder` builds the codec once the desktop dimensions are known.
    /// The returned bridge streams as soon as [`Bridge::accept_offer`]
    /// completes and the peer connects.
    pub async fn connect_with_encoder<E, F>(config: BridgeConfig, encoder: F) -> Result<Self>
    where
        E: VideoEncoder + 'static,
        F: FnOnce(u16, u16) -> Result<E>,
    {
        config.validate()?;

        let session = rfb::RfbSession::connect(
            &config.vnc_addr,
            config.password.as_deref(),
            config.read_timeout,
        )
        .await?;
        let encoder = encoder(session.width(), session.height())?;

        let (transport, control_rx) =
            TransportSession::new(&config.stun_servers, config.frame_rate).await?;
        let transport = Arc::new(transport);

        let (driver, mut samples) = Driver::spawn(&config, session, encoder, control_rx);

        // A terminal peer connection takes the whole bridge down with it
        let cancel = driver.cancellation();
        let peer_closed = transport.closed();
        tokio::spawn(async move {
            peer_closed.cancelled().await;
            cancel.cancel();
        });

        let sink = Arc::clone(&transport);
        let forwarder = tokio::spawn(async move {
            while let Some(sample) = samples.next().await {
                // Write errors are transient until the peer attaches; the
                // terminal states arrive via the connection callbacks
                if let Err(e) = sink.send_sample(&sample).await {
                    warn!(error = %e, "dropping sample after transport write failure");
                }
            }
        });

        Ok(Self { driver, transport, forwarder })
    }

    /// Connect with the built-in VP8 encoder.
    #[cfg(feature = "vpx")]
    pub async fn connect(config: BridgeConfig) -> Result<Self> {
        let bitrate = config.target_bitrate;
        Self::connect_with_encoder(config, |width, height| {
            encode::Vp8Encoder::new(width, height, bitrate)
        })
        .await
    }

    /// Apply the viewer's SDP offer, returning a gathering-complete answer.
    pub async fn accept_offer(&self, offer_sdp: String) -> Result<String> {
        self.transport.accept_offer(offer_sdp).await
    }

    /// Token that fires when any side of the bridge terminates.
    pub fn closed(&self) -> CancellationToken {
        self.driver.cancellation()
    }

    /// Stop every task and close the peer connection. Idempotent.
    pub async fn shutdown(self) {
        self.transport.close().await;
        self.driver.shutdown().await;
        let _ = self.forwarder.await;
    }
}
