//! WebRTC peer session: one VP8 video track out, one control channel in.
//!
//! The browser is the offerer and owns the control data channel; this side
//! answers with ICE candidates gathered up front, so the answer SDP is
//! complete and no trickle signalling is needed.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_VP8, MediaEngine};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::control::ControlEvent;
use crate::encode::EncodedSample;
use crate::transport::rtp::RtpClock;
use crate::{BridgeError, Result};

/// Control events buffered between data-channel callbacks and the forwarder.
const CONTROL_QUEUE_DEPTH: usize = 32;

/// One peer connection carrying the bridged desktop.
pub struct TransportSession {
    peer: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticSample>,
    clock: parking_lot::Mutex<RtpClock>,
    shutdown: CancellationToken,
}

impl TransportSession {
    /// Build the peer connection and video track.
    ///
    /// Returns the session and the stream of viewer control events. The
    /// session is idle until [`TransportSession::accept_offer`].
    pub async fn new(
        stun_servers: &[String],
        frame_rate: u32,
    ) -> Result<(Self, mpsc::Receiver<ControlEvent>)> {
        // Failures here are setup failures: Negotiation, not the mid-session
        // Transport kind.
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(|e| {
            BridgeError::negotiation_with_source("codec registration", Box::new(e))
        })?;
        let registry =
            register_default_interceptors(Registry::new(), &mut media).map_err(|e| {
                BridgeError::negotiation_with_source("interceptor registration", Box::new(e))
            })?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: stun_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let peer = Arc::new(api.new_peer_connection(config).await.map_err(|e| {
            BridgeError::negotiation_with_source("peer connection setup", Box::new(e))
        })?);

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability { mime_type: MIME_TYPE_VP8.to_owned(), ..Default::default() },
            "video".to_owned(),
            "fbcast".to_owned(),
        ));
        let sender = peer
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| {
                BridgeError::negotiation_with_source("adding the video track", Box::new(e))
            })?;

        // Drain incoming RTCP so the interceptors keep functioning
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        let shutdown = CancellationToken::new();
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);

        Self::install_state_callbacks(&peer, shutdown.clone());
        Self::install_control_channel(&peer, control_tx);

        Ok((
            Self { peer, track, clock: parking_lot::Mutex::new(RtpClock::new(frame_rate)), shutdown },
            control_rx,
        ))
    }

    fn install_state_callbacks(peer: &Arc<RTCPeerConnection>, shutdown: CancellationToken) {
        peer.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            debug!(%state, "ICE connection state");
            Box::pin(async {})
        }));

        // cancel() is idempotent, so terminal states collapse into one
        // shutdown no matter how many fire
        peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            info!(%state, "peer connection state");
            if matches!(
                state,
                RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Closed
            ) {
                shutdown.cancel();
            }
            Box::pin(async {})
        }));
    }

    fn install_control_channel(peer: &Arc<RTCPeerConnection>, control_tx: mpsc::Sender<ControlEvent>) {
        peer.on_data_channel(Box::new(move |channel| {
            debug!(label = %channel.label(), "data channel opened by viewer");
            let control_tx = control_tx.clone();
            Box::pin(async move {
                channel.on_message(Box::new(move |msg| {
                    let control_tx = control_tx.clone();
                    Box::pin(async move {
                        match ControlEvent::from_json(&msg.data) {
                            Ok(event) => {
                                trace!(?event, "control event");
                                if control_tx.try_send(event).is_err() {
                                    warn!("control queue full, dropping event");
                                }
                            }
                            // Advisory input: log and drop, never tear down
                            Err(e) => warn!(error = %e, "ignoring malformed control payload"),
                        }
                    })
                }));
            })
        }));
    }

    /// Apply the viewer's offer and return a gathering-complete answer SDP.
    pub async fn accept_offer(&self, offer_sdp: String) -> Result<String> {
        let offer = RTCSessionDescription::offer(offer_sdp)
            .map_err(|e| BridgeError::negotiation(format!("bad offer: {e}")))?;
        self.peer.set_remote_description(offer).await
            .map_err(|e| BridgeError::negotiation(e.to_string()))?;

        let answer = self.peer.create_answer(None).await
            .map_err(|e| BridgeError::negotiation(e.to_string()))?;
        let mut gathered = self.peer.gathering_complete_promise().await;
        self.peer.set_local_description(answer).await
            .map_err(|e| BridgeError::negotiation(e.to_string()))?;
        let _ = gathered.recv().await;

        let local = self
            .peer
            .local_description()
            .await
            .ok_or_else(|| BridgeError::negotiation("no local description after gathering"))?;
        info!("answer ready");
        Ok(local.sdp)
    }

    /// Write one encoded sample to the video track.
    ///
    /// Duration comes from pts deltas, so upstream drops stretch the previous
    /// sample on the wire.
    pub async fn send_sample(&self, sample: &EncodedSample) -> Result<()> {
        let timing = self.clock.lock().advance(sample.pts);
        if timing.discontinuity {
            debug!(
                sequence = sample.sequence,
                rtp_ticks = crate::transport::rtp::ticks(sample.pts),
                "pts gap ahead of this sample"
            );
        }
        self.track
            .write_sample(&Sample {
                data: sample.data.clone(),
                duration: timing.duration,
                ..Default::default()
            })
            .await?;
        trace!(sequence = sample.sequence, keyframe = sample.keyframe, "sample sent");
        Ok(())
    }

    /// Fires once the peer connection reaches a terminal state.
    pub fn closed(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Tear the peer connection down. Safe to call more than once.
    pub async fn close(&self) {
        self.shutdown.cancel();
        if let Err(e) = self.peer.close().await {
            debug!(error = %e, "peer connection close");
        }
    }
}
