//! Error types for the VNC→WebRTC bridge.
//!
//! Every failure in the pipeline maps to one [`BridgeError`] variant. The
//! taxonomy follows the propagation policy of the bridge: structural and setup
//! failures (connection, authentication, encoder init, WebRTC negotiation) are
//! fatal to the whole session, while a per-frame encode failure is absorbed
//! locally and the affected frame is dropped.
//!
//! ```rust
//! use fbcast::BridgeError;
//!
//! let err = BridgeError::protocol("unexpected rectangle encoding -1");
//! assert!(err.is_fatal());
//! ```

use std::time::Duration;
use thiserror::Error;

/// Result type alias for bridge operations.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Main error type for bridge operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BridgeError {
    /// Transport-level failure to reach or keep talking to the VNC host.
    #[error("failed to reach VNC host: {reason}")]
    Connection {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The VNC server rejected our credentials.
    #[error("VNC authentication rejected: {reason}")]
    Auth { reason: String },

    /// Malformed or unsupported RFB message. Fatal: pixel-format assumptions
    /// would be violated by continuing.
    #[error("RFB protocol error: {details}")]
    Protocol { details: String },

    /// The video encoder could not be initialized.
    #[error("encoder initialization failed: {reason}")]
    EncoderInit {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A single frame failed to encode. Recoverable: drop the frame, keep the
    /// stream alive.
    #[error("failed to encode frame {sequence}: {reason}")]
    EncodeFrame { sequence: u64, reason: String },

    /// WebRTC offer/answer or ICE setup failed.
    #[error("WebRTC negotiation failed: {reason}")]
    Negotiation {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Mid-session media-path failure (ICE disconnect, SRTP write error).
    #[error("WebRTC transport error: {reason}")]
    Transport {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A network read exceeded its deadline.
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// An operation was attempted on a session that has already shut down.
    #[error("session is disconnected")]
    Disconnected,
}

impl BridgeError {
    /// Returns whether this error tears down the whole session.
    ///
    /// Only [`BridgeError::EncodeFrame`] is absorbed locally; everything else
    /// triggers coordinated shutdown of all pipeline stages.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BridgeError::EncodeFrame { .. })
    }

    /// Helper constructor for connection errors.
    pub fn connection(reason: impl Into<String>) -> Self {
        BridgeError::Connection { reason: reason.into(), source: None }
    }

    /// Helper constructor for connection errors with source.
    pub fn connection_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        BridgeError::Connection { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for authentication errors.
    pub fn auth(reason: impl Into<String>) -> Self {
        BridgeError::Auth { reason: reason.into() }
    }

    /// Helper constructor for protocol errors.
    pub fn protocol(details: impl Into<String>) -> Self {
        BridgeError::Protocol { details: details.into() }
    }

    /// Helper constructor for encoder initialization errors.
    pub fn encoder_init(reason: impl Into<String>) -> Self {
        BridgeError::EncoderInit { reason: reason.into(), source: None }
    }

    /// Helper constructor for encoder initialization errors with source.
    pub fn encoder_init_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        BridgeError::EncoderInit { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for per-frame encode errors.
    pub fn encode_frame(sequence: u64, reason: impl Into<String>) -> Self {
        BridgeError::EncodeFrame { sequence, reason: reason.into() }
    }

    /// Helper constructor for negotiation errors.
    pub fn negotiation(reason: impl Into<String>) -> Self {
        BridgeError::Negotiation { reason: reason.into(), source: None }
    }

    /// Helper constructor for negotiation errors with source.
    pub fn negotiation_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        BridgeError::Negotiation { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for transport errors.
    pub fn transport(reason: impl Into<String>) -> Self {
        BridgeError::Transport { reason: reason.into(), source: None }
    }

    /// Helper constructor for read-deadline expiry.
    pub fn timeout(duration: Duration) -> Self {
        BridgeError::Timeout { duration }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Connection { reason: err.to_string(), source: Some(Box::new(err)) }
    }
}

impl From<webrtc::Error> for BridgeError {
    fn from(err: webrtc::Error) -> Self {
        BridgeError::Transport { reason: err.to_string(), source: Some(Box::new(err)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(test)]
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn error_messages_contain_their_context(
                reason in ".*",
                sequence in 0u64..1_000_000u64,
                duration_ms in 1u64..60000u64,
            ) {
                let conn = BridgeError::connection(reason.clone());
                prop_assert!(conn.to_string().contains(&reason));

                let auth = BridgeError::auth(reason.clone());
                prop_assert!(auth.to_string().contains(&reason));

                let frame = BridgeError::encode_frame(sequence, reason.clone());
                prop_assert!(frame.to_string().contains(&sequence.to_string()));
                prop_assert!(frame.to_string().contains(&reason));

                let timeout = BridgeError::timeout(Duration::from_millis(duration_ms));
                prop_assert!(!timeout.to_string().is_empty());
            }

            #[test]
            fn fatality_matches_propagation_policy(
                reason in ".*",
                sequence in 0u64..1_000_000u64,
            ) {
                // Only per-frame encode failures are absorbed locally.
                prop_assert!(BridgeError::connection(reason.clone()).is_fatal());
                prop_assert!(BridgeError::auth(reason.clone()).is_fatal());
                prop_assert!(BridgeError::protocol(reason.clone()).is_fatal());
                prop_assert!(BridgeError::encoder_init(reason.clone()).is_fatal());
                prop_assert!(BridgeError::negotiation(reason.clone()).is_fatal());
                prop_assert!(BridgeError::transport(reason.clone()).is_fatal());
                prop_assert!(!BridgeError::encode_frame(sequence, reason).is_fatal());
            }

            #[test]
            fn io_conversion_preserves_message(reason in "[ -~]*") {
                let io_err = std::io::Error::other(reason.clone());
                let converted: BridgeError = io_err.into();
                match converted {
                    BridgeError::Connection { source: Some(source), .. } => {
                        prop_assert_eq!(source.to_string(), reason);
                    }
                    _ => prop_assert!(false, "expected Connection error from io::Error"),
                }
            }
        }
    }

    #[test]
    fn error_traits_validation() {
        // Compile-time check: BridgeError must be Send + Sync + 'static
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<BridgeError>();

        let error = BridgeError::protocol("test");
        let _: &dyn std::error::Error = &error;
    }

    #[test]
    fn auth_and_connection_are_distinct_kinds() {
        let refused = BridgeError::connection("connection refused");
        let rejected = BridgeError::auth("bad password");
        assert!(matches!(refused, BridgeError::Connection { .. }));
        assert!(matches!(rejected, BridgeError::Auth { .. }));
    }

    #[test]
    fn setup_failures_carry_the_negotiation_kind() {
        // Peer/media setup errors are negotiation failures, not mid-session
        // transport errors.
        let cause = std::io::Error::other("no compatible codecs");
        let err = BridgeError::negotiation_with_source("media engine setup", Box::new(cause));
        assert!(matches!(err, BridgeError::Negotiation { .. }));
        let source = std::error::Error::source(&err).expect("source present");
        assert!(source.to_string().contains("no compatible codecs"));
    }

    #[test]
    fn source_chain_is_traversable() {
        let io_err = std::io::Error::other("socket closed");
        let top = BridgeError::connection_with_source("read failed", Box::new(io_err));

        let source = std::error::Error::source(&top).expect("source present");
        assert!(source.to_string().contains("socket closed"));
    }
}
