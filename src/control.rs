//! Inbound control events from the viewer.
//!
//! Pointer and keyboard events arrive on the WebRTC data channel as JSON,
//! are translated 1:1 into RFB client-to-server messages and discarded after
//! forwarding. Coordinates are framebuffer pixels, passed through unmodified.

use serde::{Deserialize, Serialize};

use crate::{BridgeError, Result};

/// A viewer input event received over the control data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlEvent {
    /// Pointer position plus button mask (RFB semantics: bit 0 = left,
    /// bit 1 = middle, bit 2 = right, bits 3/4 = scroll).
    Pointer { x: u16, y: u16, buttons: u8 },

    /// Key press or release, identified by X11 keysym as RFB requires.
    Key { keysym: u32, down: bool },
}

impl ControlEvent {
    /// Parse one data-channel payload.
    ///
    /// Malformed payloads are reported as [`BridgeError::Protocol`] but the
    /// caller logs and drops them rather than tearing the session down: the
    /// control channel is advisory input, unlike the RFB byte stream.
    pub fn from_json(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| BridgeError::protocol(format!("bad control payload: {e}")))
    }

    pub fn to_json(&self) -> Vec<u8> {
        // Serialization of these two variants cannot fail
        serde_json::to_vec(self).expect("control event serializes")
    }
}
