//! WebRTC delivery of the encoded video stream.

pub mod rtp;
mod session;

pub use session::TransportSession;
