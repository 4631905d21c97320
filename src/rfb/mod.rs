//! RFB (VNC) client protocol support.

pub(crate) mod auth;
mod session;
pub mod wire;

pub use session::{RfbSender, RfbSession, SessionPhase};
