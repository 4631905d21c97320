//! RFB (RFC 6143) byte-level message layouts.
//!
//! Everything on the wire is big-endian with fixed-size headers. This module
//! only encodes and decodes bytes; session state lives in [`crate::rfb::session`].

use crate::{BridgeError, Result};

/// Protocol version the client speaks.
pub const PROTOCOL_VERSION: &[u8; 12] = b"RFB 003.008\n";

/// Security types (handshake).
pub const SECURITY_NONE: u8 = 1;
pub const SECURITY_VNC_AUTH: u8 = 2;

/// Client-to-server message types.
pub const MSG_SET_PIXEL_FORMAT: u8 = 0;
pub const MSG_SET_ENCODINGS: u8 = 2;
pub const MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;
pub const MSG_KEY_EVENT: u8 = 4;
pub const MSG_POINTER_EVENT: u8 = 5;

/// Server-to-client message types.
pub const MSG_FRAMEBUFFER_UPDATE: u8 = 0;
pub const MSG_SET_COLOUR_MAP: u8 = 1;
pub const MSG_BELL: u8 = 2;
pub const MSG_SERVER_CUT_TEXT: u8 = 3;

/// Rectangle encodings the client negotiates, preference order.
pub const ENCODING_RAW: i32 = 0;
pub const ENCODING_COPY_RECT: i32 = 1;
pub const ENCODING_RRE: i32 = 2;
/// DesktopSize pseudo-encoding: a structural resize, not a pixel patch.
pub const ENCODING_DESKTOP_SIZE: i32 = -223;

/// Encodings sent in SetEncodings. Raw last as the universal fallback is not
/// needed client-side; servers pick the first mutually supported entry.
pub const SUPPORTED_ENCODINGS: &[i32] =
    &[ENCODING_COPY_RECT, ENCODING_RRE, ENCODING_RAW, ENCODING_DESKTOP_SIZE];

/// The 16-byte PIXEL_FORMAT block from the RFB handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    pub bits_per_pixel: u8,
    pub depth: u8,
    pub big_endian: bool,
    pub true_colour: bool,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl PixelFormat {
    /// The canonical format the client forces with SetPixelFormat: 32bpp
    /// little-endian true colour with R,G,B in ascending byte order, so raw
    /// rectangle bytes are already the framebuffer's RGBA layout.
    pub fn rgba() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian: false,
            true_colour: true,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 0,
            green_shift: 8,
            blue_shift: 16,
        }
    }

    pub fn from_bytes(bytes: &[u8; 16]) -> Self {
        Self {
            bits_per_pixel: bytes[0],
            depth: bytes[1],
            big_endian: bytes[2] != 0,
            true_colour: bytes[3] != 0,
            red_max: u16::from_be_bytes([bytes[4], bytes[5]]),
            green_max: u16::from_be_bytes([bytes[6], bytes[7]]),
            blue_max: u16::from_be_bytes([bytes[8], bytes[9]]),
            red_shift: bytes[10],
            green_shift: bytes[11],
            blue_shift: bytes[12],
            // bytes[13..16] are padding
        }
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[0] = self.bits_per_pixel;
        bytes[1] = self.depth;
        bytes[2] = self.big_endian as u8;
        bytes[3] = self.true_colour as u8;
        bytes[4..6].copy_from_slice(&self.red_max.to_be_bytes());
        bytes[6..8].copy_from_slice(&self.green_max.to_be_bytes());
        bytes[8..10].copy_from_slice(&self.blue_max.to_be_bytes());
        bytes[10] = self.red_shift;
        bytes[11] = self.green_shift;
        bytes[12] = self.blue_shift;
        bytes
    }

    /// Bytes occupied by one pixel on the wire.
    pub fn bytes_per_pixel(&self) -> usize {
        self.bits_per_pixel as usize / 8
    }

    /// Decode `count` wire pixels into canonical RGBA.
    ///
    /// The session forces [`PixelFormat::rgba`] right after ServerInit, so the
    /// common path is a widening copy; the shift/max arithmetic still handles
    /// any 8/16/32bpp true-colour layout a server echoes back.
    pub fn decode_pixels(&self, raw: &[u8], count: usize) -> Result<Vec<u8>> {
        let bpp = self.bytes_per_pixel();
        if !matches!(bpp, 1 | 2 | 4) {
            return Err(BridgeError::protocol(format!(
                "unsupported pixel size: {} bits per pixel",
                self.bits_per_pixel
            )));
        }
        if raw.len() != count * bpp {
            return Err(BridgeError::protocol(format!(
                "pixel payload is {} bytes, expected {} ({} pixels at {}bpp)",
                raw.len(),
                count * bpp,
                count,
                self.bits_per_pixel
            )));
        }
        if !self.true_colour {
            return Err(BridgeError::protocol("colour-map pixel formats are not supported"));
        }

        let mut rgba = Vec::with_capacity(count * 4);
        for px in raw.chunks_exact(bpp) {
            let value = match (bpp, self.big_endian) {
                (1, _) => px[0] as u32,
                (2, true) => u16::from_be_bytes([px[0], px[1]]) as u32,
                (2, false) => u16::from_le_bytes([px[0], px[1]]) as u32,
                (4, true) => u32::from_be_bytes([px[0], px[1], px[2], px[3]]),
                (4, false) => u32::from_le_bytes([px[0], px[1], px[2], px[3]]),
                _ => unreachable!(),
            };
            rgba.push(Self::expand(value >> self.red_shift, self.red_max));
            rgba.push(Self::expand(value >> self.green_shift, self.green_max));
            rgba.push(Self::expand(value >> self.blue_shift, self.blue_max));
            rgba.push(0xff);
        }
        Ok(rgba)
    }

    /// Scale a masked channel value to the 0..=255 range.
    fn expand(value: u32, max: u16) -> u8 {
        if max == 0 {
            return 0;
        }
        let masked = value & max as u32;
        ((masked * 255) / max as u32) as u8
    }
}

/// The 12-byte header preceding every update rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RectHeader {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub encoding: i32,
}

impl RectHeader {
    pub fn from_bytes(bytes: &[u8; 12]) -> Self {
        Self {
            x: u16::from_be_bytes([bytes[0], bytes[1]]),
            y: u16::from_be_bytes([bytes[2], bytes[3]]),
            width: u16::from_be_bytes([bytes[4], bytes[5]]),
            height: u16::from_be_bytes([bytes[6], bytes[7]]),
            encoding: i32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        }
    }
}

/// SetPixelFormat (type 0): 3 bytes padding, then the 16-byte format block.
pub fn set_pixel_format(format: &PixelFormat) -> [u8; 20] {
    let mut msg = [0u8; 20];
    msg[4..20].copy_from_slice(&format.to_bytes());
    msg
}

/// SetEncodings (type 2).
pub fn set_encodings(encodings: &[i32]) -> Vec<u8> {
    let mut msg = vec![0u8; 4 + encodings.len() * 4];
    msg[0] = 2;
    msg[2..4].copy_from_slice(&(encodings.len() as u16).to_be_bytes());
    for (i, &enc) in encodings.iter().enumerate() {
        msg[4 + i * 4..8 + i * 4].copy_from_slice(&enc.to_be_bytes());
    }
    msg
}

/// FramebufferUpdateRequest (type 3).
pub fn framebuffer_update_request(
    incremental: bool,
    x: u16,
    y: u16,
    width: u16,
    height: u16,
) -> [u8; 10] {
    let mut msg = [0u8; 10];
    msg[0] = 3;
    msg[1] = incremental as u8;
    msg[2..4].copy_from_slice(&x.to_be_bytes());
    msg[4..6].copy_from_slice(&y.to_be_bytes());
    msg[6..8].copy_from_slice(&width.to_be_bytes());
    msg[8..10].copy_from_slice(&height.to_be_bytes());
    msg
}

/// KeyEvent (type 4).
pub fn key_event(down: bool, keysym: u32) -> [u8; 8] {
    let mut msg = [0u8; 8];
    msg[0] = 4;
    msg[1] = down as u8;
    msg[4..8].copy_from_slice(&keysym.to_be_bytes());
    msg
}

/// PointerEvent (type 5).
pub fn pointer_event(buttons: u8, x: u16, y: u16) -> [u8; 6] {
    let mut msg = [0u8; 6];
    msg[0] = 5;
    msg[1] = buttons;
    msg[2..4].copy_from_slice(&x.to_be_bytes());
    msg[4..6].copy_from_slice(&y.to_be_bytes());
    msg
}
