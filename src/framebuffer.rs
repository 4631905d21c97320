//! Canonical in-memory image of the remote screen.
//!
//! The [`Framebuffer`] is the only state shared between pipeline stages: the
//! RFB decode loop writes patches into it, the frame scheduler reads snapshots
//! out of it. [`SharedFramebuffer`] mediates that access so a snapshot never
//! observes a partially-applied patch.
//!
//! Pixels are always canonical RGBA (the RFB client negotiates a 32-bit
//! true-colour format right after the handshake), so one buffer layout flows
//! through the whole pipeline.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::{BridgeError, Result};

/// Bytes per pixel in the canonical RGBA layout.
pub const BYTES_PER_PIXEL: usize = 4;

/// A rectangle in framebuffer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl Rect {
    pub fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self { x, y, width, height }
    }

    /// Number of pixels covered by this rectangle.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// A decoded update rectangle ready to be applied to the framebuffer.
///
/// `pixels` holds tightly-packed RGBA rows, `rect.width * rect.height *
/// BYTES_PER_PIXEL` bytes.
#[derive(Debug, Clone)]
pub struct PatchRect {
    pub rect: Rect,
    pub pixels: Vec<u8>,
}

impl PatchRect {
    pub fn new(rect: Rect, pixels: Vec<u8>) -> Self {
        Self { rect, pixels }
    }

    /// A rectangle filled with a single RGBA value.
    pub fn solid(rect: Rect, rgba: [u8; 4]) -> Self {
        let mut pixels = Vec::with_capacity(rect.pixel_count() * BYTES_PER_PIXEL);
        for _ in 0..rect.pixel_count() {
            pixels.extend_from_slice(&rgba);
        }
        Self { rect, pixels }
    }
}

/// An immutable, timestamped full-image copy taken at a scheduler tick.
///
/// Owned by the encoder pipeline once handed off; never mutated after
/// creation. The pixel buffer is shared cheaply via `Arc`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u16,
    pub height: u16,
    /// Canonical RGBA pixel data, `width * height * BYTES_PER_PIXEL` bytes.
    pub pixels: Arc<[u8]>,
    /// Presentation time, measured from the start of the stream.
    pub pts: Duration,
    /// Set by the scheduler on forced-refresh ticks and after a desktop
    /// resize; the encoder must emit a keyframe for this frame.
    pub force_keyframe: bool,
}

/// The canonical image plus dirty-region tracking.
///
/// Dirty rectangles are an optimization hint for the scheduler (skip encoding
/// when nothing changed); they carry no correctness obligation.
#[derive(Debug)]
pub struct Framebuffer {
    width: u16,
    height: u16,
    pixels: Vec<u8>,
    dirty: Vec<Rect>,
}

impl Framebuffer {
    /// Allocate a black framebuffer of the given dimensions.
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            pixels: vec![0u8; width as usize * height as usize * BYTES_PER_PIXEL],
            dirty: Vec::new(),
        }
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    /// Whether any patch has been applied since the last snapshot.
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    fn check_bounds(&self, rect: &Rect) -> Result<()> {
        let right = rect.x as usize + rect.width as usize;
        let bottom = rect.y as usize + rect.height as usize;
        if right > self.width as usize || bottom > self.height as usize {
            return Err(BridgeError::protocol(format!(
                "update rectangle {}x{}+{}+{} exceeds framebuffer {}x{}",
                rect.width, rect.height, rect.x, rect.y, self.width, self.height
            )));
        }
        Ok(())
    }

    /// Apply one decoded rectangle, marking its region dirty.
    pub fn apply_patch(&mut self, patch: &PatchRect) -> Result<()> {
        self.check_bounds(&patch.rect)?;

        let expected = patch.rect.pixel_count() * BYTES_PER_PIXEL;
        if patch.pixels.len() != expected {
            return Err(BridgeError::protocol(format!(
                "patch payload is {} bytes, rectangle needs {}",
                patch.pixels.len(),
                expected
            )));
        }

        let row_bytes = patch.rect.width as usize * BYTES_PER_PIXEL;
        let fb_stride = self.width as usize * BYTES_PER_PIXEL;
        for row in 0..patch.rect.height as usize {
            let src = row * row_bytes;
            let dst = (patch.rect.y as usize + row) * fb_stride
                + patch.rect.x as usize * BYTES_PER_PIXEL;
            self.pixels[dst..dst + row_bytes]
                .copy_from_slice(&patch.pixels[src..src + row_bytes]);
        }

        self.dirty.push(patch.rect);
        Ok(())
    }

    /// Copy a region of the framebuffer onto another (the CopyRect encoding).
    pub fn copy_rect(&mut self, src_x: u16, src_y: u16, dst: Rect) -> Result<()> {
        self.check_bounds(&dst)?;
        self.check_bounds(&Rect::new(src_x, src_y, dst.width, dst.height))?;

        let row_bytes = dst.width as usize * BYTES_PER_PIXEL;
        let fb_stride = self.width as usize * BYTES_PER_PIXEL;

        // Row-by-row through a scratch buffer; source and destination may overlap.
        let mut rows = Vec::with_capacity(dst.height as usize * row_bytes);
        for row in 0..dst.height as usize {
            let src = (src_y as usize + row) * fb_stride + src_x as usize * BYTES_PER_PIXEL;
            rows.extend_from_slice(&self.pixels[src..src + row_bytes]);
        }
        for row in 0..dst.height as usize {
            let src = row * row_bytes;
            let at = (dst.y as usize + row) * fb_stride + dst.x as usize * BYTES_PER_PIXEL;
            self.pixels[at..at + row_bytes].copy_from_slice(&rows[src..src + row_bytes]);
        }

        self.dirty.push(dst);
        Ok(())
    }

    /// Replace the buffer after a desktop-size change.
    ///
    /// Prior `Frame`s keep their own (now stale) dimensions; the whole new
    /// buffer is marked dirty so the next snapshot repaints everything.
    pub fn resize(&mut self, width: u16, height: u16) {
        self.width = width;
        self.height = height;
        self.pixels = vec![0u8; width as usize * height as usize * BYTES_PER_PIXEL];
        self.dirty.clear();
        self.dirty.push(Rect::new(0, 0, width, height));
    }

    /// Take an immutable full copy and clear dirty tracking.
    pub fn snapshot(&mut self, pts: Duration, force_keyframe: bool) -> Frame {
        self.dirty.clear();
        Frame {
            width: self.width,
            height: self.height,
            pixels: Arc::from(self.pixels.as_slice()),
            pts,
            force_keyframe,
        }
    }

    #[cfg(test)]
    pub(crate) fn pixel(&self, x: u16, y: u16) -> [u8; 4] {
        let at = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        self.pixels[at..at + 4].try_into().unwrap()
    }
}

/// Shared handle enforcing the atomic snapshot/patch contract.
///
/// Single writer (the RFB decode loop), any number of readers (in practice
/// one, the scheduler). The mutex is held only for memory copies, never
/// across I/O or `.await`, so the uncontended fast path stays cheap.
#[derive(Debug, Clone)]
pub struct SharedFramebuffer {
    inner: Arc<Mutex<Framebuffer>>,
}

impl SharedFramebuffer {
    pub fn new(width: u16, height: u16) -> Self {
        Self { inner: Arc::new(Mutex::new(Framebuffer::new(width, height))) }
    }

    pub fn apply_patch(&self, patch: &PatchRect) -> Result<()> {
        self.inner.lock().apply_patch(patch)
    }

    pub fn copy_rect(&self, src_x: u16, src_y: u16, dst: Rect) -> Result<()> {
        self.inner.lock().copy_rect(src_x, src_y, dst)
    }

    pub fn resize(&self, width: u16, height: u16) {
        self.inner.lock().resize(width, height);
    }

    pub fn snapshot(&self, pts: Duration, force_keyframe: bool) -> Frame {
        self.inner.lock().snapshot(pts, force_keyframe)
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.lock().is_dirty()
    }

    /// Current dimensions as `(width, height)`.
    pub fn dimensions(&self) -> (u16, u16) {
        let fb = self.inner.lock();
        (fb.width(), fb.height())
    }
}
