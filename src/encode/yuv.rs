//! RGBA to I420 planar conversion.
//!
//! Integer BT.601 studio-swing approximation. Chroma is subsampled 2x2 by
//! taking the top-left pixel of each block, which is what the downstream
//! encoder expects for yuv420p input.

/// Destination planes for one I420 frame.
///
/// Reused across frames so the planes are allocated once per resolution.
#[derive(Debug, Default, Clone)]
pub struct I420Buffer {
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
    width: usize,
    height: usize,
}

impl I420Buffer {
    pub fn new(width: usize, height: usize) -> Self {
        let mut buf = Self::default();
        buf.resize(width, height);
        buf
    }

    pub fn resize(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;
        self.y.resize(width * height, 0);
        let chroma = width.div_ceil(2) * height.div_ceil(2);
        self.u.resize(chroma, 0);
        self.v.resize(chroma, 0);
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Convert one tightly-packed RGBA frame into the planes.
    ///
    /// # Panics
    ///
    /// If `rgba` is not exactly `width * height * 4` bytes.
    pub fn fill_from_rgba(&mut self, rgba: &[u8]) {
        assert_eq!(rgba.len(), self.width * self.height * 4, "frame size mismatch");

        let chroma_stride = self.width.div_ceil(2);
        for row in 0..self.height {
            for col in 0..self.width {
                let at = (row * self.width + col) * 4;
                let r = rgba[at] as i32;
                let g = rgba[at + 1] as i32;
                let b = rgba[at + 2] as i32;

                let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
                self.y[row * self.width + col] = y.clamp(0, 255) as u8;

                if row % 2 == 0 && col % 2 == 0 {
                    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
                    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
                    let cat = (row / 2) * chroma_stride + col / 2;
                    self.u[cat] = u.clamp(0, 255) as u8;
                    self.v[cat] = v.clamp(0, 255) as u8;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: usize, height: usize, rgba: [u8; 4]) -> Vec<u8> {
        rgba.iter().copied().cycle().take(width * height * 4).collect()
    }

    #[test]
    fn plane_sizes_follow_i420_layout() {
        let buf = I420Buffer::new(6, 4);
        assert_eq!(buf.y.len(), 24);
        assert_eq!(buf.u.len(), 6);
        assert_eq!(buf.v.len(), 6);

        // Odd dimensions round the chroma planes up
        let buf = I420Buffer::new(5, 3);
        assert_eq!(buf.y.len(), 15);
        assert_eq!(buf.u.len(), 6);
        assert_eq!(buf.v.len(), 6);
    }

    #[test]
    fn black_maps_to_studio_swing_limits() {
        let mut buf = I420Buffer::new(4, 4);
        buf.fill_from_rgba(&solid(4, 4, [0, 0, 0, 255]));
        assert!(buf.y.iter().all(|&y| y == 16));
        assert!(buf.u.iter().all(|&u| u == 128));
        assert!(buf.v.iter().all(|&v| v == 128));
    }

    #[test]
    fn white_maps_to_studio_swing_limits() {
        let mut buf = I420Buffer::new(4, 4);
        buf.fill_from_rgba(&solid(4, 4, [255, 255, 255, 255]));
        assert!(buf.y.iter().all(|&y| y == 235));
        assert!(buf.u.iter().all(|&u| u == 128));
        assert!(buf.v.iter().all(|&v| v == 128));
    }

    #[test]
    fn pure_red_lands_in_the_red_chroma_quadrant() {
        let mut buf = I420Buffer::new(2, 2);
        buf.fill_from_rgba(&solid(2, 2, [255, 0, 0, 255]));
        assert_eq!(buf.y[0], 82);
        assert!(buf.u[0] < 128);
        assert!(buf.v[0] > 200);
    }

    #[test]
    fn resize_reuses_the_buffer() {
        let mut buf = I420Buffer::new(8, 8);
        buf.resize(4, 2);
        buf.fill_from_rgba(&solid(4, 2, [10, 20, 30, 255]));
        assert_eq!(buf.y.len(), 8);
        assert_eq!(buf.width(), 4);
    }
}
