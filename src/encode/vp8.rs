//! libvpx VP8 backend via ffmpeg.
//!
//! Compiled only with the `vpx` feature so the rest of the crate builds and
//! tests without native ffmpeg libraries.

use ac_ffmpeg::codec::Encoder as _;
use ac_ffmpeg::codec::video::frame::{PictureType, PixelFormat, get_pixel_format};
use ac_ffmpeg::codec::video::{VideoEncoder as FfmpegEncoder, VideoFrameMut};
use ac_ffmpeg::time::{TimeBase, Timestamp};
use bytes::Bytes;

use super::yuv::I420Buffer;
use super::{EncodedPayload, VideoEncoder};
use crate::framebuffer::Frame;
use crate::transport::rtp::CLOCK_RATE;
use crate::{BridgeError, Result};

pub struct Vp8Encoder {
    encoder: FfmpegEncoder,
    planes: I420Buffer,
    pixel_format: PixelFormat,
    time_base: TimeBase,
    target_bitrate: u64,
    width: u16,
    height: u16,
}

impl Vp8Encoder {
    /// Build a realtime, error-resilient VP8 encoder.
    pub fn new(width: u16, height: u16, target_bitrate: u64) -> Result<Self> {
        let pixel_format = get_pixel_format("yuv420p");
        let time_base = TimeBase::new(1, CLOCK_RATE as i32);
        let encoder = Self::build(pixel_format, time_base, width, height, target_bitrate)?;
        Ok(Self {
            encoder,
            planes: I420Buffer::new(width as usize, height as usize),
            pixel_format,
            time_base,
            target_bitrate,
            width,
            height,
        })
    }

    fn build(
        pixel_format: PixelFormat,
        time_base: TimeBase,
        width: u16,
        height: u16,
        target_bitrate: u64,
    ) -> Result<FfmpegEncoder> {
        FfmpegEncoder::builder("libvpx")
            .map_err(|e| BridgeError::encoder_init_with_source("libvpx unavailable", Box::new(e)))?
            .pixel_format(pixel_format)
            .width(width as usize)
            .height(height as usize)
            .time_base(time_base)
            .bit_rate(target_bitrate)
            .set_option("deadline", "realtime")
            .set_option("error-resilient", "1")
            .build()
            .map_err(|e| {
                BridgeError::encoder_init_with_source(
                    format!("could not open libvpx at {width}x{height}"),
                    Box::new(e),
                )
            })
    }

    fn pts_ticks(pts: std::time::Duration) -> i64 {
        (pts.as_nanos() * CLOCK_RATE as u128 / 1_000_000_000) as i64
    }
}

impl VideoEncoder for Vp8Encoder {
    fn encode(&mut self, frame: &Frame, force_keyframe: bool) -> Result<Option<EncodedPayload>> {
        debug_assert_eq!((frame.width, frame.height), (self.width, self.height));

        self.planes.fill_from_rgba(&frame.pixels);

        let mut vf =
            VideoFrameMut::black(self.pixel_format, self.width as usize, self.height as usize)
                .with_time_base(self.time_base)
                .with_pts(Timestamp::new(Self::pts_ticks(frame.pts), self.time_base));
        if force_keyframe {
            vf = vf.with_picture_type(PictureType::I);
        }

        {
            let chroma_width = (self.width as usize).div_ceil(2);
            let mut target = vf.planes_mut();
            for (plane, (src, width)) in target.iter_mut().zip([
                (&self.planes.y, self.width as usize),
                (&self.planes.u, chroma_width),
                (&self.planes.v, chroma_width),
            ]) {
                // ffmpeg planes may be stride-padded, copy row by row
                let stride = plane.line_size();
                let data = plane.data_mut();
                for (row, chunk) in src.chunks(width).enumerate() {
                    data[row * stride..row * stride + width].copy_from_slice(chunk);
                }
            }
        }

        let err = |e: ac_ffmpeg::Error| BridgeError::encode_frame(0, e.to_string());
        self.encoder.push(vf.freeze()).map_err(err)?;

        // libvpx in realtime mode emits one packet per pushed frame
        let mut bitstream = Vec::new();
        let mut keyframe = false;
        while let Some(packet) = self.encoder.take().map_err(err)? {
            bitstream.extend_from_slice(packet.data());
            keyframe |= packet.is_key();
        }
        if bitstream.is_empty() {
            return Ok(None);
        }
        Ok(Some(EncodedPayload { data: Bytes::from(bitstream), keyframe }))
    }

    fn reconfigure(&mut self, width: u16, height: u16) -> Result<()> {
        self.encoder =
            Self::build(self.pixel_format, self.time_base, width, height, self.target_bitrate)?;
        self.planes.resize(width as usize, height as usize);
        self.width = width;
        self.height = height;
        Ok(())
    }
}
