//! Codec Families
//!
//! The session is codec agnostic. Everything that differs between H.264 and
//! Motion JPEG goes through [`EncoderCodec`]: two required calls for open
//! parameters and output caps, and two optional hooks for per-frame
//! parameters and output filling. An absent hook is `None`, and the session
//! falls back to its default behavior.

use std::fmt;

use enumflags2::BitFlags;
use imxvpu_mem::VideoInfo;

use crate::error::Result;
use crate::frame::CodecFrame;
use crate::hardware::{EncodeParams, EncodeStatus, OpenParams};

/// Bitstream formats the encoder can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecFamily {
    H264,
    Mjpeg,
}

impl fmt::Display for CodecFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::H264 => write!(f, "H.264"),
            Self::Mjpeg => write!(f, "Motion JPEG"),
        }
    }
}

/// Media description of the encoded output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputCaps {
    pub media_type: &'static str,
    pub width: usize,
    pub height: usize,
    pub fps_n: u32,
    pub fps_d: u32,
    pub stream_format: Option<&'static str>,
    pub alignment: Option<&'static str>,
}

impl OutputCaps {
    fn for_info(media_type: &'static str, info: &VideoInfo) -> Self {
        Self {
            media_type,
            width: info.width,
            height: info.height,
            fps_n: info.fps_n,
            fps_d: info.fps_d,
            stream_format: None,
            alignment: None,
        }
    }
}

/// Adjusts encode parameters right before each `encode_frame` call
pub trait FrameParamsHook {
    fn adjust(&mut self, params: &mut EncodeParams, frame: &CodecFrame);
}

/// Moves encoded bytes from the hardware output region into the frame
pub trait OutputFiller {
    /// Write into `dst` from `src` and return the number of bytes written
    ///
    /// `dst` is the unused tail of the frame's output buffer.
    fn fill(&mut self, dst: &mut [u8], src: &[u8], status: BitFlags<EncodeStatus>) -> usize;
}

/// Codec-specific behavior plugged into an encoder session
pub trait EncoderCodec: Send {
    fn family(&self) -> CodecFamily;

    /// Fill in codec-specific open parameters
    fn set_open_params(&mut self, params: &mut OpenParams, info: &VideoInfo) -> Result<()>;

    /// Describe the encoded output for `info`
    fn output_caps(&mut self, info: &VideoInfo) -> OutputCaps;

    fn frame_params_hook(&mut self) -> Option<&mut dyn FrameParamsHook> {
        None
    }

    fn output_filler(&mut self) -> Option<&mut dyn OutputFiller> {
        None
    }
}

/// Copy as much of `src` as fits into `dst`
pub(crate) fn copy_output(dst: &mut [u8], src: &[u8]) -> usize {
    let len = dst.len().min(src.len());
    dst[..len].copy_from_slice(&src[..len]);
    len
}

/// H.264 byte-stream encoder
///
/// Sequence headers are emitted in-band and also kept as codec data.
#[cfg(feature = "h264")]
#[derive(Debug, Default)]
pub struct H264Codec {
    codec_data: Option<Vec<u8>>,
}

#[cfg(feature = "h264")]
impl H264Codec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent sequence header
    pub fn codec_data(&self) -> Option<&[u8]> {
        self.codec_data.as_deref()
    }
}

#[cfg(feature = "h264")]
impl EncoderCodec for H264Codec {
    fn family(&self) -> CodecFamily {
        CodecFamily::H264
    }

    fn set_open_params(&mut self, params: &mut OpenParams, _info: &VideoInfo) -> Result<()> {
        params.codec = CodecFamily::H264;
        self.codec_data = None;
        Ok(())
    }

    fn output_caps(&mut self, info: &VideoInfo) -> OutputCaps {
        OutputCaps {
            stream_format: Some("byte-stream"),
            alignment: Some("au"),
            ..OutputCaps::for_info("video/x-h264", info)
        }
    }

    fn output_filler(&mut self) -> Option<&mut dyn OutputFiller> {
        Some(self)
    }
}

#[cfg(feature = "h264")]
impl OutputFiller for H264Codec {
    fn fill(&mut self, dst: &mut [u8], src: &[u8], status: BitFlags<EncodeStatus>) -> usize {
        if status.contains(EncodeStatus::SequenceHeader) {
            self.codec_data = Some(src.to_vec());
        }
        copy_output(dst, src)
    }
}

/// Motion JPEG encoder; every picture is intra coded
#[cfg(feature = "mjpeg")]
#[derive(Debug, Default)]
pub struct MjpegCodec;

#[cfg(feature = "mjpeg")]
impl MjpegCodec {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(feature = "mjpeg")]
impl EncoderCodec for MjpegCodec {
    fn family(&self) -> CodecFamily {
        CodecFamily::Mjpeg
    }

    fn set_open_params(&mut self, params: &mut OpenParams, _info: &VideoInfo) -> Result<()> {
        params.codec = CodecFamily::Mjpeg;
        Ok(())
    }

    fn output_caps(&mut self, info: &VideoInfo) -> OutputCaps {
        OutputCaps::for_info("image/jpeg", info)
    }

    fn frame_params_hook(&mut self) -> Option<&mut dyn FrameParamsHook> {
        Some(self)
    }
}

#[cfg(feature = "mjpeg")]
impl FrameParamsHook for MjpegCodec {
    fn adjust(&mut self, params: &mut EncodeParams, _frame: &CodecFrame) {
        params.force_i_picture = true;
    }
}
