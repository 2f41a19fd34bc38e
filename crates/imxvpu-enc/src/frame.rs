//! Frame types and downstream delivery
//!
//! A [`CodecFrame`] carries one raw picture into the session; an
//! [`EncodedFrame`] carries the result out through a [`FrameSink`].

use imxvpu_mem::{PhysMemMeta, VideoMeta};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{EncoderError, Result};
use crate::pool::PoolBuffer;

/// Raw picture memory the session can read
pub trait VideoBuffer: Send {
    /// Present only for physically contiguous memory
    fn phys_mem_meta(&self) -> Option<PhysMemMeta>;

    fn video_meta(&self) -> Option<VideoMeta>;

    fn data(&self) -> &[u8];
}

impl VideoBuffer for PoolBuffer {
    fn phys_mem_meta(&self) -> Option<PhysMemMeta> {
        (**self).phys_mem_meta()
    }

    fn video_meta(&self) -> Option<VideoMeta> {
        (**self).video_meta()
    }

    fn data(&self) -> &[u8] {
        (**self).data()
    }
}

/// Picture in ordinary heap memory (not reachable by the VPU)
#[derive(Debug, Clone, Default)]
pub struct SystemBuffer {
    data: Vec<u8>,
    video_meta: Option<VideoMeta>,
}

impl SystemBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, video_meta: None }
    }

    #[must_use]
    pub fn with_video_meta(mut self, meta: VideoMeta) -> Self {
        self.video_meta = Some(meta);
        self
    }
}

impl VideoBuffer for SystemBuffer {
    fn phys_mem_meta(&self) -> Option<PhysMemMeta> {
        None
    }

    fn video_meta(&self) -> Option<VideoMeta> {
        self.video_meta
    }

    fn data(&self) -> &[u8] {
        &self.data
    }
}

/// One picture to encode
pub struct CodecFrame {
    pub system_frame_number: u32,
    /// Presentation timestamp in nanoseconds
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub duration: Option<u64>,
    pub input: Box<dyn VideoBuffer>,
    /// Caller asks for an intra picture
    pub force_keyframe: bool,
    /// Caller asks for an intra picture preceded by headers
    pub force_keyframe_headers: bool,
    pub sync_point: bool,
}

impl CodecFrame {
    pub fn new(system_frame_number: u32, input: impl VideoBuffer + 'static) -> Self {
        Self {
            system_frame_number,
            pts: None,
            dts: None,
            duration: None,
            input: Box::new(input),
            force_keyframe: false,
            force_keyframe_headers: false,
            sync_point: false,
        }
    }

    #[must_use]
    pub fn with_pts(mut self, pts: u64) -> Self {
        self.pts = Some(pts);
        self
    }

    #[must_use]
    pub fn with_keyframe_request(mut self, with_headers: bool) -> Self {
        if with_headers {
            self.force_keyframe_headers = true;
        } else {
            self.force_keyframe = true;
        }
        self
    }

    /// Finish the frame, dropping the input picture
    pub(crate) fn into_encoded(self, data: Option<Vec<u8>>) -> EncodedFrame {
        EncodedFrame {
            system_frame_number: self.system_frame_number,
            pts: self.pts,
            dts: self.dts,
            duration: self.duration,
            sync_point: self.sync_point,
            data,
        }
    }
}

impl std::fmt::Debug for CodecFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecFrame")
            .field("system_frame_number", &self.system_frame_number)
            .field("pts", &self.pts)
            .field("force_keyframe", &self.force_keyframe)
            .field("force_keyframe_headers", &self.force_keyframe_headers)
            .finish_non_exhaustive()
    }
}

/// A finished frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub system_frame_number: u32,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub duration: Option<u64>,
    pub sync_point: bool,
    /// Encoded bytes; `None` if the frame was dropped
    pub data: Option<Vec<u8>>,
}

impl EncodedFrame {
    pub fn is_dropped(&self) -> bool {
        self.data.is_none()
    }
}

/// How `handle_frame` ended for a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Encoded data was delivered
    Finished,
    /// The hardware never completed the frame; delivered without data
    Dropped,
}

/// Consumer of finished frames
pub trait FrameSink: Send {
    fn finish_frame(&mut self, frame: EncodedFrame) -> Result<()>;
}

/// Sink forwarding frames into a tokio channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EncodedFrame>,
}

impl ChannelSink {
    /// Create a sink and the receiving end
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EncodedFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl FrameSink for ChannelSink {
    fn finish_frame(&mut self, frame: EncodedFrame) -> Result<()> {
        trace!(
            "delivering frame {} ({} bytes)",
            frame.system_frame_number,
            frame.data.as_ref().map_or(0, Vec::len)
        );
        self.tx
            .send(frame)
            .map_err(|_| EncoderError::downstream("frame receiver dropped"))
    }
}
