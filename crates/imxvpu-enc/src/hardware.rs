//! Hardware Encode Capability
//!
//! The contract the VPU driver wrapper fulfils. Everything behind
//! [`HardwareCodec`] is opaque: the session only sees parameter records going
//! in and status flags, sizes and return codes coming out.
//!
//! Calls against one [`HwHandle`] are never issued concurrently; the owning
//! session drives them from a single thread.

use std::fmt;

use enumflags2::{bitflags, BitFlags};
use imxvpu_mem::{FramebufferHandle, MemoryKind, PhysAddr};
use thiserror::Error;

use crate::codec::CodecFamily;
use crate::config::SliceMode;

/// Return codes documented by the hardware capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetCode {
    Failure,
    InvalidParam,
    InvalidHandle,
    InvalidFrameBuffer,
    InsufficientFrameBuffers,
    InvalidStride,
    WrongCallSequence,
    Timeout,
    NotInitialized,
}

impl RetCode {
    /// Human-readable description
    pub fn description(self) -> &'static str {
        match self {
            Self::Failure => "failure",
            Self::InvalidParam => "invalid param",
            Self::InvalidHandle => "invalid handle",
            Self::InvalidFrameBuffer => "invalid framebuffer",
            Self::InsufficientFrameBuffers => "insufficient framebuffers",
            Self::InvalidStride => "invalid stride",
            Self::WrongCallSequence => "wrong call sequence",
            Self::Timeout => "timeout",
            Self::NotInitialized => "not initialized",
        }
    }
}

impl fmt::Display for RetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Non-success return code from the hardware capability
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{code}")]
pub struct HwError {
    pub code: RetCode,
}

impl HwError {
    pub fn new(code: RetCode) -> Self {
        Self { code }
    }
}

impl From<RetCode> for HwError {
    fn from(code: RetCode) -> Self {
        Self::new(code)
    }
}

/// Result type for hardware capability calls
pub type HwResult<T> = std::result::Result<T, HwError>;

/// Opaque encoder instance handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HwHandle(pub u64);

/// Versions reported after loading
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionInfo {
    pub firmware: String,
    pub library: String,
    pub wrapper: String,
}

/// One work-memory sub-block the hardware wants before `open`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDescriptor {
    pub kind: MemoryKind,
    pub size: usize,
    pub alignment: usize,
}

/// An allocated work-memory block as handed to `open`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkMemoryBlock {
    pub kind: MemoryKind,
    pub virt_addr: usize,
    pub phys_addr: Option<PhysAddr>,
    pub size: usize,
}

/// Parameters for opening an encoder instance
#[derive(Debug, Clone, PartialEq)]
pub struct OpenParams {
    pub codec: CodecFamily,
    pub pic_width: usize,
    pub pic_height: usize,
    /// Frame rate packed by [`pack_frame_rate`]
    pub frame_rate_info: u32,
    pub mirror: bool,
    /// Target bitrate in kbps, 0 for constant quality
    pub bitrate_kbps: u32,
    pub gop_size: u32,
    pub slice_mode: SliceMode,
    pub rc_intra_qp: i32,
    /// Gamma in Q15
    pub user_gamma: u32,
    pub intra_refresh: u32,
}

impl Default for OpenParams {
    fn default() -> Self {
        Self {
            codec: CodecFamily::H264,
            pic_width: 0,
            pic_height: 0,
            frame_rate_info: 0,
            mirror: false,
            bitrate_kbps: 0,
            gop_size: 16,
            slice_mode: SliceMode::Unlimited,
            rc_intra_qp: -1,
            user_gamma: (0.75 * 32768.0) as u32,
            intra_refresh: 0,
        }
    }
}

/// Pack a frame rate the way the encoder expects it
///
/// Low 16 bits carry the numerator, high 16 bits the denominator minus one.
pub fn pack_frame_rate(fps_n: u32, fps_d: u32) -> u32 {
    (fps_n & 0xffff) | ((fps_d.saturating_sub(1) & 0xffff) << 16)
}

/// Post-open configuration calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    /// Target bitrate in kbps
    Bitrate(u32),
    /// Minimum number of macroblocks refreshed per frame
    IntraRefresh(u32),
}

/// Information available right after `open`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitInfo {
    pub min_framebuffer_count: usize,
    pub address_alignment: usize,
}

/// One framebuffer of the registered set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferDesc {
    pub handle: FramebufferHandle,
    pub y: PhysAddr,
    pub cb: PhysAddr,
    pub cr: PhysAddr,
    pub mv: PhysAddr,
    pub y_stride: usize,
    pub uv_stride: usize,
}

/// Planes of the picture to encode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputPicture {
    pub y: PhysAddr,
    pub cb: PhysAddr,
    pub cr: PhysAddr,
    pub y_stride: usize,
    pub uv_stride: usize,
}

/// Parameters for one `encode_frame` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeParams {
    pub output_phys: PhysAddr,
    pub output_virt: usize,
    pub output_size: usize,
    pub pic_width: usize,
    pub pic_height: usize,
    pub frame_rate_info: u32,
    pub force_i_picture: bool,
    pub input: InputPicture,
}

/// Flags reported by one `encode_frame` call
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeStatus {
    /// The input picture has been fully consumed
    InputUsed = 0b0001,
    /// Encoded data sits in the output region
    OutputAvailable = 0b0010,
    /// A sequence header sits in the output region
    SequenceHeader = 0b0100,
    /// The encoded frame is complete
    DisplayReady = 0b1000,
}

/// Result of one `encode_frame` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOutcome {
    pub status: BitFlags<EncodeStatus>,
    /// Bytes written into the output region by this call
    pub output_size: usize,
}

impl EncodeOutcome {
    /// Whether this call left data to collect
    pub fn has_output(&self) -> bool {
        self.status
            .intersects(EncodeStatus::OutputAvailable | EncodeStatus::SequenceHeader)
    }
}

/// The opaque hardware encode capability
pub trait HardwareCodec: Send + Sync {
    /// Load the capability; called once on the first reference
    fn load(&self) -> HwResult<()>;

    /// Unload the capability; called once when the last reference goes
    fn unload(&self) -> HwResult<()>;

    fn version_info(&self) -> HwResult<VersionInfo>;

    /// Work-memory blocks required before `open`
    fn query_work_memory(&self) -> HwResult<Vec<BlockDescriptor>>;

    fn open(&self, work_memory: &[WorkMemoryBlock], params: &OpenParams) -> HwResult<HwHandle>;

    fn configure(&self, handle: HwHandle, key: ConfigKey) -> HwResult<()>;

    fn initial_info(&self, handle: HwHandle) -> HwResult<InitInfo>;

    fn register_framebuffers(
        &self,
        handle: HwHandle,
        framebuffers: &[FramebufferDesc],
        src_stride: usize,
    ) -> HwResult<()>;

    /// Feed the input picture and collect output into `output`
    ///
    /// `output` is the CPU view of the region described by
    /// `params.output_phys`/`params.output_size`.
    fn encode_frame(&self, handle: HwHandle, params: &EncodeParams, output: &mut [u8]) -> HwResult<EncodeOutcome>;

    /// Hand a framebuffer back after its contents were displayed
    ///
    /// Only meaningful for framebuffers registered as decoder output.
    fn notify_frame_displayed(&self, handle: HwHandle, framebuffer: FramebufferHandle) -> HwResult<()> {
        let _ = (handle, framebuffer);
        Ok(())
    }

    fn reset(&self, handle: HwHandle) -> HwResult<()>;

    fn close(&self, handle: HwHandle) -> HwResult<()>;
}
