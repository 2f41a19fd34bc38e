//! Buffer metadata
//!
//! Small records attached to pooled buffers. [`PhysMemMeta`] marks a buffer
//! as physically contiguous, [`VideoMeta`] carries its actual plane layout,
//! and [`FramebufferMeta`] ties it to a framebuffer the VPU knows about.

use crate::format::{PixelFormat, PlaneLayout, VideoInfo};
use crate::PhysAddr;

/// Physical-memory annotation
///
/// Its presence is what tells the encoder it can hand the buffer to the VPU
/// without a copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhysMemMeta {
    /// Bus address of the first byte
    pub phys_addr: PhysAddr,
    /// Extra columns beyond the logical width
    pub x_padding: usize,
    /// Extra rows beyond the logical height
    pub y_padding: usize,
}

impl PhysMemMeta {
    /// Meta without padding
    pub fn new(phys_addr: PhysAddr) -> Self {
        Self {
            phys_addr,
            x_padding: 0,
            y_padding: 0,
        }
    }
}

/// Actual plane layout of one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoMeta {
    pub format: PixelFormat,
    pub width: usize,
    pub height: usize,
    pub n_planes: usize,
    pub layout: PlaneLayout,
}

impl VideoMeta {
    /// Meta describing the default layout of `info`
    pub fn from_info(info: &VideoInfo) -> Self {
        Self {
            format: info.format,
            width: info.width,
            height: info.height,
            n_planes: info.n_planes(),
            layout: info.layout,
        }
    }
}

/// Index of a framebuffer inside the set registered with the VPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FramebufferHandle(pub u32);

impl FramebufferHandle {
    /// Index into the framebuffer array
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Link between a buffer and a VPU framebuffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramebufferMeta {
    /// Attached framebuffer, if any
    pub framebuffer: Option<FramebufferHandle>,
    /// Set while the VPU still expects a "displayed" notification for it
    pub not_displayed_yet: bool,
}

impl FramebufferMeta {
    /// Whether releasing the buffer must notify the hardware first
    pub fn needs_display_notification(&self) -> bool {
        self.framebuffer.is_some() && self.not_displayed_yet
    }
}
