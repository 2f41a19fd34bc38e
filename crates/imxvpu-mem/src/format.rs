//! Video Format and Plane Geometry
//!
//! Raw pixel layouts accepted by the VPU encoder and the plane arithmetic
//! the buffer pool and the fallback copy path need.

use std::fmt;

use crate::error::{MemError, Result};

/// Maximum number of planes in any supported layout
pub const MAX_PLANES: usize = 3;

/// Raw pixel layouts the encoder accepts as input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Planar 4:2:0, Y then U then V
    I420,
    /// Planar 4:2:0, Y then V then U
    Yv12,
    /// Semi-planar 4:2:0, Y then interleaved UV
    Nv12,
    /// Planar 4:2:2
    Y42b,
    /// Planar 4:4:4
    Y444,
    /// Luma only
    Gray8,
}

impl PixelFormat {
    /// Number of planes
    pub fn n_planes(self) -> usize {
        match self {
            Self::I420 | Self::Yv12 | Self::Y42b | Self::Y444 => 3,
            Self::Nv12 => 2,
            Self::Gray8 => 1,
        }
    }

    /// Horizontal and vertical chroma subsampling shifts
    fn chroma_shift(self) -> (u32, u32) {
        match self {
            Self::I420 | Self::Yv12 | Self::Nv12 => (1, 1),
            Self::Y42b => (1, 0),
            Self::Y444 | Self::Gray8 => (0, 0),
        }
    }

    /// Width in bytes of one row of `plane` for an image `width` pixels wide
    pub fn plane_row_bytes(self, plane: usize, width: usize) -> usize {
        if plane == 0 {
            return width;
        }
        let (xs, _) = self.chroma_shift();
        let chroma_width = (width + (1 << xs) - 1) >> xs;
        match self {
            // interleaved UV samples
            Self::Nv12 => chroma_width * 2,
            _ => chroma_width,
        }
    }

    /// Number of rows of `plane` for an image `height` pixels high
    pub fn plane_rows(self, plane: usize, height: usize) -> usize {
        if plane == 0 {
            return height;
        }
        let (_, ys) = self.chroma_shift();
        (height + (1 << ys) - 1) >> ys
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::I420 => "I420",
            Self::Yv12 => "YV12",
            Self::Nv12 => "NV12",
            Self::Y42b => "Y42B",
            Self::Y444 => "Y444",
            Self::Gray8 => "GRAY8",
        };
        f.write_str(name)
    }
}

/// Per-plane offsets and strides within one buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Byte offset of each plane from the start of the buffer
    pub offsets: [usize; MAX_PLANES],
    /// Bytes between the starts of consecutive rows, per plane
    pub strides: [usize; MAX_PLANES],
}

/// Negotiated raw video format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoInfo {
    /// Pixel layout
    pub format: PixelFormat,
    /// Width in pixels
    pub width: usize,
    /// Height in pixels
    pub height: usize,
    /// Frame rate numerator
    pub fps_n: u32,
    /// Frame rate denominator
    pub fps_d: u32,
    /// Plane offsets and strides
    pub layout: PlaneLayout,
    /// Total bytes per frame
    pub size: usize,
}

impl VideoInfo {
    /// Default layout: rows padded to 4 bytes, planes packed back to back
    pub fn new(format: PixelFormat, width: usize, height: usize) -> Self {
        let mut layout = PlaneLayout::default();
        let mut offset = 0;
        for plane in 0..format.n_planes() {
            let stride = crate::align_up(format.plane_row_bytes(plane, width) as u64, 4) as usize;
            layout.offsets[plane] = offset;
            layout.strides[plane] = stride;
            offset += stride * format.plane_rows(plane, height);
        }

        Self {
            format,
            width,
            height,
            fps_n: 0,
            fps_d: 1,
            layout,
            size: offset,
        }
    }

    /// Set the frame rate
    #[must_use]
    pub fn with_framerate(mut self, fps_n: u32, fps_d: u32) -> Self {
        self.fps_n = fps_n;
        self.fps_d = fps_d;
        self
    }

    /// Replace the layout, e.g. with hardware-reported geometry
    #[must_use]
    pub fn with_layout(mut self, layout: PlaneLayout, size: usize) -> Self {
        self.layout = layout;
        self.size = size;
        self
    }

    /// Number of planes
    pub fn n_planes(&self) -> usize {
        self.format.n_planes()
    }
}

/// Copy the visible pixels of a frame between two layouts
///
/// Row by row, so differing strides and padding on either side are fine.
pub fn copy_frame(
    info: &VideoInfo,
    src: &[u8],
    src_layout: &PlaneLayout,
    dst: &mut [u8],
    dst_layout: &PlaneLayout,
) -> Result<()> {
    for plane in 0..info.n_planes() {
        let row_bytes = info.format.plane_row_bytes(plane, info.width);
        let rows = info.format.plane_rows(plane, info.height);
        if rows == 0 {
            continue;
        }

        let src_stride = src_layout.strides[plane];
        let dst_stride = dst_layout.strides[plane];
        if src_stride < row_bytes || dst_stride < row_bytes {
            return Err(MemError::invalid_size(format!(
                "plane {} stride smaller than {} row bytes",
                plane, row_bytes
            )));
        }

        let src_end = src_layout.offsets[plane] + src_stride * (rows - 1) + row_bytes;
        let dst_end = dst_layout.offsets[plane] + dst_stride * (rows - 1) + row_bytes;
        if src_end > src.len() || dst_end > dst.len() {
            return Err(MemError::invalid_size(format!(
                "plane {} exceeds buffer (src {} of {}, dst {} of {})",
                plane,
                src_end,
                src.len(),
                dst_end,
                dst.len()
            )));
        }

        for row in 0..rows {
            let s = src_layout.offsets[plane] + row * src_stride;
            let d = dst_layout.offsets[plane] + row * dst_stride;
            dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
        }
    }
    Ok(())
}
