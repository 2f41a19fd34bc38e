//! Encoder and Pool Configuration
//!
//! Provides the encoder's recognized options and the physical buffer pool
//! configuration, each with a builder for ergonomic construction.
//!
//! # Examples
//!
//! ```rust
//! use imxvpu_enc::EncoderSettings;
//!
//! // Using builder pattern
//! let settings = EncoderSettings::builder()
//!     .gop_size(30)
//!     .bitrate_kbps(4000)
//!     .slice_size(-40)
//!     .build();
//!
//! // Using struct literal with defaults
//! let settings = EncoderSettings {
//!     intra_refresh: 8,
//!     ..Default::default()
//! };
//! ```

use imxvpu_mem::{VideoInfo, DEFAULT_PHYS_ALIGNMENT};

use crate::framebuffers::FramebufferGeometry;

/// Largest accepted GOP size
pub const MAX_GOP_SIZE: u32 = 32767;

/// How pictures are split into slices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceMode {
    /// One slice per picture
    Unlimited,
    /// New slice after this many bits
    Bits(u32),
    /// New slice after this many macroblocks
    Macroblocks(u32),
}

/// Encoder options
///
/// Use [`EncoderSettings::builder()`] or struct literal syntax with
/// [`Default::default()`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    /// Pictures between intra frames (default: 16, range 0..=32767)
    pub gop_size: u32,

    /// Target bitrate in kbps (default: 0)
    ///
    /// 0 selects constant-quality mode. Can be changed while encoding.
    pub bitrate_kbps: u32,

    /// Slice size (default: 0 = one slice per picture)
    ///
    /// Negative values count macroblocks, positive values count bits.
    pub slice_size: i32,

    /// Minimum number of macroblocks refreshed per frame (default: 0 = disabled)
    pub intra_refresh: u32,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            gop_size: 16,
            bitrate_kbps: 0,
            slice_size: 0,
            intra_refresh: 0,
        }
    }
}

impl EncoderSettings {
    /// Create a new builder
    pub fn builder() -> EncoderSettingsBuilder {
        EncoderSettingsBuilder::default()
    }

    /// Slice mode derived from the sign of `slice_size`
    pub fn slice_mode(&self) -> SliceMode {
        match self.slice_size {
            0 => SliceMode::Unlimited,
            n if n < 0 => SliceMode::Macroblocks(n.unsigned_abs()),
            n => SliceMode::Bits(n.unsigned_abs()),
        }
    }

    /// Validate the settings
    ///
    /// Returns every problem found rather than stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.gop_size > MAX_GOP_SIZE {
            issues.push(format!("gop_size must not exceed {}", MAX_GOP_SIZE));
        }

        if self.slice_size == i32::MIN {
            issues.push("slice_size magnitude out of range".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

/// Builder for [`EncoderSettings`]
#[derive(Debug, Clone, Default)]
pub struct EncoderSettingsBuilder {
    gop_size: Option<u32>,
    bitrate_kbps: Option<u32>,
    slice_size: Option<i32>,
    intra_refresh: Option<u32>,
}

impl EncoderSettingsBuilder {
    /// Set the GOP size
    pub fn gop_size(mut self, gop_size: u32) -> Self {
        self.gop_size = Some(gop_size);
        self
    }

    /// Set the target bitrate in kbps
    pub fn bitrate_kbps(mut self, kbps: u32) -> Self {
        self.bitrate_kbps = Some(kbps);
        self
    }

    /// Set the signed slice size
    pub fn slice_size(mut self, slice_size: i32) -> Self {
        self.slice_size = Some(slice_size);
        self
    }

    /// Set the intra refresh macroblock count
    pub fn intra_refresh(mut self, mbs: u32) -> Self {
        self.intra_refresh = Some(mbs);
        self
    }

    /// Build the settings
    pub fn build(self) -> EncoderSettings {
        let defaults = EncoderSettings::default();
        EncoderSettings {
            gop_size: self.gop_size.unwrap_or(defaults.gop_size),
            bitrate_kbps: self.bitrate_kbps.unwrap_or(defaults.bitrate_kbps),
            slice_size: self.slice_size.unwrap_or(defaults.slice_size),
            intra_refresh: self.intra_refresh.unwrap_or(defaults.intra_refresh),
        }
    }
}

/// Physical buffer pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Format of the buffers
    pub video_info: VideoInfo,

    /// Buffers allocated when the pool is activated
    pub min_buffers: usize,

    /// Upper bound on buffers in existence (0 = unbounded)
    pub max_buffers: usize,

    /// Alignment of each buffer's bus address
    pub alignment: usize,

    /// Whether buffers get their own memory (default: true)
    ///
    /// Pools whose buffers are filled by framebuffer attachment set this to
    /// false; their buffers start out empty.
    pub allocate_memory: bool,

    /// Attach a [`VideoMeta`](imxvpu_mem::VideoMeta) to every buffer (default: true)
    pub add_video_meta: bool,

    /// Take plane strides/offsets/size from hardware framebuffer geometry
    pub framebuffer_geometry: Option<FramebufferGeometry>,
}

impl PoolConfig {
    /// Configuration with defaults for `video_info`
    pub fn new(video_info: VideoInfo) -> Self {
        Self {
            video_info,
            min_buffers: 0,
            max_buffers: 0,
            alignment: DEFAULT_PHYS_ALIGNMENT,
            allocate_memory: true,
            add_video_meta: true,
            framebuffer_geometry: None,
        }
    }

    /// Create a new builder
    pub fn builder(video_info: VideoInfo) -> PoolConfigBuilder {
        PoolConfigBuilder {
            video_info,
            ..PoolConfigBuilder::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.max_buffers != 0 && self.min_buffers > self.max_buffers {
            issues.push(format!(
                "min_buffers ({}) exceeds max_buffers ({})",
                self.min_buffers, self.max_buffers
            ));
        }

        if self.video_info.width == 0 || self.video_info.height == 0 {
            issues.push("video dimensions must be non-zero".to_string());
        }

        if self.allocate_memory && self.video_info.size == 0 && self.framebuffer_geometry.is_none() {
            issues.push("buffer size must be non-zero".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

/// Builder for [`PoolConfig`]
#[derive(Debug, Clone)]
pub struct PoolConfigBuilder {
    video_info: VideoInfo,
    min_buffers: Option<usize>,
    max_buffers: Option<usize>,
    alignment: Option<usize>,
    allocate_memory: Option<bool>,
    add_video_meta: Option<bool>,
    framebuffer_geometry: Option<FramebufferGeometry>,
}

impl Default for PoolConfigBuilder {
    fn default() -> Self {
        Self {
            video_info: VideoInfo::new(imxvpu_mem::PixelFormat::I420, 0, 0),
            min_buffers: None,
            max_buffers: None,
            alignment: None,
            allocate_memory: None,
            add_video_meta: None,
            framebuffer_geometry: None,
        }
    }
}

impl PoolConfigBuilder {
    /// Set the minimum (preallocated) buffer count
    pub fn min_buffers(mut self, count: usize) -> Self {
        self.min_buffers = Some(count);
        self
    }

    /// Set the maximum buffer count (0 = unbounded)
    pub fn max_buffers(mut self, count: usize) -> Self {
        self.max_buffers = Some(count);
        self
    }

    /// Set the bus address alignment
    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = Some(alignment);
        self
    }

    /// Choose whether buffers get their own memory
    pub fn allocate_memory(mut self, enabled: bool) -> Self {
        self.allocate_memory = Some(enabled);
        self
    }

    /// Choose whether buffers carry video meta
    pub fn add_video_meta(mut self, enabled: bool) -> Self {
        self.add_video_meta = Some(enabled);
        self
    }

    /// Override plane geometry with hardware framebuffer geometry
    pub fn framebuffer_geometry(mut self, geometry: FramebufferGeometry) -> Self {
        self.framebuffer_geometry = Some(geometry);
        self
    }

    /// Build the configuration
    pub fn build(self) -> PoolConfig {
        let defaults = PoolConfig::new(self.video_info);
        PoolConfig {
            min_buffers: self.min_buffers.unwrap_or(defaults.min_buffers),
            max_buffers: self.max_buffers.unwrap_or(defaults.max_buffers),
            alignment: self.alignment.unwrap_or(defaults.alignment),
            allocate_memory: self.allocate_memory.unwrap_or(defaults.allocate_memory),
            add_video_meta: self.add_video_meta.unwrap_or(defaults.add_video_meta),
            framebuffer_geometry: self.framebuffer_geometry.or(defaults.framebuffer_geometry),
            video_info: defaults.video_info,
        }
    }
}
