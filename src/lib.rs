//! # imxvpu
//!
//! Physically contiguous memory, buffer pools and encoder sessions for the
//! i.MX VPU.
//!
//! This crate provides a unified interface to the imxvpu libraries:
//!
//! - **[`mem`]** - Block allocator over contiguous memory, plane geometry, buffer metadata
//! - **[`enc`]** - Encoder session state machine, physical buffer pool, framebuffer registry
//!
//! # Features
//!
//! All features are enabled by default. You can selectively enable only what you need:
//!
//! ```toml
//! # Use everything (default)
//! imxvpu = "0.1"
//!
//! # Memory layer only
//! imxvpu = { version = "0.1", default-features = false, features = ["mem"] }
//!
//! # All features including sub-crate features
//! imxvpu = { version = "0.1", features = ["full"] }
//! ```
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `mem` | Yes | Physical memory allocation |
//! | `enc` | Yes | Encoder session and buffer management |
//! | `full` | No | All features from all sub-crates |
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use imxvpu::prelude::*;
//!
//! let capability = HardwareCapabilityHandle::new(std::sync::Arc::new(my_vpu_driver));
//! let (sink, mut frames) = ChannelSink::new();
//! let mut session = EncoderSession::new(
//!     capability,
//!     PhysMemAllocator::system(),
//!     H264Codec::new(),
//!     sink,
//!     EncoderSettings::default(),
//! )?;
//!
//! session.start()?;
//! session.set_format(VideoInfo::new(PixelFormat::Nv12, 1920, 1080).with_framerate(30, 1))?;
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            imxvpu                               │
//! ├────────────────────────────────┬────────────────────────────────┤
//! │           imxvpu-mem           │           imxvpu-enc           │
//! │                                │                                │
//! │  PhysMemAllocator              │  EncoderSession                │
//! │  MemoryBlockLists              │  PhysBufferPool                │
//! │  VideoInfo / PlaneLayout       │  FramebufferRegistry           │
//! └───────────────┬────────────────┴───────────────┬────────────────┘
//!                 │                                │
//!                 ▼                                ▼
//!        Contiguous memory backend         HardwareCodec (VPU)
//! ```
//!
//! # Related Crates
//!
//! You can also use the individual crates directly:
//!
//! - [`imxvpu-mem`](https://crates.io/crates/imxvpu-mem) - Memory layer only
//! - [`imxvpu-enc`](https://crates.io/crates/imxvpu-enc) - Encoder and buffers

#![cfg_attr(docsrs, feature(doc_cfg))]

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// =============================================================================
// RE-EXPORTS
// =============================================================================

/// Physically contiguous memory for the VPU.
///
/// - Aligning block allocator over pluggable backends
/// - Work-memory ownership lists
/// - Raw video plane geometry and frame copies
///
/// See [`imxvpu_mem`] documentation for details.
#[cfg(feature = "mem")]
#[cfg_attr(docsrs, doc(cfg(feature = "mem")))]
pub use imxvpu_mem as mem;

/// Hardware encoder buffer lifecycle.
///
/// - Encoder session state machine
/// - Bounded physical buffer pool
/// - Framebuffer registry with exact counters
///
/// See [`imxvpu_enc`] documentation for details.
#[cfg(feature = "enc")]
#[cfg_attr(docsrs, doc(cfg(feature = "enc")))]
pub use imxvpu_enc as enc;

// =============================================================================
// PRELUDE - Common types for convenience
// =============================================================================

/// Prelude module with commonly used types.
///
/// ```rust
/// use imxvpu::prelude::*;
/// ```
pub mod prelude {
    #[cfg(feature = "mem")]
    pub use imxvpu_mem::{MemError, MemoryKind, PhysAddr, PhysMemAllocator, PixelFormat, VideoInfo};

    #[cfg(feature = "enc")]
    pub use imxvpu_enc::{
        ChannelSink, CodecFrame, EncodedFrame, EncoderError, EncoderSession, EncoderSettings, H264Codec,
        HardwareCapabilityHandle, HardwareCodec, MjpegCodec, PhysBufferPool, PoolConfig, SystemBuffer,
    };
}
