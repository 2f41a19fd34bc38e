//! # imxvpu-enc
//!
//! Buffer lifecycle and session control for the i.MX VPU hardware video
//! encoder.
//!
//! This crate is part of the `imxvpu` workspace and builds on
//! [`imxvpu-mem`](https://docs.rs/imxvpu-mem) for physically contiguous
//! memory.
//!
//! # Features
//!
//! - **Encoder Session**: Start, open, encode and stop with exact cleanup on every path
//! - **Physical Buffer Pool**: Bounded, blocking pool of VPU-reachable buffers
//! - **Framebuffer Registry**: Counted hand-off of hardware framebuffers to buffers
//! - **Shared Capability**: Hardware loaded on the first session, unloaded after the last
//! - **Codec Families**: H.264 byte-stream and Motion JPEG behind one trait
//!
//! # Requirements
//!
//! This crate requires:
//! - **Linux** (the system memory backend maps anonymous memory)
//! - **Rust 1.77+**
//! - A [`HardwareCodec`] implementation wrapping the VPU driver
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use imxvpu_enc::{
//!     ChannelSink, CodecFrame, EncoderSession, EncoderSettings, H264Codec,
//!     HardwareCapabilityHandle, SystemBuffer,
//! };
//! use imxvpu_mem::{PhysMemAllocator, PixelFormat, VideoInfo};
//!
//! // One capability handle per process, shared by every session
//! let capability = HardwareCapabilityHandle::new(Arc::new(my_vpu_driver));
//! let (sink, mut frames) = ChannelSink::new();
//!
//! let mut session = EncoderSession::new(
//!     capability,
//!     PhysMemAllocator::system(),
//!     H264Codec::new(),
//!     sink,
//!     EncoderSettings::builder().bitrate_kbps(4000).build(),
//! )?;
//!
//! session.start()?;
//! session.set_format(VideoInfo::new(PixelFormat::I420, 1280, 720).with_framerate(30, 1))?;
//!
//! let picture = vec![0u8; 1280 * 720 * 3 / 2];
//! session.handle_frame(CodecFrame::new(0, SystemBuffer::new(picture)))?;
//!
//! while let Ok(frame) = frames.try_recv() {
//!     println!("frame {}: {:?} bytes", frame.system_frame_number, frame.data.map(|d| d.len()));
//! }
//!
//! session.stop()?;
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐
//! │  CodecFrame        │  system memory or pool buffer
//! └─────────┬──────────┘
//!           │
//!           ▼
//! ┌────────────────────┐
//! │  EncoderSession    │ ◄── Fallback copy into an internal pool buffer
//! │  (state machine)   │     Lazy framebuffer + output allocation
//! └─────────┬──────────┘
//!           │
//!           ▼
//! ┌────────────────────┐
//! │  HardwareCodec     │ ◄── open / configure / encode_frame / close
//! │  (opaque VPU)      │
//! └─────────┬──────────┘
//!           │
//!           ▼
//! ┌────────────────────┐
//! │  FrameSink         │ ◄── EncodedFrame (data or dropped)
//! └────────────────────┘
//! ```
//!
//! # Error Handling
//!
//! Every fallible call returns [`EncoderError`]. [`EncoderError::kind`]
//! folds it into an [`ErrorKind`]: resource exhaustion, hardware rejection,
//! precondition violation, invalid configuration or downstream refusal.
//!
//! # Cargo Features
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `h264` | Yes | H.264 byte-stream codec family |
//! | `mjpeg` | Yes | Motion JPEG codec family |
//! | `full` | No | All features enabled |

// =============================================================================
// CORE MODULES
// =============================================================================

pub mod capability;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod framebuffers;
pub mod hardware;
pub mod pool;
pub mod session;

#[cfg(test)]
mod testing;

// =============================================================================
// RE-EXPORTS - PRIMARY API
// =============================================================================

// Session
pub use session::{EncoderSession, OutputState, SessionState, SessionStats};

// Configuration
pub use config::{EncoderSettings, EncoderSettingsBuilder, PoolConfig, PoolConfigBuilder, SliceMode};

// Errors
pub use error::{EncoderError, ErrorKind, PoolError, Result};

// Frames
pub use frame::{ChannelSink, CodecFrame, EncodedFrame, FrameOutcome, FrameSink, SystemBuffer, VideoBuffer};

// Buffers
pub use framebuffers::{FramebufferGeometry, FramebufferRegistry, FramebufferSet, RegistrationState, RegistryCounters};
pub use pool::{PhysBufferPool, PoolBuffer, PooledBuffer};

// Codecs
pub use codec::{CodecFamily, EncoderCodec, OutputCaps};

#[cfg(feature = "h264")]
pub use codec::H264Codec;

#[cfg(feature = "mjpeg")]
pub use codec::MjpegCodec;

// =============================================================================
// RE-EXPORTS - ADVANCED API
// =============================================================================

// Hardware capability contract
pub use capability::HardwareCapabilityHandle;
pub use hardware::{
    pack_frame_rate, BlockDescriptor, ConfigKey, EncodeOutcome, EncodeParams, EncodeStatus, FramebufferDesc,
    HardwareCodec, HwError, HwHandle, HwResult, InitInfo, InputPicture, OpenParams, RetCode, VersionInfo,
    WorkMemoryBlock,
};

// Codec hooks
pub use codec::{FrameParamsHook, OutputFiller};

// Status flag sets
pub use enumflags2::BitFlags;

// =============================================================================
// CRATE-LEVEL ITEMS
// =============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
