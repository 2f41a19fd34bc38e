//! # imxvpu-mem
//!
//! Physically contiguous memory for the i.MX VPU: an aligning block
//! allocator over pluggable backends, the work-memory ownership lists the
//! encoder tears down in bulk, raw video plane geometry, and the metadata
//! records attached to pooled buffers.
//!
//! This crate is part of the `imxvpu` workspace and is the memory layer
//! under [`imxvpu-enc`](https://docs.rs/imxvpu-enc).
//!
//! # Quick Start
//!
//! ```rust
//! use imxvpu_mem::{MemoryKind, PhysMemAllocator};
//!
//! # fn main() -> imxvpu_mem::Result<()> {
//! let allocator = PhysMemAllocator::system();
//!
//! // 64 KiB the VPU can reach, bus address aligned to 4 KiB
//! let mut block = allocator.allocate(MemoryKind::HardwareVisible, 64 * 1024, 4096)?;
//! block.as_mut_slice().fill(0);
//!
//! allocator.free(block)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Work Memory
//!
//! The encoder asks the hardware for a list of scratch blocks at start.
//! [`MemoryBlockLists`] keeps CPU-only and hardware-visible blocks apart and
//! releases both lists at stop, attempting every block even when some frees
//! fail:
//!
//! ```rust
//! use imxvpu_mem::{MemoryBlockLists, MemoryKind, PhysMemAllocator};
//!
//! # fn main() -> imxvpu_mem::Result<()> {
//! let mut lists = MemoryBlockLists::new(PhysMemAllocator::system());
//! lists.allocate(MemoryKind::CpuVisible, 1024, 8)?;
//! lists.allocate(MemoryKind::HardwareVisible, 16 * 1024, 512)?;
//!
//! lists.free_everything()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Cargo Features
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `system-backend` | Yes | Anonymous-mapping backend |
//! | `full` | No | All features enabled |

// =============================================================================
// CORE MODULES
// =============================================================================

pub mod allocator;
pub mod backend;
pub mod error;
pub mod format;
pub mod meta;

// =============================================================================
// RE-EXPORTS - PRIMARY API
// =============================================================================

// Allocation
pub use allocator::{
    align_up, AllocatorStats, MemoryBlockLists, MemoryKind, PhysAddr, PhysMemAllocator,
    PhysicalMemoryBlock,
};

// Errors
pub use error::{MemError, Result};

// Geometry and metadata
pub use format::{copy_frame, PixelFormat, PlaneLayout, VideoInfo, MAX_PLANES};
pub use meta::{FramebufferHandle, FramebufferMeta, PhysMemMeta, VideoMeta};

// =============================================================================
// RE-EXPORTS - ADVANCED API
// =============================================================================

// Backends
pub use backend::{MemoryBackend, RawAllocation};

#[cfg(feature = "system-backend")]
pub use backend::SystemMemoryBackend;

// =============================================================================
// CRATE-LEVEL ITEMS
// =============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default alignment for hardware-visible buffers handed to the VPU
pub const DEFAULT_PHYS_ALIGNMENT: usize = 16;
