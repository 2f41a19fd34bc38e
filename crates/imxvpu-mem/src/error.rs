//! Error types for physical memory operations
//!
//! Provides typed errors that callers can match on, mostly to tell an
//! exhausted contiguous-memory region apart from a programming error.

use thiserror::Error;

use crate::allocator::MemoryKind;

/// Errors that can occur while allocating, freeing or copying into
/// physical memory blocks
///
/// # Examples
///
/// ```no_run
/// # use imxvpu_mem::{MemError, MemoryKind, PhysMemAllocator};
/// # fn example(allocator: &PhysMemAllocator) {
/// match allocator.allocate(MemoryKind::HardwareVisible, 4 * 1024 * 1024, 4096) {
///     Ok(block) => println!("block at {}", block.phys_addr().unwrap_or_default()),
///     Err(MemError::OutOfMemory { size, .. }) => eprintln!("no room for {} bytes", size),
///     Err(e) => eprintln!("allocation failed: {}", e),
/// }
/// # }
/// ```
#[derive(Error, Debug)]
pub enum MemError {
    /// The backend could not provide a region of the requested size
    ///
    /// For hardware-visible memory this usually means the contiguous
    /// memory area (CMA) reserved for the VPU is exhausted.
    #[error("Out of memory: could not allocate {size} bytes of {kind} memory")]
    OutOfMemory {
        /// Kind of memory that was requested
        kind: MemoryKind,
        /// Number of bytes requested from the backend (alignment slack included)
        size: usize,
    },

    /// Alignment value cannot be honored
    #[error("Invalid alignment: {0}")]
    InvalidAlignment(usize),

    /// Size is zero, overflows, or does not fit the destination
    #[error("Invalid size: {0}")]
    InvalidSize(String),

    /// The memory backend reported a failure that is not an exhaustion
    #[error("Memory backend failure: {0}")]
    Backend(String),

    /// Mapping or unmapping a region failed
    #[error("Mapping operation failed: {0}")]
    Mapping(#[from] nix::Error),

    /// Bulk teardown completed but some blocks could not be released
    #[error("Failed to free {failed} of {total} memory blocks")]
    FreeFailed {
        /// Number of blocks whose release failed
        failed: usize,
        /// Number of blocks the teardown attempted to release
        total: usize,
    },
}

/// Result type for memory operations
pub type Result<T> = std::result::Result<T, MemError>;

impl MemError {
    /// Create an invalid size error
    pub(crate) fn invalid_size(msg: impl Into<String>) -> Self {
        Self::InvalidSize(msg.into())
    }

    /// Create a backend error
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Whether the error is an exhaustion of the backing memory
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}
