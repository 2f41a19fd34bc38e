//! Memory Backends
//!
//! A backend hands out raw regions: a CPU mapping plus, for hardware-visible
//! memory, the bus address the VPU uses to reach the same bytes. The
//! [`PhysMemAllocator`](crate::PhysMemAllocator) layers alignment and
//! bookkeeping on top of whatever backend it is given.
//!
//! On a real i.MX board the backend wraps the vendor's contiguous memory
//! allocator. [`SystemMemoryBackend`] uses anonymous mappings instead and
//! reports the CPU address as the bus address, which is what an identity
//! mapped IOMMU (or a software encoder) sees.

use std::fmt;
use std::ptr::NonNull;

use crate::allocator::MemoryKind;
use crate::error::Result;
use crate::PhysAddr;

/// A raw region obtained from a [`MemoryBackend`]
///
/// Nothing is released on drop; the region must be returned to the backend
/// that produced it via [`MemoryBackend::free`].
#[derive(Debug)]
pub struct RawAllocation {
    virt: NonNull<u8>,
    phys: Option<PhysAddr>,
    size: usize,
}

// SAFETY: a RawAllocation is the sole record of its region. Access to the
// bytes goes through PhysicalMemoryBlock, which hands out shared or exclusive
// borrows tied to its own borrow state.
unsafe impl Send for RawAllocation {}
// SAFETY: see Send above; &RawAllocation only exposes addresses.
unsafe impl Sync for RawAllocation {}

impl RawAllocation {
    /// Wrap a region produced by a backend
    ///
    /// # Safety
    ///
    /// `virt` must point to `size` bytes that stay valid for reads and
    /// writes until the allocation is handed back to the backend's `free`.
    pub unsafe fn new(virt: NonNull<u8>, phys: Option<PhysAddr>, size: usize) -> Self {
        Self { virt, phys, size }
    }

    /// CPU pointer to the start of the region
    pub fn virt_ptr(&self) -> NonNull<u8> {
        self.virt
    }

    /// CPU address of the start of the region
    pub fn virt_addr(&self) -> usize {
        self.virt.as_ptr() as usize
    }

    /// Bus address of the start of the region (hardware-visible memory only)
    pub fn phys_addr(&self) -> Option<PhysAddr> {
        self.phys
    }

    /// Size of the region in bytes
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Source of raw memory regions
pub trait MemoryBackend: Send + Sync + fmt::Debug {
    /// Short name used in log output
    fn name(&self) -> &'static str;

    /// Obtain a region of exactly `size` bytes
    ///
    /// `HardwareVisible` regions must carry a bus address.
    fn allocate(&self, kind: MemoryKind, size: usize) -> Result<RawAllocation>;

    /// Return a region previously obtained from [`allocate`](Self::allocate)
    fn free(&self, allocation: RawAllocation) -> Result<()>;
}

#[cfg(feature = "system-backend")]
pub use system::SystemMemoryBackend;

#[cfg(feature = "system-backend")]
mod system {
    use std::num::NonZeroUsize;
    use std::os::fd::BorrowedFd;
    use std::ptr::NonNull;

    use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
    use parking_lot::Mutex;
    use tracing::{debug, trace};

    use super::{MemoryBackend, RawAllocation};
    use crate::allocator::MemoryKind;
    use crate::error::{MemError, Result};
    use crate::PhysAddr;

    /// Backend built on anonymous private mappings
    ///
    /// An optional byte limit emulates the fixed size of a contiguous memory
    /// reservation; requests beyond it fail with
    /// [`MemError::OutOfMemory`].
    #[derive(Debug, Default)]
    pub struct SystemMemoryBackend {
        limit: Option<usize>,
        in_use: Mutex<usize>,
    }

    impl SystemMemoryBackend {
        /// Create an unbounded backend
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Create a backend that refuses to hand out more than `limit` bytes in total
        #[must_use]
        pub fn with_limit(limit: usize) -> Self {
            Self {
                limit: Some(limit),
                in_use: Mutex::new(0),
            }
        }

        /// Bytes currently mapped through this backend
        pub fn in_use(&self) -> usize {
            *self.in_use.lock()
        }
    }

    impl MemoryBackend for SystemMemoryBackend {
        fn name(&self) -> &'static str {
            "system"
        }

        fn allocate(&self, kind: MemoryKind, size: usize) -> Result<RawAllocation> {
            let length =
                NonZeroUsize::new(size).ok_or_else(|| MemError::invalid_size("cannot map zero bytes"))?;

            let mut in_use = self.in_use.lock();
            if let Some(limit) = self.limit {
                if in_use.saturating_add(size) > limit {
                    debug!("{} bytes requested, {} of {} in use", size, *in_use, limit);
                    return Err(MemError::OutOfMemory { kind, size });
                }
            }

            // SAFETY: anonymous private mapping at a kernel-chosen address; no
            // existing memory is affected.
            let ptr = unsafe {
                mmap(
                    None,
                    length,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                    None::<BorrowedFd<'static>>,
                    0,
                )
            }
            .map_err(|errno| match errno {
                nix::errno::Errno::ENOMEM => MemError::OutOfMemory { kind, size },
                other => MemError::Mapping(other),
            })?;

            let virt = NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| MemError::backend("mmap returned a null mapping"))?;
            let phys = match kind {
                MemoryKind::HardwareVisible => Some(PhysAddr::new(virt.as_ptr() as u64)),
                MemoryKind::CpuVisible => None,
            };

            *in_use += size;
            trace!("mapped {} bytes of {} memory at {:p}", size, kind, virt);

            // SAFETY: the mapping is `size` bytes long, readable and writable,
            // and stays mapped until free() unmaps it.
            Ok(unsafe { RawAllocation::new(virt, phys, size) })
        }

        fn free(&self, allocation: RawAllocation) -> Result<()> {
            let size = allocation.size();

            // SAFETY: the allocation came from allocate() above, so the pointer
            // and length describe exactly one live mapping.
            unsafe { munmap(allocation.virt_ptr().as_ptr().cast::<libc::c_void>(), size) }?;

            let mut in_use = self.in_use.lock();
            *in_use = in_use.saturating_sub(size);
            trace!("unmapped {} bytes", size);
            Ok(())
        }
    }
}
