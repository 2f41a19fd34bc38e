//! Physical Memory Block Allocator
//!
//! Hands out aligned [`PhysicalMemoryBlock`]s on top of a [`MemoryBackend`]
//! and keeps the per-kind ownership lists the encoder uses for its work
//! memory.
//!
//! # Alignment
//!
//! The backend is asked for `size + alignment - 1` bytes, so an aligned
//! start with `size` usable bytes always exists inside the raw region. For
//! hardware-visible blocks the bus address is what the VPU cares about: it
//! is aligned, and the CPU address is shifted by the same offset so both
//! views keep describing the same bytes.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::backend::{MemoryBackend, RawAllocation};
use crate::error::{MemError, Result};

/// Where a block must be reachable from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// CPU-visible only; no bus address
    CpuVisible,
    /// Physically contiguous and reachable by the VPU
    HardwareVisible,
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CpuVisible => write!(f, "cpu-visible"),
            Self::HardwareVisible => write!(f, "hardware-visible"),
        }
    }
}

/// Bus address of a hardware-visible region
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Wrap a raw bus address
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Raw address value
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Null bus addresses never name a valid block
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Round `value` up to the next multiple of `alignment`
///
/// An alignment of 0 or 1 leaves the value unchanged. Non power-of-two
/// alignments are honored too.
pub fn align_up(value: u64, alignment: usize) -> u64 {
    if alignment <= 1 {
        return value;
    }
    let alignment = alignment as u64;
    value.div_ceil(alignment) * alignment
}

/// An aligned, contiguous region owned by whoever holds it
///
/// Returned by [`PhysMemAllocator::allocate`] and released through
/// [`PhysMemAllocator::free`]. Dropping a block without freeing it leaks the
/// underlying region.
#[derive(Debug)]
pub struct PhysicalMemoryBlock {
    raw: RawAllocation,
    kind: MemoryKind,
    offset: usize,
    size: usize,
    alignment: usize,
}

impl PhysicalMemoryBlock {
    /// CPU address of the aligned start
    pub fn virt_addr(&self) -> usize {
        self.raw.virt_addr() + self.offset
    }

    /// Bus address of the aligned start, for hardware-visible blocks
    pub fn phys_addr(&self) -> Option<PhysAddr> {
        self.raw.phys_addr().map(|phys| phys.offset(self.offset))
    }

    /// Usable size (the size originally requested)
    pub fn size(&self) -> usize {
        self.size
    }

    /// Alignment the block was allocated with
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Kind of memory backing this block
    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    /// Bytes obtained from the backend, alignment slack included
    pub fn raw_size(&self) -> usize {
        self.raw.size()
    }

    /// View of the usable bytes
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: offset + size <= raw size by construction in allocate(), and
        // the raw region stays valid until the block is consumed by free().
        unsafe { std::slice::from_raw_parts(self.raw.virt_ptr().as_ptr().add(self.offset), self.size) }
    }

    /// Mutable view of the usable bytes
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as in as_slice; &mut self guarantees exclusive access.
        unsafe {
            std::slice::from_raw_parts_mut(self.raw.virt_ptr().as_ptr().add(self.offset), self.size)
        }
    }
}

/// Allocator counters
#[derive(Debug, Clone, Default)]
pub struct AllocatorStats {
    /// Blocks currently allocated
    pub live_blocks: usize,
    /// Raw bytes currently allocated
    pub live_bytes: usize,
    /// Successful allocations since creation
    pub total_allocations: u64,
    /// Allocations refused by the backend
    pub failed_allocations: u64,
    /// Frees the backend reported as failed
    pub failed_frees: u64,
}

/// Aligning allocator over a shared [`MemoryBackend`]
///
/// Cheap to clone; clones share the backend and the counters.
#[derive(Debug, Clone)]
pub struct PhysMemAllocator {
    backend: Arc<dyn MemoryBackend>,
    stats: Arc<Mutex<AllocatorStats>>,
}

impl PhysMemAllocator {
    /// Create an allocator over `backend`
    pub fn new(backend: Arc<dyn MemoryBackend>) -> Self {
        debug!("Creating physical memory allocator over {} backend", backend.name());
        Self {
            backend,
            stats: Arc::new(Mutex::new(AllocatorStats::default())),
        }
    }

    /// Allocator backed by anonymous system mappings
    #[cfg(feature = "system-backend")]
    pub fn system() -> Self {
        Self::new(Arc::new(crate::backend::SystemMemoryBackend::new()))
    }

    /// Name of the backend in use
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Allocate `size` usable bytes aligned to `alignment`
    ///
    /// For `HardwareVisible` memory the bus address is aligned; for
    /// `CpuVisible` memory the CPU address is.
    pub fn allocate(&self, kind: MemoryKind, size: usize, alignment: usize) -> Result<PhysicalMemoryBlock> {
        if size == 0 {
            return Err(MemError::invalid_size("cannot allocate a zero-sized block"));
        }
        let alignment = alignment.max(1);
        let raw_size = size
            .checked_add(alignment - 1)
            .ok_or_else(|| MemError::invalid_size(format!("{} + alignment {} overflows", size, alignment)))?;

        let raw = match self.backend.allocate(kind, raw_size) {
            Ok(raw) => raw,
            Err(e) => {
                self.stats.lock().failed_allocations += 1;
                return Err(e);
            }
        };

        let base = match (kind, raw.phys_addr()) {
            (MemoryKind::HardwareVisible, Some(phys)) => phys.as_u64(),
            (MemoryKind::HardwareVisible, None) => {
                let _ = self.backend.free(raw);
                return Err(MemError::backend("hardware-visible allocation has no bus address"));
            }
            (MemoryKind::CpuVisible, _) => raw.virt_addr() as u64,
        };
        let offset = (align_up(base, alignment) - base) as usize;

        {
            let mut stats = self.stats.lock();
            stats.live_blocks += 1;
            stats.live_bytes += raw_size;
            stats.total_allocations += 1;
        }

        let block = PhysicalMemoryBlock {
            raw,
            kind,
            offset,
            size,
            alignment,
        };
        trace!(
            "allocated {} block: {} bytes, alignment {}, virt {:#x}, phys {:?}",
            kind,
            size,
            alignment,
            block.virt_addr(),
            block.phys_addr()
        );
        Ok(block)
    }

    /// Return a block to the backend
    pub fn free(&self, block: PhysicalMemoryBlock) -> Result<()> {
        let raw_size = block.raw.size();
        let result = self.backend.free(block.raw);

        let mut stats = self.stats.lock();
        stats.live_blocks = stats.live_blocks.saturating_sub(1);
        stats.live_bytes = stats.live_bytes.saturating_sub(raw_size);
        if result.is_err() {
            stats.failed_frees += 1;
        }
        result
    }

    /// Snapshot of the allocator counters
    pub fn stats(&self) -> AllocatorStats {
        self.stats.lock().clone()
    }
}

/// Work-memory ownership lists
///
/// CPU-visible blocks land in the virtual-only list, hardware-visible blocks
/// in the physical list. Blocks are only released by bulk teardown.
#[derive(Debug)]
pub struct MemoryBlockLists {
    allocator: PhysMemAllocator,
    virt_blocks: Vec<PhysicalMemoryBlock>,
    phys_blocks: Vec<PhysicalMemoryBlock>,
}

impl MemoryBlockLists {
    /// Create empty lists that allocate through `allocator`
    pub fn new(allocator: PhysMemAllocator) -> Self {
        Self {
            allocator,
            virt_blocks: Vec::new(),
            phys_blocks: Vec::new(),
        }
    }

    /// Allocate a block and append it to the list for its kind
    pub fn allocate(&mut self, kind: MemoryKind, size: usize, alignment: usize) -> Result<&PhysicalMemoryBlock> {
        let block = self.allocator.allocate(kind, size, alignment)?;
        let list = self.list_mut(kind);
        list.push(block);
        list.last()
            .ok_or_else(|| MemError::backend("block list empty after push"))
    }

    /// Blocks currently owned for `kind`
    pub fn blocks(&self, kind: MemoryKind) -> &[PhysicalMemoryBlock] {
        match kind {
            MemoryKind::CpuVisible => &self.virt_blocks,
            MemoryKind::HardwareVisible => &self.phys_blocks,
        }
    }

    /// Number of blocks owned for `kind`
    pub fn len(&self, kind: MemoryKind) -> usize {
        self.blocks(kind).len()
    }

    /// Whether both lists are empty
    pub fn is_empty(&self) -> bool {
        self.virt_blocks.is_empty() && self.phys_blocks.is_empty()
    }

    /// Release every block of `kind`
    ///
    /// Keeps going after a failed free; the list ends up empty either way.
    pub fn free_all(&mut self, kind: MemoryKind) -> Result<()> {
        let blocks = std::mem::take(self.list_mut(kind));
        let total = blocks.len();
        let mut failed = 0;

        for block in blocks {
            if let Err(e) = self.allocator.free(block) {
                warn!("Failed to free {} work memory block: {}", kind, e);
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(MemError::FreeFailed { failed, total });
        }
        if total > 0 {
            debug!("Freed {} {} work memory blocks", total, kind);
        }
        Ok(())
    }

    /// Release both lists
    ///
    /// Both lists are processed even if the first reports failures; the
    /// result is `Ok` only if every individual free succeeded.
    pub fn free_everything(&mut self) -> Result<()> {
        let virt_total = self.virt_blocks.len();
        let phys_total = self.phys_blocks.len();
        let virt = self.free_all(MemoryKind::CpuVisible);
        let phys = self.free_all(MemoryKind::HardwareVisible);

        let failed = [virt, phys]
            .into_iter()
            .map(|r| match r {
                Err(MemError::FreeFailed { failed, .. }) => failed,
                _ => 0,
            })
            .sum::<usize>();

        if failed > 0 {
            Err(MemError::FreeFailed {
                failed,
                total: virt_total + phys_total,
            })
        } else {
            Ok(())
        }
    }

    fn list_mut(&mut self, kind: MemoryKind) -> &mut Vec<PhysicalMemoryBlock> {
        match kind {
            MemoryKind::CpuVisible => &mut self.virt_blocks,
            MemoryKind::HardwareVisible => &mut self.phys_blocks,
        }
    }
}

impl Drop for MemoryBlockLists {
    fn drop(&mut self) {
        if !self.is_empty() {
            warn!(
                "Dropping {} work memory blocks that were never freed",
                self.virt_blocks.len() + self.phys_blocks.len()
            );
            let _ = self.free_everything();
        }
    }
}
