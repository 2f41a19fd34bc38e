//! Physical Buffer Pool
//!
//! A bounded pool of buffers backed by physically contiguous memory. Free
//! buffers belong to the pool; an acquired buffer is held through a
//! [`PoolBuffer`] guard that returns it when dropped.
//!
//! Acquisition blocks while the pool is at its maximum and nothing is free.
//! Deactivating the pool wakes every waiter with [`PoolError::Inactive`].
//!
//! When a [`FramebufferRegistry`] is attached, returning a buffer first runs
//! the registry's release path so framebuffer bookkeeping stays exact.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use imxvpu_mem::{
    FramebufferMeta, MemError, MemoryKind, PhysAddr, PhysMemAllocator, PhysMemMeta, PhysicalMemoryBlock,
    PlaneLayout, VideoMeta,
};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::framebuffers::{FramebufferRegistry, FramebufferSet};

/// Memory block that returns itself to its allocator on drop
#[derive(Debug)]
pub(crate) struct OwnedBlock {
    block: Option<PhysicalMemoryBlock>,
    allocator: PhysMemAllocator,
}

impl Drop for OwnedBlock {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            if let Err(e) = self.allocator.free(block) {
                warn!("Failed to free buffer memory: {}", e);
            }
        }
    }
}

/// What a buffer's bytes live in
#[derive(Debug, Default)]
pub(crate) enum BufferMemory {
    #[default]
    Empty,
    Owned(OwnedBlock),
    /// Zero-copy view of a registered framebuffer
    Framebuffer { set: Arc<FramebufferSet>, index: usize },
}

/// A buffer handed to and from the hardware
#[derive(Debug, Default)]
pub struct PooledBuffer {
    pub(crate) memory: BufferMemory,
    pub(crate) phys_meta: Option<PhysMemMeta>,
    pub(crate) video_meta: Option<VideoMeta>,
    pub(crate) fb_meta: FramebufferMeta,
}

impl PooledBuffer {
    pub fn phys_mem_meta(&self) -> Option<PhysMemMeta> {
        self.phys_meta
    }

    pub fn video_meta(&self) -> Option<VideoMeta> {
        self.video_meta
    }

    pub fn framebuffer_meta(&self) -> FramebufferMeta {
        self.fb_meta
    }

    pub fn phys_addr(&self) -> Option<PhysAddr> {
        self.phys_meta.map(|meta| meta.phys_addr)
    }

    pub fn has_memory(&self) -> bool {
        !matches!(self.memory, BufferMemory::Empty)
    }

    /// CPU view of the buffer contents
    pub fn data(&self) -> &[u8] {
        match &self.memory {
            BufferMemory::Empty => &[],
            BufferMemory::Owned(owned) => owned.block.as_ref().map_or(&[][..], PhysicalMemoryBlock::as_slice),
            BufferMemory::Framebuffer { set, index } => set.data(*index).unwrap_or(&[]),
        }
    }

    /// Writable view; only buffers with their own memory are writable
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.memory {
            BufferMemory::Owned(owned) => owned.block.as_mut().map(PhysicalMemoryBlock::as_mut_slice),
            _ => None,
        }
    }

    pub fn size(&self) -> usize {
        self.data().len()
    }

    /// Drop the backing memory and the physical-memory annotation
    pub(crate) fn clear_memory(&mut self) {
        self.memory = BufferMemory::Empty;
        self.phys_meta = None;
    }
}

struct PoolState {
    free: VecDeque<PooledBuffer>,
    allocated: usize,
    active: bool,
    framebuffers: Option<Arc<FramebufferRegistry>>,
}

struct PoolInner {
    config: PoolConfig,
    allocator: PhysMemAllocator,
    buffer_size: usize,
    layout: PlaneLayout,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl PoolInner {
    fn new_buffer(&self) -> Result<PooledBuffer, PoolError> {
        let mut buffer = PooledBuffer::default();
        if self.config.add_video_meta {
            let info = &self.config.video_info;
            buffer.video_meta = Some(VideoMeta {
                format: info.format,
                width: info.width,
                height: info.height,
                n_planes: info.n_planes(),
                layout: self.layout,
            });
        }
        if self.config.allocate_memory {
            self.fill_memory(&mut buffer)?;
        }
        Ok(buffer)
    }

    fn fill_memory(&self, buffer: &mut PooledBuffer) -> Result<(), PoolError> {
        let block = self
            .allocator
            .allocate(MemoryKind::HardwareVisible, self.buffer_size, self.config.alignment)?;
        let phys_addr = match block.phys_addr() {
            Some(addr) => addr,
            None => {
                let _ = self.allocator.free(block);
                return Err(MemError::backend("pool buffer has no bus address").into());
            }
        };

        buffer.memory = BufferMemory::Owned(OwnedBlock {
            block: Some(block),
            allocator: self.allocator.clone(),
        });
        buffer.phys_meta = Some(PhysMemMeta::new(phys_addr));
        trace!("pool buffer memory at {}", phys_addr);
        Ok(())
    }

    fn release(&self, mut buffer: PooledBuffer) {
        let framebuffers = self.state.lock().framebuffers.clone();
        if let Some(registry) = framebuffers {
            registry.release_buffer(&mut buffer);
        }

        let mut state = self.state.lock();
        if state.active {
            state.free.push_back(buffer);
            self.released.notify_one();
        } else {
            state.allocated = state.allocated.saturating_sub(1);
            drop(state);
            drop(buffer);
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.free.is_empty() {
            debug!("Freeing {} pooled buffers", state.free.len());
        }
    }
}

/// Pool of physically contiguous buffers
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct PhysBufferPool {
    inner: Arc<PoolInner>,
}

impl PhysBufferPool {
    /// Create an inactive pool
    pub fn new(config: PoolConfig, allocator: PhysMemAllocator) -> Result<Self, PoolError> {
        config
            .validate()
            .map_err(|issues| PoolError::InvalidConfig(issues.join("; ")))?;

        let (layout, buffer_size) = match &config.framebuffer_geometry {
            Some(geometry) => (geometry.plane_layout(), geometry.picture_size()),
            None => (config.video_info.layout, config.video_info.size),
        };

        debug!(
            "Creating buffer pool: {} {}x{}, {} bytes per buffer, min {} max {}",
            config.video_info.format,
            config.video_info.width,
            config.video_info.height,
            buffer_size,
            config.min_buffers,
            config.max_buffers
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                allocator,
                buffer_size,
                layout,
                state: Mutex::new(PoolState {
                    free: VecDeque::new(),
                    allocated: 0,
                    active: false,
                    framebuffers: None,
                }),
                released: Condvar::new(),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Bytes of memory behind each buffer
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Activate (preallocating `min_buffers`) or deactivate the pool
    ///
    /// Deactivation frees all idle buffers and wakes blocked acquirers.
    pub fn set_active(&self, active: bool) -> Result<(), PoolError> {
        let mut state = self.inner.state.lock();
        if state.active == active {
            return Ok(());
        }

        if active {
            while state.allocated < self.inner.config.min_buffers {
                let buffer = self.inner.new_buffer()?;
                state.free.push_back(buffer);
                state.allocated += 1;
            }
            state.active = true;
            debug!("Buffer pool activated with {} buffers", state.allocated);
        } else {
            state.active = false;
            let idle: Vec<PooledBuffer> = state.free.drain(..).collect();
            state.allocated -= idle.len();
            self.inner.released.notify_all();
            drop(state);
            debug!("Buffer pool deactivated, freed {} idle buffers", idle.len());
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.lock().active
    }

    /// Take a buffer, blocking while the pool is exhausted
    pub fn acquire(&self) -> Result<PoolBuffer, PoolError> {
        self.acquire_inner(None)
    }

    /// Take a buffer, giving up after `timeout`
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<PoolBuffer, PoolError> {
        self.acquire_inner(Some(timeout))
    }

    fn acquire_inner(&self, timeout: Option<Duration>) -> Result<PoolBuffer, PoolError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let inner = &self.inner;
        let mut state = inner.state.lock();

        loop {
            if !state.active {
                return Err(PoolError::Inactive);
            }

            if let Some(mut buffer) = state.free.pop_front() {
                drop(state);
                if inner.config.allocate_memory && !buffer.has_memory() {
                    if let Err(e) = inner.fill_memory(&mut buffer) {
                        inner.release(buffer);
                        return Err(e);
                    }
                }
                return Ok(self.guard(buffer));
            }

            let max = inner.config.max_buffers;
            if max == 0 || state.allocated < max {
                state.allocated += 1;
                drop(state);
                return match inner.new_buffer() {
                    Ok(buffer) => Ok(self.guard(buffer)),
                    Err(e) => {
                        let mut state = inner.state.lock();
                        state.allocated -= 1;
                        inner.released.notify_one();
                        Err(e)
                    }
                };
            }

            trace!("buffer pool exhausted ({} buffers), waiting", state.allocated);
            match (deadline, timeout) {
                (Some(deadline), Some(timeout)) => {
                    if inner.released.wait_until(&mut state, deadline).timed_out()
                        && state.free.is_empty()
                        && state.active
                    {
                        return Err(PoolError::Timeout(timeout));
                    }
                }
                _ => inner.released.wait(&mut state),
            }
        }
    }

    fn guard(&self, buffer: PooledBuffer) -> PoolBuffer {
        PoolBuffer {
            buffer,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Attach or detach the framebuffer registry consulted on release
    pub fn set_framebuffers(&self, framebuffers: Option<Arc<FramebufferRegistry>>) {
        self.inner.state.lock().framebuffers = framebuffers;
    }

    pub fn framebuffers(&self) -> Option<Arc<FramebufferRegistry>> {
        self.inner.state.lock().framebuffers.clone()
    }

    /// Idle buffers
    pub fn free_count(&self) -> usize {
        self.inner.state.lock().free.len()
    }

    /// Buffers in existence, idle or held
    pub fn allocated_count(&self) -> usize {
        self.inner.state.lock().allocated
    }
}

impl std::fmt::Debug for PhysBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("PhysBufferPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("free", &state.free.len())
            .field("allocated", &state.allocated)
            .field("active", &state.active)
            .finish()
    }
}

/// A buffer on loan from a [`PhysBufferPool`]
///
/// Returned to the pool when dropped.
pub struct PoolBuffer {
    buffer: PooledBuffer,
    pool: Arc<PoolInner>,
}

impl PoolBuffer {
    /// Return the buffer to its pool
    pub fn release(self) {}

    /// The pool this buffer belongs to
    pub fn pool(&self) -> PhysBufferPool {
        PhysBufferPool {
            inner: Arc::clone(&self.pool),
        }
    }
}

impl Deref for PoolBuffer {
    type Target = PooledBuffer;

    fn deref(&self) -> &PooledBuffer {
        &self.buffer
    }
}

impl DerefMut for PoolBuffer {
    fn deref_mut(&mut self) -> &mut PooledBuffer {
        &mut self.buffer
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        self.pool.release(buffer);
    }
}

impl std::fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuffer").field("buffer", &self.buffer).finish_non_exhaustive()
    }
}
