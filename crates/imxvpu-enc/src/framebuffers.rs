//! Framebuffer Registry
//!
//! The VPU works on a fixed set of framebuffers that must be allocated and
//! registered right after the hardware instance is opened. Buffers handed to
//! the rest of the pipeline may wrap one of those framebuffers; the registry
//! keeps count of who holds what so a producer knows when it may proceed.
//!
//! # Counters
//!
//! - `available`: framebuffers the hardware may use right now
//! - `in_buffers`: framebuffers currently wrapped by a [`PooledBuffer`]
//! - `decremented`: how often `available` was decremented and not yet
//!   given back
//!
//! Framebuffers the hardware took but that are not yet inside a buffer are
//! "in flight": `decremented - in_buffers`. Under the registry lock
//! `available + in_buffers + in_flight == total` always holds.
//!
//! The registry is shared through an `Arc`. Pools that still hold wrapped
//! buffers keep it, and the framebuffer memory, alive after the session has
//! moved on to a new set.

use std::sync::Arc;

use imxvpu_mem::{
    align_up, FramebufferHandle, MemoryKind, PhysAddr, PhysMemAllocator, PhysMemMeta, PhysicalMemoryBlock,
    PlaneLayout, VideoMeta,
};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::error::{EncoderError, Result};
use crate::hardware::{FramebufferDesc, HardwareCodec, HwHandle, InitInfo};
use crate::pool::{BufferMemory, PooledBuffer};

/// Plane geometry of every framebuffer in a set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferGeometry {
    pub pic_width: usize,
    pub pic_height: usize,
    pub y_stride: usize,
    pub uv_stride: usize,
    pub y_size: usize,
    pub u_size: usize,
    pub v_size: usize,
    pub mv_size: usize,
    pub total_size: usize,
    /// Number of framebuffers in the set
    pub count: usize,
    /// Bus address alignment of each framebuffer
    pub alignment: usize,
}

impl FramebufferGeometry {
    /// Geometry for `count` framebuffers holding a `pic_width` x `pic_height` picture
    pub fn new(pic_width: usize, pic_height: usize, count: usize, alignment: usize) -> Self {
        let y_stride = align_up(pic_width as u64, 16) as usize;
        let aligned_height = align_up(pic_height as u64, 16) as usize;
        let y_size = y_stride * aligned_height;
        let u_size = y_size / 4;

        Self {
            pic_width,
            pic_height,
            y_stride,
            uv_stride: y_stride / 2,
            y_size,
            u_size,
            v_size: u_size,
            mv_size: u_size,
            total_size: y_size + 3 * u_size,
            count,
            alignment: alignment.max(1),
        }
    }

    /// Geometry from the hardware's initial info
    pub fn from_init_info(info: &InitInfo, pic_width: usize, pic_height: usize) -> Self {
        Self::new(pic_width, pic_height, info.min_framebuffer_count, info.address_alignment)
    }

    /// Plane offsets and strides of the picture part of a framebuffer
    pub fn plane_layout(&self) -> PlaneLayout {
        PlaneLayout {
            offsets: [0, self.y_size, self.y_size + self.u_size],
            strides: [self.y_stride, self.uv_stride, self.uv_stride],
        }
    }

    /// Bytes of the picture part (without the motion vector plane)
    pub fn picture_size(&self) -> usize {
        self.y_size + self.u_size + self.v_size
    }
}

/// Framebuffer memory, freed when the last holder lets go
#[derive(Debug)]
pub struct FramebufferSet {
    geometry: FramebufferGeometry,
    blocks: Vec<PhysicalMemoryBlock>,
    allocator: PhysMemAllocator,
}

impl FramebufferSet {
    /// Allocate `geometry.count` hardware-visible framebuffers
    pub fn allocate(geometry: FramebufferGeometry, allocator: PhysMemAllocator) -> Result<Self> {
        let mut set = Self {
            geometry,
            blocks: Vec::with_capacity(geometry.count),
            allocator,
        };

        for _ in 0..geometry.count {
            // a partially filled set frees its blocks on drop
            let block = set
                .allocator
                .allocate(MemoryKind::HardwareVisible, geometry.total_size, geometry.alignment)
                .map_err(|e| EncoderError::resource_exhausted("framebuffer", e))?;
            set.blocks.push(block);
        }

        debug!(
            "Allocated {} framebuffers of {} bytes ({}x{}, Y stride {})",
            geometry.count, geometry.total_size, geometry.pic_width, geometry.pic_height, geometry.y_stride
        );
        Ok(set)
    }

    pub fn geometry(&self) -> &FramebufferGeometry {
        &self.geometry
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Bus address of the luma plane of framebuffer `index`
    pub fn phys_addr(&self, index: usize) -> Option<PhysAddr> {
        self.blocks.get(index).and_then(PhysicalMemoryBlock::phys_addr)
    }

    /// CPU view of framebuffer `index`
    pub fn data(&self, index: usize) -> Option<&[u8]> {
        self.blocks.get(index).map(PhysicalMemoryBlock::as_slice)
    }

    /// Descriptors handed to the hardware at registration
    pub fn descriptors(&self) -> Vec<FramebufferDesc> {
        let g = &self.geometry;
        self.blocks
            .iter()
            .enumerate()
            .map(|(index, block)| {
                let y = block.phys_addr().unwrap_or_default();
                FramebufferDesc {
                    handle: FramebufferHandle(index as u32),
                    y,
                    cb: y.offset(g.y_size),
                    cr: y.offset(g.y_size + g.u_size),
                    mv: y.offset(g.y_size + g.u_size + g.v_size),
                    y_stride: g.y_stride,
                    uv_stride: g.uv_stride,
                }
            })
            .collect()
    }
}

impl Drop for FramebufferSet {
    fn drop(&mut self) {
        let count = self.blocks.len();
        for block in self.blocks.drain(..) {
            if let Err(e) = self.allocator.free(block) {
                warn!("Failed to free framebuffer memory: {}", e);
            }
        }
        if count > 0 {
            debug!("Freed {} framebuffers", count);
        }
    }
}

/// Registration state of a framebuffer set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    /// Framebuffers receive decoded pictures
    DecoderTarget(HwHandle),
    /// Framebuffers hold encoder reference pictures
    EncoderTarget(HwHandle),
    TornDown,
}

/// Snapshot of the registry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounters {
    pub total: usize,
    pub available: usize,
    pub in_buffers: usize,
    pub decremented: usize,
}

impl RegistryCounters {
    /// Framebuffers taken by the hardware but not yet wrapped by a buffer
    pub fn in_flight(&self) -> usize {
        self.decremented.saturating_sub(self.in_buffers)
    }
}

#[derive(Debug)]
struct RegistryState {
    registration: RegistrationState,
    hardware_open: bool,
    available: usize,
    in_buffers: usize,
    decremented: usize,
    flushing: bool,
}

/// Shared bookkeeping for one framebuffer set
pub struct FramebufferRegistry {
    hardware: Arc<dyn HardwareCodec>,
    set: Arc<FramebufferSet>,
    state: Mutex<RegistryState>,
    available_cond: Condvar,
}

impl FramebufferRegistry {
    /// Allocate a framebuffer set sized from the hardware's initial info
    pub fn new(
        hardware: Arc<dyn HardwareCodec>,
        allocator: PhysMemAllocator,
        init_info: &InitInfo,
        pic_width: usize,
        pic_height: usize,
    ) -> Result<Self> {
        let geometry = FramebufferGeometry::from_init_info(init_info, pic_width, pic_height);
        let set = FramebufferSet::allocate(geometry, allocator)?;
        let total = set.len();

        Ok(Self {
            hardware,
            set: Arc::new(set),
            state: Mutex::new(RegistryState {
                registration: RegistrationState::Unregistered,
                hardware_open: false,
                available: total,
                in_buffers: 0,
                decremented: 0,
                flushing: false,
            }),
            available_cond: Condvar::new(),
        })
    }

    pub fn geometry(&self) -> &FramebufferGeometry {
        self.set.geometry()
    }

    pub fn framebuffers(&self) -> &Arc<FramebufferSet> {
        &self.set
    }

    pub fn registration(&self) -> RegistrationState {
        self.state.lock().registration
    }

    /// Register the set as encoder reference pictures
    pub fn register_with_encoder(&self, handle: HwHandle, src_stride: usize) -> Result<()> {
        self.register(RegistrationState::EncoderTarget(handle), handle, src_stride)
    }

    /// Register the set as decoder output
    pub fn register_with_decoder(&self, handle: HwHandle) -> Result<()> {
        let stride = self.geometry().y_stride;
        self.register(RegistrationState::DecoderTarget(handle), handle, stride)
    }

    fn register(&self, target: RegistrationState, handle: HwHandle, src_stride: usize) -> Result<()> {
        let mut state = self.state.lock();

        if matches!(
            state.registration,
            RegistrationState::DecoderTarget(_) | RegistrationState::EncoderTarget(_)
        ) {
            error!("Framebuffers are already registered");
            return Err(EncoderError::AlreadyRegistered);
        }

        self.hardware
            .register_framebuffers(handle, &self.set.descriptors(), src_stride)
            .map_err(|e| {
                error!("Registering framebuffers failed: {}", e);
                EncoderError::FramebufferRegistration(e)
            })?;

        state.registration = target;
        state.hardware_open = true;
        state.flushing = false;
        info!("Registered {} framebuffers ({:?})", self.set.len(), target);
        Ok(())
    }

    /// Wrap framebuffer `handle` in `buffer`
    ///
    /// Any memory the buffer had before is dropped first. Padding is the
    /// difference between the framebuffer picture size and the logical size.
    pub fn attach_framebuffer(
        &self,
        buffer: &mut PooledBuffer,
        handle: FramebufferHandle,
        logical_width: usize,
        logical_height: usize,
    ) -> Result<()> {
        let index = handle.index();
        let phys_addr = self
            .set
            .phys_addr(index)
            .ok_or_else(|| EncoderError::invalid_state(format!("framebuffer {} out of range", index)))?;

        {
            let mut state = self.state.lock();
            // the hardware did not report this one as consumed
            if state.decremented <= state.in_buffers {
                if state.available == 0 {
                    return Err(EncoderError::NoFramebufferAvailable);
                }
                state.available -= 1;
                state.decremented += 1;
            }
            state.in_buffers += 1;
            trace!(
                "attach framebuffer {}: available {} in_buffers {} decremented {}",
                index,
                state.available,
                state.in_buffers,
                state.decremented
            );
        }

        let geometry = *self.geometry();
        buffer.clear_memory();
        buffer.memory = BufferMemory::Framebuffer {
            set: Arc::clone(&self.set),
            index,
        };
        buffer.phys_meta = Some(PhysMemMeta {
            phys_addr,
            x_padding: geometry.pic_width.saturating_sub(logical_width),
            y_padding: geometry.pic_height.saturating_sub(logical_height),
        });
        if let Some(meta) = buffer.video_meta.as_mut() {
            *meta = VideoMeta {
                width: logical_width,
                height: logical_height,
                layout: geometry.plane_layout(),
                ..*meta
            };
        }
        buffer.fb_meta.framebuffer = Some(handle);
        buffer.fb_meta.not_displayed_yet = false;
        Ok(())
    }

    /// Flag the buffer's framebuffer as handed out but not yet displayed
    pub fn mark_not_displayed(&self, buffer: &mut PooledBuffer) {
        if buffer.fb_meta.framebuffer.is_some() {
            buffer.fb_meta.not_displayed_yet = true;
        }
    }

    /// Record the hardware taking a framebuffer
    pub fn consume_framebuffer(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.available == 0 {
            return Err(EncoderError::NoFramebufferAvailable);
        }
        state.available -= 1;
        state.decremented += 1;
        trace!(
            "framebuffer consumed: available {} decremented {}",
            state.available,
            state.decremented
        );
        Ok(())
    }

    /// Block until at least `min` framebuffers are available
    ///
    /// Returns false if the wait ended because the registry is flushing.
    pub fn wait_until_available(&self, min: usize) -> bool {
        let mut state = self.state.lock();
        while state.available < min && !state.flushing {
            self.available_cond.wait(&mut state);
        }
        state.available >= min
    }

    /// Release or re-arm waiters of [`wait_until_available`](Self::wait_until_available)
    pub fn set_flushing(&self, flushing: bool) {
        let mut state = self.state.lock();
        state.flushing = flushing;
        if flushing {
            self.available_cond.notify_all();
        }
    }

    /// The hardware handle is gone; framebuffer handles are no longer valid
    pub fn mark_hardware_closed(&self) {
        let mut state = self.state.lock();
        state.hardware_open = false;
        state.flushing = true;
        self.available_cond.notify_all();
    }

    /// End the registration
    pub fn tear_down(&self) {
        let mut state = self.state.lock();
        state.registration = RegistrationState::TornDown;
        state.hardware_open = false;
        state.flushing = true;
        self.available_cond.notify_all();
        debug!("Framebuffer registry torn down");
    }

    pub fn counters(&self) -> RegistryCounters {
        let state = self.state.lock();
        RegistryCounters {
            total: self.set.len(),
            available: state.available,
            in_buffers: state.in_buffers,
            decremented: state.decremented,
        }
    }

    /// Release path for a buffer returning to its pool
    ///
    /// Notifies the hardware first if the wrapped framebuffer still awaits
    /// its "displayed" call and the decoder is open. The buffer's memory is
    /// removed in every case.
    pub(crate) fn release_buffer(&self, buffer: &mut PooledBuffer) {
        let Some(handle) = buffer.fb_meta.framebuffer else {
            return;
        };

        {
            let mut state = self.state.lock();

            let returned = match (buffer.fb_meta.not_displayed_yet, state.registration, state.hardware_open) {
                (true, RegistrationState::DecoderTarget(hw), true) => {
                    match self.hardware.notify_frame_displayed(hw, handle) {
                        Ok(()) => true,
                        Err(e) => {
                            error!("Marking framebuffer {} as displayed failed: {}", handle.index(), e);
                            false
                        }
                    }
                }
                // a closed instance already invalidated every handle
                _ => true,
            };

            if returned {
                buffer.fb_meta.not_displayed_yet = false;
                if state.decremented > 0 {
                    state.available += 1;
                    state.decremented -= 1;
                    state.in_buffers = state.in_buffers.saturating_sub(1);
                }
                trace!(
                    "framebuffer {} returned: available {} in_buffers {} decremented {}",
                    handle.index(),
                    state.available,
                    state.in_buffers,
                    state.decremented
                );
            }
        }

        buffer.clear_memory();
        buffer.fb_meta.framebuffer = None;
        self.available_cond.notify_all();
    }
}

impl std::fmt::Debug for FramebufferRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramebufferRegistry")
            .field("geometry", self.geometry())
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::pool::PhysBufferPool;
    use crate::testing::MockHardware;
    use imxvpu_mem::{PixelFormat, VideoInfo};
    use std::time::Duration;

    const INIT: InitInfo = InitInfo {
        min_framebuffer_count: 3,
        address_alignment: 16,
    };

    fn registry(mock: &Arc<MockHardware>) -> Arc<FramebufferRegistry> {
        Arc::new(
            FramebufferRegistry::new(mock.clone(), PhysMemAllocator::system(), &INIT, 100, 60)
                .expect("framebuffers"),
        )
    }

    fn assert_invariant(registry: &FramebufferRegistry) {
        let c = registry.counters();
        assert_eq!(c.available + c.in_buffers + c.in_flight(), c.total, "{:?}", c);
    }

    fn wrapping_pool(registry: &Arc<FramebufferRegistry>) -> PhysBufferPool {
        let info = VideoInfo::new(PixelFormat::I420, 100, 60);
        let config = PoolConfig::builder(info)
            .allocate_memory(false)
            .framebuffer_geometry(*registry.geometry())
            .build();
        let pool = PhysBufferPool::new(config, PhysMemAllocator::system()).expect("pool");
        pool.set_framebuffers(Some(Arc::clone(registry)));
        pool.set_active(true).expect("activate");
        pool
    }

    #[test]
    fn test_geometry() {
        let g = FramebufferGeometry::new(100, 60, 3, 0);
        assert_eq!(g.y_stride, 112);
        assert_eq!(g.uv_stride, 56);
        assert_eq!(g.y_size, 112 * 64);
        assert_eq!(g.u_size, g.y_size / 4);
        assert_eq!(g.total_size, g.y_size + g.u_size * 3);
        assert_eq!(g.alignment, 1);
        assert_eq!(g.plane_layout().offsets, [0, g.y_size, g.y_size + g.u_size]);
    }

    #[test]
    fn test_descriptors() {
        let mock = MockHardware::new();
        let registry = registry(&mock);
        let g = *registry.geometry();
        let descs = registry.framebuffers().descriptors();

        assert_eq!(descs.len(), 3);
        for (i, desc) in descs.iter().enumerate() {
            assert_eq!(desc.handle, FramebufferHandle(i as u32));
            assert_eq!(desc.y.as_u64() % 16, 0);
            assert_eq!(desc.cb, desc.y.offset(g.y_size));
            assert_eq!(desc.mv, desc.y.offset(g.y_size + 2 * g.u_size));
        }
    }

    #[test]
    fn test_double_registration_rejected() {
        let mock = MockHardware::new();
        let registry = registry(&mock);

        registry.register_with_encoder(HwHandle(1), 112).expect("first registration");
        assert_eq!(registry.registration(), RegistrationState::EncoderTarget(HwHandle(1)));

        let err = registry.register_with_decoder(HwHandle(1)).expect_err("second registration");
        assert!(matches!(err, EncoderError::AlreadyRegistered));
        assert_eq!(mock.count("register_framebuffers"), 1);

        registry.tear_down();
        registry.register_with_encoder(HwHandle(2), 112).expect("after teardown");
    }

    #[test]
    fn test_invariant_across_lifecycle() {
        let mock = MockHardware::new();
        let registry = registry(&mock);
        registry.register_with_decoder(HwHandle(7)).expect("register");
        let pool = wrapping_pool(&registry);
        assert_invariant(&registry);

        // hardware takes a framebuffer, later it lands in a buffer
        registry.consume_framebuffer().expect("consume");
        assert_invariant(&registry);
        assert_eq!(registry.counters().in_flight(), 1);

        let mut first = pool.acquire().expect("buffer");
        registry
            .attach_framebuffer(&mut first, FramebufferHandle(0), 96, 60)
            .expect("attach");
        registry.mark_not_displayed(&mut first);
        assert_invariant(&registry);
        assert_eq!(first.phys_mem_meta().map(|m| (m.x_padding, m.y_padding)), Some((4, 0)));
        assert!(first.framebuffer_meta().needs_display_notification());

        // attach without a prior consume counts as one
        let mut second = pool.acquire().expect("buffer");
        registry
            .attach_framebuffer(&mut second, FramebufferHandle(1), 100, 60)
            .expect("attach");
        assert_invariant(&registry);
        let c = registry.counters();
        assert_eq!((c.available, c.in_buffers, c.in_flight()), (1, 2, 0));

        drop(first);
        assert_invariant(&registry);
        assert_eq!(mock.count("notify_frame_displayed"), 1);

        second.release();
        assert_invariant(&registry);
        let c = registry.counters();
        assert_eq!((c.available, c.in_buffers, c.decremented), (3, 0, 0));
        // only the buffer flagged as not displayed needed a notification
        assert_eq!(mock.count("notify_frame_displayed"), 1);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_release_after_close_skips_notification() {
        let mock = MockHardware::new();
        let registry = registry(&mock);
        registry.register_with_decoder(HwHandle(7)).expect("register");
        let pool = wrapping_pool(&registry);

        let mut buffer = pool.acquire().expect("buffer");
        registry
            .attach_framebuffer(&mut buffer, FramebufferHandle(2), 100, 60)
            .expect("attach");
        registry.mark_not_displayed(&mut buffer);
        registry.mark_hardware_closed();

        drop(buffer);
        assert_eq!(mock.count("notify_frame_displayed"), 0);
        assert_eq!(registry.counters().available, 3);
        assert_invariant(&registry);
    }

    #[test]
    fn test_failed_notification_keeps_framebuffer_counted() {
        let mock = MockHardware::new();
        let registry = registry(&mock);
        registry.register_with_decoder(HwHandle(7)).expect("register");
        let pool = wrapping_pool(&registry);

        let mut buffer = pool.acquire().expect("buffer");
        registry
            .attach_framebuffer(&mut buffer, FramebufferHandle(0), 100, 60)
            .expect("attach");
        registry.mark_not_displayed(&mut buffer);

        mock.fail_next("notify_frame_displayed", crate::hardware::RetCode::InvalidFrameBuffer);
        drop(buffer);

        let c = registry.counters();
        assert_eq!((c.available, c.in_buffers), (2, 1));
        assert_invariant(&registry);
        // memory is removed regardless
        let buffer = pool.acquire().expect("buffer");
        assert!(!buffer.has_memory());
    }

    #[test]
    fn test_wait_until_available() {
        let mock = MockHardware::new();
        let registry = registry(&mock);
        registry.register_with_decoder(HwHandle(7)).expect("register");
        let pool = wrapping_pool(&registry);

        let mut held = Vec::new();
        for i in 0..3 {
            let mut buffer = pool.acquire().expect("buffer");
            registry
                .attach_framebuffer(&mut buffer, FramebufferHandle(i), 100, 60)
                .expect("attach");
            held.push(buffer);
        }
        assert_eq!(registry.counters().available, 0);

        let waiter = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.wait_until_available(1))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        held.pop();
        assert!(waiter.join().expect("waiter thread"));
    }

    #[test]
    fn test_flushing_releases_waiters() {
        let mock = MockHardware::new();
        let registry = registry(&mock);
        for _ in 0..3 {
            registry.consume_framebuffer().expect("consume");
        }
        assert!(matches!(
            registry.consume_framebuffer(),
            Err(EncoderError::NoFramebufferAvailable)
        ));

        let waiter = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.wait_until_available(2))
        };
        std::thread::sleep(Duration::from_millis(20));
        registry.set_flushing(true);
        assert!(!waiter.join().expect("waiter thread"));
    }
}
