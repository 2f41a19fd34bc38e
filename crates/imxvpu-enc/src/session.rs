//! Encoder Session
//!
//! Drives one hardware encoder instance through its lifecycle:
//!
//! ```text
//! Closed ──start──> MemQueried ──set_format──> Opened ──> Configured ──handle_frame──> Encoding
//!   ^                   ^                                                                 │
//!   │                   └────────────── set_format (close + reopen) ──────────────────────┤
//!   └───────────────────────────────────────── stop ──────────────────────────────────────┘
//! ```
//!
//! Work memory is allocated at start and freed at stop. The hardware
//! instance is opened on every format change. Framebuffers, the output
//! region and the fallback input buffer are set up lazily by the first
//! frame that needs them.

use std::sync::Arc;

use imxvpu_mem::{
    copy_frame, MemoryBlockLists, MemoryKind, PhysAddr, PhysMemAllocator, PhysicalMemoryBlock, PlaneLayout,
    VideoInfo, DEFAULT_PHYS_ALIGNMENT,
};
use tracing::{debug, error, info, warn};

use crate::capability::HardwareCapabilityHandle;
use crate::codec::{copy_output, EncoderCodec, OutputCaps};
use crate::config::{EncoderSettings, PoolConfig};
use crate::error::{EncoderError, Result};
use crate::frame::{CodecFrame, FrameOutcome, FrameSink};
use crate::framebuffers::FramebufferRegistry;
use crate::hardware::{
    pack_frame_rate, ConfigKey, EncodeParams, EncodeStatus, HardwareCodec, HwHandle, InitInfo, InputPicture,
    OpenParams, WorkMemoryBlock,
};
use crate::pool::{PhysBufferPool, PoolBuffer};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not started, or stopped
    Closed,
    /// Work memory allocated, no hardware instance
    MemQueried,
    /// Hardware instance open, configuration pending
    Opened,
    /// Open and configured, waiting for frames
    Configured,
    /// At least one frame fed since the last open
    Encoding,
}

/// Negotiated output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputState {
    pub caps: OutputCaps,
    pub info: VideoInfo,
}

/// Statistics for a session
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Frames delivered with encoded data
    pub frames_encoded: u64,

    /// Frames the hardware never completed
    pub frames_dropped: u64,

    /// Output buffers allocated for frames
    pub output_buffers_allocated: u64,

    /// Internal input buffers allocated for non-contiguous input
    pub fallback_buffers_allocated: u64,

    /// Frames copied into the internal input buffer
    pub fallback_copies: u64,

    /// Encoded bytes delivered
    pub bytes_produced: u64,
}

/// One hardware encoder instance and everything it owns
pub struct EncoderSession<C: EncoderCodec> {
    capability: Arc<HardwareCapabilityHandle>,
    hardware: Arc<dyn HardwareCodec>,
    allocator: PhysMemAllocator,
    codec: C,
    sink: Box<dyn FrameSink>,
    settings: EncoderSettings,
    state: SessionState,
    holds_ref: bool,
    work_memory: MemoryBlockLists,
    work_blocks: Vec<WorkMemoryBlock>,
    handle: Option<HwHandle>,
    open_params: Option<OpenParams>,
    init_info: Option<InitInfo>,
    output_state: Option<OutputState>,
    framebuffers: Option<Arc<FramebufferRegistry>>,
    output_block: Option<PhysicalMemoryBlock>,
    internal_buffer: Option<PoolBuffer>,
    internal_pool: Option<PhysBufferPool>,
    stats: SessionStats,
}

impl<C: EncoderCodec> EncoderSession<C> {
    /// Create a closed session
    pub fn new(
        capability: Arc<HardwareCapabilityHandle>,
        allocator: PhysMemAllocator,
        codec: C,
        sink: impl FrameSink + 'static,
        settings: EncoderSettings,
    ) -> Result<Self> {
        settings
            .validate()
            .map_err(|issues| EncoderError::InvalidConfig(issues.join("; ")))?;

        info!("Creating {} encoder session with settings: {:?}", codec.family(), settings);

        Ok(Self {
            hardware: capability.hardware(),
            capability,
            work_memory: MemoryBlockLists::new(allocator.clone()),
            allocator,
            codec,
            sink: Box::new(sink),
            settings,
            state: SessionState::Closed,
            holds_ref: false,
            work_blocks: Vec::new(),
            handle: None,
            open_params: None,
            init_info: None,
            output_state: None,
            framebuffers: None,
            output_block: None,
            internal_buffer: None,
            internal_pool: None,
            stats: SessionStats::default(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Output negotiated by the last successful `set_format`
    pub fn output_state(&self) -> Option<&OutputState> {
        self.output_state.as_ref()
    }

    /// Open parameters of the current hardware instance
    pub fn open_params(&self) -> Option<&OpenParams> {
        self.open_params.as_ref()
    }

    /// Framebuffers registered with the current hardware instance
    pub fn framebuffers(&self) -> Option<&Arc<FramebufferRegistry>> {
        self.framebuffers.as_ref()
    }

    /// Load the capability and allocate work memory
    pub fn start(&mut self) -> Result<()> {
        if self.state != SessionState::Closed {
            return Err(EncoderError::invalid_state("session already started"));
        }

        info!("Starting {} encoder session", self.codec.family());
        self.capability.acquire_ref()?;
        self.holds_ref = true;

        let descriptors = match self.hardware.query_work_memory() {
            Ok(descriptors) => descriptors,
            Err(e) => {
                error!("Querying work memory requirements failed: {}", e);
                self.release_capability();
                return Err(EncoderError::hardware("work memory query", e));
            }
        };

        for desc in &descriptors {
            match self.work_memory.allocate(desc.kind, desc.size, desc.alignment) {
                Ok(block) => self.work_blocks.push(WorkMemoryBlock {
                    kind: desc.kind,
                    virt_addr: block.virt_addr(),
                    phys_addr: block.phys_addr(),
                    size: block.size(),
                }),
                Err(e) => {
                    error!(
                        "Allocating {} bytes of {} work memory failed: {}",
                        desc.size, desc.kind, e
                    );
                    if let Err(free_err) = self.work_memory.free_everything() {
                        warn!("Rolling back work memory failed: {}", free_err);
                    }
                    self.work_blocks.clear();
                    self.release_capability();
                    return Err(EncoderError::resource_exhausted("work memory", e));
                }
            }
        }

        debug!(
            "Allocated {} work memory blocks ({} cpu-visible, {} hardware-visible)",
            descriptors.len(),
            self.work_memory.len(MemoryKind::CpuVisible),
            self.work_memory.len(MemoryKind::HardwareVisible)
        );
        self.state = SessionState::MemQueried;
        Ok(())
    }

    /// Open the hardware for a new input format
    ///
    /// An already open instance is closed first, together with its
    /// framebuffers and output region.
    pub fn set_format(&mut self, info: VideoInfo) -> Result<OutputState> {
        if self.state == SessionState::Closed {
            return Err(EncoderError::invalid_state("set_format called before start"));
        }

        info!(
            "Setting input format {} {}x{} @ {}/{} fps",
            info.format, info.width, info.height, info.fps_n, info.fps_d
        );
        self.close_hardware();

        let mut params = OpenParams {
            codec: self.codec.family(),
            pic_width: info.width,
            pic_height: info.height,
            frame_rate_info: pack_frame_rate(info.fps_n, info.fps_d),
            bitrate_kbps: self.settings.bitrate_kbps,
            gop_size: self.settings.gop_size,
            slice_mode: self.settings.slice_mode(),
            intra_refresh: self.settings.intra_refresh,
            ..OpenParams::default()
        };
        self.codec.set_open_params(&mut params, &info)?;

        let handle = self.hardware.open(&self.work_blocks, &params).map_err(|e| {
            error!("Opening encoder failed: {}", e);
            EncoderError::hardware("open", e)
        })?;
        self.handle = Some(handle);
        self.state = SessionState::Opened;
        debug!("Encoder opened with {:?}", params);

        if self.settings.bitrate_kbps != 0 {
            self.configure(handle, ConfigKey::Bitrate(self.settings.bitrate_kbps), "bitrate configuration")?;
        }
        if self.settings.intra_refresh != 0 {
            self.configure(
                handle,
                ConfigKey::IntraRefresh(self.settings.intra_refresh),
                "intra refresh configuration",
            )?;
        }
        self.state = SessionState::Configured;

        let init_info = self.hardware.initial_info(handle).map_err(|e| {
            error!("Querying initial info failed: {}", e);
            EncoderError::hardware("initial info query", e)
        })?;
        debug!(
            "Encoder wants {} framebuffers, address alignment {}",
            init_info.min_framebuffer_count, init_info.address_alignment
        );

        let output_state = OutputState {
            caps: self.codec.output_caps(&info),
            info,
        };
        self.init_info = Some(init_info);
        self.open_params = Some(params);
        self.output_state = Some(output_state.clone());
        Ok(output_state)
    }

    fn configure(&self, handle: HwHandle, key: ConfigKey, operation: &'static str) -> Result<()> {
        self.hardware.configure(handle, key).map_err(|e| {
            error!("Encoder {} ({:?}) failed: {}", operation, key, e);
            EncoderError::hardware(operation, e)
        })
    }

    /// Change the target bitrate, live if the hardware is open
    pub fn set_bitrate(&mut self, kbps: u32) -> Result<()> {
        self.settings.bitrate_kbps = kbps;
        if let Some(handle) = self.handle {
            self.configure(handle, ConfigKey::Bitrate(kbps), "bitrate configuration")?;
            info!("Bitrate changed to {} kbps", kbps);
        }
        Ok(())
    }

    /// Pool an upstream producer can write into directly
    ///
    /// Buffers carry physical-memory meta, so frames from this pool skip the
    /// fallback copy. The pool is returned inactive.
    pub fn propose_allocation(&self, info: &VideoInfo) -> Result<PhysBufferPool> {
        let config = PoolConfig::builder(info.clone())
            .min_buffers(2)
            .max_buffers(0)
            .add_video_meta(true)
            .build();
        Ok(PhysBufferPool::new(config, self.allocator.clone())?)
    }

    /// Encode one frame and hand it to the sink
    ///
    /// Returns [`FrameOutcome::Dropped`] if the hardware consumed the input
    /// without completing the frame; the frame is still delivered, without
    /// data.
    pub fn handle_frame(&mut self, mut frame: CodecFrame) -> Result<FrameOutcome> {
        let (handle, info) = match (self.handle, self.output_state.as_ref(), self.state) {
            (Some(handle), Some(output), SessionState::Configured | SessionState::Encoding) => {
                (handle, output.info.clone())
            }
            _ => return Err(EncoderError::invalid_state("handle_frame called before set_format")),
        };

        let (phys_addr, layout) = match frame.input.phys_mem_meta() {
            Some(meta) => (
                meta.phys_addr,
                frame.input.video_meta().map_or(info.layout, |m| m.layout),
            ),
            None => self.upload_to_internal_buffer(&frame, &info)?,
        };
        let input = InputPicture {
            y: phys_addr,
            cb: phys_addr.offset(layout.offsets[1]),
            cr: phys_addr.offset(layout.offsets[2]),
            y_stride: layout.strides[0],
            uv_stride: layout.strides[1],
        };

        let geometry = *self.ensure_framebuffers(handle, &info, input.y_stride)?.geometry();

        if self.output_block.is_none() {
            let block = self
                .allocator
                .allocate(MemoryKind::HardwareVisible, geometry.total_size, DEFAULT_PHYS_ALIGNMENT)
                .map_err(|e| {
                    error!("Allocating output buffer of {} bytes failed: {}", geometry.total_size, e);
                    EncoderError::resource_exhausted("output buffer", e)
                })?;
            debug!("Allocated output buffer of {} bytes", block.size());
            self.output_block = Some(block);
        }
        let (output_phys, output_virt, output_size) = match self.output_block.as_ref() {
            Some(block) => (block.phys_addr().unwrap_or_default(), block.virt_addr(), block.size()),
            None => return Err(EncoderError::invalid_state("output buffer missing")),
        };

        let mut params = EncodeParams {
            output_phys,
            output_virt,
            output_size,
            pic_width: geometry.pic_width,
            pic_height: geometry.pic_height,
            frame_rate_info: pack_frame_rate(info.fps_n, info.fps_d),
            force_i_picture: false,
            input,
        };
        if frame.force_keyframe || frame.force_keyframe_headers {
            debug!("Forcing intra picture for frame {}", frame.system_frame_number);
            params.force_i_picture = true;
            frame.sync_point = true;
        }
        if let Some(hook) = self.codec.frame_params_hook() {
            hook.adjust(&mut params, &frame);
        }

        self.state = SessionState::Encoding;
        self.drain_encoder(handle, &params, frame)
    }

    /// Run `encode_frame` until the hardware has consumed the input
    fn drain_encoder(&mut self, handle: HwHandle, params: &EncodeParams, frame: CodecFrame) -> Result<FrameOutcome> {
        let frame_number = frame.system_frame_number;
        let mut pending = Some(frame);
        let mut output: Option<Vec<u8>> = None;
        let mut offset = 0;

        loop {
            let scratch = match self.output_block.as_mut() {
                Some(block) => block.as_mut_slice(),
                None => return Err(EncoderError::invalid_state("output buffer missing")),
            };

            let outcome = match self.hardware.encode_frame(handle, params, scratch) {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Encoding frame {} failed: {}", frame_number, e);
                    if let Err(reset_err) = self.hardware.reset(handle) {
                        error!("Resetting encoder failed: {}", reset_err);
                    }
                    return Err(EncoderError::hardware("frame encoding", e));
                }
            };

            if pending.is_some() {
                if outcome.has_output() {
                    let stats = &mut self.stats;
                    let buffer = output.get_or_insert_with(|| {
                        stats.output_buffers_allocated += 1;
                        vec![0; params.output_size]
                    });
                    let src = &scratch[..outcome.output_size.min(scratch.len())];
                    let dst = &mut buffer[offset..];
                    offset += match self.codec.output_filler() {
                        Some(filler) => filler.fill(dst, src, outcome.status),
                        None => copy_output(dst, src),
                    };
                }

                if outcome.status.contains(EncodeStatus::DisplayReady) {
                    if let Some(mut finished) = pending.take() {
                        let mut data = output.take().unwrap_or_default();
                        data.truncate(offset);
                        finished.dts = finished.pts;

                        self.stats.frames_encoded += 1;
                        self.stats.bytes_produced += offset as u64;
                        self.sink.finish_frame(finished.into_encoded(Some(data)))?;
                    }
                }
            }

            if outcome.status.contains(EncodeStatus::InputUsed) {
                break;
            }
        }

        match pending {
            None => Ok(FrameOutcome::Finished),
            Some(unfinished) => {
                if output.take().is_some() {
                    warn!("Frame {} was never completed, dropping its output", frame_number);
                } else {
                    warn!("Frame {} produced no output, dropping", frame_number);
                }
                self.stats.frames_dropped += 1;
                self.sink.finish_frame(unfinished.into_encoded(None))?;
                Ok(FrameOutcome::Dropped)
            }
        }
    }

    /// Copy non-contiguous input into the internal buffer
    fn upload_to_internal_buffer(&mut self, frame: &CodecFrame, info: &VideoInfo) -> Result<(PhysAddr, PlaneLayout)> {
        if self.internal_buffer.is_none() {
            debug!("Input is not physically contiguous, creating internal input buffer");
            let config = PoolConfig::builder(info.clone())
                .min_buffers(1)
                .max_buffers(0)
                .add_video_meta(true)
                .build();
            let pool = PhysBufferPool::new(config, self.allocator.clone())?;
            pool.set_active(true).map_err(|e| {
                error!("Activating internal buffer pool failed: {}", e);
                e
            })?;
            let buffer = pool.acquire()?;
            self.stats.fallback_buffers_allocated += 1;
            self.internal_pool = Some(pool);
            self.internal_buffer = Some(buffer);
        }

        let buffer = match self.internal_buffer.as_mut() {
            Some(buffer) => buffer,
            None => return Err(EncoderError::invalid_state("internal buffer missing")),
        };
        let dst_layout = buffer.video_meta().map_or(info.layout, |m| m.layout);
        let src_layout = frame.input.video_meta().map_or(info.layout, |m| m.layout);
        let phys_addr = buffer
            .phys_addr()
            .ok_or_else(|| EncoderError::invalid_state("internal buffer has no physical address"))?;
        let dst = buffer
            .data_mut()
            .ok_or_else(|| EncoderError::invalid_state("internal buffer has no memory"))?;

        let src = frame.input.data();
        if let Err(e) = copy_frame(info, src, &src_layout, dst, &dst_layout) {
            warn!("Input frame does not match the negotiated format ({}), copying raw bytes", e);
            copy_output(dst, src);
        }
        self.stats.fallback_copies += 1;

        Ok((phys_addr, dst_layout))
    }

    fn ensure_framebuffers(&mut self, handle: HwHandle, info: &VideoInfo, src_stride: usize) -> Result<&FramebufferRegistry> {
        if self.framebuffers.is_none() {
            let init_info = self
                .init_info
                .ok_or_else(|| EncoderError::invalid_state("initial info missing"))?;
            let registry = FramebufferRegistry::new(
                Arc::clone(&self.hardware),
                self.allocator.clone(),
                &init_info,
                info.width,
                info.height,
            )?;
            registry.register_with_encoder(handle, src_stride)?;
            self.framebuffers = Some(Arc::new(registry));
        }

        self.framebuffers
            .as_deref()
            .ok_or_else(|| EncoderError::invalid_state("framebuffers missing"))
    }

    /// Close the hardware instance and drop everything tied to it
    fn close_hardware(&mut self) {
        self.internal_buffer = None;
        if let Some(pool) = self.internal_pool.take() {
            if let Err(e) = pool.set_active(false) {
                warn!("Deactivating internal buffer pool failed: {}", e);
            }
        }

        if let Some(registry) = self.framebuffers.take() {
            registry.tear_down();
        }

        if let Some(block) = self.output_block.take() {
            if let Err(e) = self.allocator.free(block) {
                warn!("Freeing output buffer failed: {}", e);
            }
        }

        if let Some(handle) = self.handle.take() {
            match self.hardware.close(handle) {
                Ok(()) => info!("Encoder closed"),
                Err(e) => error!("Closing encoder failed: {}", e),
            }
        }

        self.init_info = None;
        self.open_params = None;
        self.output_state = None;
        if self.state != SessionState::Closed {
            self.state = SessionState::MemQueried;
        }
    }

    fn release_capability(&mut self) {
        if self.holds_ref {
            self.capability.release_ref();
            self.holds_ref = false;
        }
    }

    /// Close the hardware, free all memory and release the capability
    ///
    /// Safe to call in any state and any number of times.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == SessionState::Closed && !self.holds_ref {
            debug!("Encoder session already stopped");
            return Ok(());
        }

        info!("Stopping {} encoder session", self.codec.family());
        self.close_hardware();

        let freed = self.work_memory.free_everything();
        self.work_blocks.clear();
        self.release_capability();
        self.state = SessionState::Closed;

        freed.map_err(|e| {
            error!("Freeing work memory failed: {}", e);
            EncoderError::Release {
                what: "work memory",
                source: e,
            }
        })
    }
}

impl<C: EncoderCodec> Drop for EncoderSession<C> {
    fn drop(&mut self) {
        if self.holds_ref || self.handle.is_some() {
            debug!("Dropping running encoder session");
            let _ = self.stop();
        }
    }
}

impl<C: EncoderCodec> std::fmt::Debug for EncoderSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderSession")
            .field("family", &self.codec.family())
            .field("state", &self.state)
            .field("handle", &self.handle)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, feature = "h264", feature = "mjpeg"))]
mod tests {
    use super::*;
    use crate::codec::{H264Codec, MjpegCodec};
    use crate::config::SliceMode;
    use crate::error::ErrorKind;
    use crate::frame::{ChannelSink, EncodedFrame, SystemBuffer};
    use crate::hardware::{BlockDescriptor, RetCode};
    use crate::testing::{MockHardware, DEFAULT_PAYLOAD};
    use imxvpu_mem::{PixelFormat, SystemMemoryBackend};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        mock: Arc<MockHardware>,
        capability: Arc<HardwareCapabilityHandle>,
        allocator: PhysMemAllocator,
    }

    impl Fixture {
        fn new() -> Self {
            let mock = MockHardware::new();
            Self {
                capability: HardwareCapabilityHandle::new(mock.clone()),
                mock,
                allocator: PhysMemAllocator::system(),
            }
        }

        fn session<C: EncoderCodec>(
            &self,
            codec: C,
            settings: EncoderSettings,
        ) -> (EncoderSession<C>, UnboundedReceiver<EncodedFrame>) {
            let (sink, rx) = ChannelSink::new();
            let session = EncoderSession::new(
                Arc::clone(&self.capability),
                self.allocator.clone(),
                codec,
                sink,
                settings,
            )
            .expect("session");
            (session, rx)
        }

        fn running_h264(&self) -> (EncoderSession<H264Codec>, UnboundedReceiver<EncodedFrame>) {
            let (mut session, rx) = self.session(H264Codec::new(), EncoderSettings::default());
            session.start().expect("start");
            session.set_format(info()).expect("set_format");
            (session, rx)
        }
    }

    fn info() -> VideoInfo {
        VideoInfo::new(PixelFormat::I420, 64, 48).with_framerate(30, 1)
    }

    fn system_frame(n: u32) -> CodecFrame {
        CodecFrame::new(n, SystemBuffer::new(vec![0x80; info().size])).with_pts(u64::from(n) * 33_333_333)
    }

    fn received(rx: &mut UnboundedReceiver<EncodedFrame>) -> Vec<EncodedFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_start_allocates_work_memory() {
        let fx = Fixture::new();
        let (mut session, _rx) = fx.session(H264Codec::new(), EncoderSettings::default());

        session.start().expect("start");
        assert_eq!(session.state(), SessionState::MemQueried);
        assert_eq!(fx.allocator.stats().live_blocks, 2);
        assert_eq!(fx.capability.ref_count(), 1);

        session.set_format(info()).expect("set_format");
        let opened = fx.mock.opened.lock();
        let (blocks, _) = &opened[0];
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].kind, MemoryKind::CpuVisible);
        assert_eq!(blocks[0].virt_addr % 8, 0);
        assert_eq!(blocks[1].phys_addr.map(|a| a.as_u64() % 512), Some(0));
    }

    #[test]
    fn test_start_failure_rolls_back() {
        let mock = MockHardware::new();
        mock.set_work_memory(vec![
            BlockDescriptor {
                kind: MemoryKind::CpuVisible,
                size: 1000,
                alignment: 8,
            },
            BlockDescriptor {
                kind: MemoryKind::HardwareVisible,
                size: 8192,
                alignment: 512,
            },
        ]);
        let capability = HardwareCapabilityHandle::new(mock.clone());
        let allocator = PhysMemAllocator::new(Arc::new(SystemMemoryBackend::with_limit(4096)));
        let (sink, _rx) = ChannelSink::new();
        let mut session = EncoderSession::new(
            Arc::clone(&capability),
            allocator.clone(),
            H264Codec::new(),
            sink,
            EncoderSettings::default(),
        )
        .expect("session");

        let err = session.start().expect_err("second block does not fit");
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(allocator.stats().live_blocks, 0);
        assert_eq!(capability.ref_count(), 0);
        assert_eq!((mock.count("load"), mock.count("unload")), (1, 1));

        // nothing left for stop to undo
        session.stop().expect("stop");
        assert_eq!(mock.count("unload"), 1);
    }

    #[test]
    fn test_set_format_open_params() {
        let fx = Fixture::new();
        let settings = EncoderSettings::builder()
            .gop_size(30)
            .bitrate_kbps(2000)
            .slice_size(-10)
            .intra_refresh(5)
            .build();
        let (mut session, _rx) = fx.session(H264Codec::new(), settings);
        session.start().expect("start");

        let output = session
            .set_format(VideoInfo::new(PixelFormat::I420, 320, 240).with_framerate(30000, 1001))
            .expect("set_format");
        assert_eq!(session.state(), SessionState::Configured);
        assert_eq!(output.caps.media_type, "video/x-h264");
        assert_eq!((output.caps.width, output.caps.height), (320, 240));

        let params = session.open_params().expect("open params").clone();
        assert_eq!((params.pic_width, params.pic_height), (320, 240));
        assert_eq!(params.frame_rate_info, 30000 | (1000 << 16));
        assert_eq!(params.gop_size, 30);
        assert_eq!(params.bitrate_kbps, 2000);
        assert_eq!(params.slice_mode, SliceMode::Macroblocks(10));
        assert_eq!(params.intra_refresh, 5);
        assert_eq!(params.rc_intra_qp, -1);

        assert_eq!(
            *fx.mock.configured.lock(),
            vec![ConfigKey::Bitrate(2000), ConfigKey::IntraRefresh(5)]
        );
    }

    #[test]
    fn test_no_configuration_calls_by_default() {
        let fx = Fixture::new();
        let (_session, _rx) = fx.running_h264();
        assert_eq!(fx.mock.count("configure"), 0);
    }

    #[test]
    fn test_configure_failure_is_fatal() {
        let fx = Fixture::new();
        let settings = EncoderSettings::builder().bitrate_kbps(1000).build();
        let (mut session, _rx) = fx.session(H264Codec::new(), settings);
        session.start().expect("start");

        fx.mock.fail_next("configure", RetCode::InvalidParam);
        let err = session.set_format(info()).expect_err("configure fails");
        assert_eq!(err.kind(), ErrorKind::HardwareRejected);
        assert_eq!(session.state(), SessionState::Opened);

        session.stop().expect("stop");
        assert_eq!(fx.mock.count("close"), 1);
    }

    #[test]
    fn test_set_format_reopens() {
        let fx = Fixture::new();
        let (mut session, _rx) = fx.running_h264();
        session.handle_frame(system_frame(0)).expect("frame");
        let first_registry = Arc::clone(session.framebuffers().expect("framebuffers"));

        session.set_format(info()).expect("second set_format");
        assert_eq!(fx.mock.count("open"), 2);
        assert_eq!(fx.mock.count("close"), 1);
        assert!(session.framebuffers().is_none());
        assert_eq!(
            first_registry.registration(),
            crate::framebuffers::RegistrationState::TornDown
        );
    }

    #[test]
    fn test_handle_frame_before_set_format() {
        let fx = Fixture::new();
        let (mut session, _rx) = fx.session(H264Codec::new(), EncoderSettings::default());
        session.start().expect("start");

        let err = session.handle_frame(system_frame(0)).expect_err("not opened");
        assert_eq!(err.kind(), ErrorKind::PreconditionViolation);
    }

    #[test]
    fn test_fallback_buffer_allocated_once() {
        let fx = Fixture::new();
        let (mut session, mut rx) = fx.running_h264();

        assert_eq!(session.handle_frame(system_frame(0)).expect("first"), FrameOutcome::Finished);
        let first_input = fx.mock.last_encode().expect("encoded").input;
        assert_eq!(session.handle_frame(system_frame(1)).expect("second"), FrameOutcome::Finished);
        let second_input = fx.mock.last_encode().expect("encoded").input;

        assert_eq!(session.stats().fallback_buffers_allocated, 1);
        assert_eq!(session.stats().fallback_copies, 2);
        assert_eq!(first_input.y, second_input.y);
        assert_eq!(first_input.y_stride, 64);
        assert_eq!(first_input.cb, first_input.y.offset(64 * 48));

        let frames = received(&mut rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data.as_deref(), Some(DEFAULT_PAYLOAD));
        assert_eq!(frames[1].dts, frames[1].pts);
    }

    #[test]
    fn test_contiguous_input_skips_copy() {
        let fx = Fixture::new();
        let (mut session, _rx) = fx.running_h264();

        let pool = session.propose_allocation(&info()).expect("pool");
        assert_eq!(pool.config().min_buffers, 2);
        pool.set_active(true).expect("activate");
        let buffer = pool.acquire().expect("buffer");
        let phys = buffer.phys_addr().expect("bus address");

        session.handle_frame(CodecFrame::new(0, buffer)).expect("frame");
        assert_eq!(fx.mock.last_encode().map(|p| p.input.y), Some(phys));
        assert_eq!(session.stats().fallback_buffers_allocated, 0);
        assert_eq!(session.stats().fallback_copies, 0);
        // input buffer went back to its pool with the finished frame
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_framebuffers_registered_once() {
        let fx = Fixture::new();
        let (mut session, _rx) = fx.running_h264();

        for n in 0..3 {
            session.handle_frame(system_frame(n)).expect("frame");
        }
        assert_eq!(*fx.mock.registered.lock(), vec![(2, 64)]);

        let registry = session.framebuffers().expect("framebuffers");
        assert_eq!(registry.geometry().y_stride, 64);
        assert_eq!(
            fx.mock.last_encode().map(|p| p.output_size),
            Some(registry.geometry().total_size)
        );
    }

    #[test]
    fn test_two_iteration_encode_loop() {
        let fx = Fixture::new();
        let (mut session, mut rx) = fx.running_h264();

        fx.mock.push_encode(EncodeStatus::OutputAvailable, b"hello");
        fx.mock.push_encode(
            EncodeStatus::InputUsed | EncodeStatus::OutputAvailable | EncodeStatus::DisplayReady,
            b"abc",
        );

        let outcome = session.handle_frame(system_frame(0)).expect("frame");
        assert_eq!(outcome, FrameOutcome::Finished);
        assert_eq!(fx.mock.count("encode_frame"), 2);
        assert_eq!(session.stats().output_buffers_allocated, 1);

        let frames = received(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data.as_deref(), Some(&b"helloabc"[..]));
        assert_eq!(session.stats().bytes_produced, 8);
    }

    #[test]
    fn test_frame_without_output_is_dropped() {
        let fx = Fixture::new();
        let (mut session, mut rx) = fx.running_h264();

        fx.mock.push_encode(EncodeStatus::InputUsed, b"");
        let outcome = session.handle_frame(system_frame(4)).expect("frame");

        assert_eq!(outcome, FrameOutcome::Dropped);
        assert_eq!(session.stats().frames_dropped, 1);
        assert_eq!(session.stats().output_buffers_allocated, 0);
        let frames = received(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_dropped());
        assert_eq!(frames[0].system_frame_number, 4);
    }

    #[test]
    fn test_unfinished_output_is_dropped() {
        let fx = Fixture::new();
        let (mut session, mut rx) = fx.running_h264();

        fx.mock
            .push_encode(EncodeStatus::InputUsed | EncodeStatus::OutputAvailable, b"partial");
        let outcome = session.handle_frame(system_frame(0)).expect("frame");

        assert_eq!(outcome, FrameOutcome::Dropped);
        let frames = received(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_dropped());

        // the session keeps going
        assert_eq!(session.handle_frame(system_frame(1)).expect("next"), FrameOutcome::Finished);
    }

    #[test]
    fn test_display_ready_finalizes_once() {
        let fx = Fixture::new();
        let (mut session, mut rx) = fx.running_h264();

        fx.mock
            .push_encode(EncodeStatus::OutputAvailable | EncodeStatus::DisplayReady, b"one");
        fx.mock.push_encode(EncodeStatus::OutputAvailable, b"two");
        fx.mock.push_encode(EncodeStatus::InputUsed, b"");

        assert_eq!(session.handle_frame(system_frame(0)).expect("frame"), FrameOutcome::Finished);
        assert_eq!(fx.mock.count("encode_frame"), 3);

        let frames = received(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data.as_deref(), Some(&b"one"[..]));
        assert_eq!(session.stats().frames_encoded, 1);
    }

    #[test]
    fn test_encode_error_resets_hardware() {
        let fx = Fixture::new();
        let (mut session, mut rx) = fx.running_h264();

        fx.mock.fail_next("encode_frame", RetCode::Timeout);
        let err = session.handle_frame(system_frame(0)).expect_err("encode fails");

        assert_eq!(err.kind(), ErrorKind::HardwareRejected);
        assert_eq!(fx.mock.count("reset"), 1);
        assert!(received(&mut rx).is_empty());
    }

    #[test]
    fn test_forced_keyframe() {
        let fx = Fixture::new();
        let (mut session, mut rx) = fx.running_h264();

        session.handle_frame(system_frame(0)).expect("frame");
        assert_eq!(fx.mock.last_encode().map(|p| p.force_i_picture), Some(false));

        session
            .handle_frame(system_frame(1).with_keyframe_request(true))
            .expect("keyframe");
        assert_eq!(fx.mock.last_encode().map(|p| p.force_i_picture), Some(true));

        let frames = received(&mut rx);
        assert!(!frames[0].sync_point);
        assert!(frames[1].sync_point);
    }

    #[test]
    fn test_h264_sequence_header_in_band() {
        let fx = Fixture::new();
        let (mut session, mut rx) = fx.running_h264();

        fx.mock.push_encode(EncodeStatus::SequenceHeader, &[0, 0, 0, 1, 0x67]);
        fx.mock.push_encode(
            EncodeStatus::InputUsed | EncodeStatus::OutputAvailable | EncodeStatus::DisplayReady,
            &[0, 0, 0, 1, 0x65],
        );
        session.handle_frame(system_frame(0)).expect("frame");

        assert_eq!(session.codec().codec_data(), Some(&[0u8, 0, 0, 1, 0x67][..]));
        let frames = received(&mut rx);
        assert_eq!(
            frames[0].data.as_deref(),
            Some(&[0u8, 0, 0, 1, 0x67, 0, 0, 0, 1, 0x65][..])
        );
    }

    #[test]
    fn test_mjpeg_forces_intra_pictures() {
        let fx = Fixture::new();
        let (mut session, mut rx) = fx.session(MjpegCodec::new(), EncoderSettings::default());
        session.start().expect("start");
        let output = session.set_format(info()).expect("set_format");
        assert_eq!(output.caps.media_type, "image/jpeg");

        session.handle_frame(system_frame(0)).expect("frame");
        assert_eq!(fx.mock.last_encode().map(|p| p.force_i_picture), Some(true));
        assert_eq!(received(&mut rx)[0].data.as_deref(), Some(DEFAULT_PAYLOAD));
    }

    #[test]
    fn test_live_bitrate_change() {
        let fx = Fixture::new();
        let (mut session, _rx) = fx.session(H264Codec::new(), EncoderSettings::default());

        session.set_bitrate(500).expect("not open yet");
        assert_eq!(fx.mock.count("configure"), 0);

        session.start().expect("start");
        session.set_format(info()).expect("set_format");
        assert_eq!(*fx.mock.configured.lock(), vec![ConfigKey::Bitrate(500)]);

        session.set_bitrate(800).expect("live change");
        assert_eq!(fx.mock.configured.lock().last(), Some(&ConfigKey::Bitrate(800)));
        assert_eq!(session.settings().bitrate_kbps, 800);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let fx = Fixture::new();
        let (mut session, _rx) = fx.running_h264();
        session.handle_frame(system_frame(0)).expect("frame");

        session.stop().expect("first stop");
        session.stop().expect("second stop");

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(fx.mock.count("close"), 1);
        assert_eq!(fx.mock.count("unload"), 1);
        assert_eq!(fx.capability.ref_count(), 0);
        assert_eq!(fx.allocator.stats().live_blocks, 0);
    }

    #[test]
    fn test_capability_shared_between_sessions() {
        let fx = Fixture::new();
        let (mut a, _rx_a) = fx.session(H264Codec::new(), EncoderSettings::default());
        let (mut b, _rx_b) = fx.session(MjpegCodec::new(), EncoderSettings::default());

        a.start().expect("start a");
        assert_eq!(fx.capability.ref_count(), 1);
        b.start().expect("start b");
        assert_eq!(fx.capability.ref_count(), 2);
        a.stop().expect("stop a");
        assert_eq!(fx.capability.ref_count(), 1);
        b.stop().expect("stop b");
        assert_eq!(fx.capability.ref_count(), 0);

        assert_eq!(fx.mock.count("load"), 1);
        assert_eq!(fx.mock.count("unload"), 1);
    }

    #[test]
    fn test_drop_stops_session() {
        let fx = Fixture::new();
        {
            let (mut session, _rx) = fx.running_h264();
            session.handle_frame(system_frame(0)).expect("frame");
        }
        assert_eq!(fx.mock.count("close"), 1);
        assert_eq!(fx.capability.ref_count(), 0);
        assert_eq!(fx.allocator.stats().live_blocks, 0);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let fx = Fixture::new();
        let (sink, _rx) = ChannelSink::new();
        let settings = EncoderSettings {
            gop_size: 40_000,
            ..Default::default()
        };
        let err = EncoderSession::new(
            Arc::clone(&fx.capability),
            fx.allocator.clone(),
            H264Codec::new(),
            sink,
            settings,
        )
        .expect_err("gop too large");
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_frames_arrive_on_channel() {
        let fx = Fixture::new();
        let (mut session, mut rx) = fx.running_h264();

        let worker = tokio::task::spawn_blocking(move || {
            for n in 0..5 {
                session.handle_frame(system_frame(n)).expect("frame");
            }
            session.stop().expect("stop");
        });

        for n in 0..5 {
            let frame = rx.recv().await.expect("frame");
            assert_eq!(frame.system_frame_number, n);
        }
        worker.await.expect("worker");
        assert!(rx.recv().await.is_none());
    }
}
