//! Encode a few synthetic frames against a software stand-in for the VPU.
//!
//! Run with `cargo run -p imxvpu-enc --example loopback`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use imxvpu_enc::{
    BitFlags, BlockDescriptor, ChannelSink, CodecFrame, ConfigKey, EncodeOutcome, EncodeParams, EncodeStatus,
    EncoderSession, EncoderSettings, FramebufferDesc, H264Codec, HardwareCapabilityHandle, HardwareCodec, HwHandle,
    HwResult, InitInfo, OpenParams, SystemBuffer, VersionInfo, WorkMemoryBlock,
};
use imxvpu_mem::{MemoryKind, PhysMemAllocator, PixelFormat, VideoInfo};
use tracing::info;

/// Emits a fake sequence header on the first picture and a tiny slice per frame
#[derive(Default)]
struct LoopbackCodec {
    pictures: AtomicU32,
}

impl HardwareCodec for LoopbackCodec {
    fn load(&self) -> HwResult<()> {
        Ok(())
    }

    fn unload(&self) -> HwResult<()> {
        Ok(())
    }

    fn version_info(&self) -> HwResult<VersionInfo> {
        Ok(VersionInfo {
            firmware: "loopback".into(),
            library: env!("CARGO_PKG_VERSION").into(),
            wrapper: env!("CARGO_PKG_VERSION").into(),
        })
    }

    fn query_work_memory(&self) -> HwResult<Vec<BlockDescriptor>> {
        Ok(vec![
            BlockDescriptor {
                kind: MemoryKind::CpuVisible,
                size: 4096,
                alignment: 8,
            },
            BlockDescriptor {
                kind: MemoryKind::HardwareVisible,
                size: 64 * 1024,
                alignment: 4096,
            },
        ])
    }

    fn open(&self, work_memory: &[WorkMemoryBlock], params: &OpenParams) -> HwResult<HwHandle> {
        info!(
            "loopback open: {} {}x{} with {} work blocks",
            params.codec,
            params.pic_width,
            params.pic_height,
            work_memory.len()
        );
        Ok(HwHandle(1))
    }

    fn configure(&self, _handle: HwHandle, key: ConfigKey) -> HwResult<()> {
        info!("loopback configure: {:?}", key);
        Ok(())
    }

    fn initial_info(&self, _handle: HwHandle) -> HwResult<InitInfo> {
        Ok(InitInfo {
            min_framebuffer_count: 2,
            address_alignment: 16,
        })
    }

    fn register_framebuffers(&self, _handle: HwHandle, framebuffers: &[FramebufferDesc], src_stride: usize) -> HwResult<()> {
        info!("loopback registered {} framebuffers, source stride {}", framebuffers.len(), src_stride);
        Ok(())
    }

    fn encode_frame(&self, _handle: HwHandle, params: &EncodeParams, output: &mut [u8]) -> HwResult<EncodeOutcome> {
        let n = self.pictures.fetch_add(1, Ordering::Relaxed);

        let mut bitstream = Vec::new();
        let mut status: BitFlags<EncodeStatus> =
            EncodeStatus::InputUsed | EncodeStatus::OutputAvailable | EncodeStatus::DisplayReady;
        if n == 0 {
            bitstream.extend_from_slice(&[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1f]);
            status |= EncodeStatus::SequenceHeader;
        }
        let nal = if params.force_i_picture || n == 0 { 0x65 } else { 0x41 };
        bitstream.extend_from_slice(&[0, 0, 0, 1, nal]);
        bitstream.extend_from_slice(&n.to_be_bytes());

        let len = bitstream.len().min(output.len());
        output[..len].copy_from_slice(&bitstream[..len]);
        Ok(EncodeOutcome {
            status,
            output_size: len,
        })
    }

    fn reset(&self, _handle: HwHandle) -> HwResult<()> {
        Ok(())
    }

    fn close(&self, _handle: HwHandle) -> HwResult<()> {
        info!("loopback close");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let capability = HardwareCapabilityHandle::new(Arc::new(LoopbackCodec::default()));
    let (sink, mut frames) = ChannelSink::new();
    let settings = EncoderSettings::builder().gop_size(30).bitrate_kbps(2000).build();
    let mut session = EncoderSession::new(capability, PhysMemAllocator::system(), H264Codec::new(), sink, settings)?;

    let info = VideoInfo::new(PixelFormat::I420, 320, 240).with_framerate(30, 1);
    let frame_size = info.size;

    let encoder = tokio::task::spawn_blocking(move || -> imxvpu_enc::Result<()> {
        session.start()?;
        let output = session.set_format(info)?;
        info!("negotiated output: {:?}", output.caps);

        for n in 0..10u32 {
            let picture = vec![(n * 20) as u8; frame_size];
            let mut frame = CodecFrame::new(n, SystemBuffer::new(picture)).with_pts(u64::from(n) * 33_333_333);
            if n == 5 {
                frame = frame.with_keyframe_request(false);
            }
            session.handle_frame(frame)?;
        }

        info!("session stats: {:?}", session.stats());
        session.stop()
    });

    while let Some(frame) = frames.recv().await {
        info!(
            "frame {} pts {:?} keyframe {} -> {} bytes",
            frame.system_frame_number,
            frame.pts,
            frame.sync_point,
            frame.data.as_ref().map_or(0, Vec::len)
        );
    }

    encoder.await??;
    Ok(())
}
