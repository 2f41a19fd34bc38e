//! Scripted hardware capability for unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use enumflags2::BitFlags;
use imxvpu_mem::MemoryKind;
use parking_lot::Mutex;

use crate::hardware::{
    BlockDescriptor, ConfigKey, EncodeOutcome, EncodeParams, EncodeStatus, FramebufferDesc, HardwareCodec,
    HwError, HwHandle, HwResult, InitInfo, OpenParams, RetCode, VersionInfo, WorkMemoryBlock,
};

/// One scripted `encode_frame` result
#[derive(Debug, Clone)]
pub(crate) struct EncodeStep {
    pub(crate) status: BitFlags<EncodeStatus>,
    pub(crate) payload: Vec<u8>,
}

/// Records every call and replays scripted encode results
///
/// With an empty script each `encode_frame` call completes the frame in one
/// go with a small payload.
#[derive(Debug)]
pub(crate) struct MockHardware {
    calls: Mutex<Vec<&'static str>>,
    failures: Mutex<HashMap<&'static str, RetCode>>,
    work_memory: Mutex<Vec<BlockDescriptor>>,
    script: Mutex<VecDeque<EncodeStep>>,
    next_handle: Mutex<u64>,
    pub(crate) opened: Mutex<Vec<(Vec<WorkMemoryBlock>, OpenParams)>>,
    pub(crate) configured: Mutex<Vec<ConfigKey>>,
    pub(crate) encoded: Mutex<Vec<EncodeParams>>,
    pub(crate) registered: Mutex<Vec<(usize, usize)>>,
    init_info: InitInfo,
}

pub(crate) const DEFAULT_PAYLOAD: &[u8] = b"encoded";

impl MockHardware {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            work_memory: Mutex::new(vec![
                BlockDescriptor {
                    kind: MemoryKind::CpuVisible,
                    size: 1024,
                    alignment: 8,
                },
                BlockDescriptor {
                    kind: MemoryKind::HardwareVisible,
                    size: 4096,
                    alignment: 512,
                },
            ]),
            script: Mutex::new(VecDeque::new()),
            next_handle: Mutex::new(1),
            opened: Mutex::new(Vec::new()),
            configured: Mutex::new(Vec::new()),
            encoded: Mutex::new(Vec::new()),
            registered: Mutex::new(Vec::new()),
            init_info: InitInfo {
                min_framebuffer_count: 2,
                address_alignment: 16,
            },
        })
    }

    /// Number of calls to `name`
    pub(crate) fn count(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|&&call| call == name).count()
    }

    /// Make the next call to `name` fail with `code`
    pub(crate) fn fail_next(&self, name: &'static str, code: RetCode) {
        self.failures.lock().insert(name, code);
    }

    pub(crate) fn set_work_memory(&self, blocks: Vec<BlockDescriptor>) {
        *self.work_memory.lock() = blocks;
    }

    pub(crate) fn push_encode(&self, status: impl Into<BitFlags<EncodeStatus>>, payload: &[u8]) {
        self.script.lock().push_back(EncodeStep {
            status: status.into(),
            payload: payload.to_vec(),
        });
    }

    pub(crate) fn last_encode(&self) -> Option<EncodeParams> {
        self.encoded.lock().last().cloned()
    }

    fn enter(&self, name: &'static str) -> HwResult<()> {
        self.calls.lock().push(name);
        match self.failures.lock().remove(name) {
            Some(code) => Err(HwError::new(code)),
            None => Ok(()),
        }
    }
}

impl HardwareCodec for MockHardware {
    fn load(&self) -> HwResult<()> {
        self.enter("load")
    }

    fn unload(&self) -> HwResult<()> {
        self.enter("unload")
    }

    fn version_info(&self) -> HwResult<VersionInfo> {
        self.enter("version_info")?;
        Ok(VersionInfo {
            firmware: "3.1.1".into(),
            library: "5.4.0".into(),
            wrapper: "1.0.0".into(),
        })
    }

    fn query_work_memory(&self) -> HwResult<Vec<BlockDescriptor>> {
        self.enter("query_work_memory")?;
        Ok(self.work_memory.lock().clone())
    }

    fn open(&self, work_memory: &[WorkMemoryBlock], params: &OpenParams) -> HwResult<HwHandle> {
        self.enter("open")?;
        self.opened.lock().push((work_memory.to_vec(), params.clone()));
        let mut next = self.next_handle.lock();
        let handle = HwHandle(*next);
        *next += 1;
        Ok(handle)
    }

    fn configure(&self, _handle: HwHandle, key: ConfigKey) -> HwResult<()> {
        self.enter("configure")?;
        self.configured.lock().push(key);
        Ok(())
    }

    fn initial_info(&self, _handle: HwHandle) -> HwResult<InitInfo> {
        self.enter("initial_info")?;
        Ok(self.init_info)
    }

    fn register_framebuffers(
        &self,
        _handle: HwHandle,
        framebuffers: &[FramebufferDesc],
        src_stride: usize,
    ) -> HwResult<()> {
        self.enter("register_framebuffers")?;
        self.registered.lock().push((framebuffers.len(), src_stride));
        Ok(())
    }

    fn encode_frame(&self, _handle: HwHandle, params: &EncodeParams, output: &mut [u8]) -> HwResult<EncodeOutcome> {
        self.enter("encode_frame")?;
        self.encoded.lock().push(params.clone());

        let step = self.script.lock().pop_front().unwrap_or_else(|| EncodeStep {
            status: EncodeStatus::InputUsed | EncodeStatus::OutputAvailable | EncodeStatus::DisplayReady,
            payload: DEFAULT_PAYLOAD.to_vec(),
        });
        let len = step.payload.len().min(output.len());
        output[..len].copy_from_slice(&step.payload[..len]);

        Ok(EncodeOutcome {
            status: step.status,
            output_size: len,
        })
    }

    fn notify_frame_displayed(
        &self,
        _handle: HwHandle,
        _framebuffer: imxvpu_mem::FramebufferHandle,
    ) -> HwResult<()> {
        self.enter("notify_frame_displayed")
    }

    fn reset(&self, _handle: HwHandle) -> HwResult<()> {
        self.enter("reset")
    }

    fn close(&self, _handle: HwHandle) -> HwResult<()> {
        self.enter("close")
    }
}
