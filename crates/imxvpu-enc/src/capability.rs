//! Reference-counted access to the hardware capability
//!
//! The capability is loaded when the first session starts and unloaded when
//! the last one stops. One [`HardwareCapabilityHandle`] is shared by every
//! session of a process; sessions receive it at construction.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{EncoderError, Result};
use crate::hardware::HardwareCodec;

/// Shared, reference-counted hardware capability
pub struct HardwareCapabilityHandle {
    hardware: Arc<dyn HardwareCodec>,
    refs: Mutex<usize>,
}

impl HardwareCapabilityHandle {
    pub fn new(hardware: Arc<dyn HardwareCodec>) -> Arc<Self> {
        Arc::new(Self {
            hardware,
            refs: Mutex::new(0),
        })
    }

    /// The capability itself
    pub fn hardware(&self) -> Arc<dyn HardwareCodec> {
        Arc::clone(&self.hardware)
    }

    /// Take a reference, loading the capability on the first one
    ///
    /// On load the capability versions are queried and logged. If that query
    /// fails the capability is unloaded again and no reference is taken.
    pub fn acquire_ref(&self) -> Result<()> {
        let mut refs = self.refs.lock();

        if *refs == 0 {
            info!("Loading VPU encoder capability");
            self.hardware.load().map_err(|e| {
                error!("Loading VPU encoder capability failed: {}", e);
                EncoderError::CapabilityLoad(e)
            })?;

            match self.hardware.version_info() {
                Ok(version) => {
                    info!(
                        "VPU firmware version {}, library version {}, wrapper version {}",
                        version.firmware, version.library, version.wrapper
                    );
                }
                Err(e) => {
                    error!("Querying VPU version information failed: {}", e);
                    if let Err(unload_err) = self.hardware.unload() {
                        warn!("Unloading VPU encoder capability failed: {}", unload_err);
                    }
                    return Err(EncoderError::CapabilityLoad(e));
                }
            }
        }

        *refs += 1;
        debug!("VPU encoder capability reference count: {}", *refs);
        Ok(())
    }

    /// Drop a reference, unloading the capability with the last one
    ///
    /// Releasing with no references held does nothing.
    pub fn release_ref(&self) {
        let mut refs = self.refs.lock();

        if *refs == 0 {
            warn!("Releasing VPU encoder capability with no references held");
            return;
        }

        *refs -= 1;
        debug!("VPU encoder capability reference count: {}", *refs);

        if *refs == 0 {
            info!("Unloading VPU encoder capability");
            if let Err(e) = self.hardware.unload() {
                error!("Unloading VPU encoder capability failed: {}", e);
            }
        }
    }

    /// Current number of references
    pub fn ref_count(&self) -> usize {
        *self.refs.lock()
    }
}

impl std::fmt::Debug for HardwareCapabilityHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareCapabilityHandle")
            .field("refs", &*self.refs.lock())
            .finish_non_exhaustive()
    }
}
