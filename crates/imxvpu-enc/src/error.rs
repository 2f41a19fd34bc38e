//! Error types for encoder operations
//!
//! Provides typed errors that library users can match and handle
//! specifically. [`EncoderError::kind`] folds them into the four classes
//! a pipeline reacts to.

use std::time::Duration;

use imxvpu_mem::MemError;
use thiserror::Error;

use crate::hardware::HwError;

/// Broad classes of encoder failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Memory or buffer allocation failed
    ResourceExhausted,
    /// The hardware returned a non-success code
    HardwareRejected,
    /// Programmer error, e.g. an operation issued in the wrong state
    PreconditionViolation,
    /// Settings out of range
    InvalidConfig,
    /// The downstream consumer refused a finished frame
    Downstream,
}

/// Errors from the physical buffer pool
#[derive(Error, Debug)]
pub enum PoolError {
    /// The pool is not active (never activated, or deactivated while waiting)
    #[error("Buffer pool is not active")]
    Inactive,

    /// No buffer was released within the timeout
    #[error("Timed out after {0:?} waiting for a free buffer")]
    Timeout(Duration),

    /// Pool configuration rejected
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// Backing memory could not be allocated
    #[error("Buffer allocation failed: {0}")]
    Allocation(#[from] MemError),
}

/// Errors that can occur while running an encoder session
///
/// # Examples
///
/// ```no_run
/// # use imxvpu_enc::{EncoderError, ErrorKind};
/// # fn example(result: Result<(), EncoderError>) {
/// match result {
///     Ok(()) => {}
///     Err(e) if e.kind() == ErrorKind::ResourceExhausted => {
///         eprintln!("out of VPU memory: {}", e);
///     }
///     Err(e) => eprintln!("encoder failed: {}", e),
/// }
/// # }
/// ```
#[derive(Error, Debug)]
pub enum EncoderError {
    /// Loading the hardware capability failed
    #[error("Failed to load hardware capability: {0}")]
    CapabilityLoad(#[source] HwError),

    /// Memory for a named purpose could not be allocated
    #[error("Could not allocate {what}: {source}")]
    Allocation {
        what: &'static str,
        #[source]
        source: MemError,
    },

    /// Memory could not be handed back to its backend
    #[error("Failed to release {what}: {source}")]
    Release {
        what: &'static str,
        #[source]
        source: MemError,
    },

    /// Buffer pool failure
    #[error("Buffer pool failure: {0}")]
    Pool(#[from] PoolError),

    /// The hardware rejected an operation
    #[error("Hardware rejected {operation}: {source}")]
    Hardware {
        operation: &'static str,
        #[source]
        source: HwError,
    },

    /// The hardware refused the framebuffer set
    #[error("Framebuffer registration failed: {0}")]
    FramebufferRegistration(#[source] HwError),

    /// A framebuffer set may only be registered once
    #[error("Framebuffers are already registered")]
    AlreadyRegistered,

    /// All framebuffers are held by the hardware or by buffers
    #[error("No framebuffer available")]
    NoFramebufferAvailable,

    /// Operation issued in a state that does not allow it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Settings rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The frame consumer is gone or refused the frame
    #[error("Downstream rejected frame: {0}")]
    Downstream(String),
}

/// Result type for encoder operations
pub type Result<T> = std::result::Result<T, EncoderError>;

impl EncoderError {
    /// Class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Allocation { .. }
            | Self::Release { .. }
            | Self::FramebufferRegistration(_)
            | Self::NoFramebufferAvailable => ErrorKind::ResourceExhausted,
            Self::Pool(PoolError::InvalidConfig(_)) => ErrorKind::InvalidConfig,
            Self::Pool(PoolError::Inactive) => ErrorKind::PreconditionViolation,
            Self::Pool(_) => ErrorKind::ResourceExhausted,
            Self::CapabilityLoad(_) | Self::Hardware { .. } => ErrorKind::HardwareRejected,
            Self::AlreadyRegistered | Self::InvalidState(_) => ErrorKind::PreconditionViolation,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::Downstream(_) => ErrorKind::Downstream,
        }
    }

    /// Create an allocation error
    pub(crate) fn resource_exhausted(what: &'static str, source: MemError) -> Self {
        Self::Allocation { what, source }
    }

    /// Create a hardware error
    pub(crate) fn hardware(operation: &'static str, source: HwError) -> Self {
        Self::Hardware { operation, source }
    }

    /// Create an invalid state error
    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a downstream error
    pub fn downstream(msg: impl Into<String>) -> Self {
        Self::Downstream(msg.into())
    }
}
