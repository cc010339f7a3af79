//! Error types for monitor operations

use smc_platform::PlatformError;
use thiserror::Error;

use crate::layout::PowerMode;

/// Error types for monitor operations
#[derive(Debug, Error)]
pub enum CommError {
    #[error("Out of memory (requested: {requested} bytes)")]
    OutOfMemory { requested: usize },

    #[error("Communication monitor already started")]
    AlreadyStarted,

    #[error("Communication monitor not started")]
    NotStarted,

    #[error("Communication monitor terminated")]
    Terminated,

    #[error("Polling thread still running")]
    StillRunning,

    #[error("Another monitor is already registered for secure RPC")]
    AlreadyRegistered,

    #[error("{name} is {actual} bytes, expected one page ({expected} bytes)")]
    LayoutMismatch {
        name: &'static str,
        actual: usize,
        expected: usize,
    },

    #[error("System properties too large ({len} bytes, capacity {capacity})")]
    PropertiesTooLarge { len: usize, capacity: usize },

    #[error("Secure HAL service {service} failed with status {status:#x}")]
    HalCall { service: &'static str, status: u32 },

    #[error("Interrupted by termination signal")]
    Interrupted,

    #[error("Message rejected by connection state")]
    MessageRejected,

    #[error("Channel closed while waiting for an answer")]
    ChannelClosed,

    #[error("Power operation not permitted in state {0:?}")]
    NotPermitted(PowerMode),

    #[error("Unsupported power operation {0:#x}")]
    UnsupportedPowerOperation(u32),

    #[error("Shared buffer is not physically contiguous")]
    NotContiguous,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Failed to spawn polling thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}

pub type Result<T> = core::result::Result<T, CommError>;
