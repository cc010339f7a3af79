//! Secure World Communication Monitor
//!
//! # Purpose
//! Normal-world side of the channel to a TrustZone secure world. Client
//! threads send commands through a ring in shared memory and block on their
//! answers; a dedicated polling thread hands control to the secure side and
//! serves the RPCs it issues while there.
//!
//! # Integration Points
//! - Depends on: `smc-platform` (secure bridge, physical memory)
//! - Provides to: client drivers through [`CommMonitor`] and [`Connection`]
//! - Secure callbacks: [`rpc_handler`] (fixed C signature) and
//!   [`return_from_irq`]
//!
//! # Architecture
//! - [`layout`]: byte-exact L0/L1 shared page layouts and message slots
//! - [`ring`]: command/answer rings and seqlock clock/timeout registers
//! - [`correlation`]: generation-checked tokens routing answers to callers
//! - [`poll`]: polling engine run inside the PA load call
//! - [`rpc`]: dispatcher for secure-world callbacks
//! - [`monitor`]: lifecycle, power management and send paths
//! - [`shmem`]: physically-contiguous client buffer descriptors
//!
//! # Testing Strategy
//! - Unit tests: ring counters and wraparound, torn-read stress on the
//!   timeout register, token reuse, timeout classification, buffer policy
//! - Integration tests: full start/send/shutdown cycles against the simulated
//!   secure peer in [`sim`]
//! - Benchmarks: ring enqueue/drain throughput (`benches/ring.rs`)

pub mod config;
pub mod connection;
pub mod correlation;
pub mod crypto;
pub mod error;
pub mod layout;
pub mod monitor;
pub mod poll;
mod registry;
pub mod ring;
pub mod rpc;
pub mod shmem;
pub mod signal;
pub mod smc;
pub mod timeout;

#[cfg(feature = "mock")]
pub mod sim;

pub use config::{CacheFlushMode, MonitorConfig, SdpAddresses};
pub use connection::{Connection, ConnectionContext, DeviceContextState};
pub use correlation::{CompensationRule, DestroyOrphanedDeviceContext, Token};
pub use crypto::{CryptoDelegate, NullCrypto};
pub use error::{CommError, Result};
pub use layout::{AnswerMessage, CommandMessage, MessageType, PowerMode};
pub use monitor::{CommMonitor, LifecycleState, MonitorBuilder, MonitorFlags, PowerOperation, RetryHook};
pub use poll::EngineState;
pub use registry::{return_from_irq, rpc_handler};
pub use shmem::{ShmemDescriptor, ShmemFlags, SharedMemoryMonitor};
pub use signal::KillSwitch;
