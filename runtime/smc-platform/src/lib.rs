//! Secure Monitor Platform Layer
//!
//! # Purpose
//! Abstracts the two platform services the normal-world communication monitor
//! depends on: the public-to-secure bridge that transfers control into the
//! secure world, and physically-contiguous memory that both worlds can see.
//!
//! # Integration Points
//! - Depends on: board bridge code (SMC instruction wrapper), page allocator
//! - Provides to: `smc-comm` (monitor, shared buffer descriptors)
//! - Secure services: HAL service ids in [`hal`]
//!
//! # Architecture
//! Backends implement [`SecureMonitor`] and [`PhysMemory`]. The `mock` feature
//! (default) provides host implementations in [`mock`] where physical
//! addresses are identity-mapped onto host allocations, so a simulated secure
//! side can follow the same physical pointers the real one would.
//!
//! # Testing Strategy
//! - Unit tests: mock allocator bookkeeping, user page pinning, bridge
//!   argument decoding
//! - Integration tests: driven from `smc-comm`

pub mod hal;
pub mod memory;

#[cfg(feature = "mock")]
pub mod mock;

pub use hal::{EntryFlags, RpcEntry, SecureMonitor};
pub use memory::{align_down, align_up, order_for_size, pages_needed, PageFrame, PhysMemory};

use thiserror::Error;

/// Platform page size in bytes
pub const PAGE_SIZE: usize = 4096;

/// Physical address as seen by the secure world
pub type PhysAddr = usize;

/// Error types for platform operations
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Out of memory (requested: {requested} bytes)")]
    OutOfMemory { requested: usize },

    #[error("Invalid allocation order {0}")]
    InvalidOrder(u32),

    #[error("User range {vaddr:#x} (+{len:#x}) is not mapped")]
    Unmapped { vaddr: usize, len: usize },
}

pub type Result<T> = core::result::Result<T, PlatformError>;
