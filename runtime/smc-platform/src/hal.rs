//! Secure HAL services reachable through the public-to-secure bridge

use bitflags::bitflags;

use crate::PhysAddr;

/// Application id used for every HAL service call
pub const API_HAL_APPL_ID: u32 = 0;

// HAL service (procedure) ids
pub const API_HAL_PA_LOAD: u32 = 15;
pub const API_HAL_PA_UNLOAD_ALL: u32 = 17;
pub const API_HAL_SDP_RUNTIME_INIT: u32 = 19;
pub const API_HAL_SEC_RPC_INIT: u32 = 21;
pub const API_HAL_CONTEXT_SAVE_RESTORE: u32 = 25;
pub const API_HAL_SEC_RAM_RESIZE: u32 = 26;
pub const API_HAL_KM_CRC_READ: u32 = 34;

// HAL return codes
pub const API_HAL_RET_OK: u32 = 0;
/// SDP runtime was already launched by an earlier boot stage
pub const API_HAL_SDP_RUNTIME_INIT_ERROR: u32 = 0x20;

/// Secure RAM size requested before the SDP runtime starts
pub const SEC_RAM_SIZE_60KB: u32 = 0xF000;

// DMA channels reserved for secure context save/restore
pub const CONTEXT_SAVE_DMA_CHANNEL_0: usize = 0x1E;
pub const CONTEXT_SAVE_DMA_CHANNEL_1: usize = 0x1F;

/// Maximum number of argument words in a dispatcher parameter block
pub const MAX_HAL_ARGS: usize = 4;

bitflags! {
    /// Interrupt and criticality flags for a secure entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EntryFlags: u32 {
        const FIQ_ENABLE = 0x1;
        const IRQ_ENABLE = 0x2;
        const START_HAL_CRITICAL = 0x4;
    }
}

/// Fixed-signature RPC callback installed with `API_HAL_SEC_RPC_INIT`
///
/// Arguments are `(rpc_id, command, reserved1, reserved2)`; the return value is
/// an RPC status word handed back to the secure side.
pub type RpcEntry = extern "C" fn(u32, u32, u32, u32) -> u32;

/// Public-to-secure bridge and cache maintenance
///
/// The parameter block at `args` is a physically-contiguous array of words
/// `[n_args, a1, .., an]`. The caller flushes caches before entering.
pub trait SecureMonitor: Send + Sync {
    /// Transfer control to the secure world; returns the HAL status
    fn bridge_entry(&self, appl_id: u32, proc_id: u32, flags: EntryFlags, args: PhysAddr) -> u32;

    /// Clean and invalidate the whole data cache
    fn flush_cache_all(&self);

    /// Clean and invalidate `[vaddr, vaddr + len)`
    fn flush_cache_range(&self, vaddr: usize, len: usize);
}

/// Human-readable HAL service name for logs
pub fn service_name(proc_id: u32) -> &'static str {
    match proc_id {
        API_HAL_PA_LOAD => "PA_LOAD",
        API_HAL_PA_UNLOAD_ALL => "PA_UNLOAD_ALL",
        API_HAL_SDP_RUNTIME_INIT => "SDP_RUNTIME_INIT",
        API_HAL_SEC_RPC_INIT => "SEC_RPC_INIT",
        API_HAL_CONTEXT_SAVE_RESTORE => "CONTEXT_SAVE_RESTORE",
        API_HAL_SEC_RAM_RESIZE => "SEC_RAM_RESIZE",
        API_HAL_KM_CRC_READ => "KM_CRC_READ",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pa_load_flags() {
        let flags = EntryFlags::IRQ_ENABLE | EntryFlags::FIQ_ENABLE | EntryFlags::START_HAL_CRITICAL;
        assert_eq!(flags.bits(), 0x7);
    }

    #[test]
    fn test_service_names() {
        assert_eq!(service_name(API_HAL_PA_LOAD), "PA_LOAD");
        assert_eq!(service_name(API_HAL_KM_CRC_READ), "KM_CRC_READ");
        assert_eq!(service_name(99), "UNKNOWN");
    }
}
