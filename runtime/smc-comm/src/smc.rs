//! Secure HAL calls: parameter-block dispatcher and one-time SDP provisioning

use core::mem::size_of;

use smc_platform::hal::{
    self, EntryFlags, RpcEntry, API_HAL_APPL_ID, API_HAL_RET_OK, API_HAL_SDP_RUNTIME_INIT_ERROR,
    MAX_HAL_ARGS,
};
use smc_platform::{PhysAddr, PhysMemory, SecureMonitor};

use crate::config::{MonitorConfig, SdpAddresses};
use crate::error::{CommError, Result};

const PARAM_BLOCK_SIZE: usize = (1 + MAX_HAL_ARGS) * size_of::<usize>();

/// Call a HAL service with up to four argument words
///
/// The block `[n_args, a1..a4]` lives in physically-contiguous memory for the
/// duration of the call; caches are flushed before entering the secure world.
pub fn dispatch(
    platform: &dyn SecureMonitor,
    memory: &dyn PhysMemory,
    proc_id: u32,
    flags: EntryFlags,
    args: &[usize],
) -> Result<u32> {
    assert!(args.len() <= MAX_HAL_ARGS, "too many HAL arguments: {}", args.len());
    log::debug!(
        "smc: dispatch {} flags={:?} args={:x?}",
        hal::service_name(proc_id),
        flags,
        args
    );

    let block = memory.alloc(PARAM_BLOCK_SIZE)?;
    let words = block as *mut usize;
    // SAFETY: `block` is a fresh allocation of PARAM_BLOCK_SIZE bytes.
    unsafe {
        words.write(args.len());
        for (i, arg) in args.iter().enumerate() {
            words.add(i + 1).write(*arg);
        }
    }

    platform.flush_cache_all();
    let status = platform.bridge_entry(API_HAL_APPL_ID, proc_id, flags, memory.virt_to_phys(block));
    memory.free(block, PARAM_BLOCK_SIZE);

    log::debug!("smc: {} returned {:#x}", hal::service_name(proc_id), status);
    Ok(status)
}

fn expect_ok(proc_id: u32, status: u32) -> Result<()> {
    if status == API_HAL_RET_OK {
        Ok(())
    } else {
        Err(CommError::HalCall {
            service: hal::service_name(proc_id),
            status,
        })
    }
}

/// Provision the SDP runtime and install the RPC entry
///
/// CRC read (logged), secure RAM resize, SDP runtime start and RPC handler
/// installation, in that order. An SDP runtime already launched by an earlier
/// stage is accepted.
pub fn sdp_init(
    platform: &dyn SecureMonitor,
    memory: &dyn PhysMemory,
    config: &MonitorConfig,
    sdp: SdpAddresses,
    rpc_entry: RpcEntry,
) -> Result<()> {
    let crc = dispatch(platform, memory, hal::API_HAL_KM_CRC_READ, EntryFlags::empty(), &[])?;
    log::info!("smc: secure CRC {:#010x}", crc);

    let critical = EntryFlags::FIQ_ENABLE | EntryFlags::START_HAL_CRITICAL;
    let status = dispatch(
        platform,
        memory,
        hal::API_HAL_SEC_RAM_RESIZE,
        critical,
        &[config.sec_ram_size as usize],
    )?;
    expect_ok(hal::API_HAL_SEC_RAM_RESIZE, status)?;
    log::debug!("smc: secure RAM resized to {:#x}", config.sec_ram_size);

    log::info!(
        "smc: SDP runtime init (backing store {:#x}, ext store {:#x})",
        sdp.backing_store,
        sdp.back_ext_storage
    );
    let status = dispatch(
        platform,
        memory,
        hal::API_HAL_SDP_RUNTIME_INIT,
        critical,
        &[sdp.backing_store as usize, sdp.back_ext_storage as usize],
    )?;
    if status == API_HAL_SDP_RUNTIME_INIT_ERROR {
        log::info!("smc: SDP runtime already launched");
    } else {
        expect_ok(hal::API_HAL_SDP_RUNTIME_INIT, status)?;
    }

    let status = dispatch(
        platform,
        memory,
        hal::API_HAL_SEC_RPC_INIT,
        EntryFlags::START_HAL_CRITICAL,
        &[rpc_entry as usize],
    )?;
    expect_ok(hal::API_HAL_SEC_RPC_INIT, status)
}

/// Direction of a secure context transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextDirection {
    Restore = 0,
    Save = 1,
}

/// Move the secure RAM context to or from `phys_addr` via the reserved DMA channels
pub fn context_save_restore(
    platform: &dyn SecureMonitor,
    memory: &dyn PhysMemory,
    phys_addr: PhysAddr,
    direction: ContextDirection,
) -> Result<()> {
    let status = dispatch(
        platform,
        memory,
        hal::API_HAL_CONTEXT_SAVE_RESTORE,
        EntryFlags::START_HAL_CRITICAL,
        &[
            phys_addr,
            hal::CONTEXT_SAVE_DMA_CHANNEL_0,
            hal::CONTEXT_SAVE_DMA_CHANNEL_1,
            direction as usize,
        ],
    )?;
    match expect_ok(hal::API_HAL_CONTEXT_SAVE_RESTORE, status) {
        Ok(()) => {
            log::info!("smc: context {:?} OK at {:#x}", direction, phys_addr);
            Ok(())
        }
        Err(e) => {
            log::error!("smc: context {:?} failed at {:#x}: {}", direction, phys_addr, e);
            Err(e)
        }
    }
}
