//! Process-wide monitor handle behind the fixed RPC entry
//!
//! The secure world calls back through a plain function pointer with no
//! context argument, so exactly one monitor can be reachable at a time. It is
//! registered when the monitor is built and cleared on terminate.

use std::sync::{Arc, RwLock};

use crate::error::{CommError, Result};
use crate::monitor::MonitorShared;
use crate::rpc::status;

static MONITOR: RwLock<Option<Arc<MonitorShared>>> = RwLock::new(None);

pub(crate) fn register(shared: &Arc<MonitorShared>) -> Result<()> {
    let mut slot = MONITOR.write().unwrap_or_else(|p| p.into_inner());
    if slot.is_some() {
        return Err(CommError::AlreadyRegistered);
    }
    *slot = Some(Arc::clone(shared));
    Ok(())
}

/// Clear the handle if it still refers to `shared`
pub(crate) fn unregister(shared: &Arc<MonitorShared>) -> bool {
    let mut slot = MONITOR.write().unwrap_or_else(|p| p.into_inner());
    match slot.as_ref() {
        Some(current) if Arc::ptr_eq(current, shared) => {
            *slot = None;
            true
        }
        _ => false,
    }
}

pub(crate) fn current() -> Option<Arc<MonitorShared>> {
    MONITOR.read().unwrap_or_else(|p| p.into_inner()).clone()
}

/// RPC entry installed in the secure world
///
/// Runs on the polling thread while the secure side is suspended in the PA
/// load call.
pub extern "C" fn rpc_handler(rpc_id: u32, command: u32, reserved1: u32, reserved2: u32) -> u32 {
    match current() {
        Some(monitor) => monitor.handle_rpc(rpc_id, command, reserved1, reserved2),
        None => {
            log::error!(
                "rpc: no registered monitor for RPC id={:#x} cmd={:#x}",
                rpc_id,
                command
            );
            status::GENERIC
        }
    }
}

/// Interrupt-return hook: drain answers and refresh the clock
pub fn return_from_irq() {
    if let Some(monitor) = current() {
        monitor.return_from_irq();
    }
}
