//! Secure-world RPC dispatcher
//!
//! # Purpose
//! Decodes callbacks issued by the secure side while it runs inside the PA
//! load call and executes the matching normal-world handler on the polling
//! thread.
//!
//! # Architecture
//! Only the SModule RPC family is served. `yield` runs one polling cycle with
//! the crypto hardware lock released, `init` finishes the start sequence,
//! `trace` forwards secure logs, and the crypto commands go to the
//! [`CryptoDelegate`](crate::crypto::CryptoDelegate). Every dispatch ends by
//! making the shared pages coherent for the secure side.

use smc_platform::PAGE_SIZE;

use crate::config::CacheFlushMode;
use crate::layout::protocol_major;
use crate::monitor::{CommState, LifecycleState, MonitorShared};

// RPC families
pub const RPC_ID_SEC_STORAGE: u32 = 0x00;
pub const RPC_ID_DMA: u32 = 0x01;
pub const RPC_ID_SMODULE: u32 = 0x02;

/// RPC return values handed back to the secure side
pub mod status {
    pub const SUCCESS: u32 = 0x0000_0000;
    pub const GENERIC: u32 = 0xFFFF_0000;
    pub const BAD_PARAMETERS: u32 = 0xFFFF_0006;
    pub const OUT_OF_MEMORY: u32 = 0xFFFF_000C;
    pub const CONNECTION_PROTOCOL: u32 = 0xFFFF_3020;
}

/// SModule RPC commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCommand {
    Yield = 0x00,
    Init = 0x01,
    Trace = 0x02,
    CryptoInit = 0x10,
    CryptoUpdate = 0x11,
    CryptoFinal = 0x12,
    CryptoTerminate = 0x13,
    CryptoEnableClock = 0x14,
    CryptoInvalidateSession = 0x15,
}

impl RpcCommand {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0x00 => Self::Yield,
            0x01 => Self::Init,
            0x02 => Self::Trace,
            0x10 => Self::CryptoInit,
            0x11 => Self::CryptoUpdate,
            0x12 => Self::CryptoFinal,
            0x13 => Self::CryptoTerminate,
            0x14 => Self::CryptoEnableClock,
            0x15 => Self::CryptoInvalidateSession,
            _ => return None,
        })
    }
}

impl MonitorShared {
    /// Serve one secure-world RPC
    pub(crate) fn handle_rpc(&self, rpc_id: u32, command: u32, _reserved1: u32, _reserved2: u32) -> u32 {
        if rpc_id != RPC_ID_SMODULE {
            log::error!("rpc: invalid RPC id {:#x} (cmd {:#x}), ignored", rpc_id, command);
            return status::BAD_PARAMETERS;
        }

        let result = match RpcCommand::from_raw(command) {
            Some(RpcCommand::Yield) => {
                // Init is done once the secure side yields; an idle side may
                // park this cycle until the first command arrives.
                self.mark_l1_ready();
                self.hwa.release();
                let result = self.polling_cycle();
                self.hwa.acquire();
                result
            }
            Some(RpcCommand::Init) => {
                let mut state = self.lock_state();
                self.rpc_init(&mut state)
            }
            Some(RpcCommand::Trace) => {
                let state = self.lock_state();
                if let Some(channel) = state.channel.as_ref() {
                    log::info!(target: "smc::secure", "{}", channel.l0.trace_message());
                }
                status::SUCCESS
            }
            Some(RpcCommand::CryptoInvalidateSession) => {
                self.crypto().invalidate_session();
                status::SUCCESS
            }
            Some(op) => self.forward_crypto(op),
            None => {
                log::error!("rpc: invalid RPC command {:#x}", command);
                status::BAD_PARAMETERS
            }
        };

        self.flush_shared_buffers();
        result
    }

    /// Release the one-shot PA buffers and check the protocol version
    pub(crate) fn rpc_init(&self, state: &mut CommState) -> u32 {
        if let Some(pa) = state.pa.take() {
            log::debug!("rpc: PA buffers released");
            pa.release(&*self.memory);
        }

        let Some(channel) = state.channel.as_ref() else {
            log::error!("rpc: init without a started channel");
            return status::GENERIC;
        };
        let version = channel.l0.protocol_version();
        let major = protocol_major(version);
        if major != self.config.protocol_major_version {
            log::error!(
                "rpc: unsupported protocol major version {:#04x}, expected {:#04x}",
                major,
                self.config.protocol_major_version
            );
            return status::CONNECTION_PROTOCOL;
        }
        log::info!("rpc: secure protocol version {:#010x}", version);
        status::SUCCESS
    }

    fn forward_crypto(&self, op: RpcCommand) -> u32 {
        let Some(l0) = self.lock_state().channel.as_ref().map(|c| c.l0) else {
            return status::GENERIC;
        };
        // SAFETY: the secure side is suspended in this RPC and only the
        // polling thread touches L0 while the channel is up.
        let page = unsafe { l0.bytes_mut() };
        let mut crypto = self.crypto();
        match op {
            RpcCommand::CryptoInit => crypto.init(page),
            RpcCommand::CryptoUpdate => crypto.update(page),
            RpcCommand::CryptoFinal => crypto.finalize(page),
            RpcCommand::CryptoTerminate => crypto.terminate(page),
            RpcCommand::CryptoEnableClock => crypto.enable_clock(page),
            other => {
                log::error!("rpc: {:?} is not a crypto command", other);
                status::BAD_PARAMETERS
            }
        }
    }

    /// Make L0/L1 coherent for the secure side
    pub(crate) fn flush_shared_buffers(&self) {
        let state = self.lock_state();
        match self.config.cache_flush {
            CacheFlushMode::Full => self.platform.flush_cache_all(),
            CacheFlushMode::SharedRanges => {
                if let Some(channel) = state.channel.as_ref() {
                    self.platform.flush_cache_range(channel.l0.vaddr(), PAGE_SIZE);
                    self.platform.flush_cache_range(channel.ring.vaddr(), PAGE_SIZE);
                }
            }
        }
    }

    fn mark_l1_ready(&self) {
        self.set_l1_ready();
        let mut state = self.lock_state();
        if state.lifecycle == LifecycleState::Started {
            state.lifecycle = LifecycleState::Active;
        }
    }
}
