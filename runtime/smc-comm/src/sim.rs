//! Simulated secure peer for host testing
//!
//! [`SecurePeer`] is a [`PaProgram`] for the mock secure monitor. It runs on
//! the polling thread inside the PA load call, like the real secure world:
//! it checks the SMC init request, reports its protocol version through the
//! `init` RPC, then serves the command ring and yields back to the normal
//! world until it receives the prepare-shutdown command.

use core::ptr;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use smc_platform::hal::{RpcEntry, API_HAL_RET_OK};
use smc_platform::mock::{MockSecureMonitor, PaLoad, PaProgram};
use smc_platform::PhysMemory;

use crate::layout::{
    status, AnswerMessage, CommandMessage, L0Page, MessageType, PaInfo, PowerMode, L0_L1_STATUS_OFFSET,
    L0_PROTOCOL_VERSION_OFFSET, L0_TRACE_CAPACITY, L0_TRACE_OFFSET, L1_COMMAND_SMC_INIT,
    OPERATION_ID_NONE, PM_PREPARE_SHUTDOWN, PROTOCOL_VERSION, TIME_INFINITE,
};
use crate::ring::SecureRingView;
use crate::rpc::{self, RpcCommand, RPC_ID_SMODULE};
use crate::signal::lock;

/// PA load status when no RPC entry was installed
pub const PA_LOAD_NO_RPC: u32 = 0x0000_0001;

/// Base of the device context handles handed out by the peer
pub const DEVICE_CONTEXT_BASE: u32 = 0x1000;

/// Custom answer producer; the operation id is filled in by the peer
pub type Responder = Box<dyn FnMut(&CommandMessage) -> AnswerMessage + Send>;

/// What the peer has seen so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub commands: usize,
    pub answers: usize,
    pub yields: usize,
    pub init_status: Option<u32>,
    /// Results of the extra RPCs, in issue order
    pub rpc_results: Vec<u32>,
    pub live_device_contexts: u32,
    pub shutdown_received: bool,
}

/// Live controls shared between a test and the running peer
#[derive(Debug, Default)]
pub struct PeerControl {
    hold_commands: AtomicBool,
    hold_answers: AtomicBool,
    reverse_answers: AtomicBool,
    stats: Mutex<PeerStats>,
}

impl PeerControl {
    /// Stop consuming the command ring
    pub fn hold_commands(&self, hold: bool) {
        self.hold_commands.store(hold, Ordering::SeqCst);
    }

    /// Keep produced answers back instead of publishing them
    pub fn hold_answers(&self, hold: bool) {
        self.hold_answers.store(hold, Ordering::SeqCst);
    }

    /// Publish pending answers newest first
    pub fn reverse_answers(&self, reverse: bool) {
        self.reverse_answers.store(reverse, Ordering::SeqCst);
    }

    pub fn stats(&self) -> PeerStats {
        lock(&self.stats).clone()
    }

    fn update(&self, f: impl FnOnce(&mut PeerStats)) {
        f(&mut lock(&self.stats));
    }
}

/// Secure-side PA program speaking the L0/L1 protocol
pub struct SecurePeer {
    protocol_version: u32,
    responder: Option<Responder>,
    trace: Option<String>,
    extra_rpcs: Vec<(u32, u32)>,
    control: Arc<PeerControl>,
    next_context: u32,
}

impl Default for SecurePeer {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurePeer {
    pub fn new() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            responder: None,
            trace: None,
            extra_rpcs: Vec::new(),
            control: Arc::new(PeerControl::default()),
            next_context: 0,
        }
    }

    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_responder(mut self, responder: impl FnMut(&CommandMessage) -> AnswerMessage + Send + 'static) -> Self {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Emit `message` through the trace RPC after init
    pub fn with_trace(mut self, message: &str) -> Self {
        self.trace = Some(message.to_owned());
        self
    }

    /// Issue `(rpc_id, command)` callbacks after init, recording their results
    pub fn with_rpc_calls(mut self, calls: &[(u32, u32)]) -> Self {
        self.extra_rpcs.extend_from_slice(calls);
        self
    }

    pub fn control(&self) -> Arc<PeerControl> {
        Arc::clone(&self.control)
    }

    /// Install as the program run by the PA load call
    pub fn install(self, platform: &MockSecureMonitor) -> Arc<PeerControl> {
        let control = self.control();
        platform.set_pa_program(self);
        control
    }

    fn answer(&mut self, cmd: &CommandMessage) -> AnswerMessage {
        let kind = cmd.kind();
        let mut context = None;
        match kind {
            Some(MessageType::CreateDeviceContext) => {
                self.next_context += 1;
                context = Some(DEVICE_CONTEXT_BASE + self.next_context);
                self.control.update(|s| s.live_device_contexts += 1);
            }
            Some(MessageType::DestroyDeviceContext) => {
                self.control
                    .update(|s| s.live_device_contexts = s.live_device_contexts.saturating_sub(1));
            }
            _ => {}
        }

        if let Some(responder) = self.responder.as_mut() {
            let mut answer = responder(cmd);
            answer.operation_id = cmd.operation_id;
            return answer;
        }
        let mut answer = AnswerMessage::new(
            kind.unwrap_or(MessageType::InvokeClientCommand),
            cmd.operation_id,
            if kind.is_some() { status::S_SUCCESS } else { status::S_ERROR_BAD_STATE },
        );
        answer.message_type = cmd.message_type;
        answer.body[0] = context.unwrap_or(cmd.body[0]);
        answer
    }

    fn write_trace(l0: &L0Page, message: &str) {
        let bytes = message.as_bytes();
        let n = bytes.len().min(L0_TRACE_CAPACITY - 1);
        // SAFETY: the normal world is suspended in this PA load call.
        let page = unsafe { l0.bytes_mut() };
        page[L0_TRACE_OFFSET..L0_TRACE_OFFSET + n].copy_from_slice(&bytes[..n]);
        page[L0_TRACE_OFFSET + n] = 0;
    }

    fn serve(&mut self, entry: RpcEntry, l0: &L0Page, ring: SecureRingView) -> u32 {
        let mut outbox: VecDeque<AnswerMessage> = VecDeque::new();
        loop {
            if !self.control.hold_commands.load(Ordering::SeqCst) {
                while let Some(cmd) = ring.pop_command() {
                    self.control.update(|s| s.commands += 1);
                    if cmd.kind() == Some(MessageType::PowerManagement) && cmd.body[0] == PM_PREPARE_SHUTDOWN {
                        ring.set_power_mode(PowerMode::ReadyToShutdown);
                        l0.write_u32(L0_L1_STATUS_OFFSET, status::S_SUCCESS);
                        self.control.update(|s| s.shutdown_received = true);
                        return API_HAL_RET_OK;
                    }
                    let answer = self.answer(&cmd);
                    if cmd.operation_id != OPERATION_ID_NONE {
                        outbox.push_back(answer);
                    }
                }
            }

            if !self.control.hold_answers.load(Ordering::SeqCst) {
                let reverse = self.control.reverse_answers.load(Ordering::SeqCst);
                loop {
                    let next = if reverse { outbox.back() } else { outbox.front() };
                    let Some(answer) = next else {
                        break;
                    };
                    if ring.push_answer(answer).is_err() {
                        break;
                    }
                    if reverse {
                        outbox.pop_back();
                    } else {
                        outbox.pop_front();
                    }
                    self.control.update(|s| s.answers += 1);
                }
            }

            let busy = !outbox.is_empty() || ring.commands_pending() > 0;
            ring.write_timeout(if busy { ring.current_time() + 2 } else { TIME_INFINITE });

            self.control.update(|s| s.yields += 1);
            let result = entry(RPC_ID_SMODULE, RpcCommand::Yield as u32, 0, 0);
            if result != rpc::status::SUCCESS {
                log::error!("sim: yield returned {:#x}, exiting", result);
                l0.write_u32(L0_L1_STATUS_OFFSET, status::S_ERROR_GENERIC);
                return API_HAL_RET_OK;
            }
        }
    }
}

impl PaProgram for SecurePeer {
    fn run(&mut self, load: PaLoad<'_>) -> u32 {
        let Some(entry) = load.rpc else {
            log::error!("sim: no RPC entry installed");
            return PA_LOAD_NO_RPC;
        };
        let mem = load.memory;

        // SAFETY: the PA info block stays allocated until the init RPC.
        let info = unsafe { ptr::read_unaligned(mem.phys_to_virt(load.pa_info) as *const PaInfo) };
        // SAFETY: parameters point at the L0 page, live for the whole call.
        let l0 = unsafe { L0Page::from_raw(mem.phys_to_virt(info.parameters)) };
        let input = l0.read_init_input();
        if input.l1_command != L1_COMMAND_SMC_INIT || input.l1_shared_buffer_length as usize != mem.page_size() {
            log::error!("sim: bad SMC init request {:#x}", input.l1_command);
            l0.write_u32(L0_L1_STATUS_OFFSET, status::S_ERROR_BAD_STATE);
            return API_HAL_RET_OK;
        }
        // SAFETY: the L1 page is live until the normal world unloads the PA.
        let ring = unsafe { SecureRingView::from_raw(mem.phys_to_virt(input.l1_shared_buffer_phys_addr as usize)) };
        log::debug!(
            "sim: init with {} bytes of properties, backing store {:#x}",
            input.properties_buffer_length,
            input.backing_store_addr
        );

        l0.write_u32(L0_PROTOCOL_VERSION_OFFSET, self.protocol_version);
        l0.write_u32(L0_L1_STATUS_OFFSET, status::S_SUCCESS);
        let init = entry(RPC_ID_SMODULE, RpcCommand::Init as u32, 0, 0);
        self.control.update(|s| s.init_status = Some(init));
        if init != rpc::status::SUCCESS {
            l0.write_u32(L0_L1_STATUS_OFFSET, status::S_ERROR_GENERIC);
            return API_HAL_RET_OK;
        }

        if let Some(message) = self.trace.take() {
            Self::write_trace(&l0, &message);
            entry(RPC_ID_SMODULE, RpcCommand::Trace as u32, 0, 0);
        }
        for (rpc_id, command) in std::mem::take(&mut self.extra_rpcs) {
            let result = entry(rpc_id, command, 0, 0);
            self.control.update(|s| s.rpc_results.push(result));
        }

        ring.set_power_mode(PowerMode::Active);
        self.serve(entry, &l0, ring)
    }
}
