//! Communication monitor: lifecycle, power management and the send paths
//!
//! # Purpose
//! [`CommMonitor`] is the handle client code holds. It provisions the secure
//! domain, sets up the L0/L1 shared pages, runs the polling thread and moves
//! client commands to the secure world and answers back.
//!
//! # Integration Points
//! - Platform: [`SecureMonitor`] and [`PhysMemory`] from `smc-platform`
//! - Secure RPC entry: [`registry::rpc_handler`] is installed at first start
//! - Clients: [`ConnectionContext`] decides which messages may be sent
//!
//! # Architecture
//! One mutex guards the rings, the correlation table and the deferred
//! compensation queue. Callers and the polling thread meet on one condition
//! variable keyed by a wake sequence number. Secure calls and sleeps happen
//! outside the lock.
//!
//! ```text
//! caller ── enqueue ──► L1 command ring ──► secure side
//!   ▲                                          │
//!   └── AnswerSignal ◄── drain ◄── L1 answer ring
//! ```

use core::mem::size_of;
use core::ptr;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bitflags::bitflags;
use crossbeam::utils::Backoff;
use smc_platform::hal::{EntryFlags, API_HAL_PA_UNLOAD_ALL, API_HAL_RET_OK};
use smc_platform::{PhysAddr, PhysMemory, SecureMonitor, PAGE_SIZE};

use crate::config::{CacheFlushMode, MonitorConfig, SdpAddresses};
use crate::connection::ConnectionContext;
use crate::correlation::{CompensationRule, CorrelationTable, DestroyOrphanedDeviceContext, Withdrawal};
use crate::crypto::{CryptoDelegate, NullCrypto};
use crate::error::{CommError, Result};
use crate::layout::{
    check_page_layout, status, AnswerMessage, CommandMessage, L0Page, PaInfo, PowerMode, SmcInitInput,
    L0_PROPERTIES_CAPACITY, L1_COMMAND_SMC_INIT, OPERATION_ID_NONE,
};
use crate::poll::EngineState;
use crate::registry;
use crate::ring::RingChannel;
use crate::signal::{lock, AnswerSignal, Completion, HwaLock, KillSwitch, WaitOutcome};
use crate::smc::{self, ContextDirection};
use crate::timeout::wall_clock_ms;

/// How long a monitor dropped while running waits for the secure side to exit
const DROP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Hook run between two attempts to enqueue into a full ring
pub type RetryHook = Arc<dyn Fn() + Send + Sync>;

bitflags! {
    /// Monitor-wide state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MonitorFlags: u32 {
        const POLLING_THREAD_STARTED = 1 << 0;
        const TERMINATING = 1 << 1;
        const SDP_INITIALIZED = 1 << 2;
        /// The secure side has yielded at least once since start
        const L1_READY = 1 << 3;
    }
}

/// Lifecycle of the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initialized,
    Started,
    Active,
    ShuttingDown,
    Stopped,
    Terminated,
}

/// Power operations accepted by [`CommMonitor::power_management`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerOperation {
    Shutdown = 0,
}

impl PowerOperation {
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Self::Shutdown),
            other => Err(CommError::UnsupportedPowerOperation(other)),
        }
    }
}

/// Live shared pages
pub(crate) struct Channel {
    pub(crate) ring: RingChannel,
    pub(crate) l0: L0Page,
}

/// Buffers only needed until the secure side acknowledges init
pub(crate) struct PaBuffers {
    info: usize,
    image: usize,
    image_len: usize,
}

impl PaBuffers {
    pub(crate) fn release(self, mem: &dyn PhysMemory) {
        mem.free(self.info, size_of::<PaInfo>());
        mem.free(self.image, self.image_len);
    }
}

/// Partially built start state, released as a whole on failure
#[derive(Default)]
struct StartResources {
    pa_info: Option<usize>,
    image: Option<(usize, usize)>,
    l0: Option<usize>,
    l1: Option<usize>,
}

impl StartResources {
    fn release(self, mem: &dyn PhysMemory) {
        if let Some(info) = self.pa_info {
            mem.free(info, size_of::<PaInfo>());
        }
        if let Some((image, len)) = self.image {
            mem.free(image, len);
        }
        if let Some(l0) = self.l0 {
            mem.free_pages(l0, 0);
        }
        if let Some(l1) = self.l1 {
            mem.free_pages(l1, 0);
        }
    }
}

/// State behind the monitor lock
pub(crate) struct CommState {
    pub(crate) channel: Option<Channel>,
    pub(crate) pa: Option<PaBuffers>,
    pub(crate) answers: CorrelationTable,
    pub(crate) deferred: VecDeque<CommandMessage>,
    pub(crate) wake_seq: u64,
    pub(crate) lifecycle: LifecycleState,
}

/// Monitor internals shared with the polling thread and the RPC entry
pub(crate) struct MonitorShared {
    pub(crate) platform: Arc<dyn SecureMonitor>,
    pub(crate) memory: Arc<dyn PhysMemory>,
    pub(crate) config: MonitorConfig,
    state: Mutex<CommState>,
    pub(crate) wake: Condvar,
    flags: AtomicU32,
    engine: AtomicU8,
    pub(crate) thread_death: Completion,
    pub(crate) hwa: HwaLock,
    crypto: Mutex<Box<dyn CryptoDelegate>>,
    pub(crate) compensation: Vec<Box<dyn CompensationRule>>,
    retry_hook: Option<RetryHook>,
    polling_thread: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorShared {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, CommState> {
        lock(&self.state)
    }

    pub(crate) fn crypto(&self) -> MutexGuard<'_, Box<dyn CryptoDelegate>> {
        lock(&self.crypto)
    }

    pub(crate) fn flags(&self) -> MonitorFlags {
        MonitorFlags::from_bits_retain(self.flags.load(Ordering::SeqCst))
    }

    fn set_flags(&self, flags: MonitorFlags) -> MonitorFlags {
        MonitorFlags::from_bits_retain(self.flags.fetch_or(flags.bits(), Ordering::SeqCst))
    }

    pub(crate) fn clear_flags(&self, flags: MonitorFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    pub(crate) fn set_l1_ready(&self) {
        self.set_flags(MonitorFlags::L1_READY);
    }

    pub(crate) fn engine_state(&self) -> EngineState {
        EngineState::from_raw(self.engine.load(Ordering::SeqCst))
    }

    pub(crate) fn set_engine(&self, state: EngineState) {
        self.engine.store(state as u8, Ordering::SeqCst);
    }

    fn alloc_block(&self, size: usize) -> Result<usize> {
        self.memory
            .alloc(size)
            .map_err(|_| CommError::OutOfMemory { requested: size })
    }

    fn alloc_page(&self) -> Result<usize> {
        self.memory
            .alloc_pages(0)
            .map_err(|_| CommError::OutOfMemory { requested: PAGE_SIZE })
    }

    fn start(self: &Arc<Self>, sdp: SdpAddresses, pa_image: &[u8], properties: &[u8]) -> Result<()> {
        if self.lock_state().lifecycle == LifecycleState::Terminated {
            return Err(CommError::Terminated);
        }
        check_page_layout(self.memory.page_size())?;
        if properties.len() > L0_PROPERTIES_CAPACITY {
            return Err(CommError::PropertiesTooLarge {
                len: properties.len(),
                capacity: L0_PROPERTIES_CAPACITY,
            });
        }

        if !self.flags().contains(MonitorFlags::SDP_INITIALIZED) {
            smc::sdp_init(&*self.platform, &*self.memory, &self.config, sdp, registry::rpc_handler)?;
            self.set_flags(MonitorFlags::SDP_INITIALIZED);
            log::info!("monitor: SDP provisioned");
        }

        // A previous polling thread has already signalled its death
        if let Some(previous) = lock(&self.polling_thread).take() {
            if previous.join().is_err() {
                log::error!("monitor: previous polling thread panicked");
            }
        }

        let mut res = StartResources::default();
        if let Err(e) = self.allocate_start(&mut res, pa_image) {
            log::error!("monitor: start allocation failed: {}", e);
            res.release(&*self.memory);
            return Err(e);
        }
        let (Some(info), Some((image, image_len)), Some(l0_vaddr), Some(l1_vaddr)) =
            (res.pa_info, res.image, res.l0, res.l1)
        else {
            res.release(&*self.memory);
            return Err(CommError::OutOfMemory { requested: PAGE_SIZE });
        };

        // SAFETY: both pages were just allocated, page-sized and page-aligned.
        let l0 = unsafe { L0Page::from_raw(l0_vaddr) };
        let mut ring = unsafe { RingChannel::from_raw(l1_vaddr) };
        l0.zero();
        // SAFETY: `l1_vaddr` is a private page until the channel is published.
        unsafe { ptr::write_bytes(l1_vaddr as *mut u8, 0, PAGE_SIZE) };

        let pa_info = PaInfo {
            certificate: self.memory.virt_to_phys(image),
            parameters: self.memory.virt_to_phys(l0_vaddr),
            results: self.memory.virt_to_phys(l0_vaddr),
        };
        // SAFETY: `info` holds size_of::<PaInfo>() bytes.
        unsafe { ptr::write_unaligned(info as *mut PaInfo, pa_info) };

        let mut input = Box::new(SmcInitInput::zeroed());
        input.l1_command = L1_COMMAND_SMC_INIT;
        input.l1_shared_buffer_length = PAGE_SIZE as u32;
        input.l1_shared_buffer_phys_addr = self.memory.virt_to_phys(l1_vaddr) as u64;
        input.backing_store_addr = sdp.backing_store;
        input.back_ext_storage_addr = sdp.back_ext_storage;
        input.properties_buffer_length = properties.len() as u32;
        input.properties_buffer[..properties.len()].copy_from_slice(properties);
        l0.write_init_input(&input);
        ring.set_current_time(wall_clock_ms());

        {
            let mut state = self.lock_state();
            state.channel = Some(Channel { ring, l0 });
            state.pa = Some(PaBuffers {
                info,
                image,
                image_len,
            });
            state.answers = CorrelationTable::new();
            state.deferred.clear();
            state.wake_seq = 0;
            state.lifecycle = LifecycleState::Started;
        }
        self.thread_death.reset();
        self.clear_flags(MonitorFlags::TERMINATING | MonitorFlags::L1_READY);
        self.set_engine(EngineState::Idle);

        let shared = Arc::clone(self);
        let pa_info_phys = self.memory.virt_to_phys(info);
        let spawned = thread::Builder::new()
            .name(self.config.polling_thread_name.clone())
            .spawn(move || shared.run_polling_thread(pa_info_phys));
        match spawned {
            Ok(handle) => {
                *lock(&self.polling_thread) = Some(handle);
                log::info!("monitor: started, L1 at {:#x}", self.memory.virt_to_phys(l1_vaddr));
                Ok(())
            }
            Err(e) => {
                log::error!("monitor: cannot spawn polling thread: {}", e);
                self.stop_channel();
                Err(e.into())
            }
        }
    }

    fn allocate_start(&self, res: &mut StartResources, pa_image: &[u8]) -> Result<()> {
        res.pa_info = Some(self.alloc_block(size_of::<PaInfo>())?);

        let image_len = pa_image.len().max(1);
        let image = self.alloc_block(image_len)?;
        res.image = Some((image, image_len));
        // SAFETY: `image` holds at least `pa_image.len()` bytes.
        unsafe { ptr::copy_nonoverlapping(pa_image.as_ptr(), image as *mut u8, pa_image.len()) };

        res.l0 = Some(self.alloc_page()?);
        res.l1 = Some(self.alloc_page()?);
        Ok(())
    }

    /// Copy `msg` into the command ring, retrying while it is full
    fn enqueue(&self, msg: &CommandMessage, kill: Option<&KillSwitch>) -> Result<()> {
        let backoff = Backoff::new();
        loop {
            {
                let mut guard = self.lock_state();
                let state = &mut *guard;
                let Some(channel) = state.channel.as_mut() else {
                    return Err(CommError::NotStarted);
                };
                let pushed = channel.ring.try_enqueue(msg).is_ok();
                state.wake_seq = state.wake_seq.wrapping_add(1);
                self.wake.notify_all();
                if pushed {
                    return Ok(());
                }
            }
            if kill.is_some_and(KillSwitch::is_killed) {
                return Err(CommError::Interrupted);
            }
            log::trace!("monitor: command ring full, retrying");
            match &self.retry_hook {
                Some(hook) => hook(),
                None => backoff.snooze(),
            }
        }
    }

    fn send(&self, msg: &CommandMessage, conn: &dyn ConnectionContext, kill: Option<&KillSwitch>) -> Result<()> {
        if kill.is_some_and(KillSwitch::is_killed) {
            return Err(CommError::Interrupted);
        }
        if !conn.check_message_validity(msg) {
            return Err(CommError::MessageRejected);
        }
        let mut cmd = *msg;
        cmd.operation_id = OPERATION_ID_NONE;
        self.flush_client_memory(&cmd, conn);
        self.enqueue(&cmd, kill)
    }

    fn send_receive(
        &self,
        msg: &CommandMessage,
        conn: &dyn ConnectionContext,
        kill: Option<&KillSwitch>,
    ) -> Result<AnswerMessage> {
        if kill.is_some_and(KillSwitch::is_killed) {
            return Err(CommError::Interrupted);
        }
        if !conn.check_message_validity(msg) {
            return Err(CommError::MessageRejected);
        }

        let signal = AnswerSignal::new();
        let token = {
            let mut state = self.lock_state();
            if state.channel.is_none() {
                return Err(CommError::NotStarted);
            }
            state
                .answers
                .register(Arc::clone(&signal))
                .ok_or(CommError::OutOfMemory {
                    requested: size_of::<AnswerMessage>(),
                })?
        };

        let mut cmd = *msg;
        cmd.operation_id = token.operation_id();
        self.flush_client_memory(&cmd, conn);
        if let Err(e) = self.enqueue(&cmd, kill) {
            self.lock_state().answers.release(token);
            return Err(e);
        }

        let answer = match signal.wait(kill) {
            WaitOutcome::Answer(answer) => answer,
            WaitOutcome::Aborted => return Err(CommError::ChannelClosed),
            WaitOutcome::Killed => {
                let withdrawal = self.lock_state().answers.withdraw(token);
                match (withdrawal, signal.take_answer()) {
                    (Withdrawal::AlreadyCompleted, Some(answer)) => answer,
                    _ => {
                        log::debug!("monitor: operation {:#010x} cancelled", token.operation_id());
                        return Err(CommError::Interrupted);
                    }
                }
            }
        };

        if answer.status != status::S_SUCCESS {
            log::warn!(
                "monitor: {:?} answered with channel status {:#010x}",
                answer.kind(),
                answer.status
            );
        }
        conn.record_answer(&answer);
        Ok(answer)
    }

    fn flush_client_memory(&self, cmd: &CommandMessage, conn: &dyn ConnectionContext) {
        if self.config.cache_flush != CacheFlushMode::SharedRanges {
            return;
        }
        if cmd.kind().is_some_and(|kind| kind.uses_client_memory()) {
            if let Some(shmem) = conn.shared_memory() {
                shmem.flush_all(&*self.platform);
            }
        }
    }

    fn power_management(&self, op: PowerOperation) -> Result<()> {
        if !self.flags().contains(MonitorFlags::POLLING_THREAD_STARTED) {
            log::info!("monitor: {:?} requested while stopped, nothing to do", op);
            return Ok(());
        }
        let mode = match self.lock_state().channel.as_ref() {
            Some(channel) => channel.ring.power_mode(),
            None => return Ok(()),
        };
        if mode != PowerMode::Active {
            log::warn!("monitor: {:?} refused in power mode {:?}", op, mode);
            return Err(CommError::NotPermitted(mode));
        }

        match op {
            PowerOperation::Shutdown => self.shutdown(),
        }
    }

    fn shutdown(&self) -> Result<()> {
        log::info!("monitor: shutting down the secure world");
        self.begin_shutdown(None)?;
        self.thread_death.wait();
        self.join_polling_thread();
        log::info!("monitor: secure world shut down");
        Ok(())
    }

    /// Flag termination and queue the prepare-shutdown command
    ///
    /// On failure the flag and the lifecycle state are put back.
    fn begin_shutdown(&self, kill: Option<&KillSwitch>) -> Result<()> {
        self.set_flags(MonitorFlags::TERMINATING);
        let previous = {
            let mut state = self.lock_state();
            core::mem::replace(&mut state.lifecycle, LifecycleState::ShuttingDown)
        };
        self.enqueue(&CommandMessage::prepare_shutdown(), kill)
            .inspect_err(|_| {
                self.clear_flags(MonitorFlags::TERMINATING);
                let mut state = self.lock_state();
                if state.lifecycle == LifecycleState::ShuttingDown {
                    state.lifecycle = previous;
                }
            })
    }

    /// Shut a running secure side down without blocking for longer than `timeout`
    ///
    /// The command gets one enqueue attempt. Returns whether the polling thread
    /// exited in time.
    fn shutdown_bounded(&self, timeout: Duration) -> bool {
        let once = KillSwitch::new();
        once.kill();
        if let Err(e) = self.begin_shutdown(Some(&once)) {
            log::warn!("monitor: prepare-shutdown not queued: {}", e);
        }
        if !self.thread_death.wait_timeout(timeout) {
            return false;
        }
        self.join_polling_thread();
        true
    }

    fn join_polling_thread(&self) {
        let handle = lock(&self.polling_thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("monitor: polling thread panicked");
            }
        }
    }

    /// Unload the PA and release every start resource; idempotent
    pub(crate) fn stop_channel(&self) {
        let (channel, pa, aborted) = {
            let mut state = self.lock_state();
            let aborted = state.answers.abort_all();
            state.deferred.clear();
            if state.lifecycle != LifecycleState::Terminated {
                state.lifecycle = LifecycleState::Stopped;
            }
            (state.channel.take(), state.pa.take(), aborted)
        };
        self.clear_flags(MonitorFlags::L1_READY);
        if channel.is_none() && pa.is_none() {
            return;
        }
        if aborted > 0 {
            log::warn!("monitor: {} waiting caller(s) aborted by stop", aborted);
        }

        match smc::dispatch(
            &*self.platform,
            &*self.memory,
            API_HAL_PA_UNLOAD_ALL,
            EntryFlags::START_HAL_CRITICAL,
            &[],
        ) {
            Ok(API_HAL_RET_OK) => {}
            Ok(status) => log::warn!("monitor: PA unload returned {:#x}", status),
            Err(e) => log::warn!("monitor: PA unload not issued: {}", e),
        }

        if let Some(pa) = pa {
            pa.release(&*self.memory);
        }
        if let Some(channel) = channel {
            self.memory.free_pages(channel.l0.vaddr(), 0);
            self.memory.free_pages(channel.ring.vaddr(), 0);
        }
        log::info!("monitor: channel stopped");
    }

    pub(crate) fn return_from_irq(&self) {
        if !self.flags().contains(MonitorFlags::L1_READY) {
            return;
        }
        self.drain_answers();
        if let Some(channel) = self.lock_state().channel.as_mut() {
            channel.ring.set_current_time(wall_clock_ms());
        }
        self.flush_shared_buffers();
    }
}

/// Builder for [`CommMonitor`]
pub struct MonitorBuilder {
    platform: Arc<dyn SecureMonitor>,
    memory: Arc<dyn PhysMemory>,
    config: MonitorConfig,
    crypto: Box<dyn CryptoDelegate>,
    compensation: Vec<Box<dyn CompensationRule>>,
    retry_hook: Option<RetryHook>,
}

impl MonitorBuilder {
    pub fn new(platform: Arc<dyn SecureMonitor>, memory: Arc<dyn PhysMemory>) -> Self {
        Self {
            platform,
            memory,
            config: MonitorConfig::default(),
            crypto: Box::new(NullCrypto),
            compensation: vec![Box::new(DestroyOrphanedDeviceContext)],
            retry_hook: None,
        }
    }

    pub fn config(mut self, config: MonitorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn crypto(mut self, crypto: impl CryptoDelegate + 'static) -> Self {
        self.crypto = Box::new(crypto);
        self
    }

    /// Add a rule consulted after the built-in device context rule
    pub fn compensation_rule(mut self, rule: impl CompensationRule + 'static) -> Self {
        self.compensation.push(Box::new(rule));
        self
    }

    /// Replace the default spin/yield backoff used while the ring is full
    pub fn retry_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.retry_hook = Some(Arc::new(hook));
        self
    }

    /// Validate the configuration and register the monitor behind the RPC entry
    pub fn build(self) -> Result<CommMonitor> {
        self.config.validate()?;
        let shared = Arc::new(MonitorShared {
            platform: self.platform,
            memory: self.memory,
            config: self.config,
            state: Mutex::new(CommState {
                channel: None,
                pa: None,
                answers: CorrelationTable::new(),
                deferred: VecDeque::new(),
                wake_seq: 0,
                lifecycle: LifecycleState::Initialized,
            }),
            wake: Condvar::new(),
            flags: AtomicU32::new(0),
            engine: AtomicU8::new(EngineState::Idle as u8),
            thread_death: Completion::default(),
            hwa: HwaLock::new_held(),
            crypto: Mutex::new(self.crypto),
            compensation: self.compensation,
            retry_hook: self.retry_hook,
            polling_thread: Mutex::new(None),
        });
        registry::register(&shared)?;
        log::debug!("monitor: registered for secure RPC");
        Ok(CommMonitor { shared })
    }
}

/// Handle to the normal-world communication monitor
pub struct CommMonitor {
    shared: Arc<MonitorShared>,
}

impl CommMonitor {
    pub fn builder(platform: Arc<dyn SecureMonitor>, memory: Arc<dyn PhysMemory>) -> MonitorBuilder {
        MonitorBuilder::new(platform, memory)
    }

    /// Provision the secure domain, set up the shared pages and start polling
    pub fn start(&self, sdp: SdpAddresses, pa_image: &[u8], properties: &[u8]) -> Result<()> {
        let previous = self.shared.set_flags(MonitorFlags::POLLING_THREAD_STARTED);
        if previous.contains(MonitorFlags::POLLING_THREAD_STARTED) {
            return Err(CommError::AlreadyStarted);
        }
        self.shared
            .start(sdp, pa_image, properties)
            .inspect_err(|_| self.shared.clear_flags(MonitorFlags::POLLING_THREAD_STARTED))
    }

    /// Fire-and-forget send; the command carries no operation id
    pub fn send(&self, msg: &CommandMessage, conn: &dyn ConnectionContext, kill: Option<&KillSwitch>) -> Result<()> {
        self.shared.send(msg, conn, kill)
    }

    /// Send and block until the matching answer arrives
    ///
    /// A fired `kill` returns [`CommError::Interrupted`]; the entry is then
    /// settled by the drain loop, including any compensating teardown.
    pub fn send_receive(
        &self,
        msg: &CommandMessage,
        conn: &dyn ConnectionContext,
        kill: Option<&KillSwitch>,
    ) -> Result<AnswerMessage> {
        self.shared.send_receive(msg, conn, kill)
    }

    pub fn power_management(&self, op: PowerOperation) -> Result<()> {
        self.shared.power_management(op)
    }

    /// Tear the channel down; refused while the polling thread runs
    pub fn stop(&self) -> Result<()> {
        if self.shared.flags().contains(MonitorFlags::POLLING_THREAD_STARTED) {
            return Err(CommError::StillRunning);
        }
        self.shared.stop_channel();
        Ok(())
    }

    /// Release the RPC registration and the crypto delegate
    pub fn terminate(&self) -> Result<()> {
        if self.shared.flags().contains(MonitorFlags::POLLING_THREAD_STARTED) {
            return Err(CommError::StillRunning);
        }
        self.shared.stop_channel();
        let mut state = self.shared.lock_state();
        if state.lifecycle == LifecycleState::Terminated {
            return Ok(());
        }
        registry::unregister(&self.shared);
        self.shared.crypto().shutdown();
        state.lifecycle = LifecycleState::Terminated;
        log::info!("monitor: terminated");
        Ok(())
    }

    pub fn save_context(&self, phys_addr: PhysAddr) -> Result<()> {
        smc::context_save_restore(
            &*self.shared.platform,
            &*self.shared.memory,
            phys_addr,
            ContextDirection::Save,
        )
    }

    pub fn restore_context(&self, phys_addr: PhysAddr) -> Result<()> {
        smc::context_save_restore(
            &*self.shared.platform,
            &*self.shared.memory,
            phys_addr,
            ContextDirection::Restore,
        )
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.shared.lock_state().lifecycle
    }

    pub fn engine_state(&self) -> EngineState {
        self.shared.engine_state()
    }

    pub fn flags(&self) -> MonitorFlags {
        self.shared.flags()
    }

    /// Correlation entries not yet settled, orphans included
    pub fn pending_operations(&self) -> usize {
        self.shared.lock_state().answers.pending()
    }

    pub fn is_running(&self) -> bool {
        self.flags().contains(MonitorFlags::POLLING_THREAD_STARTED)
    }

    pub fn hwa_lock(&self) -> &HwaLock {
        &self.shared.hwa
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.shared.config
    }

    pub fn memory(&self) -> &dyn PhysMemory {
        &*self.shared.memory
    }

    /// Join the polling thread once it leaves the secure world on its own
    pub fn wait_polling_exit(&self) {
        self.shared.join_polling_thread();
    }
}

impl Drop for CommMonitor {
    fn drop(&mut self) {
        if self.is_running() {
            log::warn!("monitor: dropped while running, shutting the secure world down");
            if !self.shared.shutdown_bounded(DROP_SHUTDOWN_TIMEOUT) {
                log::error!("monitor: polling thread did not exit, releasing the RPC entry anyway");
                registry::unregister(&self.shared);
                return;
            }
        }
        if let Err(e) = self.terminate() {
            log::warn!("monitor: terminate on drop failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_operation_decoding() {
        assert_eq!(PowerOperation::from_raw(0).unwrap(), PowerOperation::Shutdown);
        assert!(matches!(
            PowerOperation::from_raw(7),
            Err(CommError::UnsupportedPowerOperation(7))
        ));
    }

    #[cfg(feature = "mock")]
    #[test]
    fn test_failed_shutdown_request_restores_lifecycle() {
        use smc_platform::mock::{MockMemory, MockSecureMonitor};

        let mem = Arc::new(MockMemory::new());
        let platform = Arc::new(MockSecureMonitor::new(mem.clone()));
        let monitor = CommMonitor::builder(platform, mem).build().unwrap();
        monitor.shared.lock_state().lifecycle = LifecycleState::Active;

        // No channel: the prepare-shutdown command cannot be queued
        assert!(matches!(monitor.shared.begin_shutdown(None), Err(CommError::NotStarted)));
        assert_eq!(monitor.lifecycle(), LifecycleState::Active);
        assert!(!monitor.flags().contains(MonitorFlags::TERMINATING));
    }

    #[test]
    fn test_flags_are_distinct() {
        let all = MonitorFlags::all();
        assert_eq!(all.bits().count_ones(), 4);
        assert!(!MonitorFlags::L1_READY.intersects(MonitorFlags::TERMINATING));
    }
}
