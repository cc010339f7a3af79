//! Polling engine
//!
//! # Purpose
//! Owns the dedicated thread that hands control to the secure side and keeps
//! the rings moving while it is there.
//!
//! # Architecture
//! The thread issues the one-shot PA load call and stays inside it until the
//! secure side exits. Each `yield` RPC runs one [`polling_cycle`]: drain the
//! answer ring, read the secure timeout with the lock-free seqlock reader,
//! and either return at once or park on the wake condition until a caller
//! enqueues, shutdown is requested, or the timeout expires. Before returning
//! to the secure side the cycle publishes the normal-world clock.
//!
//! [`polling_cycle`]: MonitorShared::polling_cycle

use std::sync::Arc;

use smc_platform::hal::{EntryFlags, API_HAL_PA_LOAD, API_HAL_RET_OK};
use smc_platform::PhysAddr;

use crate::correlation::{Delivery, Token};
use crate::layout::status;
use crate::monitor::{CommState, MonitorFlags, MonitorShared};
use crate::rpc;
use crate::smc;
use crate::timeout::{classify, wall_clock_ms, SleepPlan};

/// Observable state of the polling engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    /// Not parked and not inside the secure world
    Idle = 0,
    /// Parked on the wake condition
    Waiting = 1,
    /// Control is with the secure side
    Dispatching = 2,
    /// Thread has left the PA load call and is exiting
    Terminating = 3,
}

impl EngineState {
    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Waiting,
            2 => Self::Dispatching,
            3 => Self::Terminating,
            _ => Self::Idle,
        }
    }
}

impl MonitorShared {
    /// One normal-world turn between two secure-side runs
    pub(crate) fn polling_cycle(&self) -> u32 {
        self.set_engine(EngineState::Idle);
        loop {
            if self.flags().contains(MonitorFlags::TERMINATING) {
                log::debug!("poll: terminating, returning to the secure side");
                self.set_engine(EngineState::Terminating);
                break;
            }

            let (seq, reader) = {
                let state = self.lock_state();
                match state.channel.as_ref() {
                    Some(channel) => (state.wake_seq, channel.ring.timeout_reader()),
                    None => break,
                }
            };

            self.drain_answers();

            let plan = classify(reader.read(), wall_clock_ms(), self.config.max_sleep());
            if plan == SleepPlan::Immediate {
                break;
            }

            let state = self.lock_state();
            if state.wake_seq != seq {
                continue;
            }
            let busy = state
                .channel
                .as_ref()
                .map_or(true, |channel| !channel.ring.is_idle())
                || !state.deferred.is_empty();
            if busy {
                break;
            }

            self.set_engine(EngineState::Waiting);
            let parked = |s: &mut CommState| {
                s.wake_seq == seq && !self.flags().contains(MonitorFlags::TERMINATING)
            };
            let state = match plan {
                SleepPlan::For(duration) => self
                    .wake
                    .wait_timeout_while(state, duration, parked)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|p| p.into_inner().0),
                _ => self
                    .wake
                    .wait_while(state, parked)
                    .unwrap_or_else(|p| p.into_inner()),
            };
            drop(state);
            self.set_engine(EngineState::Idle);
        }

        if let Some(channel) = self.lock_state().channel.as_mut() {
            channel.ring.set_current_time(wall_clock_ms());
        }
        if self.engine_state() != EngineState::Terminating {
            self.set_engine(EngineState::Dispatching);
        }
        rpc::status::SUCCESS
    }

    /// Empty the answer ring, routing every answer to its caller
    ///
    /// Deferred compensation commands are pushed first. Answers of cancelled
    /// callers go through the compensation rules once; a resulting command
    /// reuses the orphaned token and its own answer releases the entry.
    pub(crate) fn drain_answers(&self) {
        let mut guard = self.lock_state();
        let CommState {
            channel,
            answers,
            deferred,
            wake_seq,
            ..
        } = &mut *guard;
        let Some(channel) = channel.as_mut() else {
            return;
        };

        let mut enqueued = false;
        while let Some(cmd) = deferred.front() {
            if channel.ring.try_enqueue(cmd).is_err() {
                break;
            }
            deferred.pop_front();
            enqueued = true;
        }

        while let Some(answer) = channel.ring.pop_answer() {
            let Some(token) = Token::from_operation_id(answer.operation_id) else {
                log::debug!("poll: answer {:?} without operation id dropped", answer.kind());
                continue;
            };
            match answers.complete(token, &answer) {
                Delivery::Delivered => {}
                Delivery::Compensated => {
                    log::debug!("poll: teardown for operation {:#010x} settled", token.operation_id());
                }
                Delivery::Stale => {
                    log::warn!("poll: stale answer for operation {:#010x}", token.operation_id());
                }
                Delivery::Orphaned => {
                    let teardown = self.compensation.iter().find_map(|rule| rule.compensate(&answer));
                    match teardown {
                        Some(mut cmd) => {
                            answers.mark_compensated(token);
                            cmd.operation_id = token.operation_id();
                            log::info!(
                                "poll: compensating {:?} for cancelled operation {:#010x}",
                                cmd.kind(),
                                token.operation_id()
                            );
                            if deferred.is_empty() && channel.ring.try_enqueue(&cmd).is_ok() {
                                enqueued = true;
                            } else {
                                deferred.push_back(cmd);
                            }
                        }
                        None => {
                            answers.release(token);
                        }
                    }
                }
            }
        }

        if enqueued {
            *wake_seq = wake_seq.wrapping_add(1);
            self.wake.notify_all();
        }
    }

    /// Body of the polling thread
    pub(crate) fn run_polling_thread(self: Arc<Self>, pa_info: PhysAddr) {
        log::info!("poll: polling thread started");
        self.set_engine(EngineState::Dispatching);

        let flags = EntryFlags::IRQ_ENABLE | EntryFlags::FIQ_ENABLE | EntryFlags::START_HAL_CRITICAL;
        match smc::dispatch(&*self.platform, &*self.memory, API_HAL_PA_LOAD, flags, &[pa_info]) {
            Ok(API_HAL_RET_OK) => {
                let exit = self.lock_state().channel.as_ref().map(|c| c.l0.l1_status());
                match exit {
                    Some(status::S_SUCCESS) => log::info!("poll: secure world exited normally"),
                    Some(status::S_ERROR_SDP_RUNTIME_INIT_ADDR_CHECK_FAIL) => {
                        log::error!("poll: SDP runtime address check failed")
                    }
                    Some(other) => log::warn!("poll: secure world exited with status {:#010x}", other),
                    None => {}
                }
            }
            Ok(status) => log::error!("poll: PA load failed with status {:#x}", status),
            Err(e) => log::error!("poll: PA load could not be issued: {}", e),
        }

        self.set_engine(EngineState::Terminating);
        self.clear_flags(MonitorFlags::POLLING_THREAD_STARTED | MonitorFlags::TERMINATING);
        self.stop_channel();
        log::info!("poll: polling thread exiting");
        self.thread_death.complete();
    }
}
