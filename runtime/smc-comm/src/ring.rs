//! Command/answer rings and clock registers in the L1 page
//!
//! # Architecture
//! The normal world produces commands and consumes answers through
//! [`RingChannel`]; the secure world does the opposite through
//! [`SecureRingView`]. Counters are monotonic `u32` values compared with
//! wrapping arithmetic, so `free - first` is the number of occupied slots and
//! never exceeds [`QUEUE_CAPACITY`]. Payloads are written before the free
//! counter is published with release ordering.
//!
//! The clock (`time_n`) and timeout (`timeout_s`) registers are double
//! buffered 64-bit values guarded by a sequence counter. Writers fill the slot
//! of the next serial and then publish it; readers retry while the serial
//! moves under them.

use core::ptr::{self, NonNull};
use core::sync::atomic::{fence, AtomicU32, Ordering};

use crate::layout::{
    AnswerMessage, CommandMessage, L1Buffer, PowerMode, HI, LO, QUEUE_CAPACITY,
    STATUS_POWER_STATE_MASK,
};

/// No free slot in the target ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFull;

fn write_synced(serial: &AtomicU32, slots: &[[AtomicU32; 2]; 2], value: u64) {
    let next = serial.load(Ordering::Relaxed).wrapping_add(1);
    fence(Ordering::Release);
    let slot = &slots[(next & 1) as usize];
    slot[HI].store((value >> 32) as u32, Ordering::Relaxed);
    slot[LO].store(value as u32, Ordering::Relaxed);
    serial.store(next, Ordering::Release);
}

fn read_synced(serial: &AtomicU32, slots: &[[AtomicU32; 2]; 2]) -> u64 {
    loop {
        let before = serial.load(Ordering::Acquire);
        let slot = &slots[(before & 1) as usize];
        let hi = slot[HI].load(Ordering::Relaxed);
        let lo = slot[LO].load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        if serial.load(Ordering::Relaxed) == before {
            return ((hi as u64) << 32) | lo as u64;
        }
        core::hint::spin_loop();
    }
}

fn occupied(first: u32, free: u32, ring: &str) -> u32 {
    let used = free.wrapping_sub(first);
    assert!(
        used <= QUEUE_CAPACITY,
        "{} ring overrun: first {} free {}",
        ring,
        first,
        free
    );
    used
}

/// Normal-world side of the L1 rings
///
/// Every method mutating counters must be called with the monitor lock held;
/// the monitor only hands out the channel through its lock guard.
pub struct RingChannel {
    l1: NonNull<L1Buffer>,
}

// SAFETY: the channel only touches shared memory through atomics and slot
// copies guarded by the counter protocol.
unsafe impl Send for RingChannel {}

impl RingChannel {
    /// # Safety
    /// `vaddr` must point to a zero-initialised or consistent `L1Buffer` that
    /// outlives the channel.
    pub unsafe fn from_raw(vaddr: usize) -> Self {
        Self {
            l1: NonNull::new_unchecked(vaddr as *mut L1Buffer),
        }
    }

    fn l1(&self) -> &L1Buffer {
        // SAFETY: validity guaranteed by `from_raw`.
        unsafe { self.l1.as_ref() }
    }

    pub fn vaddr(&self) -> usize {
        self.l1.as_ptr() as usize
    }

    /// Copy `cmd` into the next free slot and publish it
    pub fn try_enqueue(&mut self, cmd: &CommandMessage) -> Result<(), RingFull> {
        let l1 = self.l1();
        let first = l1.first_command.load(Ordering::Acquire);
        let free = l1.first_free_command.load(Ordering::Relaxed);
        if occupied(first, free, "command") == QUEUE_CAPACITY {
            return Err(RingFull);
        }
        let slot = (free % QUEUE_CAPACITY) as usize;
        // SAFETY: slots in [first, free) belong to the consumer; this one is ours.
        unsafe { ptr::write_volatile(l1.commands[slot].get(), *cmd) };
        l1.first_free_command
            .store(free.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Take the oldest answer, advancing the consumed counter
    pub fn pop_answer(&mut self) -> Option<AnswerMessage> {
        let l1 = self.l1();
        let first = l1.first_answer.load(Ordering::Relaxed);
        let free = l1.first_free_answer.load(Ordering::Acquire);
        if occupied(first, free, "answer") == 0 {
            return None;
        }
        let slot = (first % QUEUE_CAPACITY) as usize;
        // SAFETY: the producer published this slot before bumping `free`.
        let answer = unsafe { ptr::read_volatile(l1.answers[slot].get()) };
        l1.first_answer.store(first.wrapping_add(1), Ordering::Release);
        Some(answer)
    }

    pub fn commands_in_flight(&self) -> u32 {
        let l1 = self.l1();
        occupied(
            l1.first_command.load(Ordering::Acquire),
            l1.first_free_command.load(Ordering::Relaxed),
            "command",
        )
    }

    pub fn answers_pending(&self) -> u32 {
        let l1 = self.l1();
        occupied(
            l1.first_answer.load(Ordering::Relaxed),
            l1.first_free_answer.load(Ordering::Acquire),
            "answer",
        )
    }

    /// Both rings are empty
    pub fn is_idle(&self) -> bool {
        self.commands_in_flight() == 0 && self.answers_pending() == 0
    }

    /// Publish the normal-world clock (milliseconds since the epoch)
    pub fn set_current_time(&mut self, now_ms: u64) {
        let l1 = self.l1();
        write_synced(&l1.sync_serial_n, &l1.time_n, now_ms);
    }

    pub fn power_mode(&self) -> PowerMode {
        PowerMode::from_status(self.l1().status_s.load(Ordering::Acquire))
    }

    pub fn timeout_reader(&self) -> TimeoutReader {
        TimeoutReader { l1: self.l1 }
    }
}

/// Lock-free reader of the secure-world timeout register
#[derive(Debug, Clone, Copy)]
pub struct TimeoutReader {
    l1: NonNull<L1Buffer>,
}

// SAFETY: reads go through atomics only.
unsafe impl Send for TimeoutReader {}
unsafe impl Sync for TimeoutReader {}

impl TimeoutReader {
    /// Absolute secure-world timeout in milliseconds, or a sentinel
    pub fn read(&self) -> u64 {
        // SAFETY: the L1 page outlives the polling cycle that holds the reader.
        let l1 = unsafe { self.l1.as_ref() };
        read_synced(&l1.sync_serial_s, &l1.timeout_s)
    }
}

/// Secure-world side of the L1 rings
///
/// Used by the simulated secure peer; the real secure world implements the
/// same protocol on its own side of the page.
#[derive(Clone, Copy)]
pub struct SecureRingView {
    l1: NonNull<L1Buffer>,
}

// SAFETY: same protocol as RingChannel with producer/consumer roles swapped.
unsafe impl Send for SecureRingView {}

impl SecureRingView {
    /// # Safety
    /// `vaddr` must point to a live `L1Buffer`.
    pub unsafe fn from_raw(vaddr: usize) -> Self {
        Self {
            l1: NonNull::new_unchecked(vaddr as *mut L1Buffer),
        }
    }

    fn l1(&self) -> &L1Buffer {
        // SAFETY: validity guaranteed by `from_raw`.
        unsafe { self.l1.as_ref() }
    }

    pub fn pop_command(&self) -> Option<CommandMessage> {
        let l1 = self.l1();
        let first = l1.first_command.load(Ordering::Relaxed);
        let free = l1.first_free_command.load(Ordering::Acquire);
        if occupied(first, free, "command") == 0 {
            return None;
        }
        let slot = (first % QUEUE_CAPACITY) as usize;
        // SAFETY: published by the normal world before bumping `free`.
        let cmd = unsafe { ptr::read_volatile(l1.commands[slot].get()) };
        l1.first_command.store(first.wrapping_add(1), Ordering::Release);
        Some(cmd)
    }

    pub fn push_answer(&self, answer: &AnswerMessage) -> Result<(), RingFull> {
        let l1 = self.l1();
        let first = l1.first_answer.load(Ordering::Acquire);
        let free = l1.first_free_answer.load(Ordering::Relaxed);
        if occupied(first, free, "answer") == QUEUE_CAPACITY {
            return Err(RingFull);
        }
        let slot = (free % QUEUE_CAPACITY) as usize;
        // SAFETY: slot is outside the consumer's window.
        unsafe { ptr::write_volatile(l1.answers[slot].get(), *answer) };
        l1.first_free_answer
            .store(free.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    pub fn commands_pending(&self) -> u32 {
        let l1 = self.l1();
        occupied(
            l1.first_command.load(Ordering::Relaxed),
            l1.first_free_command.load(Ordering::Acquire),
            "command",
        )
    }

    pub fn write_timeout(&self, timeout_ms: u64) {
        let l1 = self.l1();
        write_synced(&l1.sync_serial_s, &l1.timeout_s, timeout_ms);
    }

    /// Normal-world clock as last published
    pub fn current_time(&self) -> u64 {
        let l1 = self.l1();
        read_synced(&l1.sync_serial_n, &l1.time_n)
    }

    pub fn set_power_mode(&self, mode: PowerMode) {
        let l1 = self.l1();
        let status = l1.status_s.load(Ordering::Relaxed) & !STATUS_POWER_STATE_MASK;
        l1.status_s
            .store(status | mode.to_status_bits(), Ordering::Release);
    }
}
