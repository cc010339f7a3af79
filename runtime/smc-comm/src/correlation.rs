//! Answer correlation table
//!
//! # Architecture
//! In-flight blocking sends are tracked in an arena. A [`Token`] packs the
//! slot index and the slot's generation into the 32-bit `operation_id` of the
//! command, so an answer for a slot that has since been reused is recognised
//! as stale instead of being delivered to the wrong caller.
//!
//! Entries whose caller was cancelled stay in the table, marked as orphaned,
//! until their answer is drained. [`CompensationRule`]s then decide whether the
//! answer left secure-side state behind that must be torn down.

use std::sync::Arc;

use crate::layout::{status, AnswerMessage, CommandMessage, MessageType, OPERATION_ID_NONE};
use crate::signal::AnswerSignal;

const INDEX_BITS: u32 = 16;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
/// Index 0xFFFF is never handed out so no token equals `OPERATION_ID_NONE`
const MAX_ENTRIES: usize = INDEX_MASK as usize;

/// Generation-checked handle to a correlation entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u32);

impl Token {
    fn new(index: u16, generation: u16) -> Self {
        Self(((generation as u32) << INDEX_BITS) | index as u32)
    }

    pub fn from_operation_id(id: u32) -> Option<Self> {
        (id != OPERATION_ID_NONE).then_some(Self(id))
    }

    pub fn operation_id(self) -> u32 {
        self.0
    }

    pub fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    pub fn generation(self) -> u16 {
        (self.0 >> INDEX_BITS) as u16
    }
}

/// Result of matching a drained answer against the table
#[derive(Debug)]
pub enum Delivery {
    /// Handed to the waiting caller; entry released
    Delivered,
    /// Caller is gone; entry kept until the drain loop settles it
    Orphaned,
    /// Answer to the teardown issued for an orphan; entry released
    Compensated,
    /// No live entry for this token
    Stale,
}

/// Result of a cancelled caller withdrawing from its entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Withdrawal {
    /// Entry marked orphaned; the drain loop frees it later
    Orphaned,
    /// The answer arrived first; it is waiting in the caller's signal
    AlreadyCompleted,
}

/// Produces a teardown command for an answer nobody is waiting for
///
/// An orphaned entry is compensated at most once: the answer to the teardown
/// settles the entry without consulting the rules again.
pub trait CompensationRule: Send + Sync {
    fn compensate(&self, answer: &AnswerMessage) -> Option<CommandMessage>;
}

/// A device context created for a cancelled caller is destroyed again
#[derive(Debug, Default, Clone, Copy)]
pub struct DestroyOrphanedDeviceContext;

impl CompensationRule for DestroyOrphanedDeviceContext {
    fn compensate(&self, answer: &AnswerMessage) -> Option<CommandMessage> {
        (answer.kind() == Some(MessageType::CreateDeviceContext) && answer.status == status::S_SUCCESS)
            .then(|| CommandMessage::new(MessageType::DestroyDeviceContext).with_body(&[answer.body[0]]))
    }
}

struct Waiter {
    signal: Arc<AnswerSignal>,
    thread_available: bool,
    compensated: bool,
}

#[derive(Default)]
struct Entry {
    generation: u16,
    waiter: Option<Waiter>,
}

/// Arena of in-flight correlation entries
///
/// Lives behind the monitor lock together with the rings.
#[derive(Default)]
pub struct CorrelationTable {
    entries: Vec<Entry>,
    free: Vec<u16>,
    live: usize,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries registered and not yet released
    pub fn pending(&self) -> usize {
        self.live
    }

    /// Register a waiting caller; `None` when the arena is exhausted
    pub fn register(&mut self, signal: Arc<AnswerSignal>) -> Option<Token> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.entries.len() < MAX_ENTRIES => {
                self.entries.push(Entry::default());
                (self.entries.len() - 1) as u16
            }
            None => return None,
        };
        let entry = &mut self.entries[index as usize];
        entry.waiter = Some(Waiter {
            signal,
            thread_available: true,
            compensated: false,
        });
        self.live += 1;
        Some(Token::new(index, entry.generation))
    }

    fn entry_mut(&mut self, token: Token) -> Option<&mut Entry> {
        self.entries
            .get_mut(token.index())
            .filter(|e| e.generation == token.generation() && e.waiter.is_some())
    }

    /// Drop an entry regardless of its state
    pub fn release(&mut self, token: Token) -> bool {
        let Some(entry) = self.entry_mut(token) else {
            return false;
        };
        entry.waiter = None;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(token.index() as u16);
        self.live -= 1;
        true
    }

    /// Route a drained answer to its entry
    pub fn complete(&mut self, token: Token, answer: &AnswerMessage) -> Delivery {
        let Some(entry) = self.entry_mut(token) else {
            return Delivery::Stale;
        };
        let Some(waiter) = entry.waiter.as_ref() else {
            return Delivery::Stale;
        };
        if !waiter.thread_available {
            if waiter.compensated {
                self.release(token);
                return Delivery::Compensated;
            }
            return Delivery::Orphaned;
        }
        waiter.signal.deliver(*answer);
        self.release(token);
        Delivery::Delivered
    }

    /// Cancelled caller gives up its entry
    pub fn withdraw(&mut self, token: Token) -> Withdrawal {
        match self.entry_mut(token).and_then(|e| e.waiter.as_mut()) {
            Some(waiter) => {
                waiter.thread_available = false;
                Withdrawal::Orphaned
            }
            None => Withdrawal::AlreadyCompleted,
        }
    }

    /// Record that a teardown was issued on an orphaned entry
    pub fn mark_compensated(&mut self, token: Token) -> bool {
        match self.entry_mut(token).and_then(|e| e.waiter.as_mut()) {
            Some(waiter) if !waiter.thread_available => {
                waiter.compensated = true;
                true
            }
            _ => false,
        }
    }

    /// Wake every live waiter with an abort and empty the table
    pub fn abort_all(&mut self) -> usize {
        let mut aborted = 0;
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if let Some(waiter) = entry.waiter.take() {
                if waiter.thread_available {
                    waiter.signal.abort();
                    aborted += 1;
                }
                entry.generation = entry.generation.wrapping_add(1);
                self.free.push(index as u16);
            }
        }
        self.live = 0;
        aborted
    }
}
