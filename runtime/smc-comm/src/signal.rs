//! Wait/wake primitives: answer completions, termination signals, the
//! polling-thread death notice and the crypto hardware lock

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::layout::AnswerMessage;

/// Lock ignoring poisoning; a panicked holder cannot leave these states torn
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct SignalState {
    answer: Option<AnswerMessage>,
    aborted: bool,
}

/// How a blocking wait for an answer ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Answer(AnswerMessage),
    Killed,
    Aborted,
}

/// Completion signal plus answer destination of one correlation entry
#[derive(Default)]
pub struct AnswerSignal {
    state: Mutex<SignalState>,
    cv: Condvar,
}

impl AnswerSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deliver(&self, answer: AnswerMessage) {
        lock(&self.state).answer = Some(answer);
        self.cv.notify_all();
    }

    /// Wake the waiter without an answer (channel closed)
    pub fn abort(&self) {
        lock(&self.state).aborted = true;
        self.cv.notify_all();
    }

    pub fn take_answer(&self) -> Option<AnswerMessage> {
        lock(&self.state).answer.take()
    }

    fn poke(&self) {
        let _state = lock(&self.state);
        self.cv.notify_all();
    }

    /// Block until the answer lands, the channel closes, or `kill` fires
    pub fn wait(self: &Arc<Self>, kill: Option<&KillSwitch>) -> WaitOutcome {
        if let Some(kill) = kill {
            kill.watch(Arc::downgrade(self));
        }
        let mut state = lock(&self.state);
        let outcome = loop {
            if let Some(answer) = state.answer.take() {
                break WaitOutcome::Answer(answer);
            }
            if state.aborted {
                break WaitOutcome::Aborted;
            }
            if kill.is_some_and(KillSwitch::is_killed) {
                break WaitOutcome::Killed;
            }
            state = self
                .cv
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        };
        drop(state);
        if let Some(kill) = kill {
            kill.unwatch();
        }
        outcome
    }
}

struct KillInner {
    killed: AtomicBool,
    waiting_on: Mutex<Option<Weak<AnswerSignal>>>,
}

/// Termination signal for a killable caller
///
/// Only this signal cancels a blocking send; everything else is ignored while
/// the caller waits.
#[derive(Clone)]
pub struct KillSwitch {
    inner: Arc<KillInner>,
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl KillSwitch {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(KillInner {
                killed: AtomicBool::new(false),
                waiting_on: Mutex::new(None),
            }),
        }
    }

    pub fn kill(&self) {
        self.inner.killed.store(true, Ordering::SeqCst);
        let target = lock(&self.inner.waiting_on).as_ref().and_then(Weak::upgrade);
        if let Some(signal) = target {
            signal.poke();
        }
    }

    pub fn is_killed(&self) -> bool {
        self.inner.killed.load(Ordering::SeqCst)
    }

    fn watch(&self, signal: Weak<AnswerSignal>) {
        *lock(&self.inner.waiting_on) = Some(signal);
    }

    fn unwatch(&self) {
        *lock(&self.inner.waiting_on) = None;
    }
}

/// One-shot completion, reusable after [`Completion::reset`]
#[derive(Default)]
pub struct Completion {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Completion {
    pub fn complete(&self) {
        *lock(&self.done) = true;
        self.cv.notify_all();
    }

    pub fn reset(&self) {
        *lock(&self.done) = false;
    }

    pub fn is_complete(&self) -> bool {
        *lock(&self.done)
    }

    pub fn wait(&self) {
        let mut done = lock(&self.done);
        while !*done {
            done = self.cv.wait(done).unwrap_or_else(|p| p.into_inner());
        }
    }

    /// Returns false on timeout
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let done = lock(&self.done);
        let (done, _) = self
            .cv
            .wait_timeout_while(done, timeout, |done| !*done)
            .unwrap_or_else(|p| p.into_inner());
        *done
    }
}

/// Binary semaphore guarding the crypto accelerators
///
/// The secure world owns the hardware while it runs; the polling thread
/// releases it for the duration of each normal-world polling cycle.
pub struct HwaLock {
    available: Mutex<bool>,
    cv: Condvar,
}

impl HwaLock {
    /// Lock initially owned by the secure world
    pub fn new_held() -> Self {
        Self {
            available: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn acquire(&self) {
        let mut available = lock(&self.available);
        while !*available {
            available = self.cv.wait(available).unwrap_or_else(|p| p.into_inner());
        }
        *available = false;
    }

    pub fn try_acquire(&self) -> bool {
        let mut available = lock(&self.available);
        std::mem::replace(&mut *available, false)
    }

    pub fn release(&self) {
        *lock(&self.available) = true;
        self.cv.notify_one();
    }
}
