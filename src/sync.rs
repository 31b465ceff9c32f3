//! Thread-coordination building blocks for clients of the store: a
//! reusable barrier, a counting semaphore with a maximum, and an
//! auto/manual-reset event.
//!
//! Every blocking call takes an optional timeout; expiry is reported as
//! `false`, never as an error. These are in-process primitives — the store
//! itself is single-process and performs no locking beyond its
//! single-writer transaction discipline.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

fn wait_deadline<'a, T>(
    cvar: &Condvar,
    guard: std::sync::MutexGuard<'a, T>,
    deadline: Option<Instant>,
) -> (std::sync::MutexGuard<'a, T>, bool) {
    match deadline {
        None => (cvar.wait(guard).unwrap(), false),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return (guard, true);
            }
            let (guard, result) = cvar.wait_timeout(guard, deadline - now).unwrap();
            (guard, result.timed_out())
        }
    }
}

struct BarrierState {
    waiting: usize,
    generation: u64,
}

/// N-thread rendezvous, reusable round after round. The generation counter
/// keeps a straggler from a finished round out of the next one.
pub struct Barrier {
    state: Mutex<BarrierState>,
    cvar: Condvar,
    count: usize,
}

impl Barrier {
    /// A barrier for `count` threads. `count` must be nonzero.
    pub fn new(count: usize) -> Barrier {
        assert!(count > 0, "a barrier needs at least one thread");
        Barrier {
            state: Mutex::new(BarrierState {
                waiting: 0,
                generation: 0,
            }),
            cvar: Condvar::new(),
            count,
        }
    }

    /// Block until `count` threads have arrived, or the timeout expires.
    /// Returns `false` on expiry; the arrival is then withdrawn.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        let generation = state.generation;
        state.waiting += 1;
        if state.waiting == self.count {
            state.waiting = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return true;
        }
        loop {
            if state.generation != generation {
                return true;
            }
            let (next, timed_out) = wait_deadline(&self.cvar, state, deadline);
            state = next;
            if timed_out && state.generation == generation {
                state.waiting -= 1;
                return false;
            }
        }
    }
}

/// Counting semaphore bounded by a maximum count.
pub struct Semaphore {
    count: Mutex<usize>,
    cvar: Condvar,
    max: usize,
}

impl Semaphore {
    pub fn new(initial: usize, max: usize) -> Semaphore {
        assert!(max > 0 && initial <= max, "bad semaphore bounds");
        Semaphore {
            count: Mutex::new(initial),
            cvar: Condvar::new(),
            max,
        }
    }

    /// Take one permit, blocking until one is available or the timeout
    /// expires. Returns `false` on expiry.
    pub fn acquire(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut count = self.count.lock().unwrap();
        loop {
            if *count > 0 {
                *count -= 1;
                return true;
            }
            let (next, timed_out) = wait_deadline(&self.cvar, count, deadline);
            count = next;
            if timed_out && *count == 0 {
                return false;
            }
        }
    }

    /// Take one permit only if immediately available.
    pub fn try_acquire(&self) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Put `n` permits back, saturating at the maximum.
    pub fn release(&self, n: usize) {
        let mut count = self.count.lock().unwrap();
        *count = (*count + n).min(self.max);
        self.cvar.notify_all();
    }
}

/// Signalable event. A manual-reset event stays signaled until reset; an
/// auto-reset event releases exactly one waiter per set and clears itself.
pub struct Event {
    signaled: Mutex<bool>,
    cvar: Condvar,
    manual: bool,
}

impl Event {
    pub fn new(manual_reset: bool) -> Event {
        Event {
            signaled: Mutex::new(false),
            cvar: Condvar::new(),
            manual: manual_reset,
        }
    }

    pub fn set(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        if self.manual {
            self.cvar.notify_all();
        } else {
            self.cvar.notify_one();
        }
    }

    pub fn reset(&self) {
        *self.signaled.lock().unwrap() = false;
    }

    /// Block until the event is signaled or the timeout expires. Returns
    /// `false` on expiry. An auto-reset event is cleared by the waiter it
    /// releases.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut signaled = self.signaled.lock().unwrap();
        loop {
            if *signaled {
                if !self.manual {
                    *signaled = false;
                }
                return true;
            }
            let (next, timed_out) = wait_deadline(&self.cvar, signaled, deadline);
            signaled = next;
            if timed_out && !*signaled {
                return false;
            }
        }
    }
}
