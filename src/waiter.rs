// Copyright (c) 2020 kprotty
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// 	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use super::cpu::current_cpu;
use std::{
    cell::Cell,
    fmt,
    marker::PhantomPinned,
    pin::Pin,
    ptr::NonNull,
    sync::atomic::{AtomicU8, Ordering},
    thread::{self, Thread},
    time::Instant,
};

/// The record is linked into a wait queue and nobody has claimed it yet.
pub(crate) const WAITING: u8 = 0;
/// A waker detached the record and is about to deliver the wake.
pub(crate) const CLAIMED: u8 = 1;
/// The wake was delivered. Once a thread observes this it may return and invalidate the record.
pub(crate) const WOKEN: u8 = 2;
/// The owner removed the record itself after its deadline expired.
pub(crate) const TIMED_OUT: u8 = 3;

pub(crate) type WaiterLink = Cell<Option<NonNull<Waiter>>>;

/// A per-call registration of a blocked thread.
///
/// Lives on the stack of the blocking call and is only ever referenced by wait queues through
/// borrowed pointers. The owning call must not return while anything may still write to it,
/// which is what the [`WAITING`] -> [`CLAIMED`] -> [`WOKEN`] protocol guarantees.
pub(crate) struct Waiter {
    pub(crate) prev: WaiterLink,
    pub(crate) next: WaiterLink,
    state: AtomicU8,
    thread: Thread,
    cpu: Option<usize>,
    _pinned: PhantomPinned,
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("thread", &self.thread.id())
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("cpu", &self.cpu)
            .finish()
    }
}

impl Waiter {
    pub(crate) fn new() -> Self {
        Self {
            prev: Cell::new(None),
            next: Cell::new(None),
            state: AtomicU8::new(WAITING),
            thread: thread::current(),
            cpu: current_cpu(),
            _pinned: PhantomPinned,
        }
    }

    pub(crate) fn with<F>(f: impl FnOnce(Pin<&Self>) -> F) -> F {
        let waiter = Self::new();
        // SAFETY: The waiter lives on this stack frame and is never moved out of it.
        f(unsafe { Pin::new_unchecked(&waiter) })
    }

    /// A record claiming its owner last ran on `cpu`, for exercising locality grouping.
    #[cfg(test)]
    pub(crate) fn on_cpu(cpu: usize) -> Self {
        Self {
            cpu: Some(cpu),
            ..Self::new()
        }
    }

    /// The processor the owning thread was running on when it registered.
    pub(crate) fn cpu(&self) -> Option<usize> {
        self.cpu
    }

    pub(crate) fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    /// Transitions a queued record to [`CLAIMED`]. Must be called under the queue's lock.
    pub(crate) fn claim(&self) {
        let state = self.state.load(Ordering::Relaxed);
        assert_eq!(state, WAITING, "claimed a Waiter that was not queued");
        self.state.store(CLAIMED, Ordering::Relaxed);
    }

    /// Transitions a queued record to [`TIMED_OUT`]. Must be called under the queue's lock.
    pub(crate) fn cancel(&self) {
        let state = self.state.load(Ordering::Relaxed);
        assert_eq!(state, WAITING, "cancelled a Waiter that was not queued");
        self.state.store(TIMED_OUT, Ordering::Relaxed);
    }

    /// Blocks the owning thread until the record is woken or the deadline passes.
    ///
    /// Returns true if woken. Spurious unparks are absorbed here.
    #[cold]
    pub(crate) fn wait(&self, deadline: Option<Instant>) -> bool {
        loop {
            // Acquire barrier ensures the waker's writes happen before we return.
            if self.state.load(Ordering::Acquire) == WOKEN {
                return true;
            }

            match deadline {
                None => thread::park(),
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(timeout) => thread::park_timeout(timeout),
                    None => return false,
                },
            }
        }
    }

    /// Marks the record woken and makes its thread runnable.
    ///
    /// # Safety
    ///
    /// `waiter` must point to a live record which has been detached from every queue.
    /// The record may be invalidated as soon as the state store lands, so it is not touched after.
    #[cold]
    pub(crate) unsafe fn wake(waiter: NonNull<Self>) {
        let thread = waiter.as_ref().thread.clone();
        let state_ptr = &waiter.as_ref().state as *const AtomicU8;

        // Release barrier ensures everything done by the waker happens before the owner returns.
        let state = (*state_ptr).swap(WOKEN, Ordering::Release);
        assert!(
            state == WAITING || state == CLAIMED,
            "woke a Waiter which was already resolved (state = {})",
            state,
        );

        thread.unpark();
    }
}
