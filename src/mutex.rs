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

use super::{
    queue::WaitQueue,
    spin::{Backoff, SpinLock},
    waiter::Waiter,
};
use std::{
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicU8, Ordering},
};

pub type Mutex<T> = lock_api::Mutex<RawMutex, T>;
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawMutex, T>;
pub type MappedMutexGuard<'a, T> = lock_api::MappedMutexGuard<'a, RawMutex, T>;

pub const fn const_mutex<T>(value: T) -> Mutex<T> {
    Mutex::const_new(<RawMutex as lock_api::RawMutex>::INIT, value)
}

const UNLOCKED: u8 = 0;
const LOCKED: u8 = 1;
const PARKED: u8 = 2;

/// The raw lock paired with [`Condvar`](crate::Condvar).
///
/// Contended unlocks are fair: ownership is passed straight to the oldest parked thread without
/// the lock ever appearing free. This is what lets a condition variable hand the lock to a
/// thread that is still asleep (see [`RawMutex::transfer`]).
///
/// # State table:
///
/// PARKED | LOCKED | Description
///    0   |   0    | Unlocked. The only state from which the lock can be acquired.
/// -------+--------+----------------------------------------------------------------------
///    0   |   1    | Locked with no parked threads; unlock() just clears LOCKED.
/// -------+--------+----------------------------------------------------------------------
///    1   |   1    | Locked with threads parked in `waiters`. unlock() takes the queue lock
///        |        | and hands ownership to the oldest one. Only modified under that lock.
/// -------+--------+----------------------------------------------------------------------
pub struct RawMutex {
    state: AtomicU8,
    waiters: SpinLock<WaitQueue>,
}

impl fmt::Debug for RawMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load(Ordering::Relaxed);
        f.debug_struct("RawMutex")
            .field("locked", &(state & LOCKED != 0))
            .field("parked", &(state & PARKED != 0))
            .finish()
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl lock_api::RawMutex for RawMutex {
    const INIT: Self = Self::new();

    type GuardMarker = lock_api::GuardSend;

    #[inline]
    fn lock(&self) {
        if self
            .state
            .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_slow();
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    unsafe fn unlock(&self) {
        if self
            .state
            .compare_exchange(LOCKED, UNLOCKED, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            self.unlock_slow();
        }
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & LOCKED != 0
    }
}

impl RawMutex {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNLOCKED),
            waiters: SpinLock::new(WaitQueue::new()),
        }
    }

    #[cold]
    fn lock_slow(&self) {
        let mut backoff = Backoff::new();
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state == UNLOCKED {
                match self.state.compare_exchange_weak(
                    UNLOCKED,
                    LOCKED,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return,
                    Err(_) => continue,
                }
            }

            if backoff.spin() {
                continue;
            }

            // Park until an unlock() hands us ownership, unless the lock frees up while enqueueing.
            let handed_off = Waiter::with(|waiter| unsafe {
                let waiter = NonNull::from(&*waiter);
                if self.enqueue_or_acquire(waiter) {
                    return false;
                }

                assert!(waiter.as_ref().wait(None));
                true
            });

            if handed_off {
                return;
            }

            backoff = Backoff::new();
        }
    }

    /// Either acquires the lock (returning true) or parks `waiter` behind the current owner.
    ///
    /// The PARKED bit is set under the queue lock together with the push so that
    /// unlock() is forced into the slow path and is guaranteed to see the waiter.
    unsafe fn enqueue_or_acquire(&self, waiter: NonNull<Waiter>) -> bool {
        let mut waiters = self.waiters.lock();
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state == UNLOCKED {
                match self.state.compare_exchange_weak(
                    UNLOCKED,
                    LOCKED,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return true,
                    Err(e) => state = e,
                }
                continue;
            }

            match self.state.compare_exchange_weak(
                state,
                state | PARKED,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(e) => state = e,
            }
        }

        waiters.push_back(waiter);
        false
    }

    #[cold]
    unsafe fn unlock_slow(&self) {
        let mut waiters = self.waiters.lock();
        let state = self.state.load(Ordering::Relaxed);
        assert_ne!(state & LOCKED, 0, "unlocked a RawMutex which wasn't locked");

        match waiters.pop_front() {
            Some(waiter) => {
                // Ownership moves to the waiter so LOCKED stays set.
                // Release barrier ensures our critical section happens before the new owner's.
                let new_state = if waiters.is_empty() {
                    LOCKED
                } else {
                    LOCKED | PARKED
                };
                self.state.store(new_state, Ordering::Release);
                drop(waiters);
                Waiter::wake(waiter);
            }
            None => {
                self.state.store(UNLOCKED, Ordering::Release);
            }
        }
    }

    /// Grants ownership of the mutex to the (still sleeping) owner of `waiter`.
    ///
    /// If the mutex is free it is acquired on the waiter's behalf and the waiter is woken right
    /// away. Otherwise the waiter is queued and the current owner's unlock() wakes it holding the
    /// lock. Either way no other thread can acquire the mutex between this call and the woken
    /// thread's [`acknowledge`](RawMutex::acknowledge).
    ///
    /// # Safety
    ///
    /// `waiter` must be a live record detached from every other queue whose owner will call
    /// `acknowledge()` once woken.
    pub(crate) unsafe fn transfer(&self, waiter: NonNull<Waiter>) {
        if self.enqueue_or_acquire(waiter) {
            Waiter::wake(waiter);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_parked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & PARKED != 0
    }

    /// Completes a [`transfer`](RawMutex::transfer) from the thread that received the lock.
    pub(crate) fn acknowledge(&self) {
        let state = self.state.load(Ordering::Acquire);
        assert_ne!(
            state & LOCKED,
            0,
            "acknowledged a lock transfer on an unlocked RawMutex"
        );
    }
}
