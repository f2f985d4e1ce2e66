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

use std::{
    cell::UnsafeCell,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
    thread,
};

pub(crate) struct Backoff {
    spin: u8,
}

impl Backoff {
    #[cfg(target_arch = "x86_64")]
    const MAX_SPIN: u8 = 100;
    #[cfg(not(target_arch = "x86_64"))]
    const MAX_SPIN: u8 = 10;

    pub(crate) fn new() -> Self {
        Self {
            spin: Self::MAX_SPIN,
        }
    }

    /// Spins once, returning false when the spin budget is exhausted.
    pub(crate) fn spin(&mut self) -> bool {
        self.spin
            .checked_sub(1)
            .map(|new_spin| {
                self.spin = new_spin;
                spin_loop();
            })
            .is_some()
    }

    /// Spins, falling back to yielding the OS thread once the budget runs out.
    pub(crate) fn snooze(&mut self) {
        if !self.spin() {
            *self = Self::new();
            thread::yield_now();
        }
    }
}

/// A short-held test-and-test-and-set lock protecting waiter queues.
///
/// Nothing done while holding it may park the thread.
pub(crate) struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    pub(crate) fn lock(&self) -> SpinLockGuard<'_, T> {
        if self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_slow();
        }

        SpinLockGuard { lock: self }
    }

    #[cold]
    fn lock_slow(&self) {
        let mut backoff = Backoff::new();
        loop {
            // Spin on a load so contending threads share the cache line until it looks free.
            while self.locked.load(Ordering::Relaxed) {
                backoff.snooze();
            }

            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }
}

pub(crate) struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
