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
    mode::WakeMode,
    mutex::{MutexGuard, RawMutex},
    queue::WaitQueue,
    spin::SpinLock,
    waiter::{Waiter, WAITING},
};
use lock_api::RawMutex as _RawMutex;
use log::{debug, trace};
use std::{
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

struct WaitList {
    waiters: WaitQueue,
    /// The mutex every queued waiter registered with. Only tracked in [`WakeMode::Handoff`],
    /// and reset whenever `waiters` becomes empty.
    mutex: Option<NonNull<RawMutex>>,
}

// SAFETY: only accessed under the Condvar's internal lock.
unsafe impl Send for WaitList {}

/// A Condition Variable
///
/// Condition variables represent the ability to block a thread such that it
/// consumes no CPU time while waiting for an event to occur. Condition
/// variables are typically associated with a boolean predicate (a condition)
/// and a mutex. The predicate is always verified inside of the mutex before
/// determining that thread must block.
///
/// Waiting threads are woken in FIFO order. How they are woken is decided once, at
/// construction, by a [`WakeMode`]:
///
/// - [`WakeMode::Handoff`] ("wait morphing"): a notified thread is given ownership of the mutex
///   it waited with while it is still asleep. It never re-contends for the mutex, and no other
///   thread can take the mutex between the notification and the waiter running.
///   All threads waiting at the same time must use the same mutex; waiting with two different
///   mutexes at once panics. A different mutex may be used once all waiters have left.
/// - [`WakeMode::Resume`]: a notified thread is made runnable and re-acquires its mutex itself.
///
/// A timed wait reports a timeout only if no notification was delivered to it: a waiter whose
/// deadline expires while a `notify_*` call is already waking it returns as notified.
///
/// # Examples
///
/// ```
/// use morphsync::{Mutex, Condvar};
/// use std::sync::Arc;
/// use std::thread;
///
/// let pair = Arc::new((Mutex::new(false), Condvar::new()));
/// let pair2 = pair.clone();
///
/// // Inside of our lock, spawn a new thread, and then wait for it to start
/// thread::spawn(move|| {
///     let &(ref lock, ref cvar) = &*pair2;
///     let mut started = lock.lock();
///     *started = true;
///     cvar.notify_one();
/// });
///
/// // wait for the thread to start up
/// let &(ref lock, ref cvar) = &*pair;
/// let mut started = lock.lock();
/// while !*started {
///     cvar.wait(&mut started);
/// }
/// ```
pub struct Condvar {
    mode: WakeMode,
    /// Mirrors `!queue.waiters.is_empty()` so notifications can skip the internal lock.
    has_waiters: AtomicBool,
    queue: SpinLock<WaitList>,
}

impl fmt::Debug for Condvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl Condvar {
    /// Creates a new condition variable which is ready to be waited on and
    /// notified, using [`WakeMode::DEFAULT`].
    pub const fn new() -> Self {
        Self::with_mode(WakeMode::DEFAULT)
    }

    /// Creates a new condition variable which wakes waiters using `mode`.
    pub const fn with_mode(mode: WakeMode) -> Self {
        Self {
            mode,
            has_waiters: AtomicBool::new(false),
            queue: SpinLock::new(WaitList {
                waiters: WaitQueue::new(),
                mutex: None,
            }),
        }
    }

    /// The wake mode this condition variable was created with.
    pub fn mode(&self) -> WakeMode {
        self.mode
    }

    /// Blocks the current thread until this condition variable receives a
    /// notification.
    ///
    /// This function will atomically unlock the mutex specified (represented by
    /// `mutex_guard`) and block the current thread. This means that any calls
    /// to `notify_*()` which happen logically after the mutex is unlocked are
    /// candidates to wake this thread up. When this function call returns, the
    /// lock specified will have been re-acquired.
    ///
    /// # Panics
    ///
    /// In [`WakeMode::Handoff`], panics if another thread is waiting on this condvar with a
    /// different mutex.
    pub fn wait<T: ?Sized>(&self, mutex_guard: &mut MutexGuard<'_, T>) {
        let result = self.wait_with(mutex_guard, None);
        assert!(!result.timed_out());
    }

    /// Blocks the current thread while `condition` returns true, re-checking it under the
    /// mutex after every wake up.
    pub fn wait_while<T: ?Sized>(
        &self,
        mutex_guard: &mut MutexGuard<'_, T>,
        mut condition: impl FnMut(&mut T) -> bool,
    ) {
        while condition(&mut **mutex_guard) {
            self.wait(mutex_guard);
        }
    }

    /// Waits on this condition variable for a notification, timing out after
    /// the specified time instant.
    ///
    /// The semantics of this function are equivalent to `wait()` except that
    /// the thread will be blocked roughly until `timeout` is reached. A deadline
    /// in the past still releases and re-acquires the mutex.
    ///
    /// The returned `WaitTimeoutResult` value indicates if the timeout is
    /// known to have elapsed without a notification being delivered.
    ///
    /// Like `wait`, the lock specified will be re-acquired when this function
    /// returns, regardless of whether the timeout elapsed or not.
    pub fn wait_until<T: ?Sized>(
        &self,
        mutex_guard: &mut MutexGuard<'_, T>,
        timeout: Instant,
    ) -> WaitTimeoutResult {
        self.wait_with(mutex_guard, Some(timeout))
    }

    /// Waits on this condition variable for a notification, timing out after a
    /// specified duration.
    ///
    /// The semantics of this function are equivalent to `wait()` except that
    /// the thread will be blocked for roughly no longer than `timeout`. A
    /// duration too large to be represented as a deadline waits forever.
    ///
    /// Like `wait`, the lock specified will be re-acquired when this function
    /// returns, regardless of whether the timeout elapsed or not.
    pub fn wait_for<T: ?Sized>(
        &self,
        mutex_guard: &mut MutexGuard<'_, T>,
        timeout: Duration,
    ) -> WaitTimeoutResult {
        let deadline = Instant::now().checked_add(timeout);
        self.wait_with(mutex_guard, deadline)
    }

    /// Like [`wait_while`](Condvar::wait_while), but gives up after `timeout`.
    ///
    /// The result reports a timeout only if `condition` still holds once the time ran out.
    pub fn wait_while_for<T: ?Sized>(
        &self,
        mutex_guard: &mut MutexGuard<'_, T>,
        timeout: Duration,
        mut condition: impl FnMut(&mut T) -> bool,
    ) -> WaitTimeoutResult {
        let deadline = Instant::now().checked_add(timeout);
        while condition(&mut **mutex_guard) {
            if self.wait_with(mutex_guard, deadline).timed_out() {
                return WaitTimeoutResult(condition(&mut **mutex_guard));
            }
        }
        WaitTimeoutResult(false)
    }

    #[cold]
    fn wait_with<T: ?Sized>(
        &self,
        mutex_guard: &mut MutexGuard<'_, T>,
        deadline: Option<Instant>,
    ) -> WaitTimeoutResult {
        trace!("condvar {:p} wait (deadline = {:?})", self, deadline);

        // SAFETY: The guard proves the calling thread holds the mutex,
        // and it is held again by the time we return.
        let timed_out = unsafe {
            let raw_mutex = MutexGuard::mutex(mutex_guard).raw();
            self.wait_raw(raw_mutex, deadline)
        };

        WaitTimeoutResult(timed_out)
    }

    /// Returns true if the wait timed out.
    ///
    /// # Safety
    ///
    /// The calling thread must hold `raw_mutex`.
    unsafe fn wait_raw(&self, raw_mutex: &RawMutex, deadline: Option<Instant>) -> bool {
        Waiter::with(|waiter| {
            let waiter_ptr = NonNull::from(&*waiter);
            self.enqueue_and_unlock(waiter_ptr, raw_mutex);

            // Block the thread and wait for a wake up or timeout.
            let mut woken = waiter.wait(deadline);

            // On timeout, we must ensure that our waiter is no longer in the queue before returning.
            // If a notify already detached it, that notify is about to (or just did) wake it,
            // so the timeout is void and we must stay put until it does.
            if !woken && !self.try_remove(waiter_ptr) {
                debug!(
                    "condvar {:p} waiter timed out with a wake in flight, waiting for it",
                    self
                );
                woken = waiter.wait(None);
                assert!(woken, "Condvar waiter claimed but never woken");
            }

            // Hand-off wakes only happen after the mutex was transferred to us.
            if woken && self.mode == WakeMode::Handoff {
                raw_mutex.acknowledge();
            } else {
                raw_mutex.lock();
            }

            !woken
        })
    }

    unsafe fn enqueue_and_unlock(&self, waiter: NonNull<Waiter>, raw_mutex: &RawMutex) {
        let mut queue = self.queue.lock();

        if self.mode == WakeMode::Handoff {
            let mutex = NonNull::from(raw_mutex);
            let captured = *queue.mutex.get_or_insert(mutex);
            assert_eq!(
                captured, mutex,
                "Condvar waited on with different mutexes at the same time"
            );
        }

        queue.waiters.push_back(waiter);
        self.has_waiters.store(true, Ordering::Relaxed);

        // The waiter is visible to notify_*() before the mutex is released, and both
        // releases happen back to back, so a notification sent as soon as the mutex
        // is free can't be missed.
        raw_mutex.unlock();
        drop(queue);
    }

    /// Removes a waiter whose deadline expired, returning false if a notify already claimed it.
    unsafe fn try_remove(&self, waiter: NonNull<Waiter>) -> bool {
        let mut queue = self.queue.lock();
        if waiter.as_ref().state() != WAITING {
            return false;
        }

        queue.waiters.remove(waiter);
        waiter.as_ref().cancel();
        if queue.waiters.is_empty() {
            self.mark_empty(&mut queue);
        }

        true
    }

    fn mark_empty(&self, queue: &mut WaitList) {
        self.has_waiters.store(false, Ordering::Relaxed);
        queue.mutex = None;
    }

    /// Wakes up one blocked thread on this condvar, the one which has been waiting the longest.
    ///
    /// Returns **a hint** as to whether a thread was woken up.
    ///
    /// If there is a blocked thread on this condition variable, then it will
    /// be woken up from its call to `wait` or `wait_for`. Calls to
    /// `notify_one` are not buffered in any way *to subsequent waiters*.
    ///
    /// To wake up all threads, see `notify_all()`.
    ///
    /// # Examples
    ///
    /// ```
    /// use morphsync::Condvar;
    ///
    /// let condvar = Condvar::new();
    ///
    /// // do something with condvar, share it with other threads
    ///
    /// if !condvar.notify_one() {
    ///     println!("Nobody was listening for this.");
    /// }
    /// ```
    #[inline]
    pub fn notify_one(&self) -> bool {
        trace!("condvar {:p} notify_one", self);

        // Avoid contending on the internal lock when there's nobody to wake.
        if !self.has_waiters.load(Ordering::Relaxed) {
            return false;
        }

        self.notify_one_slow()
    }

    #[cold]
    fn notify_one_slow(&self) -> bool {
        let (waiter, mutex) = {
            let mut queue = self.queue.lock();
            let waiter = match unsafe { queue.waiters.pop_front() } {
                Some(waiter) => waiter,
                None => return false,
            };

            unsafe { waiter.as_ref().claim() };
            let mutex = queue.mutex;
            if queue.waiters.is_empty() {
                self.mark_empty(&mut queue);
            }

            (waiter, mutex)
        };

        // SAFETY: The claimed waiter can't return (and drop the mutex it borrows) until woken.
        unsafe {
            match self.mode {
                WakeMode::Resume => Waiter::wake(waiter),
                WakeMode::Handoff => Self::mutex_of(mutex).transfer(waiter),
            }
        }

        true
    }

    /// Wakes up all blocked threads on this condvar, oldest first.
    ///
    /// Returns **a hint** as to whether any threads were woken up.
    ///
    /// This method will ensure that any current waiters on the condition
    /// variable are awoken. Calls to `notify_all()` are not buffered in any
    /// way.
    ///
    /// To wake up only one thread, see `notify_one()`.
    #[inline]
    pub fn notify_all(&self) -> bool {
        trace!("condvar {:p} notify_all", self);

        if !self.has_waiters.load(Ordering::Relaxed) {
            return false;
        }

        self.notify_all_slow()
    }

    #[cold]
    fn notify_all_slow(&self) -> bool {
        match self.detach_all() {
            Some((waiters, mutex)) => {
                unsafe { self.wake_detached(waiters, mutex) };
                true
            }
            None => false,
        }
    }

    /// Claims every queued waiter at once, returning them along with the captured mutex.
    fn detach_all(&self) -> Option<(WaitQueue, Option<NonNull<RawMutex>>)> {
        let mut queue = self.queue.lock();
        if queue.waiters.is_empty() {
            return None;
        }

        let waiters = queue.waiters.take_all();
        for waiter in waiters.iter() {
            unsafe { waiter.as_ref().claim() };
        }

        let mutex = queue.mutex;
        self.mark_empty(&mut queue);
        Some((waiters, mutex))
    }

    /// Wakes waiters detached by [`detach_all`](Condvar::detach_all). Never called with the
    /// internal lock held as it may take a while.
    unsafe fn wake_detached(&self, mut waiters: WaitQueue, mutex: Option<NonNull<RawMutex>>) {
        // pop_front() unlinks each waiter before it's woken, as waking may invalidate it.
        while let Some(waiter) = waiters.pop_front() {
            if self.mode == WakeMode::Resume {
                Waiter::wake(waiter);
                continue;
            }

            let mutex = Self::mutex_of(mutex);
            let cpu = waiter.as_ref().cpu();
            mutex.transfer(waiter);

            // Threads waking up on the same CPU back to back is cheaper than bouncing between CPUs,
            // so hand off to the remaining waiters which last ran on this CPU right away.
            let cpu = match cpu {
                Some(cpu) => cpu,
                None => continue,
            };

            let mut grouped = 0usize;
            let mut cursor = waiters.head();
            while let Some(other) = cursor {
                cursor = other.as_ref().next.get();
                if other.as_ref().cpu() == Some(cpu) {
                    waiters.remove(other);
                    mutex.transfer(other);
                    grouped += 1;
                }
            }

            if grouped > 0 {
                debug!(
                    "condvar {:p} handed off to {} more waiters on cpu {}",
                    self, grouped, cpu
                );
            }
        }
    }

    unsafe fn mutex_of<'a>(mutex: Option<NonNull<RawMutex>>) -> &'a RawMutex {
        match mutex {
            Some(mutex) => &*mutex.as_ptr(),
            None => unreachable!("Condvar in Handoff mode had waiters without a mutex"),
        }
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.queue.lock().waiters.iter().count()
    }

    #[cfg(test)]
    fn captured_mutex(&self) -> Option<NonNull<RawMutex>> {
        self.queue.lock().mutex
    }
}

/// A type indicating whether a timed wait on a condition variable returned
/// due to a time out or not.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct WaitTimeoutResult(bool);

impl WaitTimeoutResult {
    /// Returns whether the wait was known to have timed out.
    #[inline]
    pub fn timed_out(self) -> bool {
        self.0
    }
}
