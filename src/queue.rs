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

use super::waiter::Waiter;
use std::{iter, ptr::NonNull};

/// An intrusive, doubly-linked FIFO of borrowed [`Waiter`]s.
///
/// The queue never owns its nodes: each one belongs to the stack frame of a blocked call and
/// stays valid for as long as it is linked. All methods must be called with whatever lock
/// protects the queue held.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    head: Option<NonNull<Waiter>>,
    tail: Option<NonNull<Waiter>>,
}

// SAFETY: the waiters are only dereferenced by whoever holds the queue's lock.
unsafe impl Send for WaitQueue {}

impl WaitQueue {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub(crate) fn head(&self) -> Option<NonNull<Waiter>> {
        self.head
    }

    pub(crate) unsafe fn push_back(&mut self, waiter: NonNull<Waiter>) {
        waiter.as_ref().next.set(None);
        waiter.as_ref().prev.set(self.tail);

        match self.tail {
            Some(tail) => tail.as_ref().next.set(Some(waiter)),
            None => self.head = Some(waiter),
        }

        self.tail = Some(waiter);
    }

    pub(crate) unsafe fn pop_front(&mut self) -> Option<NonNull<Waiter>> {
        let waiter = self.head?;
        self.unlink(waiter);
        Some(waiter)
    }

    /// Unlinks `waiter` from anywhere in the queue.
    ///
    /// # Safety
    ///
    /// `waiter` must currently be linked into this queue.
    pub(crate) unsafe fn remove(&mut self, waiter: NonNull<Waiter>) {
        debug_assert!(
            self.iter().any(|w| w == waiter),
            "removing a Waiter which isn't in this queue"
        );
        self.unlink(waiter);
    }

    unsafe fn unlink(&mut self, waiter: NonNull<Waiter>) {
        let prev = waiter.as_ref().prev.replace(None);
        let next = waiter.as_ref().next.replace(None);

        match prev {
            Some(prev) => prev.as_ref().next.set(next),
            None => {
                assert_eq!(self.head, Some(waiter), "WaitQueue head is corrupt");
                self.head = next;
            }
        }

        match next {
            Some(next) => next.as_ref().prev.set(prev),
            None => {
                assert_eq!(self.tail, Some(waiter), "WaitQueue tail is corrupt");
                self.tail = prev;
            }
        }
    }

    /// Detaches every waiter at once, leaving this queue empty.
    pub(crate) fn take_all(&mut self) -> Self {
        Self {
            head: self.head.take(),
            tail: self.tail.take(),
        }
    }

    /// Iterates the queue from oldest to newest.
    ///
    /// The successor is read before a waiter is yielded, but callers must still not wake or
    /// relink waiters while iterating.
    pub(crate) fn iter(&self) -> impl Iterator<Item = NonNull<Waiter>> + '_ {
        let mut current = self.head;
        iter::from_fn(move || {
            let waiter = current?;
            current = unsafe { waiter.as_ref().next.get() };
            Some(waiter)
        })
    }
}
