#![warn(
    rust_2018_idioms,
    unreachable_pub,
    // missing_docs
    // missing_debug_implementations    
)]

mod condvar;
mod cpu;
mod mode;
mod mutex;
mod queue;
mod spin;
mod waiter;

pub use self::{
    condvar::{Condvar, WaitTimeoutResult},
    mode::{ParseWakeModeError, WakeMode},
    mutex::{const_mutex, MappedMutexGuard, Mutex, MutexGuard, RawMutex},
};
