// SPDX-License-Identifier: MPL-2.0

//! Sleeping synchronization primitives.
//!
//! Short critical sections use the spin locks of the `spin` crate directly.
//! The primitives here put the calling task to sleep through the injected
//! scheduler, so they must not be used from interrupt context.

mod completion;
mod mutex;
mod wait;

pub use self::{
    completion::Completion,
    mutex::{Mutex, MutexGuard},
    wait::{WaitQueue, Waiter, Waker},
};
