// SPDX-License-Identifier: MPL-2.0

use core::time::Duration;

use super::WaitQueue;
use crate::Machine;

/// The number of completions granted by [`Completion::complete_all`].
const COMPLETE_ALL: usize = usize::MAX / 2;

/// A one-shot (or counted) event that tasks can wait for.
///
/// Every [`complete`] lets one waiter through; [`complete_all`] lets all
/// current and future waiters through until the completion is
/// [`reinit`]ialized.
///
/// [`complete`]: Self::complete
/// [`complete_all`]: Self::complete_all
/// [`reinit`]: Self::reinit
pub struct Completion {
    done: spin::Mutex<usize>,
    wait_queue: WaitQueue,
}

impl Completion {
    /// Creates a completion that has not been completed.
    pub fn new(machine: &Machine) -> Self {
        Self {
            done: spin::Mutex::new(0),
            wait_queue: WaitQueue::new(machine),
        }
    }

    /// Signals the completion, letting one waiter through.
    pub fn complete(&self) {
        {
            let mut done = self.done.lock();
            if *done != COMPLETE_ALL {
                *done += 1;
            }
        }
        self.wait_queue.wake_one();
    }

    /// Signals the completion for every waiter.
    pub fn complete_all(&self) {
        *self.done.lock() = COMPLETE_ALL;
        self.wait_queue.wake_all();
    }

    /// Waits until the completion is signalled.
    pub fn wait(&self) {
        self.wait_queue.wait_until(|| self.try_consume().then_some(()));
    }

    /// Waits at most `timeout` for the completion, returning whether it was
    /// signalled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_queue
            .wait_until_timeout(|| self.try_consume().then_some(()), timeout)
            .is_some()
    }

    /// Returns whether a wait would return immediately.
    pub fn is_done(&self) -> bool {
        *self.done.lock() != 0
    }

    /// Resets the completion to the not-completed state.
    pub fn reinit(&self) {
        *self.done.lock() = 0;
    }

    fn try_consume(&self) -> bool {
        let mut done = self.done.lock();
        match *done {
            0 => false,
            COMPLETE_ALL => true,
            _ => {
                *done -= 1;
                true
            }
        }
    }
}
