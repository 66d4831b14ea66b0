// SPDX-License-Identifier: MPL-2.0

use alloc::collections::VecDeque;
use core::{
    marker::PhantomData,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    time::Duration,
};

use crate::{
    arch::Platform,
    prelude::*,
    task::{Scheduler, TaskHandle},
    Machine,
};

// # Explanation on the memory orders
//
// ```
// [CPU 1 (the waker)]     [CPU 2 (the waiter)]
// cond = true;
// wake_up();
//                         wait();
//                         if cond { /* .. */ }
// ```
//
// As soon as the waiter is woken up by the waker, it must see the true condition. This is
// trivially satisfied if `wake_up()` and `wait()` synchronize with a lock. But if they synchronize
// with an atomic variable, `wake_up()` must access the variable with `Ordering::Release` and
// `wait()` must access the variable with `Ordering::Acquire`.
//
// Note that dropping a waiter must be treated as a `wait()` with zero timeout, because we need to
// make sure that the wake event isn't lost in this case.

/// A wait queue.
///
/// One may wait on a wait queue to put its executing task to sleep.
/// Multiple tasks may be the waiters of a wait queue.
/// Other tasks may invoke the `wake`-family methods of a wait queue to
/// wake up one or many waiting tasks.
pub struct WaitQueue {
    // A copy of `wakers.len()`, used for the lock-free fast path in `wake_one` and `wake_all`.
    num_wakers: AtomicU32,
    wakers: spin::Mutex<VecDeque<Arc<Waker>>>,
    scheduler: Arc<dyn Scheduler>,
    platform: Arc<dyn Platform>,
}

impl WaitQueue {
    /// Creates a new, empty wait queue whose waiters sleep through the
    /// scheduler of `machine`.
    pub fn new(machine: &Machine) -> Self {
        WaitQueue {
            num_wakers: AtomicU32::new(0),
            wakers: spin::Mutex::new(VecDeque::new()),
            scheduler: machine.scheduler().clone(),
            platform: machine.platform().clone(),
        }
    }

    /// Waits until some condition is met.
    ///
    /// This method takes a closure that tests a user-given condition.
    /// The method only returns if the condition returns `Some(_)`.
    /// A waker task should first make the condition `Some(_)`, then invoke the
    /// `wake`-family method. This ordering is important to ensure that waiter
    /// tasks do not lose any wakeup notifications.
    pub fn wait_until<F, R>(&self, mut cond: F) -> R
    where
        F: FnMut() -> Option<R>,
    {
        if let Some(res) = cond() {
            return res;
        }

        let (waiter, _) = Waiter::new_pair(self);
        loop {
            self.enqueue(waiter.waker());
            if let Some(res) = cond() {
                return res;
            }
            waiter.wait();
        }
    }

    /// Waits until some condition is met or `timeout` has passed.
    ///
    /// Returns `None` on timeout. The condition is checked one last time
    /// after the deadline, so a wakeup racing with the timeout is not lost.
    pub fn wait_until_timeout<F, R>(&self, mut cond: F, timeout: Duration) -> Option<R>
    where
        F: FnMut() -> Option<R>,
    {
        if let Some(res) = cond() {
            return Some(res);
        }

        let deadline = self.platform.now().saturating_add(timeout);
        let (waiter, _) = Waiter::new_pair(self);
        loop {
            self.enqueue(waiter.waker());
            if let Some(res) = cond() {
                return Some(res);
            }
            let now = self.platform.now();
            if now >= deadline {
                waiter.waker.close();
                return cond();
            }
            waiter.wait_timeout(deadline - now);
        }
    }

    /// Wakes up one waiting task, if there is one at the point of time when this method is
    /// called, returning whether such a task was woken up.
    pub fn wake_one(&self) -> bool {
        // Fast path
        if self.is_empty() {
            return false;
        }

        loop {
            let mut wakers = self.wakers.lock();
            let Some(waker) = wakers.pop_front() else {
                return false;
            };
            self.num_wakers.fetch_sub(1, Ordering::Release);
            // Avoid holding lock when calling `wake_up`
            drop(wakers);

            if waker.wake_up() {
                return true;
            }
        }
    }

    /// Wakes up all waiting tasks, returning the number of tasks that were woken up.
    pub fn wake_all(&self) -> usize {
        // Fast path
        if self.is_empty() {
            return 0;
        }

        let mut num_woken = 0;

        loop {
            let mut wakers = self.wakers.lock();
            let Some(waker) = wakers.pop_front() else {
                break;
            };
            self.num_wakers.fetch_sub(1, Ordering::Release);
            // Avoid holding lock when calling `wake_up`
            drop(wakers);

            if waker.wake_up() {
                num_woken += 1;
            }
        }

        num_woken
    }

    fn is_empty(&self) -> bool {
        self.num_wakers.fetch_add(0, Ordering::Release) == 0
    }

    /// Enqueues the input [`Waker`] to the wait queue.
    #[doc(hidden)]
    pub fn enqueue(&self, waker: Arc<Waker>) {
        let mut wakers = self.wakers.lock();
        wakers.push_back(waker);
        self.num_wakers.fetch_add(1, Ordering::Acquire);
    }
}

/// A waiter that can put the current task to sleep until it is woken up by the associated
/// [`Waker`].
///
/// By definition, a waiter belongs to the current task, so it cannot be sent to another task
/// and its reference cannot be shared between tasks.
pub struct Waiter {
    waker: Arc<Waker>,
    scheduler: Arc<dyn Scheduler>,
    _not_send: PhantomData<*const ()>,
}

/// A waker that can wake up the associated [`Waiter`].
///
/// A waker can be created by calling [`Waiter::new_pair`]. This method creates an `Arc<Waker>` that can
/// be used across different tasks.
pub struct Waker {
    has_woken: AtomicBool,
    task: Arc<dyn TaskHandle>,
}

impl Waiter {
    /// Creates a waiter for the current task and its associated [`Waker`].
    pub fn new_pair(queue: &WaitQueue) -> (Self, Arc<Waker>) {
        let waker = Arc::new(Waker {
            has_woken: AtomicBool::new(false),
            task: queue.scheduler.current(),
        });
        let waiter = Self {
            waker: waker.clone(),
            scheduler: queue.scheduler.clone(),
            _not_send: PhantomData,
        };
        (waiter, waker)
    }

    /// Waits until the waiter is woken up by calling [`Waker::wake_up`] on the associated
    /// [`Waker`].
    ///
    /// This method returns immediately if the waiter has been woken since the end of the last call
    /// to this method (or since the waiter was created, if this method has not been called
    /// before). Otherwise, it puts the current task to sleep until the waiter is woken up.
    pub fn wait(&self) {
        while !self.waker.has_woken.swap(false, Ordering::Acquire) {
            self.scheduler.park_current(None);
        }
    }

    /// Waits like [`Self::wait`] for at most `timeout`, returning whether the waiter was woken.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if !self.waker.has_woken.swap(false, Ordering::Acquire) {
            self.scheduler.park_current(Some(timeout));
            return self.waker.has_woken.swap(false, Ordering::Acquire);
        }
        true
    }

    /// Gets the associated [`Waker`] of the current waiter.
    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        // When dropping the waiter, we need to close the waker to ensure that if someone wants to
        // wake up the waiter afterwards, they will perform a no-op.
        self.waker.close();
    }
}

impl Waker {
    /// Wakes up the associated [`Waiter`].
    ///
    /// This method returns `true` if the waiter is woken by this call. It returns `false` if the
    /// waiter has already been woken by a previous call to the method, or if the waiter has been
    /// dropped.
    pub fn wake_up(&self) -> bool {
        if self.has_woken.swap(true, Ordering::Release) {
            return false;
        }
        self.task.unpark();

        true
    }

    fn close(&self) {
        // This must use `Ordering::Acquire`, although we do not care about the return value. See
        // the memory order explanation at the top of the file for details.
        let _ = self.has_woken.swap(true, Ordering::Acquire);
    }
}
