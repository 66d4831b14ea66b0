// SPDX-License-Identifier: MPL-2.0

//! The CPU hotplug reader-writer lock.
//!
//! Readers bracket code that must not see CPUs come or go with
//! [`HotplugLock::read`]. The hotplug controller is the only writer. While
//! it holds the lock, readers block; the writer itself may take the read
//! side again without deadlocking, which lets notifier callbacks call into
//! code that reads the lock.

use hinge_frame::task::TaskId;

use crate::prelude::*;

/// No task holds the write side.
const NO_WRITER: TaskId = 0;

pub(super) struct HotplugLock {
    machine: Arc<Machine>,
    active_writer: core::sync::atomic::AtomicU64,
    mutex: Mutex<()>,
    refcount: AtomicUsize,
    writer_wait: WaitQueue,
}

impl HotplugLock {
    pub(super) fn new(machine: &Arc<Machine>) -> Self {
        Self {
            machine: machine.clone(),
            active_writer: core::sync::atomic::AtomicU64::new(NO_WRITER),
            mutex: Mutex::new(machine, ()),
            refcount: AtomicUsize::new(0),
            writer_wait: WaitQueue::new(machine),
        }
    }

    fn current_task(&self) -> TaskId {
        self.machine.scheduler().current().id()
    }

    fn is_active_writer(&self) -> bool {
        self.active_writer.load(Ordering::Acquire) == self.current_task()
    }

    /// Takes the read side.
    pub(super) fn read(&self) -> OnlineCpusGuard<'_> {
        if self.is_active_writer() {
            return OnlineCpusGuard {
                lock: self,
                counted: false,
            };
        }
        let _guard = self.mutex.lock();
        self.refcount.fetch_add(1, Ordering::AcqRel);
        OnlineCpusGuard {
            lock: self,
            counted: true,
        }
    }

    fn read_unlock(&self) {
        let _guard = self.mutex.lock();
        if self.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.writer_wait.wake_all();
        }
    }

    /// Takes the write side, waiting for all readers to leave.
    pub(super) fn write(&self) -> HotplugWriteGuard<'_> {
        self.active_writer
            .store(self.current_task(), Ordering::Release);
        loop {
            let guard = self.mutex.lock();
            if self.refcount.load(Ordering::Acquire) == 0 {
                return HotplugWriteGuard {
                    lock: self,
                    _guard: guard,
                };
            }
            drop(guard);
            self.writer_wait
                .wait_until(|| (self.refcount.load(Ordering::Acquire) == 0).then_some(()));
        }
    }

    pub(super) fn nr_readers(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }
}

/// A guard that keeps the set of online CPUs stable.
///
/// Returned by [`CpuHotplug::get_online_cpus`](super::CpuHotplug::get_online_cpus);
/// dropping it is the matching `put_online_cpus`.
#[clippy::has_significant_drop]
#[must_use]
pub struct OnlineCpusGuard<'a> {
    lock: &'a HotplugLock,
    counted: bool,
}

impl Drop for OnlineCpusGuard<'_> {
    fn drop(&mut self) {
        if self.counted {
            self.lock.read_unlock();
        }
    }
}

impl core::fmt::Debug for OnlineCpusGuard<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OnlineCpusGuard")
            .field("counted", &self.counted)
            .finish()
    }
}

#[clippy::has_significant_drop]
#[must_use]
pub(super) struct HotplugWriteGuard<'a> {
    lock: &'a HotplugLock,
    _guard: MutexGuard<'a, ()>,
}

impl Drop for HotplugWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock
            .active_writer
            .store(NO_WRITER, Ordering::Release);
    }
}
