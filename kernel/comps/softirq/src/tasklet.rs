// SPDX-License-Identifier: MPL-2.0

//! Tasklets.
//!
//! A tasklet is a dynamically created piece of deferred work that runs in
//! softirq context. Unlike a softirq kind, a tasklet never runs on two CPUs
//! at the same time: the CPU that fails to take the `RUN` bit puts the
//! tasklet back on its own queue and tries again on its next pass.
//!
//! Scheduling a tasklet that is already scheduled has no effect. A tasklet
//! that is scheduled again while it runs will run once more afterwards.

use alloc::{
    boxed::Box,
    collections::VecDeque,
    sync::{Arc, Weak},
};
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use bitflags::bitflags;
use hinge_frame::{
    cpu::{CpuId, PerCpu},
    Error, Result,
};

use super::{SoftIrq, SoftIrqId};

bitflags! {
    struct TaskletState: u8 {
        /// The tasklet is on a queue and will run.
        const SCHED = 1 << 0;
        /// The tasklet is running on some CPU.
        const RUN = 1 << 1;
    }
}

type TaskletFn = Box<dyn Fn(CpuId) + Send + Sync>;

/// A unit of deferred work serialized against itself.
pub struct Tasklet {
    state: AtomicU8,
    disable_count: AtomicUsize,
    func: TaskletFn,
    softirq: Weak<SoftIrq>,
}

impl Tasklet {
    /// Creates a tasklet running `func` on the softirq engine `softirq`.
    pub fn new<F>(softirq: &Arc<SoftIrq>, func: F) -> Arc<Self>
    where
        F: Fn(CpuId) + Send + Sync + 'static,
    {
        Arc::new(Self {
            state: AtomicU8::new(0),
            disable_count: AtomicUsize::new(0),
            func: Box::new(func),
            softirq: Arc::downgrade(softirq),
        })
    }

    /// Schedules the tasklet on `cpu` with normal priority.
    pub fn schedule(self: &Arc<Self>, cpu: CpuId) {
        self.schedule_on(cpu, SoftIrqId::Tasklet);
    }

    /// Schedules the tasklet on `cpu` with high priority.
    ///
    /// High-priority tasklets run before all other softirq kinds.
    pub fn hi_schedule(self: &Arc<Self>, cpu: CpuId) {
        self.schedule_on(cpu, SoftIrqId::Hi);
    }

    fn schedule_on(self: &Arc<Self>, cpu: CpuId, id: SoftIrqId) {
        let prev = self.state.fetch_or(TaskletState::SCHED.bits(), Ordering::AcqRel);
        if prev & TaskletState::SCHED.bits() != 0 {
            return;
        }
        let Some(softirq) = self.softirq.upgrade() else {
            return;
        };

        let _irq_guard = softirq.machine.disable_local_irq(cpu);
        softirq.tasklets.queue(id)[cpu].lock().push_back(self.clone());
        softirq.raise_irqoff(cpu, id);
    }

    /// Returns whether the tasklet is scheduled.
    pub fn is_scheduled(&self) -> bool {
        self.state().contains(TaskletState::SCHED)
    }

    /// Returns whether the tasklet is running.
    pub fn is_running(&self) -> bool {
        self.state().contains(TaskletState::RUN)
    }

    /// Returns whether the tasklet is disabled.
    pub fn is_disabled(&self) -> bool {
        self.disable_count.load(Ordering::Acquire) != 0
    }

    /// Disables the tasklet without waiting for a running instance.
    ///
    /// A disabled tasklet can still be scheduled, but it will not run until
    /// it is enabled as many times as it was disabled.
    pub fn disable_nosync(&self) {
        self.disable_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Disables the tasklet and waits until no instance of it runs.
    pub fn disable(&self) {
        self.disable_nosync();
        self.unlock_wait();
    }

    /// Reverts one [`Tasklet::disable`] or [`Tasklet::disable_nosync`].
    pub fn enable(&self) {
        let prev = self.disable_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unbalanced tasklet enable");
    }

    /// Waits until the tasklet is neither scheduled nor running, and
    /// prevents it from being scheduled meanwhile.
    ///
    /// Must not be called from interrupt context on `this_cpu`. The tasklet
    /// may be scheduled again afterwards.
    pub fn kill(&self, this_cpu: CpuId) {
        let Some(softirq) = self.softirq.upgrade() else {
            return;
        };
        if softirq.machine.in_interrupt(this_cpu) {
            log::warn!("CPU{}: attempt to kill a tasklet from interrupt", this_cpu);
        }

        while self.state.fetch_or(TaskletState::SCHED.bits(), Ordering::AcqRel)
            & TaskletState::SCHED.bits()
            != 0
        {
            while self.is_scheduled() {
                softirq.machine.scheduler().yield_now();
            }
        }
        self.unlock_wait();
        self.state
            .fetch_and(!TaskletState::SCHED.bits(), Ordering::AcqRel);
    }

    /// Removes the tasklet from the queue of `dead_cpu`.
    ///
    /// The CPU must be offline and the tasklet must not be running; it fails
    /// with [`Error::InvalidArgs`] otherwise.
    pub fn kill_immediate(&self, dead_cpu: CpuId) -> Result<()> {
        let Some(softirq) = self.softirq.upgrade() else {
            return Ok(());
        };
        if softirq.machine.topology().is_online(dead_cpu) || self.is_running() {
            return Err(Error::InvalidArgs);
        }
        if !self.is_scheduled() {
            return Ok(());
        }

        for id in [SoftIrqId::Tasklet, SoftIrqId::Hi] {
            softirq.tasklets.queue(id)[dead_cpu]
                .lock()
                .retain(|queued| !core::ptr::eq(Arc::as_ptr(queued), self));
        }
        self.state
            .fetch_and(!TaskletState::SCHED.bits(), Ordering::AcqRel);
        Ok(())
    }

    fn state(&self) -> TaskletState {
        TaskletState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    fn try_lock(&self) -> bool {
        self.state.fetch_or(TaskletState::RUN.bits(), Ordering::Acquire) & TaskletState::RUN.bits()
            == 0
    }

    fn unlock(&self) {
        self.state
            .fetch_and(!TaskletState::RUN.bits(), Ordering::Release);
    }

    fn unlock_wait(&self) {
        while self.is_running() {
            core::hint::spin_loop();
        }
    }
}

impl core::fmt::Debug for Tasklet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Tasklet")
            .field("state", &self.state())
            .field("disable_count", &self.disable_count)
            .finish_non_exhaustive()
    }
}

type TaskletQueue = PerCpu<spin::Mutex<VecDeque<Arc<Tasklet>>>>;

/// The per-CPU queues of scheduled tasklets.
pub(super) struct TaskletQueues {
    normal: TaskletQueue,
    hi: TaskletQueue,
}

impl TaskletQueues {
    pub(super) fn new() -> Self {
        Self {
            normal: PerCpu::new(|_| spin::Mutex::new(VecDeque::new())),
            hi: PerCpu::new(|_| spin::Mutex::new(VecDeque::new())),
        }
    }

    fn queue(&self, id: SoftIrqId) -> &TaskletQueue {
        if id == SoftIrqId::Hi {
            &self.hi
        } else {
            &self.normal
        }
    }
}

impl SoftIrq {
    /// Runs the tasklets queued on `cpu` for the softirq kind `id`.
    pub(super) fn run_tasklets(&self, cpu: CpuId, id: SoftIrqId) {
        let queue = &self.tasklets.queue(id)[cpu];
        let list = {
            let _irq_guard = self.machine.disable_local_irq(cpu);
            core::mem::take(&mut *queue.lock())
        };

        for tasklet in list {
            if tasklet.try_lock() {
                if !tasklet.is_disabled() {
                    let prev = tasklet
                        .state
                        .fetch_and(!TaskletState::SCHED.bits(), Ordering::AcqRel);
                    if prev & TaskletState::SCHED.bits() == 0 {
                        log::error!("CPU{}: running a tasklet that is not scheduled", cpu);
                    }
                    (tasklet.func)(cpu);
                    tasklet.unlock();
                    continue;
                }
                tasklet.unlock();
            }

            // Running elsewhere or disabled; retry on a later pass.
            let _irq_guard = self.machine.disable_local_irq(cpu);
            queue.lock().push_back(tasklet);
            self.raise_irqoff(cpu, id);
        }
    }

    /// Moves the tasklets queued on `dead_cpu` to the queues of `this_cpu`.
    pub fn takeover_tasklets(&self, this_cpu: CpuId, dead_cpu: CpuId) {
        let _irq_guard = self.machine.disable_local_irq(this_cpu);
        for id in [SoftIrqId::Tasklet, SoftIrqId::Hi] {
            let queue = self.tasklets.queue(id);
            let moved = core::mem::take(&mut *queue[dead_cpu].lock());
            if moved.is_empty() {
                continue;
            }
            log::debug!(
                "CPU{}: took over {} {} tasklets of CPU{}",
                this_cpu,
                moved.len(),
                id,
                dead_cpu
            );
            queue[this_cpu].lock().extend(moved);
            self.raise_irqoff(this_cpu, id);
        }
    }

    /// Returns the number of tasklets queued on `cpu` for `id`.
    pub fn nr_queued_tasklets(&self, cpu: CpuId, id: SoftIrqId) -> usize {
        self.tasklets.queue(id)[cpu].lock().len()
    }
}
