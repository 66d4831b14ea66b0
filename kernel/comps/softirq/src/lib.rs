// SPDX-License-Identifier: MPL-2.0

//! Software interrupt.
//!
//! # Overview
//!
//! Softirq is an interrupt mechanism in the kernel that enables bottom-half
//! processing; softirqs are cheaper to execute compared to regular
//! interrupts because they are less time-critical and thus can be processed
//! in a more flexible manner.
//!
//! Each CPU has a mask of pending softirq kinds. Raising a kind sets its bit;
//! raising it again before it runs has no further effect. Pending kinds are
//! dispatched in ascending [`SoftIrqId`] order when the CPU leaves the
//! outermost hard interrupt, when bottom halves are re-enabled, or by the
//! per-CPU `ksoftirqd` thread.
//!
//! A dispatch pass that keeps finding new work restarts at most
//! [`MAX_SOFTIRQ_RESTART`] times, then leaves the rest to `ksoftirqd`, so a
//! softirq storm cannot starve ordinary tasks.
//!
//! # Example
//!
//! ```ignore
//! softirq.open(SoftIrqId::Timer, |cpu| {
//!     // Run the expired timers of `cpu`.
//! })?;
//! // Later on, in the timer interrupt handler:
//! softirq.raise(cpu, SoftIrqId::Timer);
//! ```
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

use alloc::{
    boxed::Box,
    format,
    sync::{Arc, Weak},
};
use core::sync::atomic::{AtomicU32, Ordering};

use hinge_frame::{
    cpu::{CpuAction, CpuEvent, CpuId, CpuNotifierBlock, PerCpu},
    notifier::{NotifierBlock, NotifyResult},
    task::{KThread, KThreadOptions, TaskPriority},
    Error, Machine, Result,
};
use spin::Once;

pub mod softirq_id;
mod stats;
mod tasklet;

pub use softirq_id::{SoftIrqId, NR_SOFTIRQS};
pub use tasklet::Tasklet;
use tasklet::TaskletQueues;

/// The number of dispatch passes before the remaining work is deferred to
/// `ksoftirqd`.
pub const MAX_SOFTIRQ_RESTART: usize = 10;

/// The priority of the softirq CPU notifier.
pub const SOFTIRQ_NOTIFIER_PRIORITY: i32 = 0;

type SoftIrqAction = Box<dyn Fn(CpuId) + Send + Sync>;

/// The softirq engine of a machine.
pub struct SoftIrq {
    machine: Arc<Machine>,
    weak_self: Weak<SoftIrq>,
    actions: [Once<SoftIrqAction>; NR_SOFTIRQS],
    pending: PerCpu<AtomicU32>,
    ksoftirqd: PerCpu<spin::Mutex<Option<KThread>>>,
    tasklets: TaskletQueues,
    stats: stats::SoftIrqStats,
}

impl SoftIrq {
    /// Creates the engine and installs it as the bottom half of `machine`.
    ///
    /// The tasklet kinds ([`SoftIrqId::Hi`] and [`SoftIrqId::Tasklet`]) are
    /// opened here. No `ksoftirqd` thread exists yet; see
    /// [`SoftIrq::spawn_ksoftirqd`].
    pub fn new(machine: Arc<Machine>) -> Arc<Self> {
        let softirq = Arc::new_cyclic(|weak_self| Self {
            machine: machine.clone(),
            weak_self: weak_self.clone(),
            actions: core::array::from_fn(|_| Once::new()),
            pending: PerCpu::new(|_| AtomicU32::new(0)),
            ksoftirqd: PerCpu::new(|_| spin::Mutex::new(None)),
            tasklets: TaskletQueues::new(),
            stats: Default::default(),
        });

        let weak = Arc::downgrade(&softirq);
        machine.register_bottom_half_handler(move |cpu| {
            if let Some(softirq) = weak.upgrade() {
                softirq.do_softirq(cpu);
            }
        });

        for id in [SoftIrqId::Hi, SoftIrqId::Tasklet] {
            let weak = Arc::downgrade(&softirq);
            let res = softirq.open(id, move |cpu| {
                if let Some(softirq) = weak.upgrade() {
                    softirq.run_tasklets(cpu, id);
                }
            });
            debug_assert!(res.is_ok());
        }

        softirq
    }

    /// Returns the machine.
    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// Installs the action of a softirq kind.
    ///
    /// Each kind can only be opened once; a second attempt fails with
    /// [`Error::Busy`].
    pub fn open<F>(&self, id: SoftIrqId, action: F) -> Result<()>
    where
        F: Fn(CpuId) + Send + Sync + 'static,
    {
        let slot = &self.actions[id.as_index()];
        if slot.is_completed() {
            return Err(Error::Busy);
        }
        slot.call_once(|| Box::new(action));
        Ok(())
    }

    /// Returns whether the action of `id` is installed.
    pub fn is_open(&self, id: SoftIrqId) -> bool {
        self.actions[id.as_index()].is_completed()
    }

    /// Marks `id` pending on `cpu`.
    ///
    /// Outside interrupt context, `ksoftirqd` is woken so that the softirq
    /// runs soon even if no hardware interrupt arrives.
    pub fn raise(&self, cpu: CpuId, id: SoftIrqId) {
        let _irq_guard = self.machine.disable_local_irq(cpu);
        self.raise_irqoff(cpu, id);
    }

    /// Like [`SoftIrq::raise`], with local IRQs of `cpu` already disabled.
    pub fn raise_irqoff(&self, cpu: CpuId, id: SoftIrqId) {
        self.pending[cpu].fetch_or(id.mask(), Ordering::AcqRel);
        if !self.machine.in_interrupt(cpu) {
            self.wakeup_ksoftirqd(cpu);
        }
    }

    /// Returns the pending mask of `cpu`.
    pub fn pending(&self, cpu: CpuId) -> u32 {
        self.pending[cpu].load(Ordering::Acquire)
    }

    /// Runs the pending softirqs of `cpu`, unless it is in interrupt context.
    pub fn do_softirq(&self, cpu: CpuId) {
        if self.machine.in_interrupt(cpu) {
            return;
        }
        if self.pending(cpu) != 0 {
            self.process_pending(cpu);
        }
    }

    /// Dispatches pending softirqs of `cpu`.
    ///
    /// Returns immediately if `cpu` is already serving softirqs, so a kind
    /// never nests against itself on one CPU.
    fn process_pending(&self, cpu: CpuId) {
        let Some(_serving_guard) = self.machine.enter_softirq(cpu) else {
            return;
        };

        let platform = self.machine.platform();
        let was_enabled = platform.is_local_irq_enabled(cpu);
        platform.local_irq_disable(cpu);

        let mut restart = MAX_SOFTIRQ_RESTART;
        loop {
            let pending = self.pending[cpu].swap(0, Ordering::AcqRel);

            // Hardware interrupts may preempt the actions.
            platform.local_irq_enable(cpu);
            self.dispatch(cpu, pending);
            platform.local_irq_disable(cpu);

            if self.pending(cpu) == 0 {
                break;
            }
            restart -= 1;
            if restart == 0 {
                log::trace!("CPU{}: softirq restart limit reached, deferring", cpu);
                self.wakeup_ksoftirqd(cpu);
                break;
            }
        }

        if was_enabled {
            platform.local_irq_enable(cpu);
        }
    }

    fn dispatch(&self, cpu: CpuId, mut pending: u32) {
        let preempt_count = self.machine.preempt_count(cpu);

        while pending != 0 {
            let index = pending.trailing_zeros() as usize;
            pending &= pending - 1;

            let (Some(id), Some(action)) = (SoftIrqId::from_index(index), self.actions[index].get())
            else {
                continue;
            };

            self.stats.count(cpu, id);
            let prev_count = preempt_count.get();
            action(cpu);
            let count = preempt_count.get();
            if count != prev_count {
                log::error!(
                    "CPU{}: softirq {} leaked preempt count: {:#010x} -> {:#010x}",
                    cpu,
                    id,
                    prev_count,
                    count
                );
            }
        }
    }

    /// Creates the `ksoftirqd` thread of `cpu`.
    ///
    /// Does nothing if the thread already exists.
    pub fn spawn_ksoftirqd(&self, cpu: CpuId) -> Result<()> {
        let mut slot = self.ksoftirqd[cpu].lock();
        if slot.is_some() {
            return Ok(());
        }

        let weak = self.weak_self.clone();
        let options = KThreadOptions::new(format!("ksoftirqd/{}", cpu))
            .cpu_affinity(cpu)
            .priority(TaskPriority::SoftIrq);
        let thread = KThread::spawn(&self.machine, options, move |this| {
            while let Some(softirq) = this.wait_until(|| {
                let softirq = weak.upgrade()?;
                (softirq.pending(cpu) != 0).then_some(softirq)
            }) {
                softirq.run_ksoftirqd(cpu);
            }
            0
        })
        .inspect_err(|err| log::error!("ksoftirqd for CPU{} failed: {}", cpu, err))?;

        *slot = Some(thread);
        Ok(())
    }

    /// Stops the `ksoftirqd` thread of `cpu`, if any.
    pub fn stop_ksoftirqd(&self, cpu: CpuId) {
        let thread = self.ksoftirqd[cpu].lock().take();
        if let Some(thread) = thread {
            thread.stop();
        }
    }

    /// Returns whether `cpu` has a `ksoftirqd` thread.
    pub fn has_ksoftirqd(&self, cpu: CpuId) -> bool {
        self.ksoftirqd[cpu].lock().is_some()
    }

    /// Wakes the `ksoftirqd` thread of `cpu`.
    pub fn wakeup_ksoftirqd(&self, cpu: CpuId) {
        let thread = self.ksoftirqd[cpu].lock().clone();
        if let Some(thread) = thread {
            thread.wake_up();
        }
    }

    fn run_ksoftirqd(&self, cpu: CpuId) {
        {
            let _irq_guard = self.machine.disable_local_irq(cpu);
            if self.pending(cpu) != 0 && !self.machine.in_interrupt(cpu) {
                self.process_pending(cpu);
            }
        }
        self.machine.scheduler().yield_now();
    }

    /// Returns the CPU notifier that manages `ksoftirqd` threads and the
    /// tasklets of dead CPUs.
    pub fn cpu_notifier(self: &Arc<Self>) -> Arc<CpuNotifierBlock> {
        let weak = Arc::downgrade(self);
        NotifierBlock::new("softirq", SOFTIRQ_NOTIFIER_PRIORITY, move |event: CpuEvent, cpu| {
            let Some(softirq) = weak.upgrade() else {
                return NotifyResult::Done;
            };
            match event.action {
                CpuAction::UpPrepare => softirq.spawn_ksoftirqd(cpu).into(),
                CpuAction::Online => {
                    softirq.wakeup_ksoftirqd(cpu);
                    NotifyResult::Ok
                }
                CpuAction::UpCanceled => {
                    softirq.stop_ksoftirqd(cpu);
                    NotifyResult::Ok
                }
                CpuAction::Dead => {
                    softirq.stop_ksoftirqd(cpu);
                    match softirq.machine.topology().online().first() {
                        Some(this_cpu) => softirq.takeover_tasklets(this_cpu, cpu),
                        None => log::error!("no online CPU to take over tasklets of CPU{}", cpu),
                    }
                    NotifyResult::Ok
                }
                _ => NotifyResult::Done,
            }
        })
    }
}

impl core::fmt::Debug for SoftIrq {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SoftIrq").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test;
