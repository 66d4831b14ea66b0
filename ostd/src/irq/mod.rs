// SPDX-License-Identifier: MPL-2.0

//! Interrupt context bookkeeping.
//!
//! # Top vs bottom half
//!
//! The handling of an interrupt is split into a **top half**, which runs
//! with local IRQs disabled between [`Machine::irq_enter`] and
//! [`Machine::irq_exit`], and a **bottom half**, which runs when the CPU
//! leaves the outermost interrupt context. The framework does not hardcode
//! the bottom half; the kernel registers one with
//! [`Machine::register_bottom_half_handler`] (the softirq engine does).
//!
//! The same hook runs when bottom halves are re-enabled by dropping a
//! [`DisabledBhGuard`], so work raised while they were disabled is not
//! delayed until the next interrupt.

mod preempt;

pub use preempt::{
    PreemptCount, HARDIRQ_MASK, HARDIRQ_OFFSET, PREEMPT_MASK, PREEMPT_OFFSET,
    SOFTIRQ_DISABLE_OFFSET, SOFTIRQ_MASK, SOFTIRQ_OFFSET,
};

use crate::{cpu::CpuId, Machine};

impl Machine {
    /// Enters hard interrupt context on `cpu`.
    pub fn irq_enter(&self, cpu: CpuId) {
        self.preempt_counts[cpu].add(HARDIRQ_OFFSET);
    }

    /// Leaves hard interrupt context on `cpu`, running the bottom half if
    /// this was the outermost interrupt.
    pub fn irq_exit(&self, cpu: CpuId) {
        let count = &self.preempt_counts[cpu];
        count.sub(HARDIRQ_OFFSET);
        if !count.in_interrupt() {
            self.run_bottom_half(cpu);
        }
    }

    /// Runs `f` in hard interrupt context on `cpu`.
    pub fn in_irq_context<R>(&self, cpu: CpuId, f: impl FnOnce() -> R) -> R {
        self.irq_enter(cpu);
        let res = f();
        self.irq_exit(cpu);
        res
    }

    /// Returns the preemption counter of `cpu`.
    pub fn preempt_count(&self, cpu: CpuId) -> &PreemptCount {
        &self.preempt_counts[cpu]
    }

    /// Returns true if `cpu` is handling an interrupt or a softirq, or has
    /// bottom halves disabled.
    pub fn in_interrupt(&self, cpu: CpuId) -> bool {
        self.preempt_counts[cpu].in_interrupt()
    }

    /// Disables local IRQs on `cpu` until the guard is dropped.
    pub fn disable_local_irq(&self, cpu: CpuId) -> DisabledLocalIrqGuard<'_> {
        let platform = self.platform();
        let was_enabled = platform.is_local_irq_enabled(cpu);
        if was_enabled {
            platform.local_irq_disable(cpu);
        }
        DisabledLocalIrqGuard {
            machine: self,
            cpu,
            was_enabled,
        }
    }

    /// Disables preemption on `cpu` until the guard is dropped.
    pub fn disable_preempt(&self, cpu: CpuId) -> DisabledPreemptGuard<'_> {
        self.preempt_counts[cpu].add(PREEMPT_OFFSET);
        DisabledPreemptGuard { machine: self, cpu }
    }

    /// Marks `cpu` as serving softirqs until the guard is dropped.
    ///
    /// Returns `None` if `cpu` already serves softirqs; softirq handlers
    /// never nest on one CPU.
    pub fn enter_softirq(&self, cpu: CpuId) -> Option<ServingSoftIrqGuard<'_>> {
        self.preempt_counts[cpu]
            .try_enter_softirq()
            .then_some(ServingSoftIrqGuard { machine: self, cpu })
    }

    /// Disables bottom halves on `cpu` until the guard is dropped.
    pub fn disable_bh(&self, cpu: CpuId) -> DisabledBhGuard<'_> {
        self.preempt_counts[cpu].add(SOFTIRQ_DISABLE_OFFSET);
        DisabledBhGuard { machine: self, cpu }
    }
}

/// A guard for disabled local IRQs.
#[clippy::has_significant_drop]
#[must_use]
pub struct DisabledLocalIrqGuard<'a> {
    machine: &'a Machine,
    cpu: CpuId,
    was_enabled: bool,
}

impl DisabledLocalIrqGuard<'_> {
    /// Returns the CPU whose IRQs are disabled.
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }
}

impl Drop for DisabledLocalIrqGuard<'_> {
    fn drop(&mut self) {
        if self.was_enabled {
            self.machine.platform().local_irq_enable(self.cpu);
        }
    }
}

/// A guard for disabled preemption.
#[clippy::has_significant_drop]
#[must_use]
pub struct DisabledPreemptGuard<'a> {
    machine: &'a Machine,
    cpu: CpuId,
}

impl DisabledPreemptGuard<'_> {
    /// Returns the CPU on which preemption is disabled.
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }
}

impl Drop for DisabledPreemptGuard<'_> {
    fn drop(&mut self) {
        self.machine.preempt_counts[self.cpu].sub(PREEMPT_OFFSET);
    }
}

/// A guard for a CPU serving softirqs.
#[clippy::has_significant_drop]
#[must_use]
pub struct ServingSoftIrqGuard<'a> {
    machine: &'a Machine,
    cpu: CpuId,
}

impl Drop for ServingSoftIrqGuard<'_> {
    fn drop(&mut self) {
        self.machine.preempt_counts[self.cpu].sub(SOFTIRQ_OFFSET);
    }
}

/// A guard for disabled bottom halves.
#[clippy::has_significant_drop]
#[must_use]
pub struct DisabledBhGuard<'a> {
    machine: &'a Machine,
    cpu: CpuId,
}

impl Drop for DisabledBhGuard<'_> {
    fn drop(&mut self) {
        let count = &self.machine.preempt_counts[self.cpu];
        count.sub(SOFTIRQ_DISABLE_OFFSET);
        if !count.in_interrupt() {
            self.machine.run_bottom_half(self.cpu);
        }
    }
}
