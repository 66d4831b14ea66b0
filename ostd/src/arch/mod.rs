// SPDX-License-Identifier: MPL-2.0

//! The interface to the hardware.
//!
//! A board port implements [`Platform`] on top of its interrupt controller,
//! its power controller and its secondary-CPU boot protocol. Everything
//! else in the kernel core reaches the hardware through this trait only.

use core::time::Duration;

use crate::{
    cpu::{CpuId, CpuSet},
    Result,
};

/// The kinds of inter-processor interrupts.
///
/// Each kind is a distinct software-generated interrupt number on the
/// interrupt controller. Raising an IPI that is already pending on the
/// target is idempotent: the handler runs at least once after the raise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum IpiKind {
    /// A broadcast tick for CPUs whose local timer is stopped.
    Timer = 0,
    /// Asks the target to run its scheduler.
    Reschedule = 1,
    /// Asks the target to drain the shared cross-call queue.
    CallFunction = 2,
    /// Asks the target to drain its own cross-call queue.
    CallFunctionSingle = 3,
    /// Asks the target to stop executing, for reboot or panic.
    CpuStop = 4,
}

/// The number of IPI kinds.
pub const NR_IPI: usize = 5;

impl IpiKind {
    /// All IPI kinds, in the order of their numbers.
    pub const ALL: [IpiKind; NR_IPI] = [
        IpiKind::Timer,
        IpiKind::Reschedule,
        IpiKind::CallFunction,
        IpiKind::CallFunctionSingle,
        IpiKind::CpuStop,
    ];

    /// Returns the IPI number of this kind, starting from zero.
    pub const fn as_index(self) -> usize {
        self as usize
    }

    /// Returns the kind with the given IPI number.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Returns a human-readable description, as shown in interrupt statistics.
    pub const fn description(self) -> &'static str {
        match self {
            IpiKind::Timer => "Timer broadcast interrupts",
            IpiKind::Reschedule => "Rescheduling interrupts",
            IpiKind::CallFunction => "Function call interrupts",
            IpiKind::CallFunctionSingle => "Single function call interrupts",
            IpiKind::CpuStop => "CPU stop interrupts",
        }
    }
}

/// The hardware services the SMP core depends on.
///
/// Methods that take a `cpu` argument act on that CPU. The caller is either
/// running on it (local IRQ control, TLB flushes) or is driving it from the
/// outside (booting, killing).
pub trait Platform: Send + Sync {
    /// Returns the number of cores the hardware reports.
    fn nr_cores(&self) -> usize;

    /// Raises an IPI of the given kind on every CPU of `targets`.
    fn send_ipi(&self, targets: &CpuSet, kind: IpiKind);

    /// Starts the given secondary CPU.
    ///
    /// On success the CPU begins executing the secondary start path
    /// asynchronously; this method does not wait for it to come online.
    fn boot_secondary(&self, cpu: CpuId) -> Result<()>;

    /// Powers off a CPU that has signalled its death.
    ///
    /// Returns false if the CPU could not be killed.
    fn kill_cpu(&self, cpu: CpuId) -> bool {
        let _ = cpu;
        true
    }

    /// Lets the platform veto taking the CPU down.
    fn cpu_disable(&self, cpu: CpuId) -> Result<()> {
        let _ = cpu;
        Ok(())
    }

    /// Platform-specific initialization on a freshly booted secondary CPU.
    fn secondary_init(&self, cpu: CpuId) {
        let _ = cpu;
    }

    /// Moves the interrupts routed to `cpu` to other online CPUs.
    fn migrate_irqs(&self, cpu: CpuId) {
        let _ = cpu;
    }

    /// Flushes all data caches of the CPU.
    fn flush_cache_all(&self, cpu: CpuId) {
        let _ = cpu;
    }

    /// Flushes the local TLB of the CPU.
    fn local_flush_tlb_all(&self, cpu: CpuId) {
        let _ = cpu;
    }

    /// Enables local IRQs of the CPU.
    fn local_irq_enable(&self, cpu: CpuId);

    /// Disables local IRQs of the CPU.
    fn local_irq_disable(&self, cpu: CpuId);

    /// Returns whether local IRQs of the CPU are enabled.
    fn is_local_irq_enabled(&self, cpu: CpuId) -> bool;

    /// A hint in busy-wait loops.
    fn cpu_relax(&self) {
        core::hint::spin_loop();
    }

    /// Returns the monotonic time since boot.
    fn now(&self) -> Duration;

    /// Writes a string to the early console.
    fn console_write(&self, s: &str) {
        let _ = s;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ipi_kind_indices() {
        for (idx, kind) in IpiKind::ALL.iter().enumerate() {
            assert_eq!(kind.as_index(), idx);
            assert_eq!(IpiKind::from_index(idx), Some(*kind));
        }
        assert_eq!(IpiKind::from_index(NR_IPI), None);
    }
}
