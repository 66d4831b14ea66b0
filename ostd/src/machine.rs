// SPDX-License-Identifier: MPL-2.0

use core::time::Duration;

use spin::Once;

use crate::{
    arch::Platform,
    cpu::{CpuId, CpuTopology, PerCpu},
    irq::PreemptCount,
    prelude::*,
    task::Scheduler,
};

type BottomHalfHandler = Box<dyn Fn(CpuId) + Send + Sync>;

/// The machine: hardware, scheduler and the CPU topology.
///
/// This is the root of all state the SMP core shares between CPUs. It is
/// created once per booted kernel and passed by reference (or `Arc`) to
/// every component. Creating several machines is fine; they do not share
/// anything.
pub struct Machine {
    platform: Arc<dyn Platform>,
    scheduler: Arc<dyn Scheduler>,
    topology: CpuTopology,
    pub(crate) preempt_counts: PerCpu<PreemptCount>,
    bottom_half: Once<BottomHalfHandler>,
}

impl Machine {
    /// Creates a machine on top of a platform and a scheduler.
    ///
    /// No CPU is possible yet; the boot code fills in the topology.
    pub fn new(platform: Arc<dyn Platform>, scheduler: Arc<dyn Scheduler>) -> Arc<Self> {
        Arc::new(Self {
            platform,
            scheduler,
            topology: CpuTopology::new(),
            preempt_counts: PerCpu::default(),
            bottom_half: Once::new(),
        })
    }

    /// Returns the platform.
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Returns the scheduler.
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Returns the CPU masks.
    pub fn topology(&self) -> &CpuTopology {
        &self.topology
    }

    /// Returns the time since boot.
    pub fn now(&self) -> Duration {
        self.platform.now()
    }

    /// Relaxes the CPU in a busy-wait loop.
    pub fn cpu_relax(&self) {
        self.platform.cpu_relax();
    }

    /// Registers the function that runs the bottom half of interrupt
    /// handling.
    ///
    /// The handler is called on leaving the outermost interrupt context and
    /// on re-enabling bottom halves. Only the first registration takes
    /// effect.
    pub fn register_bottom_half_handler<F>(&self, handler: F)
    where
        F: Fn(CpuId) + Send + Sync + 'static,
    {
        self.bottom_half.call_once(|| Box::new(handler));
    }

    pub(crate) fn run_bottom_half(&self, cpu: CpuId) {
        if let Some(handler) = self.bottom_half.get() {
            handler(cpu);
        }
    }
}

impl core::fmt::Debug for Machine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Machine")
            .field("topology", &self.topology)
            .finish_non_exhaustive()
    }
}
