// SPDX-License-Identifier: MPL-2.0

//! Secondary CPUs and inter-processor interrupts.
//!
//! A secondary CPU is booted by the platform and enters
//! [`Kernel::secondary_start_kernel`]. From there it announces itself with
//! the `Starting` notification, marks itself online and wakes the CPU that
//! booted it. Afterwards it runs its idle loop, which delivers the IPIs
//! raised on it to [`Kernel::handle_ipi`] and watches
//! [`Kernel::idle_state`] for the order to die or halt.

mod boot;
mod stats;

use core::sync::atomic::fence;

use hinge_frame::arch::IpiKind;

pub use self::boot::IdleState;
pub(crate) use self::{boot::SmpBoot, stats::IpiStats};
use crate::{prelude::*, Kernel};

/// The handler of broadcast ticks.
pub type TickHandler = Box<dyn Fn(CpuId) + Send + Sync>;

impl Kernel {
    /// Handles an IPI raised on `cpu`.
    ///
    /// Must be called on `cpu` with local IRQs disabled.
    pub fn handle_ipi(&self, cpu: CpuId, kind: IpiKind) {
        self.ipi_stats.count(cpu, kind);

        self.machine.irq_enter(cpu);
        match kind {
            IpiKind::Timer => match self.tick_handler.get() {
                Some(handler) => handler(cpu),
                None => trace!("CPU{}: broadcast tick without a handler", cpu),
            },
            IpiKind::Reschedule => self.machine.scheduler().reschedule_ipi(cpu),
            IpiKind::CallFunction => self.cross_call.handle_call_function_ipi(cpu),
            IpiKind::CallFunctionSingle => {
                self.cross_call.handle_call_function_single_ipi(cpu)
            }
            IpiKind::CpuStop => self.ipi_cpu_stop(cpu),
        }
        self.machine.irq_exit(cpu);
    }

    /// Handles an IPI by its number, as read from the interrupt controller.
    pub fn handle_raw_ipi(&self, cpu: CpuId, nr: usize) {
        match IpiKind::from_index(nr) {
            Some(kind) => self.handle_ipi(cpu, kind),
            None => error!("CPU{}: Unknown IPI message {:#x}", cpu, nr),
        }
    }

    fn ipi_cpu_stop(&self, cpu: CpuId) {
        info!("CPU{}: stopping", cpu);
        if let Err(err) = self.machine.topology().set_online(cpu, false) {
            warn!("CPU{}: failed to mark stopped CPU offline: {}", cpu, err);
        }
        self.machine.platform().local_irq_disable(cpu);
        self.smp_boot.set_idle_state(cpu, IdleState::Halted);
    }

    /// The entry point of a secondary CPU booted by the platform.
    ///
    /// Runs on `cpu` with local IRQs disabled and enables them before
    /// returning. The caller then enters the idle loop.
    pub fn secondary_start_kernel(&self, cpu: CpuId) {
        info!("CPU{}: Booted secondary processor", cpu);

        let platform = self.machine.platform();
        platform.secondary_init(cpu);

        self.hotplug.notify_cpu_starting(cpu);

        if let Err(err) = self.machine.topology().set_online(cpu, true) {
            error!("CPU{}: cannot mark itself online: {}", cpu, err);
            return;
        }
        self.smp_boot.signal_running();

        platform.local_irq_enable(cpu);
    }

    /// Called from the idle loop of a CPU whose idle state is
    /// [`IdleState::Dying`]. The CPU must not run anything afterwards.
    pub fn cpu_die(&self, cpu: CpuId) {
        self.machine.platform().local_irq_disable(cpu);
        // Everything this CPU wrote must be visible before it is reported
        // dead and powered off.
        fence(Ordering::SeqCst);
        self.smp_boot.signal_died();
    }

    /// Returns what the idle loop of `cpu` should do.
    pub fn idle_state(&self, cpu: CpuId) -> IdleState {
        self.smp_boot.idle_state(cpu)
    }

    /// Stops every other online CPU, for reboot or panic.
    ///
    /// Waits up to the configured timeout for them to go offline.
    pub fn smp_send_stop(&self, this_cpu: CpuId) {
        let topology = self.machine.topology();
        let mut targets = topology.online();
        targets.remove(this_cpu);
        if !targets.is_empty() {
            self.machine
                .platform()
                .send_ipi(&targets, IpiKind::CpuStop);
        }

        let deadline = self.machine.now() + self.config.smp_stop_timeout;
        while topology.num_online() > 1 && self.machine.now() < deadline {
            self.machine.cpu_relax();
        }
        if topology.num_online() > 1 {
            warn!("SMP: failed to stop secondary CPUs");
        }
    }

    /// Asks `cpu` to run its scheduler.
    pub fn smp_send_reschedule(&self, cpu: CpuId) {
        self.machine
            .platform()
            .send_ipi(&CpuSet::from(cpu), IpiKind::Reschedule);
    }

    /// Sends a broadcast tick to `cpus`.
    pub fn tick_broadcast(&self, cpus: &CpuSet) {
        self.machine.platform().send_ipi(cpus, IpiKind::Timer);
    }

    /// Installs the handler of broadcast ticks.
    ///
    /// Only the first handler takes effect.
    pub fn set_tick_broadcast_handler<F>(&self, handler: F)
    where
        F: Fn(CpuId) + Send + Sync + 'static,
    {
        self.tick_handler.call_once(|| Box::new(handler));
    }

    /// Formats the IPI counters of the online CPUs, one IPI kind per row.
    pub fn show_ipi_list(&self) -> String {
        self.ipi_stats.show(&self.machine.topology().online())
    }

    /// Returns how many IPIs of `kind` `cpu` has handled.
    pub fn ipi_count(&self, cpu: CpuId, kind: IpiKind) -> usize {
        self.ipi_stats.get(cpu, kind)
    }

    /// Brings up the present CPUs, up to the configured maximum.
    ///
    /// A CPU that fails to come up is reported and skipped.
    pub fn smp_init(&self) {
        let topology = self.machine.topology();
        for cpu in topology.present().iter() {
            if topology.num_online() >= self.config.max_cpus {
                break;
            }
            if topology.is_online(cpu) {
                continue;
            }
            if let Err(err) = self.hotplug.cpu_up(cpu) {
                warn!("CPU{}: failed to bring up: {}", cpu, err);
            }
        }

        let nr_online = topology.num_online();
        info!("Brought up {} CPUs", nr_online);
        info!("SMP: Total of {} processors activated", nr_online);
    }
}
