// SPDX-License-Identifier: MPL-2.0

//! The SMP core of the hinge kernel.
//!
//! This crate brings secondary CPUs up, takes them down again, and stops
//! the whole machine when a function needs it for itself. It is built on
//! the framework in `hinge-frame` and the softirq engine in
//! `hinge-softirq`, and ties them together in a [`Kernel`]:
//!
//! - [`hotplug::CpuHotplug`] drives CPU transitions and the CPU notifier
//!   chain;
//! - [`stop_machine::StopMachine`] runs functions on the per-CPU stopper
//!   threads;
//! - the [`smp`] module boots secondary CPUs and dispatches IPIs;
//! - [`sched`] keeps the active mask in sync with hotplug.
//!
//! A board port creates the kernel with [`Kernel::new`] on its boot CPU,
//! calls [`Kernel::smp_init`], and enters
//! [`Kernel::secondary_start_kernel`] on every secondary CPU it boots.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod hotplug;
mod prelude;
pub mod sched;
pub mod smp;
pub mod stop_machine;

use hinge_frame::{
    arch::Platform,
    boot::KCmdlineArg,
    cpu::{CpuNotifierBlock, NR_CPUS},
    smp::CrossCall,
    task::Scheduler,
};
use hinge_softirq::SoftIrq;
use spin::Once;

use crate::{
    config::SmpConfig,
    hotplug::{CpuHotplug, OnlineCpusGuard},
    prelude::*,
    smp::{IpiStats, SmpBoot, TickHandler},
    stop_machine::{CpuStopFn, StopMachine},
};
pub use crate::error::{Errno, Error};

/// The SMP core of a booted machine.
pub struct Kernel {
    machine: Arc<Machine>,
    config: SmpConfig,
    cross_call: Arc<CrossCall>,
    softirq: Arc<SoftIrq>,
    stop_machine: Arc<StopMachine>,
    hotplug: CpuHotplug,
    smp_boot: Arc<SmpBoot>,
    ipi_stats: IpiStats,
    tick_handler: Once<TickHandler>,
}

impl Kernel {
    /// Initializes the SMP core on the boot CPU.
    ///
    /// Every CPU the platform reports, up to the `nr_cpus=` limit, becomes
    /// possible and present. Only the boot CPU is online; the others are
    /// brought up by [`Kernel::smp_init`] or [`Kernel::cpu_up`].
    pub fn new(
        platform: Arc<dyn Platform>,
        scheduler: Arc<dyn Scheduler>,
        cmdline: &str,
    ) -> Result<Arc<Self>> {
        let machine = Machine::new(platform, scheduler);
        let cmdline = KCmdlineArg::from(cmdline);
        hinge_frame::logger::init(&machine, &cmdline);
        let config = SmpConfig::from_cmdline(&cmdline);

        let nr_cores = machine.platform().nr_cores().min(NR_CPUS);
        let nr_cpu_ids = config.nr_cpus.map_or(nr_cores, |limit| limit.min(nr_cores));
        let topology = machine.topology();
        topology.init_possible(nr_cpu_ids)?;
        for cpu in topology.possible().iter() {
            topology.set_present(cpu, true)?;
        }

        let boot_cpu = CpuId::bsp();
        topology.set_online(boot_cpu, true)?;
        topology.set_active(boot_cpu, true)?;
        info!("Booting CPU{} of {} possible CPUs", boot_cpu, nr_cpu_ids);

        let cross_call = Arc::new(CrossCall::new(machine.clone()));
        let softirq = SoftIrq::new(machine.clone());
        let stop_machine = Arc::new(StopMachine::new(machine.clone()));
        let smp_boot = Arc::new(SmpBoot::new(machine.clone()));
        let hotplug = CpuHotplug::new(
            machine.clone(),
            &config,
            stop_machine.clone(),
            cross_call.clone(),
            smp_boot.clone(),
        );

        for block in crate::sched::active_mask_notifiers(&machine) {
            hotplug.register_cpu_notifier(block);
        }
        hotplug.register_cpu_notifier(softirq.cpu_notifier());
        hotplug.register_cpu_notifier(stop_machine.cpu_notifier());

        softirq.spawn_ksoftirqd(boot_cpu)?;
        softirq.wakeup_ksoftirqd(boot_cpu);
        stop_machine.init_boot_cpu(boot_cpu)?;
        hotplug.init_boot_cpu(boot_cpu);

        Ok(Arc::new(Self {
            machine,
            config,
            cross_call,
            softirq,
            stop_machine,
            hotplug,
            smp_boot,
            ipi_stats: IpiStats::default(),
            tick_handler: Once::new(),
        }))
    }

    /// Returns the machine.
    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// Returns the SMP configuration.
    pub fn config(&self) -> &SmpConfig {
        &self.config
    }

    /// Returns the cross-call engine.
    pub fn cross_call(&self) -> &Arc<CrossCall> {
        &self.cross_call
    }

    /// Returns the softirq engine.
    pub fn softirq(&self) -> &Arc<SoftIrq> {
        &self.softirq
    }

    /// Returns the stop-machine engine.
    pub fn stop_machine_engine(&self) -> &Arc<StopMachine> {
        &self.stop_machine
    }

    /// Returns the hotplug controller.
    pub fn hotplug(&self) -> &CpuHotplug {
        &self.hotplug
    }

    /// Brings `cpu` up. See [`CpuHotplug::cpu_up`].
    pub fn cpu_up(&self, cpu: CpuId) -> Result<()> {
        self.hotplug.cpu_up(cpu)
    }

    /// Takes `cpu` down. See [`CpuHotplug::cpu_down`].
    pub fn cpu_down(&self, this_cpu: CpuId, cpu: CpuId) -> Result<()> {
        self.hotplug.cpu_down(this_cpu, cpu)
    }

    /// Registers a CPU notifier.
    pub fn register_cpu_notifier(&self, block: Arc<CpuNotifierBlock>) {
        self.hotplug.register_cpu_notifier(block);
    }

    /// Unregisters a CPU notifier.
    pub fn unregister_cpu_notifier(&self, block: &Arc<CpuNotifierBlock>) -> Result<()> {
        self.hotplug.unregister_cpu_notifier(block)
    }

    /// Keeps CPUs from coming or going until the guard is dropped.
    pub fn get_online_cpus(&self) -> OnlineCpusGuard<'_> {
        self.hotplug.get_online_cpus()
    }

    /// Runs `func` with the whole machine stopped, once on each CPU of
    /// `active`, or on the first online CPU if `active` is `None`.
    ///
    /// Unlike [`StopMachine::stop_machine`], keeps the set of online CPUs
    /// stable by itself.
    pub fn stop_machine<F>(&self, this_cpu: CpuId, func: F, active: Option<&CpuSet>) -> Result<()>
    where
        F: Fn(CpuId) -> Result<()> + Send + Sync + 'static,
    {
        let func: CpuStopFn = Arc::new(func);
        let _guard = self.hotplug.get_online_cpus();
        self.stop_machine.stop_machine(this_cpu, func, active)
    }

    /// Takes the non-boot CPUs down for suspend.
    pub fn disable_nonboot_cpus(&self, this_cpu: CpuId) -> Result<()> {
        self.hotplug.disable_nonboot_cpus(this_cpu)
    }

    /// Brings back the CPUs taken down for suspend.
    pub fn enable_nonboot_cpus(&self) {
        self.hotplug.enable_nonboot_cpus();
    }
}

impl core::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernel")
            .field("machine", &self.machine)
            .field("config", &self.config)
            .field("hotplug", &self.hotplug)
            .finish_non_exhaustive()
    }
}
