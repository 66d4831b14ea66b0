// SPDX-License-Identifier: MPL-2.0

//! CPU hotplug.
//!
//! The controller brings CPUs up and takes them down, one at a time. Every
//! transition is announced on the CPU notifier chain:
//!
//! ```text
//! cpu_up:   UpPrepare -> (boot) -> Starting (on the new CPU) -> Online
//!                     \-> UpCanceled
//! cpu_down: DownPrepare -> Dying (on the dying CPU, machine stopped)
//!                       -> Dead -> PostDead
//!                       \-> DownFailed
//! ```
//!
//! A vetoed `UpPrepare` or `DownPrepare` is undone for exactly the
//! notifiers that accepted it. A failure after all notifiers accepted it
//! is undone for all of them.
//!
//! Two locks serialize the work. The maps lock serializes hotplug requests
//! with each other and with notifier registration. The hotplug lock keeps
//! readers, who bracket their work with [`CpuHotplug::get_online_cpus`],
//! away from a transition in progress.

mod lock;
mod suspend;

use hinge_frame::{
    cpu::{AtomicCpuSet, CpuNotifierBlock, CpuNotifierChain, PerCpu},
    smp::CrossCall,
};

pub use self::lock::OnlineCpusGuard;
use self::lock::HotplugLock;
use crate::{
    config::SmpConfig,
    prelude::*,
    smp::{IdleState, SmpBoot},
    stop_machine::{CpuStopFn, StopMachine},
};

/// The hotplug state of a CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CpuState {
    /// Not running. A present CPU in this state can be brought up.
    Offline = 0,
    /// Being brought up.
    Preparing = 1,
    /// Up and running.
    Online = 2,
    /// Being taken down.
    Dying = 3,
    /// Taken down; the last notifications are still running.
    Dead = 4,
}

impl CpuState {
    fn from_u8(val: u8) -> Self {
        match val {
            1 => Self::Preparing,
            2 => Self::Online,
            3 => Self::Dying,
            4 => Self::Dead,
            _ => Self::Offline,
        }
    }
}

/// The state protected by the maps lock.
#[derive(Debug, Default)]
struct HotplugMaps {
    /// The nesting depth of [`CpuHotplug::cpu_hotplug_disable`].
    disable_depth: usize,
    /// The non-boot CPUs are disabled for suspend.
    suspended: bool,
}

impl HotplugMaps {
    fn is_disabled(&self) -> bool {
        self.disable_depth > 0 || self.suspended
    }
}

/// The CPU hotplug controller.
pub struct CpuHotplug {
    machine: Arc<Machine>,
    cpu_up_timeout: Duration,
    cpu_die_timeout: Duration,
    chain: Arc<CpuNotifierChain>,
    maps: Mutex<HotplugMaps>,
    lock: HotplugLock,
    frozen_cpus: AtomicCpuSet,
    states: PerCpu<AtomicU8>,
    stop_machine: Arc<StopMachine>,
    cross_call: Arc<CrossCall>,
    smp_boot: Arc<SmpBoot>,
}

impl CpuHotplug {
    pub(crate) fn new(
        machine: Arc<Machine>,
        config: &SmpConfig,
        stop_machine: Arc<StopMachine>,
        cross_call: Arc<CrossCall>,
        smp_boot: Arc<SmpBoot>,
    ) -> Self {
        Self {
            cpu_up_timeout: config.cpu_up_timeout,
            cpu_die_timeout: config.cpu_die_timeout,
            chain: Arc::new(CpuNotifierChain::new()),
            maps: Mutex::new(&machine, HotplugMaps::default()),
            lock: HotplugLock::new(&machine),
            frozen_cpus: AtomicCpuSet::default(),
            states: PerCpu::new(|_| AtomicU8::new(CpuState::Offline as u8)),
            stop_machine,
            cross_call,
            smp_boot,
            machine,
        }
    }

    /// Registers a CPU notifier.
    pub fn register_cpu_notifier(&self, block: Arc<CpuNotifierBlock>) {
        let _maps = self.maps.lock();
        self.chain.register(block);
    }

    /// Unregisters a CPU notifier.
    pub fn unregister_cpu_notifier(&self, block: &Arc<CpuNotifierBlock>) -> Result<()> {
        let _maps = self.maps.lock();
        self.chain.unregister(block)?;
        Ok(())
    }

    /// Keeps CPUs from coming or going until the guard is dropped.
    ///
    /// May sleep. Nests freely, and may be called by a notifier callback
    /// from within a transition.
    pub fn get_online_cpus(&self) -> OnlineCpusGuard<'_> {
        self.lock.read()
    }

    /// Returns the hotplug state of `cpu`.
    pub fn cpu_state(&self, cpu: CpuId) -> CpuState {
        CpuState::from_u8(self.states[cpu].load(Ordering::Acquire))
    }

    fn set_cpu_state(&self, cpu: CpuId, state: CpuState) {
        self.states[cpu].store(state as u8, Ordering::Release);
    }

    /// Marks the boot CPU as up without any notification.
    pub(crate) fn init_boot_cpu(&self, cpu: CpuId) {
        self.set_cpu_state(cpu, CpuState::Online);
    }

    /// Forbids hotplug requests until [`CpuHotplug::cpu_hotplug_enable`].
    ///
    /// Nests. Requests made meanwhile fail with `EBUSY`.
    pub fn cpu_hotplug_disable(&self) {
        self.maps.lock().disable_depth += 1;
    }

    /// Reverts one [`CpuHotplug::cpu_hotplug_disable`].
    pub fn cpu_hotplug_enable(&self) {
        let mut maps = self.maps.lock();
        match maps.disable_depth.checked_sub(1) {
            Some(depth) => maps.disable_depth = depth,
            None => warn!("unbalanced cpu_hotplug_enable"),
        }
    }

    /// Marks an offline CPU present or absent, e.g., on physical hot-add.
    pub fn set_cpu_present(&self, cpu: CpuId, present: bool) -> Result<()> {
        let _maps = self.maps.lock();
        self.machine.topology().set_present(cpu, present)?;
        Ok(())
    }

    /// Brings `cpu` up.
    ///
    /// Fails with `EINVAL` if the CPU is not possible, not present or
    /// already online, with `EBUSY` if hotplug is disabled, with the veto
    /// of a notifier, or with `EIO` if the CPU did not come up in time.
    pub fn cpu_up(&self, cpu: CpuId) -> Result<()> {
        if !self.machine.topology().is_possible(cpu) {
            error!(
                "can't online cpu {} because it is not configured as may-hotadd at boot time",
                cpu
            );
            return_errno_with_message!(Errno::EINVAL, "the CPU is not possible");
        }

        let maps = self.maps.lock();
        if maps.is_disabled() {
            return_errno_with_message!(Errno::EBUSY, "CPU hotplug is disabled");
        }
        self.do_cpu_up(cpu, CpuEvent::new(CpuAction::UpPrepare))
    }

    /// Takes `cpu` down on behalf of a task running on `this_cpu`.
    ///
    /// Fails with `EBUSY` if `cpu` is the last online CPU or hotplug is
    /// disabled, with `EINVAL` if it is not online, or with the veto of a
    /// notifier or of the platform.
    pub fn cpu_down(&self, this_cpu: CpuId, cpu: CpuId) -> Result<()> {
        let maps = self.maps.lock();
        if maps.is_disabled() {
            return_errno_with_message!(Errno::EBUSY, "CPU hotplug is disabled");
        }
        self.do_cpu_down(this_cpu, cpu, CpuEvent::new(CpuAction::DownPrepare))
    }

    /// Brings a CPU up. The maps lock must be held.
    fn do_cpu_up(&self, cpu: CpuId, event: CpuEvent) -> Result<()> {
        let topology = self.machine.topology();
        if topology.is_online(cpu) || !topology.is_present(cpu) {
            return_errno_with_message!(Errno::EINVAL, "the CPU is online or not present");
        }

        let writer = self.lock.write();
        self.set_cpu_state(cpu, CpuState::Preparing);

        if let Err(err) = self.chain.notify_with_rollback(
            event,
            event.with_action(CpuAction::UpCanceled),
            cpu,
        ) {
            warn!("attempt to bring up CPU{} failed: {}", cpu, err);
            self.set_cpu_state(cpu, CpuState::Offline);
            return Err(err.into());
        }

        if let Err(err) = self.smp_boot.cpu_up(cpu, self.cpu_up_timeout) {
            error!("CPU{}: bring-up failed: {}", cpu, err);
            self.chain
                .notify_reverse_nofail(event.with_action(CpuAction::UpCanceled), cpu);
            self.set_cpu_state(cpu, CpuState::Offline);
            return Err(err);
        }

        self.set_cpu_state(cpu, CpuState::Online);
        self.chain
            .notify_nofail(event.with_action(CpuAction::Online), cpu);
        drop(writer);

        debug!("CPU{} is up", cpu);
        Ok(())
    }

    /// Takes a CPU down. The maps lock must be held.
    fn do_cpu_down(&self, this_cpu: CpuId, cpu: CpuId, event: CpuEvent) -> Result<()> {
        let topology = self.machine.topology();
        if topology.num_online() == 1 {
            return_errno_with_message!(Errno::EBUSY, "cannot take the last CPU down");
        }
        if !topology.is_online(cpu) {
            return_errno_with_message!(Errno::EINVAL, "the CPU is not online");
        }

        let writer = self.lock.write();

        if let Err(err) = self.chain.notify_with_rollback(
            event,
            event.with_action(CpuAction::DownFailed),
            cpu,
        ) {
            warn!("attempt to take down CPU{} failed: {}", cpu, err);
            return Err(err.into());
        }

        self.set_cpu_state(cpu, CpuState::Dying);
        self.smp_boot.prepare_cpu_die();
        if let Err(err) = self.stop_machine.stop_machine(
            this_cpu,
            self.take_cpu_down_fn(event),
            Some(&CpuSet::from(cpu)),
        ) {
            error!("CPU{}: failed to take down: {}", cpu, err);
            self.chain
                .notify_reverse_nofail(event.with_action(CpuAction::DownFailed), cpu);
            self.set_cpu_state(cpu, CpuState::Online);
            return Err(err);
        }
        if topology.is_online(cpu) {
            error!("CPU{}: still online after being taken down", cpu);
            self.chain
                .notify_reverse_nofail(event.with_action(CpuAction::DownFailed), cpu);
            self.set_cpu_state(cpu, CpuState::Online);
            return_errno_with_message!(Errno::EBUSY, "the CPU did not go offline");
        }

        self.smp_boot.cpu_die(cpu, self.cpu_die_timeout);
        self.set_cpu_state(cpu, CpuState::Dead);
        self.chain
            .notify_nofail(event.with_action(CpuAction::Dead), cpu);
        drop(writer);

        self.chain
            .notify_nofail(event.with_action(CpuAction::PostDead), cpu);
        self.set_cpu_state(cpu, CpuState::Offline);
        debug!("CPU{} is down", cpu);
        Ok(())
    }

    /// Returns the function that runs on the dying CPU while the machine is
    /// stopped.
    fn take_cpu_down_fn(&self, event: CpuEvent) -> CpuStopFn {
        let machine = self.machine.clone();
        let cross_call = self.cross_call.clone();
        let smp_boot = self.smp_boot.clone();
        let chain = self.chain.clone();
        Arc::new(move |cpu: CpuId| -> Result<()> {
            let platform = machine.platform();
            platform.cpu_disable(cpu)?;

            machine.topology().set_online(cpu, false)?;
            platform.migrate_irqs(cpu);
            platform.flush_cache_all(cpu);
            platform.local_flush_tlb_all(cpu);
            cross_call.flush_pending(cpu);

            chain.notify_nofail(event.with_action(CpuAction::Dying), cpu);
            smp_boot.set_idle_state(cpu, IdleState::Dying);
            Ok(())
        })
    }

    /// Sends the `Starting` notification. Called on a booting CPU.
    pub(crate) fn notify_cpu_starting(&self, cpu: CpuId) {
        let event = if self.frozen_cpus.contains(cpu, Ordering::Acquire) {
            CpuEvent::frozen(CpuAction::Starting)
        } else {
            CpuEvent::new(CpuAction::Starting)
        };
        self.chain.notify_nofail(event, cpu);
    }
}

impl core::fmt::Debug for CpuHotplug {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CpuHotplug")
            .field("nr_notifiers", &self.chain.len())
            .field("nr_readers", &self.lock.nr_readers())
            .finish_non_exhaustive()
    }
}
