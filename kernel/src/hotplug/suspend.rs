// SPDX-License-Identifier: MPL-2.0

//! Taking the non-boot CPUs down for suspend and bringing them back.
//!
//! The notifications sent on this path have `tasks_frozen` set. The CPUs
//! taken down are remembered in the frozen mask so that exactly those come
//! back on resume.

use super::CpuHotplug;
use crate::prelude::*;

impl CpuHotplug {
    /// Takes every online CPU but the first one down, on behalf of a task
    /// running on `this_cpu`.
    ///
    /// Stops at the first CPU that fails to go down and returns its error;
    /// the CPUs already down stay down and are brought back by
    /// [`CpuHotplug::enable_nonboot_cpus`]. On success, hotplug requests
    /// fail with `EBUSY` until then.
    pub fn disable_nonboot_cpus(&self, this_cpu: CpuId) -> Result<()> {
        let mut maps = self.maps.lock();
        let online = self.machine.topology().online();
        let Some(first_cpu) = online.first() else {
            return_errno_with_message!(Errno::EINVAL, "no CPU is online");
        };

        self.frozen_cpus.store(&CpuSet::new_empty(), Ordering::Release);
        info!("Disabling non-boot CPUs ...");
        for cpu in online.iter().filter(|cpu| *cpu != first_cpu) {
            match self.do_cpu_down(this_cpu, cpu, CpuEvent::frozen(CpuAction::DownPrepare)) {
                Ok(()) => self.frozen_cpus.add(cpu, Ordering::Release),
                Err(err) => {
                    error!("Error taking CPU{} down: {}", cpu, err);
                    error!("Non-boot CPUs are not disabled");
                    return Err(err);
                }
            }
        }

        debug_assert_eq!(self.machine.topology().num_online(), 1);
        maps.suspended = true;
        Ok(())
    }

    /// Brings back the CPUs taken down by
    /// [`CpuHotplug::disable_nonboot_cpus`].
    ///
    /// A CPU that fails to come up is reported and skipped.
    pub fn enable_nonboot_cpus(&self) {
        let mut maps = self.maps.lock();
        maps.suspended = false;

        let frozen = self.frozen_cpus.load(Ordering::Acquire);
        if frozen.is_empty() {
            return;
        }

        info!("Enabling non-boot CPUs ...");
        for cpu in frozen.iter() {
            match self.do_cpu_up(cpu, CpuEvent::frozen(CpuAction::UpPrepare)) {
                Ok(()) => info!("CPU{} is up", cpu),
                Err(err) => warn!("Error taking CPU{} up: {}", cpu, err),
            }
        }
        self.frozen_cpus.store(&CpuSet::new_empty(), Ordering::Release);
    }

    /// Returns the CPUs taken down by the last suspend.
    pub fn frozen_cpus(&self) -> CpuSet {
        self.frozen_cpus.load(Ordering::Acquire)
    }
}
