// SPDX-License-Identifier: MPL-2.0

//! Stopping CPUs.
//!
//! A stop request preempts everything on the targeted CPUs: the works run
//! on the per-CPU stopper threads, which have the highest scheduling class.
//! On top of that, [`StopMachine::stop_machine`] makes every online CPU
//! spin with IRQs disabled while a function runs, which gives the function
//! exclusive access to the machine.
//!
//! At most one multi-CPU stop request is in flight at a time. Two of them
//! could otherwise each occupy some of the stoppers and wait for the others
//! forever.

mod multi;
mod stopper;

use hinge_frame::{
    cpu::{CpuNotifierBlock, PerCpu},
    notifier::{NotifierBlock, NotifyResult},
};

use self::{
    multi::MultiStopData,
    stopper::{CpuStopDone, CpuStopWork, Stopper},
};
use crate::prelude::*;

/// A function run by a stopper on the CPU passed to it.
pub type CpuStopFn = Arc<dyn Fn(CpuId) -> Result<()> + Send + Sync>;

/// The priority of the stopper CPU notifier.
pub const STOPPER_NOTIFIER_PRIORITY: i32 = 10;

/// The stop-machine engine.
pub struct StopMachine {
    machine: Arc<Machine>,
    stoppers: PerCpu<Arc<Stopper>>,
    stop_cpus_mutex: Mutex<()>,
    initialized: AtomicBool,
}

impl StopMachine {
    /// Creates the engine. No stopper is enabled yet.
    pub fn new(machine: Arc<Machine>) -> Self {
        Self {
            stoppers: PerCpu::new(Stopper::new),
            stop_cpus_mutex: Mutex::new(&machine, ()),
            initialized: AtomicBool::new(false),
            machine,
        }
    }

    /// Starts and enables the stopper of the boot CPU.
    ///
    /// Before this, [`StopMachine::stop_machine`] runs its function inline.
    pub fn init_boot_cpu(&self, cpu: CpuId) -> Result<()> {
        let stopper = &self.stoppers[cpu];
        stopper.spawn_thread(&self.machine)?;
        stopper.enable();
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Returns whether the stopper of `cpu` accepts works.
    pub fn is_stopper_enabled(&self, cpu: CpuId) -> bool {
        self.stoppers[cpu].is_enabled()
    }

    /// Runs `func` on the stopper of `cpu` and waits for it.
    ///
    /// Fails with `ENOENT` without calling `func` if the stopper is
    /// disabled, i.e., `cpu` is offline.
    pub fn stop_one_cpu<F>(&self, cpu: CpuId, func: F) -> Result<()>
    where
        F: Fn(CpuId) -> Result<()> + Send + Sync + 'static,
    {
        let done = CpuStopDone::new(&self.machine, 1);
        self.stoppers[cpu].queue(CpuStopWork {
            func: Arc::new(func),
            done: Some(done.clone()),
        });
        done.wait()
    }

    /// Queues `func` on the stopper of `cpu` without waiting.
    ///
    /// Returns false if the stopper is disabled.
    pub fn stop_one_cpu_nowait<F>(&self, cpu: CpuId, func: F) -> bool
    where
        F: Fn(CpuId) -> Result<()> + Send + Sync + 'static,
    {
        self.stoppers[cpu].queue(CpuStopWork {
            func: Arc::new(func),
            done: None,
        })
    }

    /// Runs `func` on the stoppers of every CPU in `mask` and waits for all
    /// of them.
    ///
    /// Returns the first error of `func`. Fails with `ENOENT` if `mask` is
    /// empty or none of its stoppers is enabled.
    pub fn stop_cpus<F>(&self, this_cpu: CpuId, mask: &CpuSet, func: F) -> Result<()>
    where
        F: Fn(CpuId) -> Result<()> + Send + Sync + 'static,
    {
        let _guard = self.stop_cpus_mutex.lock();
        self.stop_cpus_locked(this_cpu, mask, Arc::new(func), |_| {})
    }

    /// Like [`StopMachine::stop_cpus`], but fails with `EAGAIN` instead of
    /// waiting for another stop request.
    pub fn try_stop_cpus<F>(&self, this_cpu: CpuId, mask: &CpuSet, func: F) -> Result<()>
    where
        F: Fn(CpuId) -> Result<()> + Send + Sync + 'static,
    {
        let Some(_guard) = self.stop_cpus_mutex.try_lock() else {
            return_errno_with_message!(Errno::EAGAIN, "another stop request is in flight");
        };
        self.stop_cpus_locked(this_cpu, mask, Arc::new(func), |_| {})
    }

    /// Runs `func` while every online CPU spins with IRQs disabled.
    ///
    /// `func` runs once on each CPU of `active`, or only on the first
    /// online CPU if `active` is `None`. Fails with `ENOENT` if none of
    /// these CPUs has an enabled stopper. The caller must keep the set of
    /// online CPUs stable, e.g., with
    /// [`CpuHotplug::get_online_cpus`](crate::hotplug::CpuHotplug::get_online_cpus).
    ///
    /// Before the boot CPU's stopper is up, `func` just runs on `this_cpu`
    /// with IRQs disabled.
    pub fn stop_machine(
        &self,
        this_cpu: CpuId,
        func: CpuStopFn,
        active: Option<&CpuSet>,
    ) -> Result<()> {
        if !self.initialized.load(Ordering::Acquire) {
            let _irq_guard = self.machine.disable_local_irq(this_cpu);
            return func(this_cpu);
        }

        let msdata = Arc::new(MultiStopData::new(func, active.copied()));
        let msdata_cloned = msdata.clone();
        let machine = self.machine.clone();
        let work_fn: CpuStopFn = Arc::new(move |cpu: CpuId| msdata_cloned.run(&machine, cpu));

        let online = self.machine.topology().online();
        let _guard = self.stop_cpus_mutex.lock();
        self.stop_cpus_locked(this_cpu, &online, work_fn, |nr_queued| {
            msdata.prepare(nr_queued)
        })?;

        // An active CPU without an enabled stopper never got the work.
        if msdata.nr_active_ran() == 0 {
            return_errno_with_message!(Errno::ENOENT, "no active CPU ran the function");
        }
        Ok(())
    }

    /// Queues the works with preemption disabled, so that no stopper that
    /// got its work first can preempt the caller before all the others got
    /// theirs.
    fn stop_cpus_locked(
        &self,
        this_cpu: CpuId,
        mask: &CpuSet,
        func: CpuStopFn,
        on_queued: impl FnOnce(usize),
    ) -> Result<()> {
        let nr_cpus = mask.count();
        if nr_cpus == 0 {
            return_errno_with_message!(Errno::ENOENT, "no CPU to stop");
        }

        let done = CpuStopDone::new(&self.machine, nr_cpus);
        let nr_queued = {
            let _preempt_guard = self.machine.disable_preempt(this_cpu);
            mask.iter()
                .filter(|cpu| {
                    self.stoppers[*cpu].queue(CpuStopWork {
                        func: func.clone(),
                        done: Some(done.clone()),
                    })
                })
                .count()
        };
        debug!("CPU{}: stop request queued on {}/{} CPUs", this_cpu, nr_queued, nr_cpus);
        on_queued(nr_queued);

        done.wait()
    }

    /// Returns the CPU notifier that manages the stoppers of hotplugged
    /// CPUs.
    pub fn cpu_notifier(self: &Arc<Self>) -> Arc<CpuNotifierBlock> {
        let weak = Arc::downgrade(self);
        NotifierBlock::new("stopper", STOPPER_NOTIFIER_PRIORITY, move |event: CpuEvent, cpu| {
            let Some(stop_machine) = weak.upgrade() else {
                return NotifyResult::Done;
            };
            let stopper = &stop_machine.stoppers[cpu];
            match event.action {
                CpuAction::UpPrepare => stopper
                    .spawn_thread(&stop_machine.machine)
                    .map_err(hinge_frame::Error::from)
                    .into(),
                CpuAction::Online => {
                    stopper.enable();
                    NotifyResult::Ok
                }
                CpuAction::Dying => {
                    stopper.disable();
                    NotifyResult::Ok
                }
                CpuAction::UpCanceled | CpuAction::PostDead => {
                    stopper.stop_thread();
                    NotifyResult::Ok
                }
                _ => NotifyResult::Done,
            }
        })
    }

    /// Returns whether `cpu` has a stopper thread.
    pub fn has_stopper_thread(&self, cpu: CpuId) -> bool {
        self.stoppers[cpu].has_thread()
    }
}

impl core::fmt::Debug for StopMachine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StopMachine")
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}
