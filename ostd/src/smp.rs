// SPDX-License-Identifier: MPL-2.0

//! Symmetric Multi-Processing (SMP) support.
//!
//! This module provides a way to execute code on other processors via inter-
//! processor interrupts.
//!
//! Every CPU owns a queue of [`CallSingleData`] descriptors. A sender appends
//! a descriptor to the target's queue and raises a
//! [`IpiKind::CallFunctionSingle`] IPI only if the queue was empty; a
//! non-empty queue already has an IPI in flight that will drain it.
//!
//! Calls to many CPUs share one descriptor with a reference count. The
//! descriptor sits on a machine-wide queue until the last target has run
//! the function.
//!
//! The function of a call runs in interrupt context on the target, with
//! local IRQs disabled. It must be short and must not sleep. It receives
//! the ID of the CPU it runs on.

use alloc::collections::VecDeque;
use core::sync::atomic::{fence, AtomicBool, AtomicU8, AtomicUsize, Ordering};

use bitflags::bitflags;
use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListAtomicLink};
use smallvec::SmallVec;

use crate::{
    arch::IpiKind,
    cpu::{AtomicCpuSet, CpuId, CpuSet, PerCpu},
    prelude::*,
    Error,
};

/// A function executed by a cross-CPU call.
pub type CallFn = Arc<dyn Fn(CpuId) + Send + Sync>;

bitflags! {
    /// The state of a call descriptor.
    pub struct CsdFlags: u8 {
        /// The descriptor is owned by a pending call. It is set by the
        /// sender and cleared by the target after the function returns.
        const LOCK = 1 << 0;
        /// The sender spins until the function has run.
        const WAIT = 1 << 1;
    }
}

/// A descriptor of a call to a single CPU.
///
/// Senders that do not wait may keep a descriptor and reuse it for the next
/// call with [`CrossCall::send_call_function_single`]; a reuse waits until
/// the previous call has released it.
pub struct CallSingleData {
    link: LinkedListAtomicLink,
    flags: AtomicU8,
    func: spin::Mutex<Option<CallFn>>,
}

intrusive_adapter!(CsdAdapter = Arc<CallSingleData>: CallSingleData { link: LinkedListAtomicLink });

impl CallSingleData {
    /// Creates an unused descriptor.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            link: LinkedListAtomicLink::new(),
            flags: AtomicU8::new(0),
            func: spin::Mutex::new(None),
        })
    }

    /// Returns whether a call using this descriptor is still pending.
    pub fn is_locked(&self) -> bool {
        self.flags().contains(CsdFlags::LOCK)
    }

    fn flags(&self) -> CsdFlags {
        CsdFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    fn try_lock(&self, wait: bool) -> bool {
        let mut new_flags = CsdFlags::LOCK;
        if wait {
            new_flags |= CsdFlags::WAIT;
        }
        self.flags
            .compare_exchange(0, new_flags.bits(), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self) {
        self.flags.store(0, Ordering::Release);
    }
}

/// A call shared by several target CPUs.
struct CallFunctionData {
    func: CallFn,
    // The targets that have not run the function yet.
    cpumask: AtomicCpuSet,
    refs: AtomicUsize,
    locked: AtomicBool,
}

/// The cross-call engine of a machine.
pub struct CrossCall {
    machine: Arc<Machine>,
    single_queues: PerCpu<spin::Mutex<LinkedList<CsdAdapter>>>,
    many_queue: spin::Mutex<VecDeque<Arc<CallFunctionData>>>,
    warned_irqs_disabled: AtomicBool,
}

impl CrossCall {
    /// Creates the engine with empty queues.
    pub fn new(machine: Arc<Machine>) -> Self {
        Self {
            machine,
            single_queues: PerCpu::new(|_| spin::Mutex::new(LinkedList::new(CsdAdapter::new()))),
            many_queue: spin::Mutex::new(VecDeque::new()),
            warned_irqs_disabled: AtomicBool::new(false),
        }
    }

    /// Runs `f` on `target`.
    ///
    /// If `target` is the calling CPU, `f` runs right away with local IRQs
    /// disabled. Otherwise the call is queued on `target`; if `wait` is
    /// true, this method spins until `f` has returned there.
    ///
    /// Fails with [`Error::NotOnline`] if `target` is not online.
    pub fn call_function_single<F>(&self, this_cpu: CpuId, target: CpuId, f: F, wait: bool) -> Result<()>
    where
        F: Fn(CpuId) + Send + Sync + 'static,
    {
        self.call_single(this_cpu, target, Arc::new(f), wait)
    }

    /// Runs a function on `target` using a caller-owned descriptor.
    ///
    /// If the descriptor is still in use by a previous call, this method
    /// spins until that call has completed.
    pub fn send_call_function_single<F>(
        &self,
        this_cpu: CpuId,
        target: CpuId,
        csd: &Arc<CallSingleData>,
        f: F,
        wait: bool,
    ) -> Result<()>
    where
        F: Fn(CpuId) + Send + Sync + 'static,
    {
        let _preempt_guard = self.machine.disable_preempt(this_cpu);
        self.check_irqs_enabled(this_cpu);

        if target == this_cpu {
            let _irq_guard = self.machine.disable_local_irq(this_cpu);
            f(this_cpu);
            return Ok(());
        }
        if !self.machine.topology().is_online(target) {
            return Err(Error::NotOnline);
        }

        while !csd.try_lock(wait) {
            self.machine.cpu_relax();
        }
        *csd.func.lock() = Some(Arc::new(f));
        self.exec_single(target, csd.clone());
        if wait {
            self.csd_lock_wait(csd);
        }
        Ok(())
    }

    /// Runs `f` on every online CPU of `mask` other than the calling CPU.
    ///
    /// Offline CPUs in `mask` are skipped. If `wait` is true, this method
    /// spins until every target has returned from `f`.
    pub fn call_function_many<F>(&self, this_cpu: CpuId, mask: &CpuSet, f: F, wait: bool)
    where
        F: Fn(CpuId) + Send + Sync + 'static,
    {
        self.call_many(this_cpu, mask, Arc::new(f), wait);
    }

    /// Runs `f` on all other online CPUs.
    pub fn smp_call_function<F>(&self, this_cpu: CpuId, f: F, wait: bool)
    where
        F: Fn(CpuId) + Send + Sync + 'static,
    {
        let online = self.machine.topology().online();
        self.call_many(this_cpu, &online, Arc::new(f), wait);
    }

    /// Runs `f` on all online CPUs, including the calling one.
    ///
    /// The local invocation happens after the remote ones have been sent,
    /// with local IRQs disabled.
    pub fn on_each_cpu<F>(&self, this_cpu: CpuId, f: F, wait: bool)
    where
        F: Fn(CpuId) + Send + Sync + 'static,
    {
        let online = self.machine.topology().online();
        self.on_each_cpu_mask(this_cpu, &online, f, wait);
    }

    /// Runs `f` on the online CPUs of `mask`, including the calling one if
    /// it is in `mask`.
    pub fn on_each_cpu_mask<F>(&self, this_cpu: CpuId, mask: &CpuSet, f: F, wait: bool)
    where
        F: Fn(CpuId) + Send + Sync + 'static,
    {
        let func: CallFn = Arc::new(f);
        self.call_many(this_cpu, mask, func.clone(), wait);
        if mask.contains(this_cpu) {
            let _irq_guard = self.machine.disable_local_irq(this_cpu);
            func(this_cpu);
        }
    }

    /// Runs `f` on one online CPU of `mask`, preferring the calling CPU.
    ///
    /// Fails with [`Error::NotOnline`] if no CPU of `mask` is online.
    pub fn call_function_any<F>(&self, this_cpu: CpuId, mask: &CpuSet, f: F, wait: bool) -> Result<()>
    where
        F: Fn(CpuId) + Send + Sync + 'static,
    {
        let candidates = mask.and(&self.machine.topology().online());
        let target = if candidates.contains(this_cpu) {
            this_cpu
        } else {
            candidates.first().ok_or(Error::NotOnline)?
        };
        self.call_single(this_cpu, target, Arc::new(f), wait)
    }

    /// Drains the queue of `cpu`. Called on an [`IpiKind::CallFunctionSingle`] IPI.
    pub fn handle_call_function_single_ipi(&self, cpu: CpuId) {
        let batch: SmallVec<[Arc<CallSingleData>; 8]> = {
            let mut queue = self.single_queues[cpu].lock();
            let mut batch = SmallVec::new();
            while let Some(csd) = queue.pop_front() {
                batch.push(csd);
            }
            batch
        };

        for csd in batch {
            let func = csd.func.lock().take();
            if let Some(func) = func {
                log::trace!("CPU{}: running queued single call", cpu);
                func(cpu);
            }
            csd.unlock();
        }
    }

    /// Runs the shared calls that still target `cpu`. Called on an
    /// [`IpiKind::CallFunction`] IPI.
    pub fn handle_call_function_ipi(&self, cpu: CpuId) {
        let pending: SmallVec<[Arc<CallFunctionData>; 4]> = self
            .many_queue
            .lock()
            .iter()
            .filter(|data| data.cpumask.test_and_remove(cpu, Ordering::AcqRel))
            .cloned()
            .collect();

        for data in pending {
            (data.func)(cpu);
            if data.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.many_queue
                    .lock()
                    .retain(|queued| !Arc::ptr_eq(queued, &data));
                data.locked.store(false, Ordering::Release);
            }
        }
    }

    /// Runs every call still pending for `cpu`.
    ///
    /// A CPU that is going offline calls this so that no queued call is left
    /// behind.
    pub fn flush_pending(&self, cpu: CpuId) {
        self.handle_call_function_single_ipi(cpu);
        self.handle_call_function_ipi(cpu);
    }

    fn call_single(&self, this_cpu: CpuId, target: CpuId, func: CallFn, wait: bool) -> Result<()> {
        let _preempt_guard = self.machine.disable_preempt(this_cpu);
        self.check_irqs_enabled(this_cpu);

        if target == this_cpu {
            let _irq_guard = self.machine.disable_local_irq(this_cpu);
            func(this_cpu);
            return Ok(());
        }
        if !self.machine.topology().is_online(target) {
            return Err(Error::NotOnline);
        }

        let csd = CallSingleData::new();
        // A fresh descriptor is never locked.
        let _ = csd.try_lock(wait);
        *csd.func.lock() = Some(func);
        self.exec_single(target, csd.clone());
        if wait {
            self.csd_lock_wait(&csd);
        }
        Ok(())
    }

    fn call_many(&self, this_cpu: CpuId, mask: &CpuSet, func: CallFn, wait: bool) {
        let _preempt_guard = self.machine.disable_preempt(this_cpu);
        self.check_irqs_enabled(this_cpu);

        let mut targets = mask.and(&self.machine.topology().online());
        targets.remove(this_cpu);

        let nr_targets = targets.count();
        if nr_targets == 0 {
            return;
        }
        if nr_targets == 1 {
            if let Some(target) = targets.first() {
                // The target may have gone offline meanwhile; a skipped
                // offline CPU is not an error here.
                if let Err(err) = self.call_single(this_cpu, target, func, wait) {
                    log::trace!(
                        "CPU{}: cross-CPU call to CPU{} skipped: {}",
                        this_cpu,
                        target,
                        err
                    );
                }
            }
            return;
        }

        let data = Arc::new(CallFunctionData {
            func,
            cpumask: AtomicCpuSet::new(targets),
            refs: AtomicUsize::new(nr_targets),
            locked: AtomicBool::new(true),
        });
        self.many_queue.lock().push_back(data.clone());

        // The queued descriptor must be visible before any target takes the IPI.
        fence(Ordering::SeqCst);
        self.machine
            .platform()
            .send_ipi(&targets, IpiKind::CallFunction);

        if wait {
            while data.locked.load(Ordering::Acquire) {
                self.machine.cpu_relax();
            }
        }
    }

    fn exec_single(&self, target: CpuId, csd: Arc<CallSingleData>) {
        let raise_ipi = {
            let mut queue = self.single_queues[target].lock();
            let was_empty = queue.is_empty();
            queue.push_back(csd);
            was_empty
        };

        // The target drains the whole queue on each IPI, so an IPI is only
        // needed for the first descriptor.
        if raise_ipi {
            self.machine
                .platform()
                .send_ipi(&CpuSet::from(target), IpiKind::CallFunctionSingle);
        }
    }

    fn csd_lock_wait(&self, csd: &CallSingleData) {
        while csd.is_locked() {
            self.machine.cpu_relax();
        }
    }

    fn check_irqs_enabled(&self, this_cpu: CpuId) {
        let machine = &self.machine;
        if machine.topology().is_online(this_cpu)
            && !machine.platform().is_local_irq_enabled(this_cpu)
            && !self.warned_irqs_disabled.swap(true, Ordering::Relaxed)
        {
            log::warn!(
                "CPU{}: cross-CPU call with local IRQs disabled may deadlock",
                this_cpu
            );
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        arch::Platform,
        host::{cpu, host_machine_with_platform, HostPlatform},
    };

    fn engine(nr_cpus: usize, deliver: bool) -> (Arc<CrossCall>, Arc<HostPlatform>) {
        let (machine, platform) = host_machine_with_platform(nr_cpus);
        let cross_call = Arc::new(CrossCall::new(machine));
        if deliver {
            let cross_call = cross_call.clone();
            platform.set_ipi_hook(move |cpu, kind| match kind {
                IpiKind::CallFunction => cross_call.handle_call_function_ipi(cpu),
                IpiKind::CallFunctionSingle => cross_call.handle_call_function_single_ipi(cpu),
                _ => {}
            });
        }
        (cross_call, platform)
    }

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(CpuId) + Send + Sync + 'static) {
        let ran_on = Arc::new(Mutex::new(Vec::new()));
        let ran_on_cloned = ran_on.clone();
        (ran_on, move |cpu: CpuId| {
            ran_on_cloned.lock().unwrap().push(cpu.as_u32())
        })
    }

    #[test]
    fn single_call_runs_on_target() {
        let (cross_call, platform) = engine(4, true);
        let (ran_on, f) = recorder();

        cross_call
            .call_function_single(cpu(0), cpu(2), f, true)
            .unwrap();

        assert_eq!(*ran_on.lock().unwrap(), [2]);
        assert_eq!(platform.ipis_sent(cpu(2), IpiKind::CallFunctionSingle), 1);
    }

    #[test]
    fn single_call_to_self_runs_inline() {
        let (cross_call, platform) = engine(2, false);
        let (ran_on, f) = recorder();

        cross_call
            .call_function_single(cpu(1), cpu(1), f, false)
            .unwrap();

        assert_eq!(*ran_on.lock().unwrap(), [1]);
        assert_eq!(platform.ipis_sent(cpu(1), IpiKind::CallFunctionSingle), 0);
        assert!(platform.is_local_irq_enabled(cpu(1)));
    }

    #[test]
    fn single_call_to_offline_cpu_fails() {
        let (cross_call, _platform) = engine(4, true);
        cross_call
            .machine
            .topology()
            .set_online(cpu(3), false)
            .unwrap();

        let res = cross_call.call_function_single(cpu(0), cpu(3), |_| {}, true);
        assert_eq!(res, Err(Error::NotOnline));
    }

    #[test]
    fn queued_calls_share_one_ipi() {
        let (cross_call, platform) = engine(2, false);
        let (ran_on, f) = recorder();
        let f = Arc::new(f);

        for _ in 0..3 {
            let f = f.clone();
            cross_call
                .call_function_single(cpu(0), cpu(1), move |cpu| f(cpu), false)
                .unwrap();
        }
        assert_eq!(platform.ipis_sent(cpu(1), IpiKind::CallFunctionSingle), 1);
        assert!(ran_on.lock().unwrap().is_empty());

        cross_call.handle_call_function_single_ipi(cpu(1));
        assert_eq!(*ran_on.lock().unwrap(), [1, 1, 1]);

        cross_call
            .call_function_single(cpu(0), cpu(1), |_| {}, false)
            .unwrap();
        assert_eq!(platform.ipis_sent(cpu(1), IpiKind::CallFunctionSingle), 2);
    }

    #[test]
    fn caller_owned_descriptor_is_released() {
        let (cross_call, _platform) = engine(2, false);
        let csd = CallSingleData::new();
        let (ran_on, f) = recorder();

        cross_call
            .send_call_function_single(cpu(0), cpu(1), &csd, f, false)
            .unwrap();
        assert!(csd.is_locked());

        cross_call.handle_call_function_single_ipi(cpu(1));
        assert!(!csd.is_locked());
        assert_eq!(*ran_on.lock().unwrap(), [1]);

        cross_call
            .send_call_function_single(cpu(0), cpu(1), &csd, |_| {}, false)
            .unwrap();
        cross_call.flush_pending(cpu(1));
        assert!(!csd.is_locked());
    }

    #[test]
    fn many_call_runs_once_per_target() {
        let (cross_call, platform) = engine(4, true);
        let (ran_on, f) = recorder();
        let mask: CpuSet = [cpu(1), cpu(2), cpu(3)].into_iter().collect();

        cross_call.call_function_many(cpu(0), &mask, f, true);

        let mut cpus = ran_on.lock().unwrap().clone();
        cpus.sort();
        assert_eq!(cpus, [1, 2, 3]);
        assert!(cross_call.many_queue.lock().is_empty());
        for raw in 1..4 {
            assert_eq!(platform.ipis_sent(cpu(raw), IpiKind::CallFunction), 1);
        }
    }

    #[test]
    fn many_call_with_one_target() {
        let (cross_call, platform) = engine(4, true);
        let (ran_on, f) = recorder();
        let mask: CpuSet = [cpu(0), cpu(2)].into_iter().collect();
        cross_call.call_function_many(cpu(0), &mask, f, true);
        assert_eq!(*ran_on.lock().unwrap(), [2]);
        assert_eq!(platform.ipis_sent(cpu(2), IpiKind::CallFunctionSingle), 1);
        assert_eq!(platform.ipis_sent(cpu(2), IpiKind::CallFunction), 0);

        cross_call
            .machine
            .topology()
            .set_online(cpu(3), false)
            .unwrap();
        let (ran_on, f) = recorder();
        let mask: CpuSet = [cpu(0), cpu(3)].into_iter().collect();
        cross_call.call_function_many(cpu(0), &mask, f, true);
        assert!(ran_on.lock().unwrap().is_empty());
        assert_eq!(platform.ipis_sent(cpu(3), IpiKind::CallFunctionSingle), 0);
    }

    #[test]
    fn many_call_skips_self_and_offline() {
        let (cross_call, _platform) = engine(4, true);
        cross_call
            .machine
            .topology()
            .set_online(cpu(3), false)
            .unwrap();
        let (ran_on, f) = recorder();

        cross_call.call_function_many(cpu(1), &CpuSet::new_first(4), f, true);

        let mut cpus = ran_on.lock().unwrap().clone();
        cpus.sort();
        assert_eq!(cpus, [0, 2]);
    }

    #[test]
    fn many_call_waits_for_last_target() {
        let (cross_call, _platform) = engine(3, false);
        let (ran_on, f) = recorder();

        cross_call.call_function_many(cpu(0), &CpuSet::new_first(3), f, false);
        assert_eq!(cross_call.many_queue.lock().len(), 1);

        cross_call.handle_call_function_ipi(cpu(1));
        assert_eq!(cross_call.many_queue.lock().len(), 1);
        cross_call.handle_call_function_ipi(cpu(1));
        assert_eq!(ran_on.lock().unwrap().len(), 1);

        cross_call.flush_pending(cpu(2));
        assert!(cross_call.many_queue.lock().is_empty());
        assert_eq!(*ran_on.lock().unwrap(), [1, 2]);
    }

    #[test]
    fn on_each_cpu_includes_caller() {
        let (cross_call, _platform) = engine(4, true);
        let (ran_on, f) = recorder();

        cross_call.on_each_cpu(cpu(2), f, true);

        let mut cpus = ran_on.lock().unwrap().clone();
        cpus.sort();
        assert_eq!(cpus, [0, 1, 2, 3]);
    }

    #[test]
    fn call_any_prefers_caller() {
        let (cross_call, _platform) = engine(4, true);
        let (ran_on, f) = recorder();
        let mask: CpuSet = [cpu(1), cpu(3)].into_iter().collect();

        cross_call.call_function_any(cpu(3), &mask, f, true).unwrap();
        assert_eq!(*ran_on.lock().unwrap(), [3]);

        let (ran_on, f) = recorder();
        cross_call.call_function_any(cpu(0), &mask, f, true).unwrap();
        assert_eq!(*ran_on.lock().unwrap(), [1]);

        let nobody = CpuSet::new_empty();
        assert_eq!(
            cross_call.call_function_any(cpu(0), &nobody, |_| {}, true),
            Err(Error::NotOnline)
        );
    }
}
