// SPDX-License-Identifier: MPL-2.0

//! A host-backed platform and scheduler for tests.
//!
//! Tasks are host threads. IPIs are delivered synchronously on the sending
//! thread through a hook installed by the test.
//!
//! Only available in tests and with the `host` feature.

use std::{
    cell::RefCell,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    thread::Thread,
    time::{Duration, Instant},
};

use crate::{
    arch::{IpiKind, Platform, NR_IPI},
    cpu::{CpuId, CpuSet, PerCpu},
    task::{Scheduler, TaskEntry, TaskHandle, TaskId},
    Machine, Result,
};

type IpiHook = Box<dyn Fn(CpuId, IpiKind) + Send + Sync>;

/// A platform whose CPUs are bookkeeping only.
///
/// Booting a secondary CPU does nothing; the test drives the CPU's start
/// path itself.
pub struct HostPlatform {
    nr_cores: usize,
    boot: Instant,
    irq_enabled: PerCpu<AtomicBool>,
    ipi_sent: PerCpu<[AtomicUsize; NR_IPI]>,
    ipi_hook: OnceLock<IpiHook>,
}

impl HostPlatform {
    /// Returns how many IPIs of `kind` were sent to `cpu`.
    pub fn ipis_sent(&self, cpu: CpuId, kind: IpiKind) -> usize {
        self.ipi_sent[cpu][kind.as_index()].load(Ordering::Relaxed)
    }

    /// Installs the function that receives every IPI sent.
    ///
    /// Only the first hook takes effect.
    pub fn set_ipi_hook(&self, hook: impl Fn(CpuId, IpiKind) + Send + Sync + 'static) {
        let _ = self.ipi_hook.set(Box::new(hook));
    }
}

impl Platform for HostPlatform {
    fn nr_cores(&self) -> usize {
        self.nr_cores
    }

    fn send_ipi(&self, targets: &CpuSet, kind: IpiKind) {
        for cpu in targets.iter() {
            self.ipi_sent[cpu][kind.as_index()].fetch_add(1, Ordering::Relaxed);
            if let Some(hook) = self.ipi_hook.get() {
                hook(cpu, kind);
            }
        }
    }

    fn boot_secondary(&self, _cpu: CpuId) -> Result<()> {
        Ok(())
    }

    fn local_irq_enable(&self, cpu: CpuId) {
        self.irq_enabled[cpu].store(true, Ordering::Release);
    }

    fn local_irq_disable(&self, cpu: CpuId) {
        self.irq_enabled[cpu].store(false, Ordering::Release);
    }

    fn is_local_irq_enabled(&self, cpu: CpuId) -> bool {
        self.irq_enabled[cpu].load(Ordering::Acquire)
    }

    fn now(&self) -> Duration {
        self.boot.elapsed()
    }
}

/// A task backed by a host thread.
pub struct HostTask {
    id: TaskId,
    name: String,
    thread: OnceLock<Thread>,
}

impl TaskHandle for HostTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn unpark(&self) {
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<HostTask>>> = const { RefCell::new(None) };
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// A scheduler that runs every task on its own host thread.
///
/// Threads that were not spawned by the scheduler become tasks the first
/// time they ask for the current task.
#[derive(Debug, Default)]
pub struct HostScheduler;

impl Scheduler for HostScheduler {
    fn current(&self) -> Arc<dyn TaskHandle> {
        CURRENT.with(|current| {
            current
                .borrow_mut()
                .get_or_insert_with(|| {
                    let thread = std::thread::current();
                    let task = HostTask {
                        id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
                        name: thread.name().unwrap_or("host").to_string(),
                        thread: OnceLock::new(),
                    };
                    let _ = task.thread.set(thread);
                    Arc::new(task)
                })
                .clone()
        })
    }

    fn park_current(&self, timeout: Option<Duration>) {
        // A bounded park keeps the tests robust against an unpark that
        // races with the thread handle being published.
        let slice = Duration::from_millis(10);
        std::thread::park_timeout(timeout.map_or(slice, |t| t.min(slice)));
    }

    fn spawn(&self, entry: TaskEntry) -> Result<Arc<dyn TaskHandle>> {
        let task = Arc::new(HostTask {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            name: entry.name.clone(),
            thread: OnceLock::new(),
        });
        let task_cloned = task.clone();
        let func = entry.func;
        let handle = std::thread::Builder::new()
            .name(entry.name)
            .spawn(move || {
                let _ = task_cloned.thread.set(std::thread::current());
                CURRENT.with(|current| *current.borrow_mut() = Some(task_cloned));
                func();
            })
            .map_err(|_| crate::Error::NoMemory)?;
        let _ = task.thread.set(handle.thread().clone());
        Ok(task)
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

/// Creates a machine with `nr_cpus` possible, present and online CPUs.
pub fn host_machine(nr_cpus: usize) -> Arc<Machine> {
    host_machine_with_platform(nr_cpus).0
}

/// Creates a machine like [`host_machine`] and returns its platform too.
pub fn host_machine_with_platform(nr_cpus: usize) -> (Arc<Machine>, Arc<HostPlatform>) {
    let platform = Arc::new(HostPlatform {
        nr_cores: nr_cpus,
        boot: Instant::now(),
        irq_enabled: PerCpu::new(|_| AtomicBool::new(true)),
        ipi_sent: PerCpu::new(|_| core::array::from_fn(|_| AtomicUsize::new(0))),
        ipi_hook: OnceLock::new(),
    });
    let machine = Machine::new(platform.clone(), Arc::new(HostScheduler));
    let topology = machine.topology();
    topology.init_possible(nr_cpus).unwrap();
    for cpu in crate::cpu::all_cpus(nr_cpus) {
        topology.set_present(cpu, true).unwrap();
        topology.set_online(cpu, true).unwrap();
        topology.set_active(cpu, true).unwrap();
    }
    (machine, platform)
}

/// Returns the CPU ID `raw`.
///
/// # Panics
///
/// Panics if `raw` is not below [`NR_CPUS`](crate::cpu::NR_CPUS).
pub fn cpu(raw: u32) -> CpuId {
    CpuId::new(raw).unwrap()
}
