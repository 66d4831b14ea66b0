// SPDX-License-Identifier: MPL-2.0

//! A simulated machine for the integration tests.
//!
//! Every CPU is a host thread. A booted secondary CPU runs
//! [`Kernel::secondary_start_kernel`] and then an idle loop that delivers
//! the IPIs raised on it while its IRQs are enabled.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, OnceLock, Weak,
    },
    time::{Duration, Instant},
};

use hinge_frame::{
    arch::{IpiKind, Platform},
    cpu::{CpuId, CpuSet, PerCpu},
    host::HostScheduler,
    Error,
};
use hinge_kernel::{smp::IdleState, Kernel};

pub use hinge_frame::host::cpu;

/// The hardware of the simulated machine.
pub struct SimPlatform {
    nr_cores: usize,
    boot: Instant,
    irq_enabled: PerCpu<AtomicBool>,
    ipi_pending: PerCpu<AtomicU32>,
    weak_self: Weak<SimPlatform>,
    kernel: OnceLock<Weak<Kernel>>,
    /// `boot_secondary` fails.
    pub fail_boot: AtomicBool,
    /// `boot_secondary` succeeds but the CPU never runs.
    pub hang_on_boot: AtomicBool,
    /// `cpu_disable` refuses to take a CPU down.
    pub deny_disable: AtomicBool,
    /// `kill_cpu` fails.
    pub kill_fails: AtomicBool,
}

impl SimPlatform {
    fn new(nr_cores: usize) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            nr_cores,
            weak_self: weak_self.clone(),
            boot: Instant::now(),
            irq_enabled: PerCpu::new(|cpu| AtomicBool::new(cpu == CpuId::bsp())),
            ipi_pending: PerCpu::new(|_| AtomicU32::new(0)),
            kernel: OnceLock::new(),
            fail_boot: AtomicBool::new(false),
            hang_on_boot: AtomicBool::new(false),
            deny_disable: AtomicBool::new(false),
            kill_fails: AtomicBool::new(false),
        })
    }

    /// Starts the host thread of `cpu`. A secondary CPU enters the kernel
    /// before its idle loop.
    pub fn start_cpu(&self, cpu: CpuId, secondary: bool) {
        let Some(platform) = self.weak_self.upgrade() else {
            return;
        };
        std::thread::Builder::new()
            .name(format!("cpu{}", cpu))
            .spawn(move || {
                if secondary {
                    match platform.kernel() {
                        Some(kernel) => kernel.secondary_start_kernel(cpu),
                        None => return,
                    }
                }
                platform.idle_loop(cpu);
            })
            .unwrap();
    }

    fn kernel(&self) -> Option<Arc<Kernel>> {
        self.kernel.get().and_then(Weak::upgrade)
    }

    fn idle_loop(&self, cpu: CpuId) {
        loop {
            let Some(kernel) = self.kernel() else {
                return;
            };
            match kernel.idle_state(cpu) {
                IdleState::Running => {}
                IdleState::Dying => {
                    kernel.cpu_die(cpu);
                    return;
                }
                IdleState::Halted => return,
            }

            if self.is_local_irq_enabled(cpu) {
                let pending = self.ipi_pending[cpu].swap(0, Ordering::AcqRel);
                for kind in IpiKind::ALL {
                    if pending & (1 << kind.as_index()) == 0 {
                        continue;
                    }
                    self.local_irq_disable(cpu);
                    kernel.handle_ipi(cpu, kind);
                    if kernel.idle_state(cpu) == IdleState::Running {
                        self.local_irq_enable(cpu);
                    }
                }
            }
            drop(kernel);
            std::thread::sleep(Duration::from_micros(200));
        }
    }
}

impl Platform for SimPlatform {
    fn nr_cores(&self) -> usize {
        self.nr_cores
    }

    fn send_ipi(&self, targets: &CpuSet, kind: IpiKind) {
        for cpu in targets.iter() {
            self.ipi_pending[cpu].fetch_or(1 << kind.as_index(), Ordering::AcqRel);
        }
    }

    fn boot_secondary(&self, cpu: CpuId) -> hinge_frame::Result<()> {
        if self.fail_boot.load(Ordering::Relaxed) {
            return Err(Error::IoError);
        }
        self.irq_enabled[cpu].store(false, Ordering::Release);
        self.ipi_pending[cpu].store(0, Ordering::Release);
        if !self.hang_on_boot.load(Ordering::Relaxed) {
            self.start_cpu(cpu, true);
        }
        Ok(())
    }

    fn kill_cpu(&self, _cpu: CpuId) -> bool {
        !self.kill_fails.load(Ordering::Relaxed)
    }

    fn cpu_disable(&self, _cpu: CpuId) -> hinge_frame::Result<()> {
        if self.deny_disable.load(Ordering::Relaxed) {
            return Err(Error::Busy);
        }
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

    fn cpu_relax(&self) {
        std::thread::yield_now();
    }

    fn now(&self) -> Duration {
        self.boot.elapsed()
    }

    fn console_write(&self, s: &str) {
        eprint!("{}", s);
    }
}

/// Boots a simulated machine with `nr_cores` CPUs on the given command
/// line. Only the boot CPU is online.
pub fn boot(nr_cores: usize, cmdline: &str) -> (Arc<Kernel>, Arc<SimPlatform>) {
    let _ = env_logger::builder().is_test(true).try_init();

    let platform = SimPlatform::new(nr_cores);
    let kernel = Kernel::new(platform.clone(), Arc::new(HostScheduler), cmdline).unwrap();
    platform.kernel.set(Arc::downgrade(&kernel)).unwrap();
    platform.start_cpu(CpuId::bsp(), false);
    (kernel, platform)
}

/// Boots a simulated machine like [`boot`] and brings all CPUs up.
pub fn boot_all(nr_cores: usize) -> (Arc<Kernel>, Arc<SimPlatform>) {
    let (kernel, platform) = boot(nr_cores, "");
    kernel.smp_init();
    let topology = kernel.machine().topology();
    assert_eq!(topology.num_online(), nr_cores);
    // A new CPU enables its IRQs only after it has reported itself up.
    wait_for(|| {
        topology
            .online()
            .iter()
            .all(|cpu| platform.is_local_irq_enabled(cpu))
    });
    (kernel, platform)
}

/// Returns the CPUs with the given IDs.
pub fn cpus(raws: &[u32]) -> CpuSet {
    raws.iter().map(|raw| cpu(*raw)).collect()
}

/// Spins until `cond` holds, failing the test after ten seconds.
pub fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(1));
    }
}
