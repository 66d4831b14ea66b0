// SPDX-License-Identifier: MPL-2.0

//! The architecture side of bringing CPUs up and taking them down.

use hinge_frame::cpu::PerCpu;

use crate::prelude::*;

/// What the idle loop of a CPU should do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum IdleState {
    /// Keep running tasks and handling interrupts.
    Running = 0,
    /// The CPU has been taken offline; call [`Kernel::cpu_die`] and power off.
    ///
    /// [`Kernel::cpu_die`]: crate::Kernel::cpu_die
    Dying = 1,
    /// The CPU has been stopped for reboot or panic; spin forever.
    Halted = 2,
}

impl IdleState {
    fn from_u8(val: u8) -> Self {
        match val {
            1 => Self::Dying,
            2 => Self::Halted,
            _ => Self::Running,
        }
    }
}

/// The handshake between the CPU driving a transition and the CPU that
/// comes up or goes down.
pub(crate) struct SmpBoot {
    machine: Arc<Machine>,
    cpu_running: Completion,
    cpu_died: Completion,
    idle_states: PerCpu<AtomicU8>,
}

impl SmpBoot {
    pub(crate) fn new(machine: Arc<Machine>) -> Self {
        Self {
            cpu_running: Completion::new(&machine),
            cpu_died: Completion::new(&machine),
            idle_states: PerCpu::new(|_| AtomicU8::new(IdleState::Running as u8)),
            machine,
        }
    }

    pub(crate) fn idle_state(&self, cpu: CpuId) -> IdleState {
        IdleState::from_u8(self.idle_states[cpu].load(Ordering::Acquire))
    }

    pub(crate) fn set_idle_state(&self, cpu: CpuId, state: IdleState) {
        self.idle_states[cpu].store(state as u8, Ordering::Release);
    }

    /// Boots `cpu` and waits up to `timeout` for it to mark itself online.
    pub(crate) fn cpu_up(&self, cpu: CpuId, timeout: Duration) -> Result<()> {
        self.cpu_running.reinit();
        self.set_idle_state(cpu, IdleState::Running);

        if let Err(err) = self.machine.platform().boot_secondary(cpu) {
            error!("CPU{}: failed to boot: {}", cpu, err);
            return Err(err.into());
        }

        // The flag below is what counts; the completion only saves us from
        // waiting for the whole timeout.
        let _ = self.cpu_running.wait_timeout(timeout);
        if !self.machine.topology().is_online(cpu) {
            error!("CPU{}: failed to come online", cpu);
            return_errno_with_message!(Errno::EIO, "the CPU failed to come online");
        }
        Ok(())
    }

    /// Called by a booting CPU once it is online.
    pub(crate) fn signal_running(&self) {
        self.cpu_running.complete();
    }

    /// Must be called before the CPU is told to die.
    pub(crate) fn prepare_cpu_die(&self) {
        self.cpu_died.reinit();
    }

    /// Called by a dying CPU from its idle loop.
    pub(crate) fn signal_died(&self) {
        self.cpu_died.complete();
    }

    /// Waits up to `timeout` for `cpu` to die, then powers it off.
    ///
    /// Failures are only logged; the CPU is offline either way.
    pub(crate) fn cpu_die(&self, cpu: CpuId, timeout: Duration) {
        if !self.cpu_died.wait_timeout(timeout) {
            error!("CPU{}: cpu didn't die", cpu);
            return;
        }
        info!("CPU{}: shutdown", cpu);

        if !self.machine.platform().kill_cpu(cpu) {
            error!("CPU{}: unable to kill", cpu);
        }
    }
}
