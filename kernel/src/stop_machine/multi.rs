// SPDX-License-Identifier: MPL-2.0

//! The rendezvous run by every CPU taking part in a stop-machine request.
//!
//! ```text
//! None -> Prepare -> DisableIrq -> Run -> Exit
//! ```
//!
//! Each CPU polls the shared state and acknowledges every new state once.
//! The last CPU to acknowledge a state advances it for everyone. Only the
//! active CPUs call the function, in `Run`, while all the others spin with
//! local IRQs disabled.

use hinge_frame::Machine;

use super::CpuStopFn;
use crate::prelude::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum MultiStopState {
    None = 0,
    Prepare = 1,
    DisableIrq = 2,
    Run = 3,
    Exit = 4,
}

impl MultiStopState {
    fn from_u8(val: u8) -> Self {
        match val {
            1 => Self::Prepare,
            2 => Self::DisableIrq,
            3 => Self::Run,
            4 => Self::Exit,
            _ => Self::None,
        }
    }

    fn next(self) -> Self {
        match self {
            Self::Exit => Self::Exit,
            _ => Self::from_u8(self as u8 + 1),
        }
    }
}

pub(super) struct MultiStopData {
    func: CpuStopFn,
    active: Option<CpuSet>,
    nr_threads: AtomicUsize,
    state: AtomicU8,
    thread_ack: AtomicUsize,
    nr_active_ran: AtomicUsize,
}

impl MultiStopData {
    pub(super) fn new(func: CpuStopFn, active: Option<CpuSet>) -> Self {
        Self {
            func,
            active,
            nr_threads: AtomicUsize::new(0),
            state: AtomicU8::new(MultiStopState::None as u8),
            thread_ack: AtomicUsize::new(0),
            nr_active_ran: AtomicUsize::new(0),
        }
    }

    /// Starts the rendezvous of `nr_threads` CPUs.
    ///
    /// Must be called after the works are queued, with the number of
    /// stoppers that accepted them.
    pub(super) fn prepare(&self, nr_threads: usize) {
        self.nr_threads.store(nr_threads, Ordering::Relaxed);
        self.set_state(MultiStopState::Prepare);
    }

    /// Returns how many active CPUs called the function.
    pub(super) fn nr_active_ran(&self) -> usize {
        self.nr_active_ran.load(Ordering::Acquire)
    }

    fn state(&self) -> MultiStopState {
        MultiStopState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: MultiStopState) {
        // Reset the countdown before publishing the state.
        self.thread_ack
            .store(self.nr_threads.load(Ordering::Relaxed), Ordering::Relaxed);
        self.state.store(state as u8, Ordering::Release);
    }

    fn ack_state(&self, state: MultiStopState) {
        if self.thread_ack.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.set_state(state.next());
        }
    }

    /// Takes part in the rendezvous on `cpu`.
    pub(super) fn run(&self, machine: &Machine, cpu: CpuId) -> Result<()> {
        let is_active = match &self.active {
            Some(active) => active.contains(cpu),
            None => machine.topology().online().first() == Some(cpu),
        };

        let platform = machine.platform();
        let was_enabled = platform.is_local_irq_enabled(cpu);
        let mut cur_state = MultiStopState::None;
        let mut ret = Ok(());
        loop {
            machine.cpu_relax();
            let state = self.state();
            if state != cur_state {
                cur_state = state;
                match cur_state {
                    MultiStopState::DisableIrq => platform.local_irq_disable(cpu),
                    MultiStopState::Run if is_active => {
                        trace!("CPU{}: running stop-machine function", cpu);
                        ret = (self.func)(cpu);
                        self.nr_active_ran.fetch_add(1, Ordering::AcqRel);
                    }
                    _ => {}
                }
                self.ack_state(cur_state);
            }
            if cur_state == MultiStopState::Exit {
                break;
            }
        }

        if was_enabled {
            platform.local_irq_enable(cpu);
        }
        ret
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn states_advance_in_order() {
        let mut state = MultiStopState::None;
        let mut visited = Vec::new();
        while state != MultiStopState::Exit {
            state = state.next();
            visited.push(state);
        }
        assert_eq!(
            visited,
            [
                MultiStopState::Prepare,
                MultiStopState::DisableIrq,
                MultiStopState::Run,
                MultiStopState::Exit
            ]
        );
    }

    #[test]
    fn last_ack_advances_the_state() {
        let data = MultiStopData::new(Arc::new(|_: CpuId| -> Result<()> { Ok(()) }), None);
        data.prepare(2);
        assert_eq!(data.state(), MultiStopState::Prepare);
        data.ack_state(MultiStopState::Prepare);
        assert_eq!(data.state(), MultiStopState::Prepare);
        data.ack_state(MultiStopState::Prepare);
        assert_eq!(data.state(), MultiStopState::DisableIrq);
    }
}
