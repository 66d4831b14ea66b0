// SPDX-License-Identifier: MPL-2.0

//! Per-CPU stopper threads.
//!
//! Every CPU owns a stopper: a queue of works and a kernel thread of the
//! highest scheduling class that runs them one by one. A work queued on a
//! disabled stopper is not queued at all; its completion is signalled right
//! away as "not executed".

use hinge_frame::task::{KThread, KThreadOptions, TaskPriority};

use super::CpuStopFn;
use crate::prelude::*;

/// The completion shared by the works of one stop request.
pub(super) struct CpuStopDone {
    nr_todo: AtomicUsize,
    executed: AtomicBool,
    ret: spin::Mutex<Option<Error>>,
    completion: Completion,
}

impl CpuStopDone {
    pub(super) fn new(machine: &Machine, nr_todo: usize) -> Arc<Self> {
        Arc::new(Self {
            nr_todo: AtomicUsize::new(nr_todo),
            executed: AtomicBool::new(false),
            ret: spin::Mutex::new(None),
            completion: Completion::new(machine),
        })
    }

    /// Records the error of one work. The first error wins.
    fn record_error(&self, err: Error) {
        self.ret.lock().get_or_insert(err);
    }

    /// Signals that one work has been executed, or failed to be.
    fn signal(&self, executed: bool) {
        if executed {
            self.executed.store(true, Ordering::Release);
        }
        if self.nr_todo.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.completion.complete();
        }
    }

    /// Waits for every work and returns the aggregated result.
    ///
    /// Fails with `ENOENT` if none of the works was executed.
    pub(super) fn wait(&self) -> Result<()> {
        self.completion.wait();
        if !self.executed.load(Ordering::Acquire) {
            return_errno_with_message!(Errno::ENOENT, "no stopper executed the work");
        }
        match *self.ret.lock() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub(super) struct CpuStopWork {
    pub(super) func: CpuStopFn,
    pub(super) done: Option<Arc<CpuStopDone>>,
}

impl CpuStopWork {
    fn fail(self) {
        if let Some(done) = self.done {
            done.signal(false);
        }
    }
}

struct StopperQueue {
    enabled: bool,
    works: VecDeque<CpuStopWork>,
}

/// The stopper of one CPU.
pub(super) struct Stopper {
    cpu: CpuId,
    queue: spin::Mutex<StopperQueue>,
    thread: spin::Mutex<Option<KThread>>,
}

impl Stopper {
    pub(super) fn new(cpu: CpuId) -> Arc<Self> {
        Arc::new(Self {
            cpu,
            queue: spin::Mutex::new(StopperQueue {
                enabled: false,
                works: VecDeque::new(),
            }),
            thread: spin::Mutex::new(None),
        })
    }

    /// Queues `work` and wakes the thread, or fails the work if the stopper
    /// is disabled.
    ///
    /// Returns whether the work was queued.
    pub(super) fn queue(&self, work: CpuStopWork) -> bool {
        {
            let mut queue = self.queue.lock();
            if !queue.enabled {
                drop(queue);
                work.fail();
                return false;
            }
            queue.works.push_back(work);
        }
        self.wake_up();
        true
    }

    pub(super) fn is_enabled(&self) -> bool {
        self.queue.lock().enabled
    }

    pub(super) fn enable(&self) {
        self.queue.lock().enabled = true;
        self.wake_up();
    }

    /// Disables the stopper and fails every pending work.
    pub(super) fn disable(&self) {
        let works = {
            let mut queue = self.queue.lock();
            queue.enabled = false;
            core::mem::take(&mut queue.works)
        };
        if !works.is_empty() {
            warn!("CPU{}: failing {} pending stopper works", self.cpu, works.len());
        }
        works.into_iter().for_each(CpuStopWork::fail);
    }

    pub(super) fn has_thread(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Creates the stopper thread. Does nothing if it already exists.
    pub(super) fn spawn_thread(self: &Arc<Self>, machine: &Arc<Machine>) -> Result<()> {
        let mut slot = self.thread.lock();
        if slot.is_some() {
            return Ok(());
        }

        let cpu = self.cpu;
        let weak = Arc::downgrade(self);
        let machine_cloned = machine.clone();
        let options = KThreadOptions::new(format!("migration/{}", cpu))
            .cpu_affinity(cpu)
            .priority(TaskPriority::Stop);
        let thread = KThread::spawn(machine, options, move |this| {
            while let Some((stopper, work)) = this.wait_until(|| {
                let stopper = weak.upgrade()?;
                let work = stopper.queue.lock().works.pop_front()?;
                Some((stopper, work))
            }) {
                stopper.run_work(&machine_cloned, work);
            }
            0
        })?;

        *slot = Some(thread);
        Ok(())
    }

    /// Stops the thread and fails the works it left behind.
    pub(super) fn stop_thread(&self) {
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            thread.stop();
        }
        self.disable();
    }

    fn wake_up(&self) {
        let thread = self.thread.lock().clone();
        if let Some(thread) = thread {
            thread.wake_up();
        }
    }

    fn run_work(&self, machine: &Machine, work: CpuStopWork) {
        let cpu = self.cpu;
        let ret = {
            let _preempt_guard = machine.disable_preempt(cpu);
            let preempt_count = machine.preempt_count(cpu);
            let prev_count = preempt_count.get();
            let ret = (work.func)(cpu);
            let count = preempt_count.get();
            if count != prev_count {
                error!(
                    "CPU{}: stopper work leaked preempt count: {:#010x} -> {:#010x}",
                    cpu, prev_count, count
                );
            }
            ret
        };

        if let Some(done) = work.done {
            if let Err(err) = ret {
                done.record_error(err);
            }
            done.signal(true);
        }
    }
}
