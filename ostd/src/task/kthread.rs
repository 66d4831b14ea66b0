// SPDX-License-Identifier: MPL-2.0

use alloc::string::String;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use spin::Once;

use super::{TaskHandle, TaskOptions, TaskPriority};
use crate::{
    cpu::CpuId,
    prelude::*,
    sync::{Completion, WaitQueue},
    Machine,
};

/// Options to create a kernel thread.
#[derive(Clone, Debug, Default)]
pub struct KThreadOptions {
    name: String,
    cpu: Option<CpuId>,
    priority: TaskPriority,
}

impl KThreadOptions {
    /// Creates options for a thread with the given name.
    pub fn new(name: String) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    /// Binds the thread to a CPU.
    pub fn cpu_affinity(mut self, cpu: CpuId) -> Self {
        self.cpu = Some(cpu);
        self
    }

    /// Sets the scheduling class of the thread.
    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// A kernel thread that can be asked to stop.
///
/// The body of the thread receives its own handle. A typical body loops on
/// [`KThread::wait_until`], which returns `None` once [`KThread::stop`] has
/// been requested.
#[derive(Clone)]
pub struct KThread {
    inner: Arc<KThreadInner>,
}

struct KThreadInner {
    name: String,
    cpu: Option<CpuId>,
    should_stop: AtomicBool,
    exit_code: AtomicI32,
    exited: Completion,
    wait_queue: WaitQueue,
    task: Once<Arc<dyn TaskHandle>>,
}

impl KThread {
    /// Creates and starts a kernel thread running `body`.
    ///
    /// The value returned by `body` becomes the exit code reported by
    /// [`KThread::stop`].
    pub fn spawn<F>(machine: &Machine, options: KThreadOptions, body: F) -> Result<Self>
    where
        F: FnOnce(&KThread) -> i32 + Send + 'static,
    {
        let thread = KThread {
            inner: Arc::new(KThreadInner {
                name: options.name.clone(),
                cpu: options.cpu,
                should_stop: AtomicBool::new(false),
                exit_code: AtomicI32::new(0),
                exited: Completion::new(machine),
                wait_queue: WaitQueue::new(machine),
                task: Once::new(),
            }),
        };

        let thread_cloned = thread.clone();
        let mut task_options = TaskOptions::new(move || {
            let exit_code = body(&thread_cloned);
            thread_cloned
                .inner
                .exit_code
                .store(exit_code, Ordering::Relaxed);
            thread_cloned.inner.exited.complete_all();
        })
        .name(&options.name)
        .priority(options.priority);
        if let Some(cpu) = options.cpu {
            task_options = task_options.cpu_affinity(cpu);
        }

        let task = task_options.spawn(machine.scheduler().as_ref())?;
        thread.inner.task.call_once(|| task);
        log::trace!("kthread {} spawned", options.name);
        Ok(thread)
    }

    /// Returns the name of the thread.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the CPU the thread is bound to.
    pub fn cpu(&self) -> Option<CpuId> {
        self.inner.cpu
    }

    /// Returns whether [`KThread::stop`] has been requested.
    pub fn should_stop(&self) -> bool {
        self.inner.should_stop.load(Ordering::Acquire)
    }

    /// Returns whether the body has returned.
    pub fn has_exited(&self) -> bool {
        self.inner.exited.is_done()
    }

    /// Wakes the thread if it sleeps in [`KThread::wait_until`].
    pub fn wake_up(&self) {
        self.inner.wait_queue.wake_all();
    }

    /// Sleeps until `cond` returns `Some(_)` or a stop is requested.
    ///
    /// Returns `None` in the latter case. Must be called from the thread
    /// itself.
    pub fn wait_until<F, R>(&self, mut cond: F) -> Option<R>
    where
        F: FnMut() -> Option<R>,
    {
        self.inner.wait_queue.wait_until(|| {
            if self.should_stop() {
                return Some(None);
            }
            cond().map(Some)
        })
    }

    /// Asks the thread to stop and waits until its body returns.
    ///
    /// Returns the exit code of the body.
    pub fn stop(&self) -> i32 {
        self.inner.should_stop.store(true, Ordering::Release);
        self.wake_up();
        self.inner.exited.wait();
        log::trace!("kthread {} stopped", self.inner.name);
        self.inner.exit_code.load(Ordering::Relaxed)
    }
}

impl core::fmt::Debug for KThread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KThread")
            .field("name", &self.inner.name)
            .field("cpu", &self.inner.cpu)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use core::sync::atomic::AtomicUsize;

    use super::*;
    use crate::host::host_machine;

    #[test]
    fn kthread_runs_until_stopped() {
        let machine = host_machine(2);
        let work = Arc::new(AtomicUsize::new(0));
        let work_cloned = work.clone();

        let thread = KThread::spawn(
            &machine,
            KThreadOptions::new(String::from("worker/1")).cpu_affinity(CpuId::new(1).unwrap()),
            move |this| {
                let mut handled = 0;
                while let Some(n) = this.wait_until(|| {
                    let n = work_cloned.swap(0, Ordering::AcqRel);
                    (n > 0).then_some(n)
                }) {
                    handled += n;
                }
                handled as i32
            },
        )
        .unwrap();

        work.fetch_add(3, Ordering::AcqRel);
        thread.wake_up();
        while work.load(Ordering::Acquire) != 0 {
            std::thread::yield_now();
        }
        work.fetch_add(4, Ordering::AcqRel);
        thread.wake_up();
        while work.load(Ordering::Acquire) != 0 {
            std::thread::yield_now();
        }

        assert_eq!(thread.stop(), 7);
        assert!(thread.has_exited());
        assert!(thread.should_stop());
    }
}
