// SPDX-License-Identifier: MPL-2.0

//! Tasks and the scheduler interface.
//!
//! The SMP core does not implement a scheduler. It only needs to know the
//! current task, to park and unpark tasks, and to spawn kernel threads bound
//! to a CPU. A scheduler implementation provides these through the
//! [`Scheduler`] trait and is handed to the [`Machine`](crate::Machine).

mod kthread;

use alloc::string::String;
use core::time::Duration;

pub use kthread::{KThread, KThreadOptions};

use crate::{cpu::CpuId, prelude::*};

/// The ID of a task, unique within a scheduler.
pub type TaskId = u64;

/// A task known to the scheduler.
pub trait TaskHandle: Send + Sync {
    /// Returns the ID of the task.
    fn id(&self) -> TaskId;

    /// Returns the name of the task.
    fn name(&self) -> &str;

    /// Makes a parked task runnable again.
    ///
    /// Unparking a task that is not parked makes its next park return
    /// immediately.
    fn unpark(&self);
}

/// What the SMP core expects from a scheduling implementation.
pub trait Scheduler: Send + Sync {
    /// Returns the task running on the caller's context.
    fn current(&self) -> Arc<dyn TaskHandle>;

    /// Puts the current task to sleep until it is unparked or `timeout`
    /// expires.
    ///
    /// Spurious wakeups are allowed; callers always re-check their condition.
    fn park_current(&self, timeout: Option<Duration>);

    /// Creates a new task and makes it runnable.
    fn spawn(&self, entry: TaskEntry) -> Result<Arc<dyn TaskHandle>>;

    /// Yields the CPU to other runnable tasks.
    fn yield_now(&self);

    /// Handles a reschedule IPI that arrived on `cpu`.
    fn reschedule_ipi(&self, cpu: CpuId) {
        let _ = cpu;
    }
}

/// The scheduling class of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TaskPriority {
    /// An ordinary task.
    #[default]
    Normal,
    /// A softirq helper thread.
    SoftIrq,
    /// A per-CPU stopper thread, which preempts everything else.
    Stop,
}

/// Everything a scheduler needs to start a task.
pub struct TaskEntry {
    /// The name of the task.
    pub name: String,
    /// The CPU the task is bound to, if any.
    pub cpu: Option<CpuId>,
    /// The scheduling class.
    pub priority: TaskPriority,
    /// The body of the task.
    pub func: Box<dyn FnOnce() + Send>,
}

/// Options to create or spawn a new task.
pub struct TaskOptions {
    name: String,
    cpu: Option<CpuId>,
    priority: TaskPriority,
    func: Box<dyn FnOnce() + Send>,
}

impl TaskOptions {
    /// Creates a set of options for a task.
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            name: String::new(),
            cpu: None,
            priority: TaskPriority::default(),
            func: Box::new(func),
        }
    }

    /// Sets the name of the task.
    pub fn name(mut self, name: &str) -> Self {
        self.name = String::from(name);
        self
    }

    /// Binds the task to a CPU.
    pub fn cpu_affinity(mut self, cpu: CpuId) -> Self {
        self.cpu = Some(cpu);
        self
    }

    /// Sets the scheduling class of the task.
    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Builds the entry handed to the scheduler.
    pub fn build(self) -> TaskEntry {
        TaskEntry {
            name: self.name,
            cpu: self.cpu,
            priority: self.priority,
            func: self.func,
        }
    }

    /// Builds the task and lets `scheduler` run it.
    pub fn spawn(self, scheduler: &dyn Scheduler) -> Result<Arc<dyn TaskHandle>> {
        scheduler.spawn(self.build())
    }
}
