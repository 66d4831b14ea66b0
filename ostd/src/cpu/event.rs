// SPDX-License-Identifier: MPL-2.0

//! Events of the CPU hotplug state machine.

use crate::notifier::{NotifierBlock, NotifierChain};

/// A step of bringing a CPU up or taking it down.
///
/// Every step that may be vetoed has a matching step that undoes it:
/// `UpPrepare` is undone by `UpCanceled` and `DownPrepare` by `DownFailed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CpuAction {
    /// The CPU is about to be booted. May be vetoed.
    UpPrepare,
    /// Booting the CPU failed after `UpPrepare`.
    UpCanceled,
    /// Runs on the new CPU itself, before it is marked online.
    Starting,
    /// The CPU is up.
    Online,
    /// The CPU is about to go down. May be vetoed.
    DownPrepare,
    /// Taking the CPU down failed after `DownPrepare`.
    DownFailed,
    /// Runs on the dying CPU itself, with the rest of the machine stopped.
    Dying,
    /// The CPU is dead.
    Dead,
    /// Runs after the hotplug lock is released, for the dead CPU.
    PostDead,
}

/// A hotplug event delivered to CPU notifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CpuEvent {
    /// The step.
    pub action: CpuAction,
    /// Set if user tasks are frozen, i.e., during suspend and resume.
    pub tasks_frozen: bool,
}

impl CpuEvent {
    /// Creates an event of the regular hotplug path.
    pub const fn new(action: CpuAction) -> Self {
        Self {
            action,
            tasks_frozen: false,
        }
    }

    /// Creates an event of the suspend or resume path.
    pub const fn frozen(action: CpuAction) -> Self {
        Self {
            action,
            tasks_frozen: true,
        }
    }

    /// Returns the event with the same frozen flag and another action.
    pub const fn with_action(self, action: CpuAction) -> Self {
        Self {
            action,
            tasks_frozen: self.tasks_frozen,
        }
    }
}

impl From<CpuAction> for CpuEvent {
    fn from(action: CpuAction) -> Self {
        Self::new(action)
    }
}

/// A chain of CPU notifiers.
pub type CpuNotifierChain = NotifierChain<CpuEvent>;

/// A CPU notifier.
pub type CpuNotifierBlock = NotifierBlock<CpuEvent>;
