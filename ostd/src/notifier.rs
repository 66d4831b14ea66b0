// SPDX-License-Identifier: MPL-2.0

//! Priority-ordered notifier chains.
//!
//! A [`NotifierChain`] is a list of callbacks that subsystems register to
//! learn about events concerning a CPU. Callbacks run in descending
//! priority; callbacks of equal priority run in registration order.
//!
//! Walks run on a snapshot of the chain, so a callback may register or
//! unregister blocks without deadlocking. Callers that need registration to
//! be serialized with notification (the hotplug controller does) hold their
//! own lock around both.

use core::fmt::Debug;

use smallvec::SmallVec;

use crate::{cpu::CpuId, prelude::*, Error};

/// The answer of a notifier callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyResult {
    /// The callback is not interested in the event.
    Done,
    /// The callback handled the event.
    Ok,
    /// The callback handled the event and no further callback should run.
    Stop,
    /// The callback vetoes the event. The walk stops.
    Bad(Error),
}

impl NotifyResult {
    /// Returns true if the walk must not continue after this result.
    pub fn is_stop(&self) -> bool {
        matches!(self, NotifyResult::Stop | NotifyResult::Bad(_))
    }

    /// Converts the result into an error, if it is a veto.
    pub fn into_result(self) -> Result<()> {
        match self {
            NotifyResult::Bad(err) => Err(err),
            _ => Ok(()),
        }
    }
}

impl From<Result<()>> for NotifyResult {
    fn from(res: Result<()>) -> Self {
        match res {
            Ok(()) => NotifyResult::Ok,
            Err(err) => NotifyResult::Bad(err),
        }
    }
}

type NotifierFn<E> = dyn Fn(E, CpuId) -> NotifyResult + Send + Sync;

/// A registered callback.
pub struct NotifierBlock<E> {
    name: &'static str,
    priority: i32,
    callback: Box<NotifierFn<E>>,
}

impl<E> NotifierBlock<E> {
    /// Creates a notifier block.
    ///
    /// The name is only used for diagnostics.
    pub fn new<F>(name: &'static str, priority: i32, callback: F) -> Arc<Self>
    where
        F: Fn(E, CpuId) -> NotifyResult + Send + Sync + 'static,
    {
        Arc::new(Self {
            name,
            priority,
            callback: Box::new(callback),
        })
    }

    /// Returns the name of the block.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the priority of the block.
    pub fn priority(&self) -> i32 {
        self.priority
    }
}

impl<E> Debug for NotifierBlock<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NotifierBlock")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

type Snapshot<E> = SmallVec<[Arc<NotifierBlock<E>>; 8]>;

/// A chain of [`NotifierBlock`]s.
pub struct NotifierChain<E> {
    blocks: spin::RwLock<Vec<Arc<NotifierBlock<E>>>>,
}

impl<E: Copy + Debug> NotifierChain<E> {
    /// Creates an empty chain.
    pub const fn new() -> Self {
        Self {
            blocks: spin::RwLock::new(Vec::new()),
        }
    }

    /// Inserts a block after every block of greater or equal priority.
    pub fn register(&self, block: Arc<NotifierBlock<E>>) {
        let mut blocks = self.blocks.write();
        let pos = blocks
            .iter()
            .position(|b| b.priority < block.priority)
            .unwrap_or(blocks.len());
        blocks.insert(pos, block);
    }

    /// Removes a previously registered block.
    pub fn unregister(&self, block: &Arc<NotifierBlock<E>>) -> Result<()> {
        let mut blocks = self.blocks.write();
        let pos = blocks
            .iter()
            .position(|b| Arc::ptr_eq(b, block))
            .ok_or(Error::InvalidArgs)?;
        blocks.remove(pos);
        Ok(())
    }

    /// Returns the number of registered blocks.
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    /// Returns true if no block is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls the blocks in order until one of them stops the walk.
    ///
    /// At most `nr_to_call` blocks are called if it is given. Returns the
    /// result of the last called block (`Done` if none was called) and the
    /// number of blocks called.
    pub fn notify(&self, event: E, cpu: CpuId, nr_to_call: Option<usize>) -> (NotifyResult, usize) {
        let snapshot = self.snapshot();
        let limit = nr_to_call.unwrap_or(usize::MAX);

        let mut last = NotifyResult::Done;
        let mut nr_calls = 0;
        for block in snapshot.iter().take(limit) {
            last = (block.callback)(event, cpu);
            nr_calls += 1;
            if last.is_stop() {
                if let NotifyResult::Bad(err) = last {
                    log::debug!(
                        "notifier {} vetoed {:?} for CPU{}: {}",
                        block.name,
                        event,
                        cpu,
                        err
                    );
                }
                break;
            }
        }
        (last, nr_calls)
    }

    /// Calls the blocks with `event`; if one vetoes, calls `cancel` on
    /// every block that accepted `event`, in reverse order.
    ///
    /// The vetoing block does not receive `cancel`. Returns the veto error.
    pub fn notify_with_rollback(&self, event: E, cancel: E, cpu: CpuId) -> Result<()> {
        let snapshot = self.snapshot();

        for (idx, block) in snapshot.iter().enumerate() {
            let res = (block.callback)(event, cpu);
            match res {
                NotifyResult::Bad(err) => {
                    log::warn!(
                        "notifier {} vetoed {:?} for CPU{}: {}, rolling back {} callbacks",
                        block.name,
                        event,
                        cpu,
                        err,
                        idx
                    );
                    for accepted in snapshot[..idx].iter().rev() {
                        let cancel_res = (accepted.callback)(cancel, cpu);
                        if let NotifyResult::Bad(cancel_err) = cancel_res {
                            log::error!(
                                "notifier {} failed {:?} for CPU{}: {}",
                                accepted.name,
                                cancel,
                                cpu,
                                cancel_err
                            );
                        }
                    }
                    return Err(err);
                }
                NotifyResult::Stop => break,
                NotifyResult::Done | NotifyResult::Ok => {}
            }
        }
        Ok(())
    }

    /// Calls every block with an event that must not fail.
    ///
    /// A veto is logged and the walk continues with the next block.
    pub fn notify_nofail(&self, event: E, cpu: CpuId) {
        for block in self.snapshot().iter() {
            match (block.callback)(event, cpu) {
                NotifyResult::Bad(err) => {
                    log::error!(
                        "notifier {} failed {:?} for CPU{}: {}",
                        block.name,
                        event,
                        cpu,
                        err
                    );
                }
                NotifyResult::Stop => break,
                NotifyResult::Done | NotifyResult::Ok => {}
            }
        }
    }

    /// Calls every block with an undo event, in reverse order.
    ///
    /// Used when an operation fails after all blocks accepted its prepare
    /// event. A failure is logged and the walk continues.
    pub fn notify_reverse_nofail(&self, event: E, cpu: CpuId) {
        for block in self.snapshot().iter().rev() {
            if let NotifyResult::Bad(err) = (block.callback)(event, cpu) {
                log::error!(
                    "notifier {} failed {:?} for CPU{}: {}",
                    block.name,
                    event,
                    cpu,
                    err
                );
            }
        }
    }

    fn snapshot(&self) -> Snapshot<E> {
        self.blocks.read().iter().cloned().collect()
    }
}

impl<E: Copy + Debug> Default for NotifierChain<E> {
    fn default() -> Self {
        Self::new()
    }
}
