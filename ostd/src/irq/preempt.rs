// SPDX-License-Identifier: MPL-2.0

//! The per-CPU preemption counter.
//!
//! The counter packs three nesting depths into one word:
//!
//! ```text
//!  bits 0..8    preemption-disable depth
//!  bits 8..16   softirq depth; bit 8 is set while softirqs are served,
//!               bits 9.. count `local_bh_disable` nesting
//!  bits 16..26  hard interrupt depth
//! ```
//!
//! A CPU is in interrupt context if either the softirq or the hardirq field
//! is non-zero.

use core::sync::atomic::{AtomicU32, Ordering};

/// The unit of preemption-disable nesting.
pub const PREEMPT_OFFSET: u32 = 1;
/// The unit of softirq nesting; set while softirqs are being served.
pub const SOFTIRQ_OFFSET: u32 = 1 << 8;
/// The unit of `local_bh_disable` nesting.
pub const SOFTIRQ_DISABLE_OFFSET: u32 = 2 * SOFTIRQ_OFFSET;
/// The unit of hard interrupt nesting.
pub const HARDIRQ_OFFSET: u32 = 1 << 16;

/// The bits of the preemption-disable depth.
pub const PREEMPT_MASK: u32 = 0x0000_00ff;
/// The bits of the softirq depth.
pub const SOFTIRQ_MASK: u32 = 0x0000_ff00;
/// The bits of the hard interrupt depth.
pub const HARDIRQ_MASK: u32 = 0x03ff_0000;

/// The preemption counter of one CPU.
#[derive(Debug, Default)]
pub struct PreemptCount(AtomicU32);

impl PreemptCount {
    /// Returns the raw counter value.
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn add(&self, val: u32) {
        self.0.fetch_add(val, Ordering::AcqRel);
    }

    pub(crate) fn sub(&self, val: u32) {
        let old = self.0.fetch_sub(val, Ordering::AcqRel);
        debug_assert!(old >= val, "preempt count underflow");
    }

    /// Sets the softirq-serving bit unless it is already set.
    pub(crate) fn try_enter_softirq(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count & SOFTIRQ_OFFSET == 0).then_some(count + SOFTIRQ_OFFSET)
            })
            .is_ok()
    }

    /// Returns true if a hard interrupt or softirq is being handled, or
    /// bottom halves are disabled.
    pub fn in_interrupt(&self) -> bool {
        self.get() & (SOFTIRQ_MASK | HARDIRQ_MASK) != 0
    }

    /// Returns true if a hard interrupt is being handled.
    pub fn in_irq(&self) -> bool {
        self.get() & HARDIRQ_MASK != 0
    }

    /// Returns true if softirqs are being served.
    pub fn in_serving_softirq(&self) -> bool {
        self.get() & SOFTIRQ_OFFSET != 0
    }
}
