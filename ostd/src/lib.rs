// SPDX-License-Identifier: MPL-2.0

//! The framework of the hinge SMP kernel core.
//!
//! This crate contains everything that the CPU hotplug, cross-call,
//! softirq and stop-machine machinery is built upon: CPU identifiers and
//! masks, the CPU topology, per-CPU storage, interrupt and preemption
//! bookkeeping, sleeping synchronization primitives, kernel threads and
//! notifier chains.
//!
//! Nothing in this crate keeps global CPU state. The hardware and the
//! scheduler are injected through the [`arch::Platform`] and
//! [`task::Scheduler`] traits and held by a [`Machine`], which every
//! component receives explicitly.
#![cfg_attr(not(any(test, feature = "host")), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod arch;
pub mod boot;
pub mod cpu;
mod error;
#[cfg(any(test, feature = "host"))]
pub mod host;
pub mod irq;
pub mod logger;
mod machine;
pub mod notifier;
pub mod prelude;
pub mod smp;
pub mod sync;
pub mod task;

pub use self::{error::Error, machine::Machine, prelude::Result};
