// SPDX-License-Identifier: MPL-2.0

//! The util of the hinge kernel.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

pub mod per_cpu_counter;
