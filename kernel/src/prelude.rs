// SPDX-License-Identifier: MPL-2.0

pub(crate) use alloc::{
    boxed::Box,
    collections::VecDeque,
    format,
    string::String,
    sync::Arc,
};
pub(crate) use core::{
    sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    time::Duration,
};

pub(crate) use hinge_frame::{
    cpu::{CpuAction, CpuEvent, CpuId, CpuSet},
    sync::{Completion, Mutex, MutexGuard, WaitQueue},
    Machine,
};
pub(crate) use log::{debug, error, info, trace, warn};

pub(crate) use crate::error::{Errno, Error};
pub(crate) type Result<T> = core::result::Result<T, Error>;
pub(crate) use crate::return_errno_with_message;
