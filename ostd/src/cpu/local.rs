// SPDX-License-Identifier: MPL-2.0

//! Per-CPU storage.
//!
//! A [`PerCpu<T>`] holds one `T` for every CPU ID below [`NR_CPUS`]. Unlike
//! a linker-section based CPU-local variable, it is an ordinary value owned
//! by whichever context object needs it, so several machines can coexist in
//! one address space.
//!
//! Accessing the value of another CPU is allowed; the element type decides
//! how concurrent accesses are synchronized (atomics or locks).

use core::ops::Index;

use super::{CpuId, NR_CPUS};
use crate::prelude::*;

/// One value of type `T` per CPU.
pub struct PerCpu<T> {
    values: Box<[T]>,
}

impl<T> PerCpu<T> {
    /// Creates the storage, initializing the value of each CPU with `init`.
    pub fn new(mut init: impl FnMut(CpuId) -> T) -> Self {
        let values = super::all_cpus(NR_CPUS).map(&mut init).collect::<Vec<_>>();
        Self {
            values: values.into_boxed_slice(),
        }
    }

    /// Gets the value of the given CPU.
    pub fn get_on_cpu(&self, cpu: CpuId) -> &T {
        &self.values[cpu.as_usize()]
    }

    /// Iterates over the values of all CPUs with their IDs.
    pub fn iter(&self) -> impl Iterator<Item = (CpuId, &T)> {
        super::all_cpus(NR_CPUS).zip(self.values.iter())
    }
}

impl<T: Default> Default for PerCpu<T> {
    fn default() -> Self {
        Self::new(|_| T::default())
    }
}

impl<T> Index<CpuId> for PerCpu<T> {
    type Output = T;

    fn index(&self, cpu: CpuId) -> &T {
        self.get_on_cpu(cpu)
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for PerCpu<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PerCpu").finish_non_exhaustive()
    }
}
