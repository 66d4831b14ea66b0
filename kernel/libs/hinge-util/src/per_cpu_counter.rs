// SPDX-License-Identifier: MPL-2.0

//! A fast and scalable per-CPU counter.

use core::sync::atomic::{AtomicIsize, Ordering};

use hinge_frame::cpu::{CpuId, PerCpu};

/// A fast, SMP-friendly, per-CPU counter.
///
/// Updating it is fast and scalable, but reading is slow and inaccurate.
pub struct PerCpuCounter {
    per_cpu_counter: PerCpu<AtomicIsize>,
}

impl PerCpuCounter {
    /// Creates a new, zero-valued per-CPU counter.
    pub fn new() -> Self {
        Self {
            per_cpu_counter: PerCpu::new(|_| AtomicIsize::new(0)),
        }
    }

    /// Adds `increment` to the counter on the given CPU.
    pub fn add_on_cpu(&self, on_cpu: CpuId, increment: isize) {
        self.per_cpu_counter
            .get_on_cpu(on_cpu)
            .fetch_add(increment, Ordering::Relaxed);
    }

    /// Gets the total counter value.
    ///
    /// This function may be inaccurate since other CPUs may be
    /// updating the counter.
    pub fn sum_all_cpus(&self) -> usize {
        let mut total: isize = 0;
        for (_, counter) in self.per_cpu_counter.iter() {
            total = total.wrapping_add(counter.load(Ordering::Relaxed));
        }
        if total < 0 {
            // The counter is unsigned. But an observer may see a negative
            // value due to race conditions. We return zero if it happens.
            0
        } else {
            total as usize
        }
    }

    /// Gets the counter value on a specific CPU.
    pub fn get_on_cpu(&self, cpu: CpuId) -> usize {
        let val = self.per_cpu_counter.get_on_cpu(cpu).load(Ordering::Relaxed);
        if val < 0 {
            // See explanation in `sum_all_cpus`.
            0
        } else {
            val as usize
        }
    }
}

impl Default for PerCpuCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for PerCpuCounter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PerCpuCounter")
            .field("sum", &self.sum_all_cpus())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cpu(raw: u32) -> CpuId {
        CpuId::new(raw).unwrap()
    }

    #[test]
    fn counts_per_cpu_and_in_total() {
        let counter = PerCpuCounter::new();
        counter.add_on_cpu(cpu(0), 2);
        counter.add_on_cpu(cpu(3), 5);
        counter.add_on_cpu(cpu(3), -1);

        assert_eq!(counter.get_on_cpu(cpu(0)), 2);
        assert_eq!(counter.get_on_cpu(cpu(3)), 4);
        assert_eq!(counter.get_on_cpu(cpu(1)), 0);
        assert_eq!(counter.sum_all_cpus(), 6);
    }

    #[test]
    fn negative_values_read_as_zero() {
        let counter = PerCpuCounter::new();
        counter.add_on_cpu(cpu(1), -3);
        assert_eq!(counter.get_on_cpu(cpu(1)), 0);
        assert_eq!(counter.sum_all_cpus(), 0);
    }
}
