// SPDX-License-Identifier: MPL-2.0

use alloc::{fmt::Write, string::String};

use hinge_frame::cpu::{CpuId, CpuSet};
use hinge_util::per_cpu_counter::PerCpuCounter;

use super::{SoftIrq, SoftIrqId, NR_SOFTIRQS};

/// Execution counters of the softirq kinds.
#[derive(Debug, Default)]
pub(super) struct SoftIrqStats {
    counters: [PerCpuCounter; NR_SOFTIRQS],
}

impl SoftIrqStats {
    pub(super) fn count(&self, cpu: CpuId, id: SoftIrqId) {
        self.counters[id.as_index()].add_on_cpu(cpu, 1);
    }
}

impl SoftIrq {
    /// Iterates all softirq kinds for the number of executions across all CPUs.
    pub fn iter_softirq_counts_across_all_cpus(&self) -> impl Iterator<Item = usize> + '_ {
        self.stats
            .counters
            .iter()
            .map(|counter| counter.sum_all_cpus())
    }

    /// Iterates the softirq counters for a specific CPU.
    pub fn iter_softirq_counts_on_cpu(&self, cpu: CpuId) -> impl Iterator<Item = usize> + '_ {
        self.stats
            .counters
            .iter()
            .map(move |counter| counter.get_on_cpu(cpu))
    }

    /// Formats the per-CPU execution counters as a table, one kind per row.
    pub fn show_softirqs(&self, cpus: &CpuSet) -> String {
        let mut table = String::new();
        let _ = write!(table, "{:>13}", "");
        for cpu in cpus.iter() {
            let _ = write!(table, "{:>11}", alloc::format!("CPU{}", cpu));
        }
        table.push('\n');
        for id in SoftIrqId::ALL {
            let _ = write!(table, "{:>12}:", id.name());
            for cpu in cpus.iter() {
                let _ = write!(
                    table,
                    "{:>11}",
                    self.stats.counters[id.as_index()].get_on_cpu(cpu)
                );
            }
            table.push('\n');
        }
        table
    }
}
