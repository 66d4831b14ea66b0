// SPDX-License-Identifier: MPL-2.0

use alloc::fmt::Write;

use hinge_frame::arch::{IpiKind, NR_IPI};
use hinge_util::per_cpu_counter::PerCpuCounter;

use crate::prelude::*;

/// Per-CPU counters of the IPIs received.
#[derive(Debug, Default)]
pub(crate) struct IpiStats {
    counters: [PerCpuCounter; NR_IPI],
}

impl IpiStats {
    pub(crate) fn count(&self, cpu: CpuId, kind: IpiKind) {
        self.counters[kind.as_index()].add_on_cpu(cpu, 1);
    }

    pub(crate) fn get(&self, cpu: CpuId, kind: IpiKind) -> usize {
        self.counters[kind.as_index()].get_on_cpu(cpu)
    }

    /// Formats the counters of `cpus`, one IPI kind per row.
    pub(crate) fn show(&self, cpus: &CpuSet) -> String {
        let mut list = String::new();
        for kind in IpiKind::ALL {
            let _ = write!(list, "IPI{}: ", kind.as_index());
            for cpu in cpus.iter() {
                let _ = write!(list, "{:>10} ", self.get(cpu, kind));
            }
            let _ = writeln!(list, " {}", kind.description());
        }
        list
    }
}

#[cfg(test)]
mod test {
    use hinge_frame::host::cpu;

    use super::*;

    #[test]
    fn ipi_list_has_a_row_per_kind() {
        let stats = IpiStats::default();
        stats.count(cpu(1), IpiKind::Reschedule);
        stats.count(cpu(1), IpiKind::Reschedule);

        let list = stats.show(&CpuSet::new_first(2));
        let rows: Vec<&str> = list.lines().collect();
        assert_eq!(rows.len(), NR_IPI);
        assert_eq!(
            rows[1],
            "IPI1:          0          2  Rescheduling interrupts"
        );
    }
}
