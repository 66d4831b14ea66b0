// SPDX-License-Identifier: MPL-2.0

//! The four CPU masks that describe which CPUs exist and which are usable.
//!
//! The masks always satisfy `active ⊆ online ⊆ present ⊆ possible`. The
//! setters refuse any update that would break the chain, so callers do not
//! have to order their updates carefully.
//!
//! All updates are serialized by the owners of the topology (the boot code
//! and the hotplug controller). Readers may observe the masks at any time;
//! updates are published with release ordering.

use core::sync::atomic::{AtomicUsize, Ordering};

use super::{AtomicCpuSet, CpuId, CpuSet, NR_CPUS};
use crate::{Error, Result};

/// The possible, present, online and active CPU masks of a machine.
#[derive(Debug)]
pub struct CpuTopology {
    nr_cpu_ids: AtomicUsize,
    possible: AtomicCpuSet,
    present: AtomicCpuSet,
    online: AtomicCpuSet,
    active: AtomicCpuSet,
}

impl CpuTopology {
    /// Creates a topology in which no CPU exists.
    pub fn new() -> Self {
        Self {
            nr_cpu_ids: AtomicUsize::new(0),
            possible: AtomicCpuSet::default(),
            present: AtomicCpuSet::default(),
            online: AtomicCpuSet::default(),
            active: AtomicCpuSet::default(),
        }
    }

    /// Declares the first `nr_cpu_ids` CPUs possible.
    ///
    /// This is done once at boot, before any CPU is marked present.
    pub fn init_possible(&self, nr_cpu_ids: usize) -> Result<()> {
        if nr_cpu_ids == 0 || nr_cpu_ids > NR_CPUS {
            return Err(Error::OutOfRange);
        }
        if !self.present.load(Ordering::Acquire).is_empty() {
            return Err(Error::Busy);
        }
        self.possible
            .store(&CpuSet::new_first(nr_cpu_ids), Ordering::Release);
        self.nr_cpu_ids.store(nr_cpu_ids, Ordering::Release);
        Ok(())
    }

    /// Returns one plus the highest possible CPU ID.
    pub fn nr_cpu_ids(&self) -> usize {
        self.nr_cpu_ids.load(Ordering::Acquire)
    }

    /// Returns a snapshot of the possible mask.
    pub fn possible(&self) -> CpuSet {
        self.possible.load(Ordering::Acquire)
    }

    /// Returns a snapshot of the present mask.
    pub fn present(&self) -> CpuSet {
        self.present.load(Ordering::Acquire)
    }

    /// Returns a snapshot of the online mask.
    pub fn online(&self) -> CpuSet {
        self.online.load(Ordering::Acquire)
    }

    /// Returns a snapshot of the active mask.
    pub fn active(&self) -> CpuSet {
        self.active.load(Ordering::Acquire)
    }

    /// Returns whether the CPU may ever be brought up.
    pub fn is_possible(&self, cpu: CpuId) -> bool {
        self.possible.contains(cpu, Ordering::Acquire)
    }

    /// Returns whether the CPU is physically present.
    pub fn is_present(&self, cpu: CpuId) -> bool {
        self.present.contains(cpu, Ordering::Acquire)
    }

    /// Returns whether the CPU is online.
    pub fn is_online(&self, cpu: CpuId) -> bool {
        self.online.contains(cpu, Ordering::Acquire)
    }

    /// Returns whether the scheduler may place tasks on the CPU.
    pub fn is_active(&self, cpu: CpuId) -> bool {
        self.active.contains(cpu, Ordering::Acquire)
    }

    /// Returns the number of online CPUs.
    pub fn num_online(&self) -> usize {
        self.online.count(Ordering::Acquire)
    }

    /// Marks a CPU present or absent.
    ///
    /// Only possible CPUs can become present, and an online CPU cannot
    /// disappear.
    pub fn set_present(&self, cpu: CpuId, present: bool) -> Result<()> {
        if present {
            if !self.is_possible(cpu) {
                return Err(Error::InvalidArgs);
            }
            self.present.add(cpu, Ordering::Release);
        } else {
            if self.is_online(cpu) {
                return Err(Error::Busy);
            }
            self.present.remove(cpu, Ordering::Release);
        }
        Ok(())
    }

    /// Marks a CPU online or offline.
    ///
    /// Taking a CPU offline also takes it out of the active mask.
    pub fn set_online(&self, cpu: CpuId, online: bool) -> Result<()> {
        if online {
            if !self.is_present(cpu) {
                return Err(Error::InvalidArgs);
            }
            self.online.add(cpu, Ordering::Release);
        } else {
            self.active.remove(cpu, Ordering::Release);
            self.online.remove(cpu, Ordering::Release);
        }
        Ok(())
    }

    /// Marks a CPU active or inactive. Only online CPUs can be active.
    pub fn set_active(&self, cpu: CpuId, active: bool) -> Result<()> {
        if active {
            if !self.is_online(cpu) {
                return Err(Error::InvalidArgs);
            }
            self.active.add(cpu, Ordering::Release);
        } else {
            self.active.remove(cpu, Ordering::Release);
        }
        Ok(())
    }
}

impl Default for CpuTopology {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cpu(raw: u32) -> CpuId {
        CpuId::new(raw).unwrap()
    }

    fn assert_chain(topology: &CpuTopology) {
        assert!(topology.active().is_subset(&topology.online()));
        assert!(topology.online().is_subset(&topology.present()));
        assert!(topology.present().is_subset(&topology.possible()));
    }

    #[test]
    fn masks_stay_nested() {
        let topology = CpuTopology::new();
        topology.init_possible(4).unwrap();
        assert_eq!(topology.nr_cpu_ids(), 4);

        assert_eq!(topology.set_present(cpu(4), true), Err(Error::InvalidArgs));
        assert_eq!(topology.set_online(cpu(1), true), Err(Error::InvalidArgs));
        topology.set_present(cpu(0), true).unwrap();
        topology.set_present(cpu(1), true).unwrap();
        assert_eq!(topology.set_active(cpu(0), true), Err(Error::InvalidArgs));
        topology.set_online(cpu(0), true).unwrap();
        topology.set_active(cpu(0), true).unwrap();
        topology.set_online(cpu(1), true).unwrap();
        assert_chain(&topology);

        assert_eq!(topology.set_present(cpu(1), false), Err(Error::Busy));
        topology.set_online(cpu(0), false).unwrap();
        assert!(!topology.is_active(cpu(0)));
        assert_eq!(topology.num_online(), 1);
        assert_chain(&topology);

        assert_eq!(topology.init_possible(8), Err(Error::Busy));
    }

    #[test]
    fn init_possible_bounds() {
        let topology = CpuTopology::new();
        assert_eq!(topology.init_possible(0), Err(Error::OutOfRange));
        assert_eq!(topology.init_possible(NR_CPUS + 1), Err(Error::OutOfRange));
        topology.init_possible(NR_CPUS).unwrap();
        assert_eq!(topology.possible().count(), NR_CPUS);
    }
}
