// SPDX-License-Identifier: MPL-2.0

//! This module contains the implementation of the CPU set and atomic CPU set.

use core::sync::atomic::{AtomicU64, Ordering};

use super::{CpuId, NR_CPUS};

/// A subset of all CPUs in the system.
///
/// The set is a fixed-size bitmap covering [`NR_CPUS`] CPUs, so it can be
/// copied around freely and built on the stack of an interrupt handler.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuSet {
    // A bitset representing the CPUs in the system.
    bits: [InnerPart; NR_PARTS],
}

type InnerPart = u64;

const BITS_PER_PART: usize = InnerPart::BITS as usize;
const NR_PARTS: usize = NR_CPUS.div_ceil(BITS_PER_PART);

const fn part_idx(cpu_id: CpuId) -> usize {
    cpu_id.as_usize() / BITS_PER_PART
}

const fn bit_idx(cpu_id: CpuId) -> usize {
    cpu_id.as_usize() % BITS_PER_PART
}

impl CpuSet {
    /// Creates a new `CpuSet` with no CPUs in it.
    pub const fn new_empty() -> Self {
        Self {
            bits: [0; NR_PARTS],
        }
    }

    /// Creates a new `CpuSet` with the first `nr_cpus` CPUs in it.
    pub fn new_first(nr_cpus: usize) -> Self {
        let nr_cpus = nr_cpus.min(NR_CPUS);
        let mut bits = [0; NR_PARTS];
        for (idx, part) in bits.iter_mut().enumerate() {
            let start = idx * BITS_PER_PART;
            if nr_cpus >= start + BITS_PER_PART {
                *part = !0;
            } else if nr_cpus > start {
                *part = (1 << (nr_cpus - start)) - 1;
            }
        }
        Self { bits }
    }

    /// Adds a CPU to the set.
    pub fn add(&mut self, cpu_id: CpuId) {
        self.bits[part_idx(cpu_id)] |= 1 << bit_idx(cpu_id);
    }

    /// Removes a CPU from the set.
    pub fn remove(&mut self, cpu_id: CpuId) {
        self.bits[part_idx(cpu_id)] &= !(1 << bit_idx(cpu_id));
    }

    /// Returns true if the set contains the specified CPU.
    pub fn contains(&self, cpu_id: CpuId) -> bool {
        (self.bits[part_idx(cpu_id)] & (1 << bit_idx(cpu_id))) != 0
    }

    /// Returns the number of CPUs in the set.
    pub fn count(&self) -> usize {
        self.bits
            .iter()
            .map(|part| part.count_ones() as usize)
            .sum()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|part| *part == 0)
    }

    /// Removes all CPUs from the set.
    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    /// Returns the intersection of two sets.
    pub fn and(&self, other: &CpuSet) -> CpuSet {
        self.zip_with(other, |a, b| a & b)
    }

    /// Returns the union of two sets.
    pub fn or(&self, other: &CpuSet) -> CpuSet {
        self.zip_with(other, |a, b| a | b)
    }

    /// Returns the CPUs of `self` that are not in `other`.
    pub fn andnot(&self, other: &CpuSet) -> CpuSet {
        self.zip_with(other, |a, b| a & !b)
    }

    /// Returns the set of all `NR_CPUS` CPUs that are not in `self`.
    pub fn complement(&self) -> CpuSet {
        let mut bits = self.bits;
        for part in bits.iter_mut() {
            *part = !*part;
        }
        Self { bits }
    }

    /// Returns true if every CPU of `self` is also in `other`.
    pub fn is_subset(&self, other: &CpuSet) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .all(|(a, b)| a & !b == 0)
    }

    /// Returns true if `self` and `other` share at least one CPU.
    pub fn intersects(&self, other: &CpuSet) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// Returns the lowest CPU in the set.
    pub fn first(&self) -> Option<CpuId> {
        self.iter().next()
    }

    /// Returns the lowest CPU in the set other than `cpu_id`.
    pub fn any_but(&self, cpu_id: CpuId) -> Option<CpuId> {
        self.iter().find(|cpu| *cpu != cpu_id)
    }

    /// Iterates over the CPUs in the set.
    ///
    /// The order of the iteration is guaranteed to be in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.bits.iter().enumerate().flat_map(|(part_idx, &part)| {
            (0..BITS_PER_PART).filter_map(move |bit_idx| {
                if (part & (1 << bit_idx)) != 0 {
                    let cpu_id = {
                        let raw_id = part_idx * BITS_PER_PART + bit_idx;
                        // SAFETY: the bitmap only has room for `NR_CPUS` CPUs.
                        unsafe { CpuId::new_unchecked(raw_id as u32) }
                    };
                    Some(cpu_id)
                } else {
                    None
                }
            })
        })
    }

    fn zip_with(&self, other: &CpuSet, op: impl Fn(InnerPart, InnerPart) -> InnerPart) -> CpuSet {
        let mut bits = [0; NR_PARTS];
        for (idx, part) in bits.iter_mut().enumerate() {
            *part = op(self.bits[idx], other.bits[idx]);
        }
        Self { bits }
    }
}

impl From<CpuId> for CpuSet {
    fn from(cpu_id: CpuId) -> Self {
        let mut set = Self::new_empty();
        set.add(cpu_id);
        set
    }
}

impl FromIterator<CpuId> for CpuSet {
    fn from_iter<I: IntoIterator<Item = CpuId>>(iter: I) -> Self {
        let mut set = Self::new_empty();
        for cpu_id in iter {
            set.add(cpu_id);
        }
        set
    }
}

impl core::fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.iter().map(CpuId::as_u32)).finish()
    }
}

/// A subset of all CPUs in the system with atomic operations.
///
/// It provides atomic operations for each CPU in the system. When the
/// operation contains multiple CPUs, the ordering is not guaranteed.
#[derive(Debug)]
pub struct AtomicCpuSet {
    bits: [AtomicU64; NR_PARTS],
}

impl AtomicCpuSet {
    /// Creates a new `AtomicCpuSet` with an initial value.
    pub fn new(value: CpuSet) -> Self {
        Self {
            bits: value.bits.map(AtomicU64::new),
        }
    }

    /// Loads the value of the set with the given ordering.
    ///
    /// This operation can only be done in the [`Ordering::Relaxed`],
    /// [`Ordering::Acquire`] and [`Ordering::SeqCst`] orderings.
    pub fn load(&self, ordering: Ordering) -> CpuSet {
        let mut bits = [0; NR_PARTS];
        for (idx, part) in bits.iter_mut().enumerate() {
            *part = self.bits[idx].load(ordering);
        }
        CpuSet { bits }
    }

    /// Stores a new value to the set with the given ordering.
    ///
    /// This operation can only be done in the [`Ordering::Relaxed`],
    /// [`Ordering::Release`] and [`Ordering::SeqCst`] orderings.
    pub fn store(&self, value: &CpuSet, ordering: Ordering) {
        for (part, new_part) in self.bits.iter().zip(value.bits.iter()) {
            part.store(*new_part, ordering);
        }
    }

    /// Atomically adds a CPU with the given ordering.
    pub fn add(&self, cpu_id: CpuId, ordering: Ordering) {
        self.bits[part_idx(cpu_id)].fetch_or(1 << bit_idx(cpu_id), ordering);
    }

    /// Atomically removes a CPU with the given ordering.
    pub fn remove(&self, cpu_id: CpuId, ordering: Ordering) {
        self.bits[part_idx(cpu_id)].fetch_and(!(1 << bit_idx(cpu_id)), ordering);
    }

    /// Atomically removes a CPU and returns whether it was in the set.
    pub fn test_and_remove(&self, cpu_id: CpuId, ordering: Ordering) -> bool {
        let mask = 1 << bit_idx(cpu_id);
        self.bits[part_idx(cpu_id)].fetch_and(!mask, ordering) & mask != 0
    }

    /// Atomically checks if the set contains the specified CPU.
    pub fn contains(&self, cpu_id: CpuId, ordering: Ordering) -> bool {
        self.bits[part_idx(cpu_id)].load(ordering) & (1 << bit_idx(cpu_id)) != 0
    }

    /// Returns the number of CPUs in the set.
    pub fn count(&self, ordering: Ordering) -> usize {
        self.bits
            .iter()
            .map(|part| part.load(ordering).count_ones() as usize)
            .sum()
    }
}

impl Default for AtomicCpuSet {
    fn default() -> Self {
        Self::new(CpuSet::new_empty())
    }
}
