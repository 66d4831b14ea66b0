// SPDX-License-Identifier: MPL-2.0

//! CPU-related definitions.

mod event;
pub mod local;
pub mod set;
pub mod topology;

pub use event::{CpuAction, CpuEvent, CpuNotifierBlock, CpuNotifierChain};
pub use local::PerCpu;
pub use set::{AtomicCpuSet, CpuSet};
pub use topology::CpuTopology;

use crate::{Error, Result};

/// The compile-time maximum number of CPUs.
///
/// The number of CPUs that actually exist on a machine, `nr_cpu_ids`, is
/// discovered at boot and never exceeds this value.
pub const NR_CPUS: usize = 128;

/// The ID of a CPU in the system.
///
/// A `CpuId` is always less than [`NR_CPUS`]. Whether the CPU exists on the
/// running machine is a question for the [`CpuTopology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(u32);

impl CpuId {
    /// Returns the CPU ID of the boot processor.
    pub const fn bsp() -> Self {
        CpuId(0)
    }

    /// Creates a CPU ID, failing if `raw` is not below [`NR_CPUS`].
    pub const fn new(raw: u32) -> Result<Self> {
        if (raw as usize) < NR_CPUS {
            Ok(CpuId(raw))
        } else {
            Err(Error::OutOfRange)
        }
    }

    /// Creates a CPU ID without checking the range.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `raw` is less than [`NR_CPUS`].
    pub(crate) const unsafe fn new_unchecked(raw: u32) -> Self {
        CpuId(raw)
    }

    /// Converts the CPU ID to an `usize`.
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Converts the CPU ID to an `u32`.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl TryFrom<usize> for CpuId {
    type Error = Error;

    fn try_from(value: usize) -> Result<Self> {
        if value < NR_CPUS {
            Ok(CpuId(value as u32))
        } else {
            Err(Error::OutOfRange)
        }
    }
}

impl From<CpuId> for u32 {
    fn from(cpu_id: CpuId) -> Self {
        cpu_id.0
    }
}

impl core::fmt::Display for CpuId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns an iterator over all CPU IDs below `nr_cpu_ids`.
pub fn all_cpus(nr_cpu_ids: usize) -> impl Iterator<Item = CpuId> {
    // SAFETY: `nr_cpu_ids` is clamped to `NR_CPUS`.
    (0..nr_cpu_ids.min(NR_CPUS)).map(|raw| unsafe { CpuId::new_unchecked(raw as u32) })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cpu_id_range() {
        assert_eq!(CpuId::new(3).map(CpuId::as_usize), Ok(3));
        assert_eq!(CpuId::new(NR_CPUS as u32), Err(Error::OutOfRange));
        assert_eq!(CpuId::try_from(NR_CPUS - 1).map(u32::from), Ok(127));
        assert!(CpuId::try_from(usize::MAX).is_err());
    }

    #[test]
    fn all_cpus_is_clamped() {
        assert_eq!(all_cpus(4).count(), 4);
        assert_eq!(all_cpus(NR_CPUS + 10).count(), NR_CPUS);
        assert_eq!(all_cpus(0).count(), 0);
    }
}
