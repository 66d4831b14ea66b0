// SPDX-License-Identifier: MPL-2.0

//! The softirq kinds.
//!
//! A smaller ID means a higher execution priority: pending softirqs are
//! dispatched in ascending ID order.

/// The number of softirq kinds.
pub const NR_SOFTIRQS: usize = 10;

/// The kind of a softirq.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SoftIrqId {
    /// High-priority tasklets.
    Hi = 0,
    /// Timer expiry.
    Timer = 1,
    /// Network transmission.
    NetTx = 2,
    /// Network reception.
    NetRx = 3,
    /// Block request completion.
    Block = 4,
    /// Block I/O polling.
    BlockIoPoll = 5,
    /// Normal tasklets.
    Tasklet = 6,
    /// Scheduler load balancing.
    Sched = 7,
    /// High-resolution timers.
    HrTimer = 8,
    /// RCU callbacks.
    Rcu = 9,
}

impl SoftIrqId {
    /// All softirq kinds, in dispatch order.
    pub const ALL: [SoftIrqId; NR_SOFTIRQS] = [
        SoftIrqId::Hi,
        SoftIrqId::Timer,
        SoftIrqId::NetTx,
        SoftIrqId::NetRx,
        SoftIrqId::Block,
        SoftIrqId::BlockIoPoll,
        SoftIrqId::Tasklet,
        SoftIrqId::Sched,
        SoftIrqId::HrTimer,
        SoftIrqId::Rcu,
    ];

    /// Returns the index of this kind.
    pub const fn as_index(self) -> usize {
        self as usize
    }

    /// Returns the bit of this kind in a pending mask.
    pub const fn mask(self) -> u32 {
        1 << self as u32
    }

    /// Returns the kind with the given index.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Returns the name of this kind.
    pub const fn name(self) -> &'static str {
        match self {
            SoftIrqId::Hi => "HI",
            SoftIrqId::Timer => "TIMER",
            SoftIrqId::NetTx => "NET_TX",
            SoftIrqId::NetRx => "NET_RX",
            SoftIrqId::Block => "BLOCK",
            SoftIrqId::BlockIoPoll => "BLOCK_IOPOLL",
            SoftIrqId::Tasklet => "TASKLET",
            SoftIrqId::Sched => "SCHED",
            SoftIrqId::HrTimer => "HRTIMER",
            SoftIrqId::Rcu => "RCU",
        }
    }
}

impl core::fmt::Display for SoftIrqId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}
