// SPDX-License-Identifier: MPL-2.0

//! Maintenance of the active CPU mask.
//!
//! A CPU is active if the scheduler may move tasks to it. It becomes active
//! before any other notifier learns that it is online, and inactive only
//! after every other notifier has agreed to take it down.

use hinge_frame::{
    cpu::CpuNotifierBlock,
    notifier::{NotifierBlock, NotifyResult},
};

use crate::prelude::*;

/// Marks CPUs active. Runs first on the way up.
pub const SCHED_ACTIVE_PRIORITY: i32 = i32::MAX;
/// Marks CPUs inactive. Runs last on the way down.
pub const SCHED_INACTIVE_PRIORITY: i32 = i32::MIN;

/// Returns the notifiers that keep the active mask in sync with hotplug.
pub fn active_mask_notifiers(machine: &Arc<Machine>) -> [Arc<CpuNotifierBlock>; 2] {
    let machine_cloned = machine.clone();
    let active = NotifierBlock::new(
        "sched_active",
        SCHED_ACTIVE_PRIORITY,
        move |event: CpuEvent, cpu| match event.action {
            CpuAction::Online | CpuAction::DownFailed => {
                machine_cloned.topology().set_active(cpu, true).into()
            }
            _ => NotifyResult::Done,
        },
    );

    let machine_cloned = machine.clone();
    let inactive = NotifierBlock::new(
        "sched_inactive",
        SCHED_INACTIVE_PRIORITY,
        move |event: CpuEvent, cpu| match event.action {
            CpuAction::DownPrepare => machine_cloned.topology().set_active(cpu, false).into(),
            _ => NotifyResult::Done,
        },
    );

    [active, inactive]
}

#[cfg(test)]
mod test {
    use hinge_frame::{
        cpu::CpuNotifierChain,
        host::{cpu, host_machine},
    };

    use super::*;

    #[test]
    fn active_follows_hotplug_events() {
        let machine = host_machine(2);
        let chain = CpuNotifierChain::new();
        for block in active_mask_notifiers(&machine) {
            chain.register(block);
        }

        chain
            .notify_with_rollback(
                CpuEvent::new(CpuAction::DownPrepare),
                CpuEvent::new(CpuAction::DownFailed),
                cpu(1),
            )
            .unwrap();
        assert!(!machine.topology().is_active(cpu(1)));
        assert!(machine.topology().is_online(cpu(1)));

        chain.notify_nofail(CpuEvent::new(CpuAction::DownFailed), cpu(1));
        assert!(machine.topology().is_active(cpu(1)));
    }
}
