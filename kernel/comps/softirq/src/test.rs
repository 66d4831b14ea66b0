// SPDX-License-Identifier: MPL-2.0

use alloc::vec::Vec;
use core::{sync::atomic::AtomicUsize, time::Duration};
use std::{sync::Mutex, time::Instant};

use hinge_frame::{
    cpu::{CpuAction, CpuEvent, CpuNotifierChain},
    host::{cpu, host_machine},
};

use super::*;

fn counting_action(softirq: &SoftIrq, id: SoftIrqId) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let count_cloned = count.clone();
    softirq
        .open(id, move |_| {
            count_cloned.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    count
}

fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn raise_is_idempotent() {
    let machine = host_machine(2);
    let softirq = SoftIrq::new(machine.clone());
    let count = counting_action(&softirq, SoftIrqId::Timer);

    machine.in_irq_context(cpu(0), || {
        softirq.raise(cpu(0), SoftIrqId::Timer);
        softirq.raise(cpu(0), SoftIrqId::Timer);
        assert_eq!(softirq.pending(cpu(0)), SoftIrqId::Timer.mask());
    });

    assert_eq!(count.load(Ordering::Relaxed), 1);
    assert_eq!(softirq.pending(cpu(0)), 0);
    assert!(machine.platform().is_local_irq_enabled(cpu(0)));
}

#[test]
fn dispatch_in_ascending_order() {
    let machine = host_machine(1);
    let softirq = SoftIrq::new(machine.clone());
    let order = Arc::new(Mutex::new(Vec::new()));
    for id in [SoftIrqId::Rcu, SoftIrqId::NetRx, SoftIrqId::Timer] {
        let order = order.clone();
        softirq
            .open(id, move |_| order.lock().unwrap().push(id))
            .unwrap();
    }

    machine.in_irq_context(cpu(0), || {
        softirq.raise(cpu(0), SoftIrqId::Rcu);
        softirq.raise(cpu(0), SoftIrqId::NetRx);
        softirq.raise(cpu(0), SoftIrqId::Timer);
    });

    assert_eq!(
        *order.lock().unwrap(),
        [SoftIrqId::Timer, SoftIrqId::NetRx, SoftIrqId::Rcu]
    );
}

#[test]
fn open_twice_fails() {
    let softirq = SoftIrq::new(host_machine(1));
    assert!(softirq.is_open(SoftIrqId::Tasklet));
    assert!(!softirq.is_open(SoftIrqId::Sched));
    softirq.open(SoftIrqId::Sched, |_| {}).unwrap();
    assert_eq!(softirq.open(SoftIrqId::Sched, |_| {}), Err(Error::Busy));
    assert_eq!(softirq.open(SoftIrqId::Hi, |_| {}), Err(Error::Busy));
}

#[test]
fn bh_enable_runs_pending() {
    let machine = host_machine(2);
    let softirq = SoftIrq::new(machine.clone());
    let count = counting_action(&softirq, SoftIrqId::Block);

    {
        let _bh_guard = machine.disable_bh(cpu(1));
        softirq.raise(cpu(1), SoftIrqId::Block);
        softirq.do_softirq(cpu(1));
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    assert_eq!(count.load(Ordering::Relaxed), 1);
    assert_eq!(
        softirq.iter_softirq_counts_on_cpu(cpu(1)).nth(SoftIrqId::Block.as_index()),
        Some(1)
    );
    assert_eq!(softirq.iter_softirq_counts_across_all_cpus().sum::<usize>(), 1);
}

#[test]
fn restarts_are_bounded() {
    let machine = host_machine(1);
    let softirq = SoftIrq::new(machine.clone());
    let count = Arc::new(AtomicUsize::new(0));
    let count_cloned = count.clone();
    let weak = Arc::downgrade(&softirq);
    softirq
        .open(SoftIrqId::NetTx, move |cpu| {
            count_cloned.fetch_add(1, Ordering::Relaxed);
            weak.upgrade().unwrap().raise(cpu, SoftIrqId::NetTx);
        })
        .unwrap();

    machine.in_irq_context(cpu(0), || softirq.raise(cpu(0), SoftIrqId::NetTx));

    assert_eq!(count.load(Ordering::Relaxed), MAX_SOFTIRQ_RESTART);
    assert_eq!(softirq.pending(cpu(0)), SoftIrqId::NetTx.mask());
}

#[test]
fn ksoftirqd_serves_raise_outside_interrupt() {
    let machine = host_machine(2);
    let softirq = SoftIrq::new(machine.clone());
    let count = counting_action(&softirq, SoftIrqId::HrTimer);

    softirq.spawn_ksoftirqd(cpu(1)).unwrap();
    assert!(softirq.has_ksoftirqd(cpu(1)));
    softirq.raise(cpu(1), SoftIrqId::HrTimer);
    wait_for(|| count.load(Ordering::Relaxed) == 1);

    softirq.stop_ksoftirqd(cpu(1));
    assert!(!softirq.has_ksoftirqd(cpu(1)));
}

#[test]
fn tasklet_runs_once_per_schedule() {
    let machine = host_machine(2);
    let softirq = SoftIrq::new(machine.clone());
    let count = Arc::new(AtomicUsize::new(0));
    let count_cloned = count.clone();
    let tasklet = Tasklet::new(&softirq, move |_| {
        count_cloned.fetch_add(1, Ordering::Relaxed);
    });

    machine.in_irq_context(cpu(0), || {
        tasklet.schedule(cpu(0));
        tasklet.schedule(cpu(0));
        assert!(tasklet.is_scheduled());
    });
    assert_eq!(count.load(Ordering::Relaxed), 1);
    assert!(!tasklet.is_scheduled());

    machine.in_irq_context(cpu(0), || tasklet.schedule(cpu(0)));
    assert_eq!(count.load(Ordering::Relaxed), 2);
}

#[test]
fn hi_tasklets_run_first() {
    let machine = host_machine(1);
    let softirq = SoftIrq::new(machine.clone());
    let order = Arc::new(Mutex::new(Vec::new()));
    let make = |name: &'static str| {
        let order = order.clone();
        Tasklet::new(&softirq, move |_| order.lock().unwrap().push(name))
    };
    let normal = make("normal");
    let hi = make("hi");

    machine.in_irq_context(cpu(0), || {
        normal.schedule(cpu(0));
        hi.hi_schedule(cpu(0));
    });

    assert_eq!(*order.lock().unwrap(), ["hi", "normal"]);
}

#[test]
fn disabled_tasklet_waits_for_enable() {
    let machine = host_machine(1);
    let softirq = SoftIrq::new(machine.clone());
    let count = Arc::new(AtomicUsize::new(0));
    let count_cloned = count.clone();
    let tasklet = Tasklet::new(&softirq, move |_| {
        count_cloned.fetch_add(1, Ordering::Relaxed);
    });

    tasklet.disable();
    assert!(tasklet.is_disabled());
    machine.in_irq_context(cpu(0), || tasklet.schedule(cpu(0)));
    assert_eq!(count.load(Ordering::Relaxed), 0);
    assert!(tasklet.is_scheduled());
    assert_eq!(softirq.nr_queued_tasklets(cpu(0), SoftIrqId::Tasklet), 1);

    tasklet.enable();
    machine.in_irq_context(cpu(0), || {});
    assert_eq!(count.load(Ordering::Relaxed), 1);
    assert_eq!(softirq.nr_queued_tasklets(cpu(0), SoftIrqId::Tasklet), 0);
}

#[test]
fn kill_waits_for_scheduled_tasklet() {
    let machine = host_machine(2);
    let softirq = SoftIrq::new(machine.clone());
    let count = Arc::new(AtomicUsize::new(0));
    let count_cloned = count.clone();
    let tasklet = Tasklet::new(&softirq, move |_| {
        count_cloned.fetch_add(1, Ordering::Relaxed);
    });

    softirq.spawn_ksoftirqd(cpu(1)).unwrap();
    tasklet.schedule(cpu(1));
    tasklet.kill(cpu(0));

    assert_eq!(count.load(Ordering::Relaxed), 1);
    assert!(!tasklet.is_scheduled());
    softirq.stop_ksoftirqd(cpu(1));
}

#[test]
fn dead_cpu_tasklets_move_to_survivor() {
    let machine = host_machine(4);
    let softirq = SoftIrq::new(machine.clone());
    let ran_on = Arc::new(Mutex::new(Vec::new()));
    let ran_on_cloned = ran_on.clone();
    let tasklet = Tasklet::new(&softirq, move |cpu| {
        ran_on_cloned.lock().unwrap().push(cpu.as_u32())
    });

    let chain = CpuNotifierChain::new();
    chain.register(softirq.cpu_notifier());
    chain
        .notify_with_rollback(
            CpuEvent::new(CpuAction::UpPrepare),
            CpuEvent::new(CpuAction::UpCanceled),
            cpu(3),
        )
        .unwrap();
    assert!(softirq.has_ksoftirqd(cpu(3)));

    tasklet.disable_nosync();
    tasklet.schedule(cpu(3));
    machine.topology().set_online(cpu(3), false).unwrap();
    chain.notify_nofail(CpuEvent::new(CpuAction::Dead), cpu(3));

    assert!(!softirq.has_ksoftirqd(cpu(3)));
    assert_eq!(softirq.nr_queued_tasklets(cpu(3), SoftIrqId::Tasklet), 0);
    assert_eq!(softirq.nr_queued_tasklets(cpu(0), SoftIrqId::Tasklet), 1);

    tasklet.enable();
    machine.in_irq_context(cpu(0), || {});
    assert_eq!(*ran_on.lock().unwrap(), [0]);
}

#[test]
fn kill_immediate_needs_dead_cpu() {
    let machine = host_machine(2);
    let softirq = SoftIrq::new(machine.clone());
    let tasklet = Tasklet::new(&softirq, |_| {});

    tasklet.schedule(cpu(1));
    assert_eq!(tasklet.kill_immediate(cpu(1)), Err(Error::InvalidArgs));

    machine.topology().set_online(cpu(1), false).unwrap();
    tasklet.kill_immediate(cpu(1)).unwrap();
    assert!(!tasklet.is_scheduled());
    assert_eq!(softirq.nr_queued_tasklets(cpu(1), SoftIrqId::Tasklet), 0);
}
