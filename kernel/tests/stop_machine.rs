// SPDX-License-Identifier: MPL-2.0

mod common;

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use common::{boot, boot_all, cpu, cpus};
use hinge_frame::cpu::CpuId;
use hinge_kernel::{Errno, Error};

#[test]
fn stop_cpus_meets_every_cpu_once() {
    let (kernel, _platform) = boot_all(4);
    let ran_on = Arc::new(Mutex::new(Vec::new()));
    let ran_on_cloned = ran_on.clone();

    kernel
        .stop_machine_engine()
        .stop_cpus(cpu(0), &cpus(&[0, 1, 2, 3]), move |cpu| {
            ran_on_cloned.lock().unwrap().push(cpu);
            Ok(())
        })
        .unwrap();

    let mut ran_on = ran_on.lock().unwrap().clone();
    ran_on.sort();
    assert_eq!(ran_on, [cpu(0), cpu(1), cpu(2), cpu(3)]);
}

#[test]
fn stop_one_cpu_runs_on_target() {
    let (kernel, _platform) = boot_all(2);
    let ran_on = Arc::new(Mutex::new(None));
    let ran_on_cloned = ran_on.clone();
    kernel
        .stop_machine_engine()
        .stop_one_cpu(cpu(1), move |cpu| {
            *ran_on_cloned.lock().unwrap() = Some(cpu);
            Ok(())
        })
        .unwrap();
    assert_eq!(*ran_on.lock().unwrap(), Some(cpu(1)));
}

#[test]
fn stop_one_cpu_on_offline_cpu_fails() {
    let (kernel, _platform) = boot_all(3);
    kernel.cpu_down(cpu(0), cpu(2)).unwrap();

    let called = Arc::new(AtomicBool::new(false));
    let called_cloned = called.clone();
    let res = kernel
        .stop_machine_engine()
        .stop_one_cpu(cpu(2), move |_| {
            called_cloned.store(true, Ordering::Relaxed);
            Ok(())
        });
    assert_eq!(res.unwrap_err().error(), Errno::ENOENT);
    assert!(!called.load(Ordering::Relaxed));
}

#[test]
fn stop_machine_excludes_every_other_cpu() {
    let (kernel, _platform) = boot_all(4);
    let machine = kernel.machine().clone();
    let violations = Arc::new(AtomicUsize::new(0));
    let violations_cloned = violations.clone();

    kernel
        .stop_machine(
            cpu(0),
            move |this_cpu| {
                // Every other online CPU spins in the stopper with IRQs
                // disabled, so none of them can handle anything.
                for other in machine.topology().online().iter() {
                    if other != this_cpu && machine.platform().is_local_irq_enabled(other) {
                        violations_cloned.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(())
            },
            None,
        )
        .unwrap();

    assert_eq!(violations.load(Ordering::Relaxed), 0);
    for raw in 0..4 {
        assert!(kernel.machine().platform().is_local_irq_enabled(cpu(raw)));
    }
}

#[test]
fn stop_machine_returns_the_error() {
    let (kernel, _platform) = boot_all(3);
    let res = kernel.stop_machine(
        cpu(0),
        |cpu: CpuId| -> Result<(), Error> {
            if cpu.as_u32() == 2 {
                return Err(Error::new(Errno::EPERM));
            }
            Ok(())
        },
        Some(&cpus(&[1, 2])),
    );
    assert_eq!(res.unwrap_err().error(), Errno::EPERM);
}

#[test]
fn stop_machine_on_a_single_cpu() {
    let (kernel, _platform) = boot(2, "");
    let count = Arc::new(AtomicUsize::new(0));
    let count_cloned = count.clone();
    kernel
        .stop_machine(
            cpu(0),
            move |_| {
                count_cloned.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            None,
        )
        .unwrap();
    assert_eq!(count.load(Ordering::Relaxed), 1);
}

#[test]
fn concurrent_stop_requests_serialize() {
    let (kernel, _platform) = boot_all(3);
    let inside = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let kernel = kernel.clone();
            let inside = inside.clone();
            let overlaps = overlaps.clone();
            std::thread::spawn(move || {
                for _ in 0..5 {
                    let inside = inside.clone();
                    let overlaps = overlaps.clone();
                    kernel
                        .stop_machine(
                            cpu(0),
                            move |_| {
                                if inside.swap(true, Ordering::AcqRel) {
                                    overlaps.fetch_add(1, Ordering::Relaxed);
                                }
                                std::thread::yield_now();
                                inside.store(false, Ordering::Release);
                                Ok(())
                            },
                            None,
                        )
                        .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(overlaps.load(Ordering::Relaxed), 0);
}
