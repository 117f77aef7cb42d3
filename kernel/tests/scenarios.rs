//! End-to-end behaviour of one kernel instance: scheduling, IPC back
//! pressure, reincarnation limits and memory protection.

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jezgro::ipc::IpcError;
use jezgro::memory::Mpu;
use jezgro::platform::target_platform::memory_layout;
use jezgro::safety::RestartPolicy;
use jezgro::service::TaskBody;
use jezgro::{
    AccessFlags, FaultKind, Kernel, KernelConfig, KernelError, Message, Payload, Privilege, ServiceConfig,
    ServiceId, ServiceState,
};
use proptest::prelude::*;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn counting(counter: &Arc<AtomicU32>) -> TaskBody {
    let counter = Arc::clone(counter);
    Box::new(move |_, _| {
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    })
}

type Dispatches = Arc<Mutex<Vec<(Duration, ServiceId)>>>;

fn tracing(log: &Dispatches) -> TaskBody {
    let log = Arc::clone(log);
    Box::new(move |ctx, _| {
        log.lock().unwrap().push((ctx.now(), ctx.id()));
        Ok(())
    })
}

/// Unit-time EDF over 1ms ticks: implicit deadlines, releases on the period
/// grid starting at the first tick, ties broken by service id.
fn edf_reference(periods: &[(ServiceId, u64)], ticks: u64) -> Vec<(Duration, ServiceId)> {
    let mut next: Vec<u64> = vec![1; periods.len()];
    let mut ready: Vec<(u64, ServiceId)> = Vec::new();
    let mut dispatched = Vec::new();
    for now in 1..=ticks {
        for (slot, &(id, period)) in next.iter_mut().zip(periods) {
            if *slot <= now {
                ready.push((now + period, id));
                *slot += period;
            }
        }
        ready.retain(|&(deadline, _)| deadline >= now);
        let earliest = ready.iter().enumerate().min_by_key(|&(_, job)| *job).map(|(index, _)| index);
        if let Some(index) = earliest {
            let (_, id) = ready.remove(index);
            dispatched.push((ms(now), id));
        }
    }
    dispatched
}

fn run(kernel: &mut Kernel, ticks: u64) {
    for _ in 0..ticks {
        kernel.tick(ms(1));
    }
}

fn state(kernel: &Kernel, id: ServiceId) -> ServiceState {
    kernel.service(id).unwrap().state()
}

#[test]
fn periodic_service_meets_every_deadline() {
    let runs = Arc::new(AtomicU32::new(0));
    let mut kernel = Kernel::new();
    kernel
        .create_service(
            ServiceId::THERMAL,
            "thermal",
            Privilege::Service,
            ms(10),
            ms(10),
            ms(1),
            counting(&runs),
        )
        .unwrap();
    kernel.start();
    run(&mut kernel, 100);

    assert_eq!(runs.load(Ordering::Relaxed), 10);
    let runtime = *kernel.service(ServiceId::THERMAL).unwrap().runtime();
    assert_eq!(runtime.execution_count, 10);
    assert_eq!(runtime.deadline_misses, 0);
    assert_eq!(kernel.scheduler().stats().deadline_misses, 0);
    assert!((kernel.utilization() - 0.1).abs() < 1e-9);
    assert!(kernel.is_schedulable());
    assert_eq!(kernel.fault_count(), 0);
}

#[test]
fn full_mailbox_drops_the_overflow() {
    let mut kernel = Kernel::new();
    kernel
        .register_service(
            ServiceConfig::new(ServiceId::THERMAL, "thermal").periodic(ms(10), ms(10), ms(1)),
            Box::new(|_, _| Ok(())),
        )
        .unwrap();
    kernel
        .register_service(
            ServiceConfig::new(ServiceId::LOGGER, "logger")
                .sporadic(ms(10), ms(1))
                .mailbox_capacity(3),
            Box::new(|_, _| Ok(())),
        )
        .unwrap();

    let full = (0..5)
        .map(|_| kernel.send(Message::notification(ServiceId::THERMAL, ServiceId::LOGGER, Payload::new())))
        .filter(|result| *result == Err(KernelError::Ipc(IpcError::QueueFull)))
        .count();

    assert_eq!(full, 2);
    assert_eq!(kernel.ipc().stats().dropped, 2);
    assert_eq!(kernel.ipc().pending(ServiceId::LOGGER), 3);
    assert_eq!(kernel.ipc().mailbox(ServiceId::LOGGER).unwrap().dropped(), 2);
}

#[test]
fn fourth_watchdog_fault_is_permanent() {
    let id = ServiceId::SWARM;
    let config = KernelConfig {
        restart: RestartPolicy {
            max_restarts: 3,
            ..RestartPolicy::default()
        },
        ..KernelConfig::default()
    };
    let cooldown = config.restart.cooldown;
    let mut kernel = Kernel::with_config(config).unwrap();
    kernel
        .create_service(id, "swarm", Privilege::Service, ms(10), ms(10), ms(1), Box::new(|_, _| Ok(())))
        .unwrap();
    kernel.start();
    run(&mut kernel, 5);

    for round in 1..=3u32 {
        kernel.inject_fault(id, FaultKind::Watchdog).unwrap();
        assert_eq!(state(&kernel, id), ServiceState::Faulted);
        assert!(kernel.reincarnation().pending_restart(id).is_some());

        let mut waited = 0;
        while state(&kernel, id) != ServiceState::Running {
            run(&mut kernel, 1);
            waited += 1;
            assert!(waited < 1_000, "restart {round} never happened");
        }
        assert_eq!(kernel.reincarnation().history(id).unwrap().restart_count, round);

        // let the cooldown pass before the next fault
        run(&mut kernel, cooldown.as_millis() as u64 + 10);
        assert_eq!(state(&kernel, id), ServiceState::Running);
    }

    kernel.inject_fault(id, FaultKind::Watchdog).unwrap();
    let history = *kernel.reincarnation().history(id).unwrap();
    assert!(history.permanent_fault);
    assert_eq!(history.last_fault, Some(FaultKind::Watchdog));
    assert_eq!(kernel.reincarnation().pending_restart(id), None);

    run(&mut kernel, 2_000);
    assert_eq!(state(&kernel, id), ServiceState::Faulted);
    assert_eq!(kernel.reincarnation().stats().total_restarts, 3);
    assert_eq!(kernel.reincarnation().stats().permanently_faulted, 1);
}

#[test]
fn mailbox_delivers_in_send_order() {
    let mut kernel = Kernel::new();
    kernel
        .register_service(
            ServiceConfig::new(ServiceId::LOGGER, "logger").sporadic(ms(10), ms(1)),
            Box::new(|_, _| Ok(())),
        )
        .unwrap();

    let sent: Vec<u32> = (0..3i32)
        .map(|reading| {
            let payload = Payload::encode(&reading).unwrap();
            kernel
                .send(Message::notification(ServiceId::THERMAL, ServiceId::LOGGER, payload))
                .unwrap()
        })
        .collect();
    assert!(sent.windows(2).all(|pair| pair[0] < pair[1]));

    for (expected, sequence) in (0..3i32).zip(sent) {
        let message = kernel.receive(ServiceId::LOGGER).unwrap();
        assert_eq!(message.sequence, sequence);
        assert_eq!(message.payload.decode::<i32>().unwrap(), expected);
    }
    assert!(kernel.receive(ServiceId::LOGGER).is_none());
}

#[test]
fn heap_is_open_and_peripherals_are_closed_to_services() {
    let mut mpu = Mpu::new();
    let heap = memory_layout::HEAP_BASE + 0x100;
    let peripheral = memory_layout::PERIPHERAL_BASE + 0x100;

    assert!(mpu.check_access(heap, AccessFlags::RW, Privilege::Service, ServiceId::THERMAL));
    assert!(!mpu.check_access(peripheral, AccessFlags::RW, Privilege::Service, ServiceId::THERMAL));
    assert!(mpu.check_access(peripheral, AccessFlags::RW, Privilege::Driver, ServiceId::CAN));
    assert_eq!(mpu.violation_count(), 1);
}

#[test]
fn peripheral_access_from_a_service_body_faults_it() {
    let mut kernel = Kernel::new();
    kernel
        .create_service(
            ServiceId::THERMAL,
            "thermal",
            Privilege::Service,
            ms(10),
            ms(10),
            ms(1),
            Box::new(|ctx, _| {
                ctx.check_access(memory_layout::PERIPHERAL_BASE, AccessFlags::WRITE);
                Ok(())
            }),
        )
        .unwrap();
    kernel.start();
    run(&mut kernel, 1);

    let service = kernel.service(ServiceId::THERMAL).unwrap();
    assert_eq!(service.state(), ServiceState::Faulted);
    assert_eq!(service.last_fault(), Some(FaultKind::MpuViolation));
    assert_eq!(kernel.mpu().violation_count(), 1);
}

#[test]
fn instances_are_independent() {
    let mut first = Kernel::new();
    let mut second = Kernel::new();
    for kernel in [&mut first, &mut second] {
        kernel
            .create_service(ServiceId::THERMAL, "thermal", Privilege::Service, ms(10), ms(10), ms(1), Box::new(|_, _| Ok(())))
            .unwrap();
        kernel.start();
    }

    first.inject_fault(ServiceId::THERMAL, FaultKind::Exception).unwrap();
    run(&mut second, 20);

    assert_eq!(state(&first, ServiceId::THERMAL), ServiceState::Faulted);
    assert_eq!(state(&second, ServiceId::THERMAL), ServiceState::Running);
    assert_eq!(second.fault_count(), 0);
}

proptest! {
    #[test]
    fn utilization_is_the_sum_of_wcet_over_period(
        tasks in prop::collection::vec((1u64..=100, 0u64..=1_000), 1..=8),
    ) {
        let mut kernel = Kernel::new();
        let mut expected = 0.0;
        for (index, &(period_ms, permille)) in tasks.iter().enumerate() {
            let period = ms(period_ms);
            let wcet = Duration::from_micros(period_ms * permille);
            expected += wcet.as_secs_f64() / period.as_secs_f64();
            let id = ServiceId::new(index as u8 + 1);
            kernel
                .create_service(id, "task", Privilege::Service, period, period, wcet, Box::new(|_, _| Ok(())))
                .unwrap();
        }
        kernel.start();

        prop_assert!((kernel.utilization() - expected).abs() < 1e-9);
        prop_assert_eq!(kernel.is_schedulable(), expected <= 1.0);
    }

    #[test]
    fn single_periodic_service_runs_once_per_period(period_ms in 2u64..=50, periods in 1u64..=10) {
        let runs = Arc::new(AtomicU32::new(0));
        let mut kernel = Kernel::new();
        kernel
            .register_service(
                ServiceConfig::new(ServiceId::THERMAL, "thermal")
                    .periodic(ms(period_ms), ms(period_ms), ms(1))
                    .watchdog_timeout(ms(2 * period_ms)),
                counting(&runs),
            )
            .unwrap();
        kernel.start();
        run(&mut kernel, period_ms * periods);

        prop_assert_eq!(u64::from(runs.load(Ordering::Relaxed)), periods);
        prop_assert_eq!(kernel.scheduler().stats().deadline_misses, 0);
        prop_assert_eq!(kernel.fault_count(), 0);
    }

    #[test]
    fn feasible_task_set_follows_edf_order(
        periods in (2usize..=6).prop_flat_map(|n| prop::collection::vec(n as u64..=40, n)),
        ticks in 50u64..=300,
    ) {
        // every period is at least the task count, so utilization stays <= 1
        let log: Dispatches = Arc::default();
        let mut kernel = Kernel::new();
        let mut set = Vec::new();
        for (index, &period) in periods.iter().enumerate() {
            let id = ServiceId::new(index as u8 + 1);
            kernel
                .register_service(
                    ServiceConfig::new(id, "task")
                        .periodic(ms(period), ms(period), ms(1))
                        .watchdog_timeout(ms(4 * period)),
                    tracing(&log),
                )
                .unwrap();
            set.push((id, period));
        }
        kernel.start();
        run(&mut kernel, ticks);

        let expected = edf_reference(&set, ticks);
        let actual = log.lock().unwrap().clone();
        prop_assert_eq!(&actual, &expected);
        prop_assert_eq!(kernel.scheduler().stats().deadline_misses, 0);
        prop_assert_eq!(kernel.fault_count(), 0);
        for &(id, _) in &set {
            let runs = expected.iter().filter(|&&(_, ran)| ran == id).count();
            let runtime = *kernel.service(id).unwrap().runtime();
            prop_assert_eq!(runtime.execution_count as usize, runs);
            prop_assert_eq!(runtime.deadline_misses, 0);
        }
    }

    #[test]
    fn mailbox_depth_is_bounded(capacity in 1usize..=32, ops in prop::collection::vec(any::<bool>(), 0..128)) {
        let mut kernel = Kernel::new();
        kernel
            .register_service(
                ServiceConfig::new(ServiceId::LOGGER, "logger")
                    .sporadic(ms(10), ms(1))
                    .mailbox_capacity(capacity),
                Box::new(|_, _| Ok(())),
            )
            .unwrap();

        let (mut queued, mut dropped) = (0usize, 0u64);
        for send in ops {
            if send {
                let message = Message::notification(ServiceId::THERMAL, ServiceId::LOGGER, Payload::new());
                match kernel.send(message) {
                    Ok(_) => queued += 1,
                    Err(err) => {
                        prop_assert_eq!(err, KernelError::Ipc(IpcError::QueueFull));
                        dropped += 1;
                    }
                }
            } else if kernel.receive(ServiceId::LOGGER).is_some() {
                queued -= 1;
            }
            prop_assert!(kernel.ipc().pending(ServiceId::LOGGER) <= capacity);
            prop_assert_eq!(kernel.ipc().pending(ServiceId::LOGGER), queued);
        }
        prop_assert_eq!(kernel.ipc().stats().dropped, dropped);
    }

    #[test]
    fn restart_backoff_grows_and_is_capped(
        base_ms in 1u64..=100,
        factor in 1.5f64..4.0,
        extra_ms in 0u64..=2_000,
    ) {
        let policy = RestartPolicy {
            restart_delay: ms(base_ms),
            backoff_factor: factor,
            max_delay: ms(base_ms + extra_ms),
            ..RestartPolicy::default()
        };
        let mut delay = policy.restart_delay;
        for _ in 0..32 {
            let next = policy.next_delay(delay);
            prop_assert!(next >= delay);
            prop_assert!(next <= policy.max_delay);
            delay = next;
        }
        prop_assert_eq!(delay, policy.max_delay);
    }
}
