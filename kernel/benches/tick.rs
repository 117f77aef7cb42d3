//! Cost of one kernel tick with a loaded service set.

#![allow(clippy::unwrap_used, missing_docs)]

use std::hint::black_box;
use std::time::Duration;

use criterion::{Criterion, criterion_group, criterion_main};
use jezgro::{Kernel, Payload, Privilege, ServiceConfig, ServiceId};

fn loaded_kernel(services: u8) -> Kernel {
    let mut kernel = Kernel::new();
    for n in 1..=services {
        let period = Duration::from_millis(u64::from(n));
        kernel
            .register_service(
                ServiceConfig::new(ServiceId::new(n), "bench")
                    .privilege(Privilege::Service)
                    .periodic(period, period, Duration::from_micros(100))
                    .watchdog_timeout(Duration::from_secs(1)),
                Box::new(|ctx, _| {
                    ctx.broadcast(Payload::from_bytes(&[0xA5; 8])?);
                    while ctx.receive().is_some() {}
                    Ok(())
                }),
            )
            .unwrap();
    }
    kernel.start();
    kernel
}

fn bench_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick");
    for services in [1u8, 4, 8] {
        let mut kernel = loaded_kernel(services);
        group.bench_function(format!("{services}_services"), |b| {
            b.iter(|| kernel.tick(black_box(Duration::from_micros(100))));
        });
    }
    group.finish();
}

fn bench_scheduling_analysis(c: &mut Criterion) {
    let kernel = loaded_kernel(8);
    c.bench_function("utilization", |b| b.iter(|| black_box(kernel.utilization())));
}

criterion_group!(benches, bench_tick, bench_scheduling_analysis);
criterion_main!(benches);
