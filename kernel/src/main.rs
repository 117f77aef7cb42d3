//! JEZGRO Simulator
//!
//! Runs one kernel instance with the EK3 power-module service set for a
//! number of ticks, optionally injecting random faults, and prints the final
//! statistics.
//!
//! ```text
//! jezgro-sim --ticks 100000 --fault-probability 0.001 --seed 7 --json
//! ```

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use jezgro::interrupt::{ISR_ADC, ISR_SAFETY};
use jezgro::kernel::events::{EVENT_LOG_CAPACITY, EventKind};
use jezgro::platform::target_platform::{self, memory_layout};
use jezgro::safety::{FaultInjector, HealthMonitor};
use jezgro::{AccessFlags, Kernel, KernelConfig, Payload, Privilege, ServiceConfig, ServiceId};
use log::{info, warn};

/// Simulated EK3 controller running the JEZGRO kernel
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Ticks to run
    #[clap(short, long, default_value_t = 10_000)]
    ticks: u64,

    /// Tick length in microseconds (overrides the configuration)
    #[clap(long)]
    tick_us: Option<u64>,

    /// Kernel configuration file (TOML)
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Fault injector seed
    #[clap(long, default_value_t = 1)]
    seed: u64,

    /// Fault injection probability per tick
    #[clap(long, default_value_t = 0.0)]
    fault_probability: f64,

    /// Print the final statistics as JSON
    #[clap(long)]
    json: bool,
}

fn load_config(args: &Args) -> Result<KernelConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read '{}'", path.display()))?;
            toml::from_str(&text).with_context(|| format!("failed to parse '{}'", path.display()))?
        }
        None => KernelConfig::default(),
    };
    if let Some(us) = args.tick_us {
        config.tick_rate = Duration::from_micros(us);
    }
    Ok(config)
}

fn register_services(kernel: &mut Kernel) -> Result<()> {
    let us = Duration::from_micros;
    let ms = Duration::from_millis;

    kernel
        .register_service(
            ServiceConfig::new(ServiceId::POWER_CONTROL, "power_control")
                .privilege(Privilege::Driver)
                .periodic(ms(1), ms(1), us(100))
                .critical(),
            Box::new(|ctx, _| {
                ctx.check_access(memory_layout::SRAM_BASE, AccessFlags::READ);
                ctx.report_stack_usage(640);
                Ok(())
            }),
        )
        .map_err(|e| anyhow!("power_control: {e}"))?;

    kernel
        .register_service(
            ServiceConfig::new(ServiceId::THERMAL, "thermal")
                .periodic(ms(10), ms(10), us(100))
                .watchdog_timeout(ms(20)),
            Box::new(|ctx, _| {
                let reading_mc: i32 = 45_000;
                ctx.send(ServiceId::LOGGER, Payload::encode(&reading_mc)?)?;
                Ok(())
            }),
        )
        .map_err(|e| anyhow!("thermal: {e}"))?;

    kernel
        .register_service(
            ServiceConfig::new(ServiceId::HEARTBEAT, "heartbeat")
                .periodic(ms(100), ms(100), us(100))
                .watchdog_timeout(ms(200)),
            Box::new(|ctx, _| {
                let uptime_ms = u64::try_from(ctx.now().as_millis()).unwrap_or(u64::MAX);
                ctx.broadcast(Payload::encode(&uptime_ms)?);
                Ok(())
            }),
        )
        .map_err(|e| anyhow!("heartbeat: {e}"))?;

    kernel
        .register_service(
            ServiceConfig::new(ServiceId::LOGGER, "logger")
                .sporadic(ms(10), us(100))
                .watchdog_timeout(ms(500))
                .mailbox_capacity(32),
            Box::new(|ctx, _| {
                while let Some(message) = ctx.receive() {
                    log::trace!("logger: {:?} from {}", message.kind, message.sender);
                }
                Ok(())
            }),
        )
        .map_err(|e| anyhow!("logger: {e}"))?;

    kernel
        .register_service(
            ServiceConfig::new(ServiceId::CAN, "can")
                .privilege(Privilege::Driver)
                .periodic(ms(5), ms(5), us(100)),
            Box::new(|ctx, _| {
                ctx.check_access(memory_layout::PERIPHERAL_BASE, AccessFlags::RW);
                while ctx.receive().is_some() {}
                Ok(())
            }),
        )
        .map_err(|e| anyhow!("can: {e}"))?;

    kernel
        .register_isr(ISR_SAFETY, "ocp_ovp_otp", Box::new(|| {}))
        .map_err(|e| anyhow!("{e}"))?;
    kernel
        .register_isr(ISR_ADC, "adc_sample", Box::new(|| {}))
        .map_err(|e| anyhow!("{e}"))?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let mut kernel = Kernel::with_config(config).map_err(|e| anyhow!("invalid configuration: {e}"))?;
    register_services(&mut kernel)?;

    info!(
        "{} with {} services, utilization {:.3}",
        target_platform::PLATFORM_NAME,
        kernel.services().count(),
        kernel.utilization()
    );
    kernel.start();
    if !kernel.is_schedulable() {
        warn!("task set is not EDF-schedulable");
    }

    let mut injector = FaultInjector::new(args.seed, args.fault_probability);
    let adc_every = (Duration::from_millis(1).as_nanos() / kernel.config().tick_rate.as_nanos()).max(1);
    let logger_deadline = Duration::from_millis(10);
    let mut logger_job: Option<Duration> = None;
    for tick in 0..args.ticks {
        if u128::from(tick) % adc_every == 0 {
            kernel.trigger_isr(ISR_ADC).map_err(|e| anyhow!("{e}"))?;
        }
        // one outstanding logger job drains the whole mailbox
        let job_open = logger_job.is_some_and(|at| kernel.now() < at + logger_deadline);
        if !job_open && kernel.ipc().pending(ServiceId::LOGGER) > 0 && kernel.submit_sporadic(ServiceId::LOGGER).is_ok() {
            logger_job = Some(kernel.now());
        }
        if let Some((id, kind)) = injector.maybe_inject(&mut kernel) {
            info!("injected {kind} into {id}");
        }
        kernel.step();
    }

    let monitor = HealthMonitor::from_config(kernel.config());
    for report in monitor.assess_all(&kernel) {
        if report.at_risk {
            warn!("{} at risk (p = {:.3})", report.id, report.fault_probability);
        }
    }

    let stats = kernel.stats();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        info!(
            "{} ticks, uptime {:?}, {} faults, {} restarts, cpu {:.1}%",
            stats.tick_count,
            stats.uptime,
            stats.fault_count,
            stats.reincarnation.total_restarts,
            stats.scheduler.cpu_percent
        );
        let events = kernel.recent_events(EVENT_LOG_CAPACITY);
        let notable = events.iter().filter(|event| event.kind != EventKind::InterruptTriggered);
        for event in notable.rev().take(10) {
            info!(
                "{:>12?} {:<24} {} {}",
                event.timestamp,
                event.kind.as_str(),
                event.service.map(|id| id.to_string()).unwrap_or_default(),
                event.detail
            );
        }
    }
    Ok(())
}
