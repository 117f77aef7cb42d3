//! Kernel Orchestrator
//!
//! One [`Kernel`] owns every table of a simulated EK3 controller and advances
//! them in a fixed order on each [`Kernel::tick`].
//!
//! # Tick stages
//!
//! 1. Pending interrupt handlers, highest priority first
//! 2. IPC wait resolution (blocked callers whose reply, message or timeout
//!    arrived become `Running` again)
//! 3. EDF release and dispatch, then execution of the selected body
//! 4. Per-service watchdog check, then the hardware watchdog
//! 5. Due restarts, after which the supervisor kicks the hardware watchdog
//!
//! # Faults
//!
//! Every fault goes through one path: the service moves to `Faulted`, its IPC
//! wait and scheduler state are dropped, the event is logged and the
//! reincarnation server decides between a delayed restart and a permanent
//! fault. A permanently faulted service has its mailbox closed.

use alloc::vec::Vec;
use core::time::Duration;

use serde::Serialize;

use crate::config::KernelConfig;
use crate::interrupt::{IsrHandler, IsrTable};
use crate::ipc::{IpcManager, IpcResult, IpcStats, Message, Payload, ReplyTicket};
use crate::memory::{MemoryRegion, Mpu, MpuStats, Privilege};
use crate::platform::{HardwareCapabilities, PlatformType, target_platform};
use crate::safety::recovery::ReincarnationStats;
use crate::safety::{
    FaultDecision, FaultKind, ReincarnationServer, RestartPolicy, RestartTarget, WatchdogManager,
    WatchdogStats,
};
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::service::{
    MAX_SERVICES, Service, ServiceConfig, ServiceId, ServiceState, ServiceStats, ServiceTable,
    TaskBody, TaskContext,
};
use crate::{KernelError, KernelResult};

pub mod events;

pub use events::{EVENT_LOG_CAPACITY, EventKind, EventLog, KernelEvent};

/// Aggregated kernel statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KernelStats {
    /// Platform the kernel models
    pub platform: PlatformType,
    /// Hardware capabilities of the platform
    pub capabilities: HardwareCapabilities,
    /// Kernel is running
    pub running: bool,
    /// Ticks executed
    pub tick_count: u64,
    /// Time since the last start
    pub uptime: Duration,
    /// Simulated time
    pub now: Duration,
    /// Faults recorded across all services
    pub fault_count: u64,
    /// EDF utilization of the running periodic services
    pub utilization: f64,
    /// Events ever logged
    pub events_logged: u64,
    /// Per-service statistics in id order
    pub services: Vec<ServiceStats>,
    /// Scheduler statistics
    pub scheduler: SchedulerStats,
    /// MPU statistics
    pub mpu: MpuStats,
    /// IPC statistics
    pub ipc: IpcStats,
    /// Watchdog statistics
    pub watchdog: WatchdogStats,
    /// Reincarnation statistics
    pub reincarnation: ReincarnationStats,
}

/// Simulated microkernel instance
#[derive(Debug)]
pub struct Kernel {
    config: KernelConfig,
    services: ServiceTable,
    scheduler: Scheduler,
    mpu: Mpu,
    ipc: IpcManager,
    watchdog: WatchdogManager,
    reincarnation: ReincarnationServer,
    interrupts: IsrTable,
    events: EventLog,
    tick_count: u64,
    uptime: Duration,
    now: Duration,
    running: bool,
    fault_count: u64,
    supervisor_enabled: bool,
}

static_assertions::assert_impl_all!(Kernel: Send);
static_assertions::const_assert!(MAX_SERVICES <= u8::MAX as usize);

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Kernel with the default configuration
    pub fn new() -> Self {
        Self::build(KernelConfig::default())
    }

    /// Kernel with a validated configuration
    pub fn with_config(config: KernelConfig) -> KernelResult<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: KernelConfig) -> Self {
        Self {
            services: ServiceTable::new(),
            scheduler: Scheduler::new(),
            mpu: Mpu::new(),
            ipc: IpcManager::new(config.ipc_timeout),
            watchdog: WatchdogManager::new(config.watchdog_timeout),
            reincarnation: ReincarnationServer::new(config.restart),
            interrupts: IsrTable::new(),
            events: EventLog::new(),
            tick_count: 0,
            uptime: Duration::ZERO,
            now: Duration::ZERO,
            running: false,
            fault_count: 0,
            supervisor_enabled: true,
            config,
        }
    }

    fn record(&mut self, kind: EventKind, service: Option<ServiceId>, detail: heapless::String<{ events::EVENT_DETAIL_LEN }>) {
        self.events.record(KernelEvent {
            timestamp: self.now,
            kind,
            service,
            detail,
        });
    }

    // ---------------------------------------------------------------------
    // Registration and lifecycle
    // ---------------------------------------------------------------------

    /// Register a service described by `config`.
    ///
    /// The service gets its mailbox and (when enabled) its watchdog at once.
    /// It starts in `Init`, or directly in `Running` when the kernel runs.
    pub fn register_service(&mut self, config: ServiceConfig, body: TaskBody) -> KernelResult<()> {
        config.validate()?;
        let id = config.id;
        if self.services.contains(id) {
            return Err(KernelError::AlreadyRegistered(id));
        }

        let capacity = config.mailbox_capacity.unwrap_or(self.config.default_queue_size);
        self.ipc.register(id, capacity)?;
        if self.config.watchdog_enabled {
            let timeout = config.watchdog_timeout.unwrap_or(self.config.watchdog_timeout);
            self.watchdog.register(id, timeout, self.now);
        }

        let mut service = Service::new(config, body);
        if self.running {
            service.transition(ServiceState::Running)?;
        }
        klog!(info, id, "registered ({} us period)", service.period().as_micros());
        self.services.insert(service)?;
        self.record(EventKind::ServiceRegistered, Some(id), heapless::String::new());
        Ok(())
    }

    /// Register a service from its timing contract; a zero period makes it sporadic
    #[allow(clippy::too_many_arguments)]
    pub fn create_service(
        &mut self,
        id: ServiceId,
        name: &str,
        privilege: Privilege,
        period: Duration,
        deadline: Duration,
        wcet: Duration,
        body: TaskBody,
    ) -> KernelResult<()> {
        let config = ServiceConfig::new(id, name).privilege(privilege);
        let config = if period.is_zero() {
            config.sporadic(deadline, wcet)
        } else {
            config.periodic(period, deadline, wcet)
        };
        self.register_service(config, body)
    }

    /// Start the kernel: every `Init` service becomes `Running`
    pub fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        self.uptime = Duration::ZERO;
        for service in self.services.iter_mut() {
            if service.state() == ServiceState::Init {
                let _ = service.transition(ServiceState::Running);
            }
        }
        self.watchdog.reset_all(self.now);
        if self.config.hardware_watchdog_enabled {
            self.watchdog
                .enable_hardware(self.config.hardware_watchdog_timeout, self.now);
        }
        klog!(info, "kernel", "started with {} services", self.services.len());
        self.record(EventKind::KernelStarted, None, heapless::String::new());
    }

    /// Stop the kernel: every service becomes `Stopped`
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        for service in self.services.iter_mut() {
            let _ = service.transition(ServiceState::Stopped);
        }
        self.scheduler.reset();
        self.ipc.cancel_all_waits();
        klog!(info, "kernel", "stopped after {} ticks", self.tick_count);
        self.record(EventKind::KernelStopped, None, heapless::String::new());
    }

    /// Advance by one configured tick
    pub fn step(&mut self) {
        self.tick(self.config.tick_rate);
    }

    /// Advance simulated time by `dt` and run one tick
    pub fn tick(&mut self, dt: Duration) {
        if !self.running {
            return;
        }
        self.tick_count += 1;
        self.now += dt;
        self.uptime += dt;
        let now = self.now;

        self.interrupts.dispatch();

        for id in self.ipc.poll_waits(now) {
            if let Some(service) = self.services.get_mut(id) {
                if service.state() == ServiceState::Blocked && service.transition(ServiceState::Running).is_ok() {
                    self.scheduler.unblock(id);
                }
            }
        }

        let selected = self.scheduler.schedule(&mut self.services, now);
        self.handle_scheduler_misses();
        if let Some(id) = selected {
            self.execute(id, dt);
        }

        for id in self.watchdog.check(now) {
            if matches!(
                self.services.state(id),
                Some(ServiceState::Running | ServiceState::Blocked)
            ) {
                klog!(warn, id, "watchdog expired");
                self.fault(id, FaultKind::Watchdog);
            }
        }
        if self.watchdog.check_hardware(now) {
            klog!(error, "kernel", "hardware watchdog expired");
            self.record(EventKind::HardwareWatchdogExpired, None, heapless::String::new());
        }

        if self.supervisor_enabled {
            self.process_restarts();
            self.watchdog.kick_hardware(now);
        }
    }

    fn handle_scheduler_misses(&mut self) {
        let mut late = heapless::Vec::<ServiceId, MAX_SERVICES>::new();
        for miss in self.scheduler.recent_misses() {
            klog!(warn, miss.service, "deadline {:?} missed before dispatch", miss.deadline);
            self.events.record(KernelEvent {
                timestamp: self.now,
                kind: EventKind::DeadlineMiss,
                service: Some(miss.service),
                detail: detail!("released job expired at {:?}", miss.deadline),
            });
            if !late.contains(&miss.service) {
                let _ = late.push(miss.service);
            }
        }
        if self.config.fault_on_deadline_miss {
            for id in late {
                self.fault(id, FaultKind::DeadlineMiss);
            }
        }
    }

    fn execute(&mut self, id: ServiceId, dt: Duration) {
        let now = self.now;
        let mpu_enabled = self.config.mpu_enabled;
        let Some(service) = self.services.get_mut(id) else {
            self.scheduler.abort_current();
            return;
        };
        if service.state() != ServiceState::Running {
            self.scheduler.abort_current();
            return;
        }
        let privilege = service.privilege();
        let stack_size = service.config().stack_size;
        let Some(mut body) = service.body.take() else {
            self.scheduler.abort_current();
            return;
        };

        if mpu_enabled && !self.mpu.validate_service_region(id, privilege) {
            if let Some(service) = self.services.get_mut(id) {
                service.body = Some(body);
            }
            self.scheduler.abort_current();
            self.fault(id, FaultKind::MpuViolation);
            return;
        }

        let (result, denied, stack_used, blocked) = match self.services.get(id) {
            Some(service) => {
                let mut ctx = TaskContext::new(service, &mut self.ipc, &mut self.mpu, now, mpu_enabled);
                let result = body(&mut ctx, dt);
                (result, ctx.denied, ctx.stack_used, ctx.blocked)
            }
            None => return,
        };

        let Some(service) = self.services.get_mut(id) else {
            return;
        };
        service.body = Some(body);
        if let Some(bytes) = stack_used {
            service.record_stack_usage(bytes);
        }

        let fault = if denied {
            Some(FaultKind::MpuViolation)
        } else if let Err(err) = &result {
            klog!(warn, id, "task failed: {}", err);
            Some(err.fault_kind())
        } else if stack_used.is_some_and(|bytes| bytes > stack_size) {
            Some(FaultKind::StackOverflow)
        } else {
            None
        };
        if let Some(kind) = fault {
            self.scheduler.abort_current();
            self.fault(id, kind);
            return;
        }

        service.record_execution(dt, now);
        let overran = dt > service.deadline();
        if overran {
            service.record_deadline_miss();
        }
        if blocked {
            let _ = service.transition(ServiceState::Blocked);
            self.scheduler.block_current(dt);
        } else {
            self.scheduler.complete_current(dt);
        }
        if overran {
            klog!(warn, id, "runtime {:?} exceeds deadline", dt);
            self.record(EventKind::DeadlineMiss, Some(id), detail!("runtime {:?}", dt));
        }

        if self.watchdog.is_registered(id) && !self.watchdog.kick(id, now) {
            self.fault(id, FaultKind::Watchdog);
            return;
        }
        if overran && self.config.fault_on_deadline_miss {
            self.fault(id, FaultKind::DeadlineMiss);
            return;
        }
        self.reincarnation.notify_success(id, now);
    }

    fn fault(&mut self, id: ServiceId, kind: FaultKind) {
        let now = self.now;
        let Some(service) = self.services.get_mut(id) else {
            return;
        };
        if service.transition(ServiceState::Faulted).is_err() {
            return;
        }
        service.last_fault = Some(kind);
        service.runtime.fault_count += 1;
        let critical = service.is_critical();
        self.fault_count += 1;

        self.ipc.cancel_wait(id);
        self.scheduler.forget(id);
        klog!(warn, id, "faulted: {}", kind);
        self.record(EventKind::ServiceFaulted, Some(id), detail!("{}", kind));

        match self.reincarnation.on_service_fault(id, kind, now) {
            FaultDecision::Scheduled { delay, .. } => {
                self.record(EventKind::RestartScheduled, Some(id), detail!("in {:?}", delay));
            }
            FaultDecision::Permanent => {
                self.ipc.set_open(id, false);
                self.record(EventKind::PermanentFault, Some(id), detail!("{}", kind));
                if critical {
                    klog!(error, id, "critical service lost");
                    self.record(EventKind::CriticalServiceLost, Some(id), heapless::String::new());
                }
            }
            FaultDecision::AlreadyPermanent => {}
        }
    }

    fn process_restarts(&mut self) {
        let now = self.now;
        for id in self.reincarnation.take_due(now) {
            if self.services.state(id) != Some(ServiceState::Faulted) {
                continue;
            }
            self.reincarnation.begin_restart(id, now);
            let result = self.restart_service(id);
            if let Err(err) = &result {
                klog!(warn, id, "restart failed: {}", err);
                self.record(EventKind::RestartFailed, Some(id), detail!("{}", err));
            }
            self.reincarnation.record_restart(result.is_ok());
        }
    }

    // ---------------------------------------------------------------------
    // Administrative operations
    // ---------------------------------------------------------------------

    /// Pause `id`; it is neither released nor dispatched until resumed
    pub fn suspend_service(&mut self, id: ServiceId) -> KernelResult<()> {
        self.services.require_mut(id)?.transition(ServiceState::Suspended)?;
        self.ipc.cancel_wait(id);
        self.scheduler.forget(id);
        klog!(info, id, "suspended");
        self.record(EventKind::ServiceSuspended, Some(id), heapless::String::new());
        Ok(())
    }

    /// Resume a suspended service with a fresh watchdog
    pub fn resume_service(&mut self, id: ServiceId) -> KernelResult<()> {
        let service = self.services.require_mut(id)?;
        if service.state() != ServiceState::Suspended {
            return Err(KernelError::InvalidState {
                id,
                from: service.state(),
                to: ServiceState::Running,
            });
        }
        service.transition(ServiceState::Running)?;
        self.watchdog.reset(id, self.now);
        klog!(info, id, "resumed");
        self.record(EventKind::ServiceResumed, Some(id), heapless::String::new());
        Ok(())
    }

    /// Restart `id`: clear its fault, drain its mailbox, back to `Running`.
    ///
    /// Lifetime counters are kept. Restarting a permanently faulted service
    /// also clears the permanent fault and reopens its mailbox.
    pub fn restart_service(&mut self, id: ServiceId) -> KernelResult<()> {
        let now = self.now;
        let service = self.services.require_mut(id)?;
        service.transition(ServiceState::Restarting)?;
        service.last_fault = None;
        service.runtime.last_run = now;
        service.transition(ServiceState::Running)?;

        if self.reincarnation.is_permanently_faulted(id) {
            self.reincarnation.reset_permanent_fault(id);
            self.ipc.set_open(id, true);
            klog!(info, id, "permanent fault cleared by restart");
        }
        self.ipc.cancel_wait(id);
        let drained = self.ipc.flush(id);
        self.scheduler.forget(id);
        self.watchdog.reset(id, now);
        klog!(info, id, "restarted ({} messages drained)", drained);
        self.record(EventKind::ServiceRestarted, Some(id), heapless::String::new());
        Ok(())
    }

    /// Force `id` into `Faulted(kind)` through the normal fault path
    pub fn inject_fault(&mut self, id: ServiceId, kind: FaultKind) -> KernelResult<()> {
        let state = self.services.require(id)?.state();
        if !state.can_transition_to(ServiceState::Faulted) {
            return Err(KernelError::InvalidState {
                id,
                from: state,
                to: ServiceState::Faulted,
            });
        }
        klog!(info, id, "injecting {}", kind);
        self.fault(id, kind);
        Ok(())
    }

    /// Re-enable automatic restarts of a permanently faulted service.
    ///
    /// Its mailbox reopens; the service itself stays `Faulted` until restarted.
    pub fn reset_permanent_fault(&mut self, id: ServiceId) -> KernelResult<()> {
        self.services.require(id)?;
        self.reincarnation.reset_permanent_fault(id);
        self.ipc.set_open(id, true);
        klog!(info, id, "permanent fault cleared");
        self.record(EventKind::PermanentFaultCleared, Some(id), heapless::String::new());
        Ok(())
    }

    /// Override the restart policy of `id`
    pub fn set_restart_policy(&mut self, id: ServiceId, policy: RestartPolicy) {
        self.reincarnation.set_policy(id, policy);
    }

    /// Replace the watchdog of `id` with a window watchdog
    pub fn set_window_watchdog(&mut self, id: ServiceId, start: Duration, end: Duration) -> KernelResult<()> {
        self.services.require(id)?;
        if start >= end {
            return Err(KernelError::InvalidParameter("window start must precede its end"));
        }
        self.watchdog.register_window(id, start, end, self.now);
        Ok(())
    }

    /// Arm the hardware watchdog
    pub fn enable_hardware_watchdog(&mut self, timeout: Duration) {
        self.watchdog.enable_hardware(timeout, self.now);
    }

    /// Model a responsive (or hung) supervisor; a hung one stops restarting
    /// services and kicking the hardware watchdog
    pub fn set_supervisor_enabled(&mut self, enabled: bool) {
        self.supervisor_enabled = enabled;
    }

    /// Give `id` an owned memory region
    pub fn allocate_service_region(&mut self, id: ServiceId, name: &str, base: u32, size: u32) -> KernelResult<MemoryRegion> {
        let privilege = self.services.require(id)?.privilege();
        Ok(self.mpu.allocate_service_region(id, privilege, name, base, size)?)
    }

    /// Release a sporadic job of `id` due within its relative deadline
    pub fn submit_sporadic(&mut self, id: ServiceId) -> KernelResult<()> {
        let service = self.services.require(id)?;
        if service.state() != ServiceState::Running {
            return Err(crate::scheduler::SchedulerError::NotRunning(id).into());
        }
        let (wcet, deadline) = (service.wcet(), self.now + service.deadline());
        self.scheduler.submit_sporadic(id, wcet, deadline, self.now)?;
        Ok(())
    }

    /// Install an interrupt handler at `priority` (0 highest, 3 lowest)
    pub fn register_isr(&mut self, priority: u8, name: &'static str, handler: IsrHandler) -> KernelResult<()> {
        Ok(self.interrupts.register(priority, name, handler)?)
    }

    /// Mark an interrupt pending; it runs at the start of the next tick
    pub fn trigger_isr(&mut self, priority: u8) -> KernelResult<()> {
        self.interrupts.trigger(priority)?;
        self.record(EventKind::InterruptTriggered, None, detail!("P{}", priority));
        Ok(())
    }

    // ---------------------------------------------------------------------
    // IPC
    // ---------------------------------------------------------------------

    /// Non-blocking send
    pub fn send(&mut self, message: Message) -> KernelResult<u32> {
        Ok(self.ipc.send(message, self.now)?)
    }

    /// Request/response send; a running sender becomes `Blocked` until the
    /// reply or the timeout
    pub fn send_sync(&mut self, message: Message) -> KernelResult<ReplyTicket> {
        let sender = message.sender;
        let ticket = self.ipc.send_sync(message, self.now)?;
        self.block(sender);
        Ok(ticket)
    }

    /// Non-blocking receive
    pub fn receive(&mut self, id: ServiceId) -> Option<Message> {
        self.ipc.receive(id)
    }

    /// Receive, or block `id` for at most `timeout`
    pub fn receive_blocking(&mut self, id: ServiceId, timeout: Duration) -> KernelResult<Option<Message>> {
        let received = self.ipc.receive_blocking(id, timeout, self.now)?;
        if received.is_none() {
            self.block(id);
        }
        Ok(received)
    }

    fn block(&mut self, id: ServiceId) {
        if let Some(service) = self.services.get_mut(id) {
            if service.state() == ServiceState::Running {
                let _ = service.transition(ServiceState::Blocked);
            }
        }
    }

    /// Answer `request` with `payload`
    pub fn reply(&mut self, request: &Message, payload: Payload) -> KernelResult<()> {
        Ok(self.ipc.reply(request, payload, self.now)?)
    }

    /// Best-effort broadcast; returns the number of mailboxes reached
    pub fn broadcast(&mut self, message: Message) -> usize {
        self.ipc.broadcast(message, self.now)
    }

    /// Collect the outcome of a completed blocking call of `id`
    pub fn take_wait_result(&mut self, id: ServiceId) -> Option<IpcResult<Message>> {
        self.ipc.take_result(id)
    }

    // ---------------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------------

    /// Active configuration
    pub const fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Kernel is running
    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// Simulated time
    pub const fn now(&self) -> Duration {
        self.now
    }

    /// Time since the last start
    pub const fn uptime(&self) -> Duration {
        self.uptime
    }

    /// Ticks executed
    pub const fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Faults recorded across all services
    pub const fn fault_count(&self) -> u64 {
        self.fault_count
    }

    /// Service `id`
    pub fn service(&self, id: ServiceId) -> Option<&Service> {
        self.services.get(id)
    }

    /// Services in id order
    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.iter()
    }

    /// Statistics of service `id`
    pub fn service_stats(&self, id: ServiceId) -> Option<ServiceStats> {
        self.services.get(id).map(Service::stats)
    }

    /// Up to `count` most recent events, oldest first
    pub fn recent_events(&self, count: usize) -> Vec<KernelEvent> {
        self.events.recent(count)
    }

    /// Event log
    pub const fn events(&self) -> &EventLog {
        &self.events
    }

    /// Scheduler
    pub const fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// MPU
    pub const fn mpu(&self) -> &Mpu {
        &self.mpu
    }

    /// MPU, for host-driven checks and region setup
    pub const fn mpu_mut(&mut self) -> &mut Mpu {
        &mut self.mpu
    }

    /// IPC manager
    pub const fn ipc(&self) -> &IpcManager {
        &self.ipc
    }

    /// Watchdog manager
    pub const fn watchdog(&self) -> &WatchdogManager {
        &self.watchdog
    }

    /// Reincarnation server
    pub const fn reincarnation(&self) -> &ReincarnationServer {
        &self.reincarnation
    }

    /// Interrupt table
    pub const fn interrupts(&self) -> &IsrTable {
        &self.interrupts
    }

    /// EDF utilization of the running periodic services
    pub fn utilization(&self) -> f64 {
        self.scheduler.utilization(&self.services)
    }

    /// The running task set passes the EDF utilization test
    pub fn is_schedulable(&self) -> bool {
        self.scheduler.is_schedulable(&self.services)
    }

    /// Aggregated statistics snapshot
    pub fn stats(&self) -> KernelStats {
        KernelStats {
            platform: target_platform::PLATFORM_TYPE,
            capabilities: target_platform::CAPABILITIES,
            running: self.running,
            tick_count: self.tick_count,
            uptime: self.uptime,
            now: self.now,
            fault_count: self.fault_count,
            utilization: self.utilization(),
            events_logged: self.events.total(),
            services: self.services.iter().map(Service::stats).collect(),
            scheduler: self.scheduler.stats(),
            mpu: self.mpu.stats(),
            ipc: self.ipc.stats(),
            watchdog: self.watchdog.stats(),
            reincarnation: self.reincarnation.stats(),
        }
    }
}

impl RestartTarget for Kernel {
    fn restart_service(&mut self, id: ServiceId) -> KernelResult<()> {
        Self::restart_service(self, id)
    }
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::ipc::IpcError;
    use crate::memory::AccessFlags;
    use crate::platform::target_platform::memory_layout;
    use crate::service::TaskError;

    const SVC: ServiceId = ServiceId::THERMAL;
    const PEER: ServiceId = ServiceId::LOGGER;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn idle() -> TaskBody {
        Box::new(|_, _| Ok(()))
    }

    fn periodic(kernel: &mut Kernel, id: ServiceId, body: TaskBody) {
        kernel
            .create_service(id, "svc", Privilege::Service, ms(10), ms(10), ms(1), body)
            .unwrap();
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
    fn lifecycle_follows_start_and_stop() {
        let mut kernel = Kernel::new();
        periodic(&mut kernel, SVC, idle());
        assert_eq!(state(&kernel, SVC), ServiceState::Init);
        kernel.tick(ms(1));
        assert_eq!(kernel.tick_count(), 0);

        kernel.start();
        assert_eq!(state(&kernel, SVC), ServiceState::Running);
        periodic(&mut kernel, PEER, idle());
        assert_eq!(state(&kernel, PEER), ServiceState::Running);

        run(&mut kernel, 20);
        assert_eq!(kernel.uptime(), ms(20));
        kernel.stop();
        assert_eq!(state(&kernel, SVC), ServiceState::Stopped);
        assert!(kernel.inject_fault(SVC, FaultKind::Exception).is_err());
    }

    #[test]
    fn registration_is_validated() {
        let mut kernel = Kernel::new();
        periodic(&mut kernel, SVC, idle());
        assert_eq!(
            kernel.create_service(SVC, "dup", Privilege::Service, ms(10), ms(10), ms(1), idle()),
            Err(KernelError::AlreadyRegistered(SVC))
        );
        assert!(kernel
            .create_service(ServiceId::KERNEL, "k", Privilege::Kernel, ms(10), ms(10), ms(1), idle())
            .is_err());
        assert!(kernel
            .register_service(ServiceConfig::new(PEER, "peer").sporadic(ms(1), ms(1)).mailbox_capacity(0), idle())
            .is_err());
        assert!(Kernel::with_config(KernelConfig {
            tick_rate: Duration::ZERO,
            ..KernelConfig::default()
        })
        .is_err());
    }

    #[test]
    fn body_error_faults_and_restarts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut kernel = Kernel::new();
        periodic(
            &mut kernel,
            SVC,
            Box::new(move |_, _| {
                if counter.fetch_add(1, Ordering::Relaxed) == 0 {
                    Err(TaskError::Exception("boom"))
                } else {
                    Ok(())
                }
            }),
        );
        kernel.start();
        kernel.tick(ms(1));
        let service = kernel.service(SVC).unwrap();
        assert_eq!(service.state(), ServiceState::Faulted);
        assert_eq!(service.last_fault(), Some(FaultKind::Exception));
        assert_eq!(kernel.reincarnation().pending_restart(SVC), Some(ms(11)));

        run(&mut kernel, 10);
        let service = kernel.service(SVC).unwrap();
        assert_eq!(service.state(), ServiceState::Running);
        assert_eq!(service.last_fault(), None);
        assert_eq!(service.runtime().fault_count, 1);
        run(&mut kernel, 1);
        assert_eq!(kernel.service(SVC).unwrap().runtime().execution_count, 1);
        assert_eq!(kernel.fault_count(), 1);
        assert!(kernel
            .recent_events(EVENT_LOG_CAPACITY)
            .iter()
            .any(|event| event.kind == EventKind::ServiceRestarted));
    }

    #[test]
    fn denied_access_in_body_is_an_mpu_fault() {
        let mut kernel = Kernel::new();
        periodic(
            &mut kernel,
            SVC,
            Box::new(|ctx, _| {
                ctx.check_access(memory_layout::PERIPHERAL_BASE, AccessFlags::WRITE);
                Ok(())
            }),
        );
        kernel.start();
        kernel.tick(ms(1));
        assert_eq!(kernel.service(SVC).unwrap().last_fault(), Some(FaultKind::MpuViolation));
        assert_eq!(kernel.mpu().violation_count(), 1);
    }

    #[test]
    fn stack_above_budget_is_an_overflow() {
        let mut kernel = Kernel::new();
        kernel
            .register_service(
                ServiceConfig::new(SVC, "svc")
                    .periodic(ms(10), ms(10), ms(1))
                    .stack_size(256),
                Box::new(|ctx, _| {
                    ctx.report_stack_usage(512);
                    Ok(())
                }),
            )
            .unwrap();
        kernel.start();
        kernel.tick(ms(1));
        let service = kernel.service(SVC).unwrap();
        assert_eq!(service.last_fault(), Some(FaultKind::StackOverflow));
        assert_eq!(service.runtime().stack_high_water, 512);
    }

    #[test]
    fn region_shadowed_by_a_foreign_owner_fails_validation() {
        let mut kernel = Kernel::new();
        periodic(&mut kernel, SVC, idle());
        periodic(&mut kernel, PEER, idle());
        let region = kernel
            .allocate_service_region(SVC, "thermal_data", memory_layout::HEAP_BASE, 0x400)
            .unwrap();
        assert_eq!(region.owner, Some(SVC));
        kernel
            .allocate_service_region(PEER, "log_buffer", memory_layout::HEAP_BASE, 0x200)
            .unwrap();
        kernel.start();

        // both released at 1 ms: thermal runs first, logger on the next tick
        run(&mut kernel, 2);
        assert_eq!(state(&kernel, SVC), ServiceState::Running);
        assert_eq!(kernel.service(SVC).unwrap().runtime().execution_count, 1);
        assert_eq!(kernel.service(PEER).unwrap().last_fault(), Some(FaultKind::MpuViolation));
        assert_eq!(kernel.service(PEER).unwrap().runtime().execution_count, 0);
    }

    #[test]
    fn silent_service_trips_its_watchdog() {
        let mut kernel = Kernel::new();
        kernel
            .register_service(
                ServiceConfig::new(SVC, "svc")
                    .periodic(ms(50), ms(50), ms(1))
                    .watchdog_timeout(ms(20)),
                idle(),
            )
            .unwrap();
        kernel.start();
        run(&mut kernel, 20);
        assert_eq!(state(&kernel, SVC), ServiceState::Running);
        run(&mut kernel, 1);
        assert_eq!(kernel.service(SVC).unwrap().last_fault(), Some(FaultKind::Watchdog));
    }

    #[test]
    fn suspended_service_is_not_supervised() {
        let mut kernel = Kernel::new();
        periodic(&mut kernel, SVC, idle());
        kernel.start();
        run(&mut kernel, 1);
        kernel.suspend_service(SVC).unwrap();
        run(&mut kernel, 50);
        assert_eq!(state(&kernel, SVC), ServiceState::Suspended);
        let executed = kernel.service(SVC).unwrap().runtime().execution_count;

        kernel.resume_service(SVC).unwrap();
        assert!(kernel.resume_service(SVC).is_err());
        run(&mut kernel, 1);
        assert_eq!(kernel.service(SVC).unwrap().runtime().execution_count, executed + 1);
        assert_eq!(kernel.fault_count(), 0);
    }

    #[test]
    fn blocking_call_times_out() {
        let mut kernel = Kernel::with_config(KernelConfig {
            ipc_timeout: ms(5),
            ..KernelConfig::default()
        })
        .unwrap();
        let outcome = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&outcome);
        periodic(
            &mut kernel,
            SVC,
            Box::new(move |ctx, _| {
                match ctx.take_wait_result() {
                    Some(Err(IpcError::Timeout)) => seen.store(2, Ordering::Relaxed),
                    Some(_) => seen.store(3, Ordering::Relaxed),
                    None => {
                        ctx.call(PEER, Payload::new())?;
                        seen.store(1, Ordering::Relaxed);
                    }
                }
                Ok(())
            }),
        );
        periodic(&mut kernel, PEER, idle());
        kernel.start();
        kernel.tick(ms(1));
        assert_eq!(state(&kernel, SVC), ServiceState::Blocked);
        assert_eq!(outcome.load(Ordering::Relaxed), 1);

        run(&mut kernel, 5);
        assert_eq!(state(&kernel, SVC), ServiceState::Running);
        run(&mut kernel, 5);
        assert_eq!(outcome.load(Ordering::Relaxed), 2);
        assert_eq!(kernel.ipc().stats().timeouts, 1);
    }

    #[test]
    fn request_reply_between_services() {
        let mut kernel = Kernel::new();
        periodic(&mut kernel, SVC, idle());
        periodic(&mut kernel, PEER, idle());
        let request = Message::request(SVC, PEER, Payload::from_bytes(&[1]).unwrap());
        let ticket = kernel.send_sync(request).unwrap();
        let received = kernel.receive(PEER).unwrap();
        assert_eq!(received.sequence, ticket.sequence);
        kernel.reply(&received, Payload::from_bytes(&[2]).unwrap()).unwrap();

        kernel.start();
        kernel.tick(ms(1));
        let response = kernel.take_wait_result(SVC).unwrap().unwrap();
        assert_eq!(response.payload.as_bytes(), [2]);
        assert_eq!(response.sequence, ticket.sequence);
        assert_eq!(kernel.reply(&received, Payload::new()), Err(KernelError::Ipc(IpcError::NoReplySlot)));
    }

    #[test]
    fn interrupts_run_before_dispatch() {
        let fired = Arc::new(AtomicU32::new(0));
        let hits = Arc::clone(&fired);
        let mut kernel = Kernel::new();
        kernel
            .register_isr(crate::interrupt::ISR_SAFETY, "ocp", Box::new(move || {
                hits.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();
        assert!(kernel.register_isr(9, "bad", Box::new(|| {})).is_err());
        kernel.start();
        kernel.trigger_isr(crate::interrupt::ISR_SAFETY).unwrap();
        kernel.tick(ms(1));
        kernel.tick(ms(1));
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert!(kernel.trigger_isr(crate::interrupt::ISR_ADC).is_err());
    }

    #[test]
    fn hung_supervisor_lets_the_hardware_watchdog_expire() {
        let mut kernel = Kernel::new();
        kernel.enable_hardware_watchdog(ms(5));
        kernel.start();
        run(&mut kernel, 10);
        assert!(!kernel.watchdog().hardware_expired());

        kernel.set_supervisor_enabled(false);
        run(&mut kernel, 5);
        assert!(kernel.watchdog().hardware_expired());
        assert!(kernel
            .recent_events(4)
            .iter()
            .any(|event| event.kind == EventKind::HardwareWatchdogExpired));
    }

    #[test]
    fn permanent_fault_closes_the_mailbox_until_reset() {
        let mut kernel = Kernel::new();
        kernel
            .register_service(
                ServiceConfig::new(SVC, "svc").periodic(ms(10), ms(10), ms(1)).critical(),
                idle(),
            )
            .unwrap();
        kernel.set_restart_policy(
            SVC,
            RestartPolicy {
                max_restarts: 0,
                ..RestartPolicy::default()
            },
        );
        kernel.start();
        kernel.inject_fault(SVC, FaultKind::Assert).unwrap();
        assert!(kernel.reincarnation().is_permanently_faulted(SVC));
        assert!(!kernel.ipc().is_registered(SVC));
        assert!(kernel
            .recent_events(3)
            .iter()
            .any(|event| event.kind == EventKind::CriticalServiceLost));

        kernel.reset_permanent_fault(SVC).unwrap();
        assert!(kernel.ipc().is_registered(SVC));
        kernel.restart_service(SVC).unwrap();
        assert_eq!(state(&kernel, SVC), ServiceState::Running);
    }

    #[test]
    fn manual_restart_clears_a_permanent_fault() {
        let mut kernel = Kernel::new();
        periodic(&mut kernel, SVC, idle());
        kernel.set_restart_policy(
            SVC,
            RestartPolicy {
                max_restarts: 0,
                ..RestartPolicy::default()
            },
        );
        kernel.start();
        kernel.inject_fault(SVC, FaultKind::Exception).unwrap();
        assert!(kernel.reincarnation().is_permanently_faulted(SVC));

        kernel.restart_service(SVC).unwrap();
        assert_eq!(state(&kernel, SVC), ServiceState::Running);
        assert!(!kernel.reincarnation().is_permanently_faulted(SVC));
        assert!(kernel.ipc().is_registered(SVC));
        kernel
            .send(Message::notification(PEER, SVC, Payload::new()))
            .unwrap();

        // the next fault is judged again instead of being ignored
        kernel.inject_fault(SVC, FaultKind::Exception).unwrap();
        let permanent = kernel
            .recent_events(EVENT_LOG_CAPACITY)
            .iter()
            .filter(|event| event.kind == EventKind::PermanentFault)
            .count();
        assert_eq!(permanent, 2);
        assert!(!kernel.ipc().is_registered(SVC));
    }

    #[test]
    fn deadline_miss_fault_is_not_a_success() {
        let config = KernelConfig {
            fault_on_deadline_miss: true,
            ..KernelConfig::default()
        };
        let mut kernel = Kernel::with_config(config).unwrap();
        kernel
            .register_service(
                ServiceConfig::new(SVC, "svc").periodic(ms(10), ms(1), ms(1)),
                idle(),
            )
            .unwrap();
        kernel.start();
        kernel.tick(ms(2));

        let service = kernel.service(SVC).unwrap();
        assert_eq!(service.state(), ServiceState::Faulted);
        assert_eq!(service.last_fault(), Some(FaultKind::DeadlineMiss));
        assert_eq!(kernel.reincarnation().history(SVC).unwrap().last_success, None);
    }

    #[test]
    fn stats_serialize() {
        let mut kernel = Kernel::new();
        periodic(&mut kernel, SVC, idle());
        kernel.start();
        run(&mut kernel, 10);
        let stats = kernel.stats();
        assert_eq!(stats.services.len(), 1);
        assert!((stats.utilization - 0.1).abs() < 1e-9);
        let mut buf = [0u8; 1024];
        assert!(postcard::to_slice(&stats, &mut buf).is_ok());
    }
}
