//! Service Management Subsystem
//!
//! A service is the unit the kernel schedules, protects, supervises and
//! restarts: a task body plus its timing contract (period, relative deadline,
//! WCET), its privilege level and its runtime bookkeeping.
//!
//! # Service States
//!
//! ```text
//! Init -> Running <-> Suspended
//!            |  ^---> Blocked
//!            v
//!         Faulted -> Restarting -> Running
//!
//! any -> Stopped (terminal)
//! ```

use alloc::boxed::Box;
use core::fmt;
use core::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::ipc::IpcError;
use crate::memory::Privilege;
use crate::safety::FaultKind;
use crate::{KernelError, KernelResult};

pub mod context;

pub use context::TaskContext;

/// Maximum number of services per kernel
pub const MAX_SERVICES: usize = 16;

/// Maximum service name length
pub const SERVICE_NAME_LEN: usize = 32;

/// Default stack budget in bytes
pub const DEFAULT_STACK_SIZE: usize = 2048;

/// Service identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(u8);

impl ServiceId {
    /// The kernel itself (never a schedulable service)
    pub const KERNEL: Self = Self(0);
    /// Power conversion control loop
    pub const POWER_CONTROL: Self = Self(1);
    /// Thermal management
    pub const THERMAL: Self = Self(2);
    /// Swarm coordination
    pub const SWARM: Self = Self(3);
    /// Module heartbeat
    pub const HEARTBEAT: Self = Self(4);
    /// Event logger
    pub const LOGGER: Self = Self(5);
    /// Diagnostics
    pub const DIAGNOSTICS: Self = Self(6);
    /// CAN bus driver
    pub const CAN: Self = Self(7);
    /// Over-the-air update
    pub const OTA: Self = Self(8);
    /// Vehicle-to-grid negotiation
    pub const V2G: Self = Self(9);

    /// Create a new service ID
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Slot index in per-service tables
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Name of a well-known EK3 service
    pub const fn well_known_name(self) -> Option<&'static str> {
        match self.0 {
            0 => Some("kernel"),
            1 => Some("power_control"),
            2 => Some("thermal"),
            3 => Some("swarm"),
            4 => Some("heartbeat"),
            5 => Some("logger"),
            6 => Some("diagnostics"),
            7 => Some("can"),
            8 => Some("ota"),
            9 => Some("v2g"),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.well_known_name() {
            Some(name) => f.write_str(name),
            None => write!(f, "service_{}", self.0),
        }
    }
}

/// Service lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceState {
    /// Registered, kernel not started yet
    Init,
    /// Eligible for release and dispatch
    Running,
    /// Administratively paused
    Suspended,
    /// Waiting on IPC
    Blocked,
    /// Stopped by a fault, awaiting restart
    Faulted,
    /// Being restarted
    Restarting,
    /// Terminal
    Stopped,
}

impl ServiceState {
    /// Lower-case name
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Blocked => "blocked",
            Self::Faulted => "faulted",
            Self::Restarting => "restarting",
            Self::Stopped => "stopped",
        }
    }

    /// Lifecycle edges the kernel may take
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ServiceState::{Blocked, Faulted, Init, Restarting, Running, Stopped, Suspended};

        match (self, next) {
            (Stopped, _) => false,
            (_, Stopped) => true,
            (Init, Running)
            | (Running, Suspended | Blocked | Faulted)
            | (Suspended, Running | Faulted)
            | (Blocked, Running | Suspended | Faulted)
            | (Init | Faulted | Restarting, Faulted)
            | (Faulted | Running | Suspended | Blocked, Restarting)
            | (Restarting, Running) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors a task body can return
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// Generic failure of the body
    #[error("exception: {0}")]
    Exception(&'static str),
    /// A runtime assertion inside the body failed
    #[error("assertion failed: {0}")]
    Assert(&'static str),
    /// An IPC call the body depended on failed
    #[error("ipc: {0}")]
    Ipc(#[from] IpcError),
}

impl TaskError {
    /// Fault kind the kernel records for this error
    pub const fn fault_kind(&self) -> FaultKind {
        match self {
            Self::Exception(_) => FaultKind::Exception,
            Self::Assert(_) => FaultKind::Assert,
            Self::Ipc(_) => FaultKind::Communication,
        }
    }
}

/// Task body: invoked once per dispatch with the tick length
pub type TaskBody = Box<dyn FnMut(&mut TaskContext<'_>, Duration) -> Result<(), TaskError> + Send>;

/// Static description of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Service id
    pub id: ServiceId,
    /// Service name
    pub name: heapless::String<SERVICE_NAME_LEN>,
    /// Privilege level
    pub privilege: Privilege,
    /// Release period (zero for sporadic services)
    pub period: Duration,
    /// Relative deadline
    pub deadline: Duration,
    /// Worst-case execution time
    pub wcet: Duration,
    /// Stack budget in bytes
    pub stack_size: usize,
    /// Loss of this service is escalated
    pub critical: bool,
    /// Watchdog timeout override
    pub watchdog_timeout: Option<Duration>,
    /// Mailbox depth override
    pub mailbox_capacity: Option<usize>,
}

impl ServiceConfig {
    /// Sporadic, unprivileged service with default budgets
    pub fn new(id: ServiceId, name: &str) -> Self {
        Self {
            id,
            name: crate::bounded_str(name),
            privilege: Privilege::Service,
            period: Duration::ZERO,
            deadline: Duration::ZERO,
            wcet: Duration::ZERO,
            stack_size: DEFAULT_STACK_SIZE,
            critical: false,
            watchdog_timeout: None,
            mailbox_capacity: None,
        }
    }

    /// Set the privilege level
    #[must_use]
    pub fn privilege(mut self, privilege: Privilege) -> Self {
        self.privilege = privilege;
        self
    }

    /// Periodic timing contract
    #[must_use]
    pub fn periodic(mut self, period: Duration, deadline: Duration, wcet: Duration) -> Self {
        self.period = period;
        self.deadline = deadline;
        self.wcet = wcet;
        self
    }

    /// Sporadic timing contract
    #[must_use]
    pub fn sporadic(mut self, deadline: Duration, wcet: Duration) -> Self {
        self.period = Duration::ZERO;
        self.deadline = deadline;
        self.wcet = wcet;
        self
    }

    /// Set the stack budget
    #[must_use]
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Mark the service as critical
    #[must_use]
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// Override the watchdog timeout
    #[must_use]
    pub fn watchdog_timeout(mut self, timeout: Duration) -> Self {
        self.watchdog_timeout = Some(timeout);
        self
    }

    /// Override the mailbox depth
    #[must_use]
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = Some(capacity);
        self
    }

    /// Reject descriptors the kernel cannot honor
    pub fn validate(&self) -> KernelResult<()> {
        if self.id.index() >= MAX_SERVICES {
            return Err(KernelError::InvalidParameter("service id out of range"));
        }
        if self.id == ServiceId::KERNEL {
            return Err(KernelError::InvalidParameter("service id 0 is reserved for the kernel"));
        }
        if self.deadline.is_zero() {
            return Err(KernelError::InvalidParameter("deadline must be non-zero"));
        }
        if !self.period.is_zero() && self.deadline > self.period {
            return Err(KernelError::InvalidParameter("deadline exceeds period"));
        }
        if self.wcet > self.deadline {
            return Err(KernelError::InvalidParameter("wcet exceeds deadline"));
        }
        Ok(())
    }
}

/// Runtime counters of a service
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRuntime {
    /// Successful executions
    pub execution_count: u64,
    /// Sum of execution time
    pub total_runtime: Duration,
    /// Last execution time
    pub last_runtime: Duration,
    /// Missed deadlines (late release or runtime overrun)
    pub deadline_misses: u64,
    /// Timestamp of the last execution or restart
    pub last_run: Duration,
    /// Faults recorded
    pub fault_count: u32,
    /// Largest stack usage reported by the body
    pub stack_high_water: usize,
}

/// A registered service
pub struct Service {
    pub(crate) config: ServiceConfig,
    pub(crate) state: ServiceState,
    pub(crate) last_fault: Option<FaultKind>,
    pub(crate) runtime: ServiceRuntime,
    pub(crate) body: Option<TaskBody>,
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("last_fault", &self.last_fault)
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}

impl Service {
    /// Create a service in `Init`
    pub fn new(config: ServiceConfig, body: TaskBody) -> Self {
        Self {
            config,
            state: ServiceState::Init,
            last_fault: None,
            runtime: ServiceRuntime::default(),
            body: Some(body),
        }
    }

    /// Service id
    pub const fn id(&self) -> ServiceId {
        self.config.id
    }

    /// Service name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Static description
    pub const fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Privilege level
    pub const fn privilege(&self) -> Privilege {
        self.config.privilege
    }

    /// Release period (zero for sporadic)
    pub const fn period(&self) -> Duration {
        self.config.period
    }

    /// Relative deadline
    pub const fn deadline(&self) -> Duration {
        self.config.deadline
    }

    /// Worst-case execution time
    pub const fn wcet(&self) -> Duration {
        self.config.wcet
    }

    /// Current lifecycle state
    pub const fn state(&self) -> ServiceState {
        self.state
    }

    /// Most recent fault, cleared by a restart
    pub const fn last_fault(&self) -> Option<FaultKind> {
        self.last_fault
    }

    /// Runtime counters
    pub const fn runtime(&self) -> &ServiceRuntime {
        &self.runtime
    }

    /// Loss of this service is escalated
    pub const fn is_critical(&self) -> bool {
        self.config.critical
    }

    /// Periodic services are released by the scheduler
    pub const fn is_periodic(&self) -> bool {
        !self.config.period.is_zero()
    }

    /// Move to `next`, enforcing the lifecycle graph
    pub(crate) fn transition(&mut self, next: ServiceState) -> KernelResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(KernelError::InvalidState {
                id: self.id(),
                from: self.state,
                to: next,
            });
        }
        klog!(trace, self.config.name, "{} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }

    pub(crate) fn record_execution(&mut self, runtime: Duration, now: Duration) {
        self.runtime.execution_count += 1;
        self.runtime.total_runtime += runtime;
        self.runtime.last_runtime = runtime;
        self.runtime.last_run = now;
    }

    pub(crate) fn record_deadline_miss(&mut self) {
        self.runtime.deadline_misses += 1;
    }

    pub(crate) fn record_stack_usage(&mut self, bytes: usize) {
        self.runtime.stack_high_water = self.runtime.stack_high_water.max(bytes);
    }

    /// Statistics snapshot
    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            id: self.id(),
            name: self.config.name.clone(),
            state: self.state,
            privilege: self.config.privilege,
            execution_count: self.runtime.execution_count,
            total_runtime: self.runtime.total_runtime,
            last_runtime: self.runtime.last_runtime,
            deadline_misses: self.runtime.deadline_misses,
            last_run: self.runtime.last_run,
            last_fault: self.last_fault,
            fault_count: self.runtime.fault_count,
            stack_high_water: self.runtime.stack_high_water,
        }
    }
}

/// Serializable per-service statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    /// Service id
    pub id: ServiceId,
    /// Service name
    pub name: heapless::String<SERVICE_NAME_LEN>,
    /// Lifecycle state
    pub state: ServiceState,
    /// Privilege level
    pub privilege: Privilege,
    /// Successful executions
    pub execution_count: u64,
    /// Sum of execution time
    pub total_runtime: Duration,
    /// Last execution time
    pub last_runtime: Duration,
    /// Missed deadlines
    pub deadline_misses: u64,
    /// Timestamp of the last execution or restart
    pub last_run: Duration,
    /// Most recent fault
    pub last_fault: Option<FaultKind>,
    /// Faults recorded
    pub fault_count: u32,
    /// Largest reported stack usage
    pub stack_high_water: usize,
}

/// Arena of services indexed by id
#[derive(Debug)]
pub struct ServiceTable {
    slots: [Option<Service>; MAX_SERVICES],
}

impl Default for ServiceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceTable {
    /// Empty table
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
        }
    }

    /// Insert a service into its id slot
    pub fn insert(&mut self, service: Service) -> KernelResult<()> {
        let id = service.id();
        let slot = self
            .slots
            .get_mut(id.index())
            .ok_or(KernelError::InvalidParameter("service id out of range"))?;
        if slot.is_some() {
            return Err(KernelError::AlreadyRegistered(id));
        }
        *slot = Some(service);
        Ok(())
    }

    /// Look up a service
    pub fn get(&self, id: ServiceId) -> Option<&Service> {
        self.slots.get(id.index())?.as_ref()
    }

    /// Look up a service mutably
    pub fn get_mut(&mut self, id: ServiceId) -> Option<&mut Service> {
        self.slots.get_mut(id.index())?.as_mut()
    }

    /// Look up a service or fail with `ServiceNotFound`
    pub fn require(&self, id: ServiceId) -> KernelResult<&Service> {
        self.get(id).ok_or(KernelError::ServiceNotFound(id))
    }

    /// Mutable variant of [`Self::require`]
    pub fn require_mut(&mut self, id: ServiceId) -> KernelResult<&mut Service> {
        self.get_mut(id).ok_or(KernelError::ServiceNotFound(id))
    }

    /// A service is registered under `id`
    pub fn contains(&self, id: ServiceId) -> bool {
        self.get(id).is_some()
    }

    /// State of `id`, if registered
    pub fn state(&self, id: ServiceId) -> Option<ServiceState> {
        self.get(id).map(Service::state)
    }

    /// Services in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        self.slots.iter().flatten()
    }

    /// Mutable services in ascending id order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Service> {
        self.slots.iter_mut().flatten()
    }

    /// Number of registered services
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// No services registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
