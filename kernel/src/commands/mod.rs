//! Administrative Command Interface
//!
//! Numbered commands a host (or a diagnostics link) issues to a kernel
//! instance. Commands travel as a code plus two raw arguments and come back
//! as a signed result word, so they can cross a CAN frame or a FFI boundary
//! unchanged.
//!
//! # Command Categories
//!
//! - **Kernel lifecycle** (0-9): start, stop
//! - **Service lifecycle** (10-29): suspend, resume, restart, reset permanent fault
//! - **Interrupts** (30-39): trigger
//! - **Fault injection** (40-49): inject
//!
//! # Command Convention
//!
//! ```text
//! - Command code in word 0
//! - Arguments in words 1-2 (service id, then a command-specific value)
//! - Result value >= 0 on success, negated error code on failure
//! ```

use crate::interrupt::InterruptError;
use crate::ipc::IpcError;
use crate::kernel::Kernel;
use crate::safety::FaultKind;
use crate::service::ServiceId;
use crate::KernelError;

/// Number of command arguments
pub const MAX_COMMAND_ARGS: usize = 2;

/// Command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandCode {
    // Kernel lifecycle (0-9)
    /// Start the kernel
    Start = 0,
    /// Stop the kernel
    Stop = 1,

    // Service lifecycle (10-29)
    /// Suspend a service
    Suspend = 10,
    /// Resume a suspended service
    Resume = 11,
    /// Restart a service
    Restart = 12,
    /// Re-enable automatic restarts of a service
    ResetPermanentFault = 13,

    // Interrupts (30-39)
    /// Mark an interrupt level pending
    TriggerIsr = 30,

    // Fault injection (40-49)
    /// Force a fault into a service
    InjectFault = 40,
}

impl TryFrom<u32> for CommandCode {
    type Error = CommandError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Start),
            1 => Ok(Self::Stop),

            10 => Ok(Self::Suspend),
            11 => Ok(Self::Resume),
            12 => Ok(Self::Restart),
            13 => Ok(Self::ResetPermanentFault),

            30 => Ok(Self::TriggerIsr),

            40 => Ok(Self::InjectFault),

            _ => Err(CommandError::InvalidCommand),
        }
    }
}

/// Decoded command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelCommand {
    /// Start the kernel
    Start,
    /// Stop the kernel
    Stop,
    /// Suspend a service
    Suspend(ServiceId),
    /// Resume a service
    Resume(ServiceId),
    /// Restart a service
    Restart(ServiceId),
    /// Re-enable automatic restarts of a service
    ResetPermanentFault(ServiceId),
    /// Trigger the interrupt at a priority level
    TriggerIsr(u8),
    /// Inject a fault into a service
    InjectFault(ServiceId, FaultKind),
}

impl KernelCommand {
    /// Decode a command from its code and raw arguments
    pub fn decode(code: u32, args: [u32; MAX_COMMAND_ARGS]) -> Result<Self, CommandError> {
        let [first, second] = args;
        let service = || {
            u8::try_from(first)
                .map(ServiceId::new)
                .map_err(|_| CommandError::InvalidArgument)
        };
        Ok(match CommandCode::try_from(code)? {
            CommandCode::Start => Self::Start,
            CommandCode::Stop => Self::Stop,
            CommandCode::Suspend => Self::Suspend(service()?),
            CommandCode::Resume => Self::Resume(service()?),
            CommandCode::Restart => Self::Restart(service()?),
            CommandCode::ResetPermanentFault => Self::ResetPermanentFault(service()?),
            CommandCode::TriggerIsr => {
                Self::TriggerIsr(u8::try_from(first).map_err(|_| CommandError::InvalidArgument)?)
            }
            CommandCode::InjectFault => {
                let kind = FaultKind::from_code(second).ok_or(CommandError::InvalidArgument)?;
                Self::InjectFault(service()?, kind)
            }
        })
    }

    /// Code of this command
    pub const fn code(&self) -> CommandCode {
        match self {
            Self::Start => CommandCode::Start,
            Self::Stop => CommandCode::Stop,
            Self::Suspend(_) => CommandCode::Suspend,
            Self::Resume(_) => CommandCode::Resume,
            Self::Restart(_) => CommandCode::Restart,
            Self::ResetPermanentFault(_) => CommandCode::ResetPermanentFault,
            Self::TriggerIsr(_) => CommandCode::TriggerIsr,
            Self::InjectFault(..) => CommandCode::InjectFault,
        }
    }
}

/// Command result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandResult {
    /// Return value (0 or positive for success, negated error code for failure)
    pub value: i64,
}

impl CommandResult {
    /// Create a successful result
    pub const fn ok(value: u32) -> Self {
        Self { value: value as i64 }
    }

    /// Create an error result
    pub const fn err(error: CommandError) -> Self {
        Self {
            value: -(error as i64),
        }
    }

    /// Check if result is successful
    pub const fn is_ok(&self) -> bool {
        self.value >= 0
    }

    /// Check if result is an error
    pub const fn is_err(&self) -> bool {
        self.value < 0
    }

    /// Get error code if this is an error
    pub fn error(&self) -> Option<CommandError> {
        if self.is_err() {
            u32::try_from(-self.value)
                .ok()
                .and_then(|code| CommandError::try_from(code).ok())
        } else {
            None
        }
    }
}

impl From<Result<(), KernelError>> for CommandResult {
    fn from(result: Result<(), KernelError>) -> Self {
        match result {
            Ok(()) => Self::ok(0),
            Err(err) => Self::err(err.into()),
        }
    }
}

/// Command errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandError {
    /// Unknown command code
    InvalidCommand = 1,
    /// Argument out of range
    InvalidArgument = 2,
    /// No such service
    ServiceNotFound = 3,
    /// Service already registered
    AlreadyExists = 4,
    /// Lifecycle transition not allowed
    InvalidState = 5,
    /// Mailbox or queue full
    ResourceBusy = 6,
    /// Timed out
    Timeout = 7,
    /// Communication failure
    IpcError = 8,
    /// Memory protection failure
    MemoryError = 9,
    /// No handler for the interrupt level
    NotSupported = 10,
}

impl TryFrom<u32> for CommandError {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::InvalidCommand),
            2 => Ok(Self::InvalidArgument),
            3 => Ok(Self::ServiceNotFound),
            4 => Ok(Self::AlreadyExists),
            5 => Ok(Self::InvalidState),
            6 => Ok(Self::ResourceBusy),
            7 => Ok(Self::Timeout),
            8 => Ok(Self::IpcError),
            9 => Ok(Self::MemoryError),
            10 => Ok(Self::NotSupported),
            _ => Err(()),
        }
    }
}

impl From<KernelError> for CommandError {
    fn from(error: KernelError) -> Self {
        match error {
            KernelError::ServiceNotFound(_) => Self::ServiceNotFound,
            KernelError::AlreadyRegistered(_) => Self::AlreadyExists,
            KernelError::InvalidState { .. } => Self::InvalidState,
            KernelError::Ipc(IpcError::QueueFull) => Self::ResourceBusy,
            KernelError::Ipc(IpcError::Timeout) => Self::Timeout,
            KernelError::Ipc(_) => Self::IpcError,
            KernelError::Memory(_) => Self::MemoryError,
            KernelError::Scheduler(_) => Self::ResourceBusy,
            KernelError::Interrupt(InterruptError::NotRegistered(_)) => Self::NotSupported,
            KernelError::Interrupt(InterruptError::InvalidPriority(_))
            | KernelError::InvalidParameter(_)
            | KernelError::Config(_) => Self::InvalidArgument,
        }
    }
}

/// Execute `command` against `kernel`
pub fn dispatch(kernel: &mut Kernel, command: KernelCommand) -> CommandResult {
    klog!(debug, "cmd", "{:?}", command);
    match command {
        KernelCommand::Start => {
            kernel.start();
            CommandResult::ok(0)
        }
        KernelCommand::Stop => {
            kernel.stop();
            CommandResult::ok(0)
        }
        KernelCommand::Suspend(id) => kernel.suspend_service(id).into(),
        KernelCommand::Resume(id) => kernel.resume_service(id).into(),
        KernelCommand::Restart(id) => kernel.restart_service(id).into(),
        KernelCommand::ResetPermanentFault(id) => kernel.reset_permanent_fault(id).into(),
        KernelCommand::TriggerIsr(priority) => kernel.trigger_isr(priority).into(),
        KernelCommand::InjectFault(id, kind) => kernel.inject_fault(id, kind).into(),
    }
}

/// Decode and execute a raw command
pub fn dispatch_raw(kernel: &mut Kernel, code: u32, args: [u32; MAX_COMMAND_ARGS]) -> CommandResult {
    match KernelCommand::decode(code, args) {
        Ok(command) => dispatch(kernel, command),
        Err(err) => CommandResult::err(err),
    }
}
