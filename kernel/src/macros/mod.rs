//! JEZGRO Kernel Macros
//!
//! Logging helpers layered over the `log` facade. Every record goes to the
//! `jezgro` target and is tagged with the service (or subsystem) it concerns,
//! so hosts running many kernel instances can filter per module.

#[doc(hidden)]
pub use log as __log;

/// Log target used by every kernel record
pub const LOG_TARGET: &str = "jezgro";

/// Emit a kernel log record tagged with a service name.
///
/// ```
/// use jezgro::{klog, ServiceId};
/// klog!(info, ServiceId::THERMAL, "released at {}us", 100);
/// ```
#[macro_export]
macro_rules! klog {
    ($level:ident, $tag:expr, $($arg:tt)+) => {
        $crate::macros::__log::$level!(
            target: $crate::macros::LOG_TARGET,
            "[{}] {}",
            $tag,
            format_args!($($arg)+)
        )
    };
}

/// Format an event detail into a bounded string.
macro_rules! detail {
    ($($arg:tt)*) => {
        $crate::bounded_fmt(format_args!($($arg)*))
    };
}
