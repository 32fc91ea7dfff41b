//! Kernel logging facade.
//!
//! The kernel model runs embedded in a host process, so there is no serial
//! port to write to; instead the embedder (or a test) registers a global
//! log function with [`set_log_fn`] and everything emitted through the
//! `klog!` macro family is forwarded to it. Until a function is registered,
//! logging is a silent no-op.
//!
//! The registration is a single atomic function pointer, so it is safe to
//! call from any context, including while kernel locks are held.

use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Kernel log severity level. Lower = more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Fatal: unrecoverable error, the system is about to halt.
    Fatal = 0,
    /// Error: something failed but the system may continue.
    Error = 1,
    /// Warning: unexpected condition, not necessarily an error.
    Warn = 2,
    /// Informational: high-level progress messages.
    Info = 3,
    /// Debug: detailed diagnostic information.
    Debug = 4,
    /// Trace: very verbose, low-level tracing.
    Trace = 5,
}

impl LogLevel {
    /// Returns the human-readable name (fixed-width for aligned output).
    pub const fn name(self) -> &'static str {
        match self {
            Self::Fatal => "FATAL",
            Self::Error => "ERROR",
            Self::Warn => "WARN ",
            Self::Info => "INFO ",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }
}

/// The signature of the global leveled log function.
pub type LogFn = fn(LogLevel, fmt::Arguments<'_>);

fn null_log(_level: LogLevel, _args: fmt::Arguments<'_>) {}

static LOG_FN: AtomicPtr<()> = AtomicPtr::new(null_log as *mut ());

/// Registers the global log function.
///
/// May be called more than once; the last registration wins. Uses `Release`
/// ordering so subsequent loads see the new function.
///
/// # Safety
///
/// The provided function must be safe to call from any context, including
/// while kernel-internal locks are held; in particular it must not call
/// back into the kernel model.
pub unsafe fn set_log_fn(f: LogFn) {
    LOG_FN.store(f as *mut (), Ordering::Release);
}

/// Loads the current log function from the atomic pointer.
#[inline]
fn load_log_fn() -> LogFn {
    let ptr = LOG_FN.load(Ordering::Acquire);
    // SAFETY: We only ever store valid `LogFn` function pointers into LOG_FN.
    unsafe { core::mem::transmute(ptr) }
}

/// Implementation detail for [`klog!`]. Not public API.
#[doc(hidden)]
pub fn _log(level: LogLevel, args: fmt::Arguments<'_>) {
    load_log_fn()(level, args);
}

/// Logs a message at the given level.
#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::_log($level, format_args!($($arg)*))
    };
}

/// Logs a fatal-level message (level 0).
#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Fatal, $($arg)*) };
}

/// Logs an error-level message (level 1).
#[macro_export]
macro_rules! kerr {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Error, $($arg)*) };
}

/// Logs a warning-level message (level 2).
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Warn, $($arg)*) };
}

/// Logs an info-level message (level 3).
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Info, $($arg)*) };
}

/// Logs a debug-level message (level 4).
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Debug, $($arg)*) };
}

/// Logs a trace-level message (level 5).
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Trace, $($arg)*) };
}
