//! Single source of truth for muon syscall definitions.
//!
//! This crate defines everything shared between the kernel and its callers:
//! - Syscall number constants (`SYS_*`) — a stable external contract;
//!   renumbering breaks every existing binary
//! - Error code constants (`E*`), returned negated in the result register
//! - `#[repr(C)]` data structures shared across the boundary
//! - The [`Syscall`] enum with introspection methods
//! - The [`SyscallHandler`] trait and the [`dispatch`] function the trap
//!   path routes through
//! - The [`ExitStatus`] codec (see [`status`])

#![cfg_attr(not(test), no_std)]

mod status;

pub use status::ExitStatus;

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// `ESRCH` — no such process.
pub const ESRCH: isize = 3;
/// `EINTR` — interrupted (killed while blocked).
pub const EINTR: isize = 4;
/// `ECHILD` — no child processes.
pub const ECHILD: isize = 10;
/// `ENOMEM` — out of memory.
pub const ENOMEM: isize = 12;
/// `EFAULT` — bad address.
pub const EFAULT: isize = 14;
/// `EINVAL` — invalid argument.
pub const EINVAL: isize = 22;
/// `ENOSYS` — function not implemented.
pub const ENOSYS: isize = 38;

// ---------------------------------------------------------------------------
// Syscall numbers
// ---------------------------------------------------------------------------

/// Create a child process.
pub const SYS_FORK: usize = 1;
/// Terminate the calling process with a status byte.
pub const SYS_EXIT: usize = 2;
/// Wait for a child to terminate and reap it.
pub const SYS_WAIT: usize = 3;
/// Request termination of another process.
pub const SYS_KILL: usize = 6;
/// Return the caller's process identifier.
pub const SYS_GETPID: usize = 11;
/// Grow the caller's address-space size without mapping pages.
pub const SYS_SBRK: usize = 12;
/// Block until a number of timer ticks have elapsed.
pub const SYS_SLEEP: usize = 13;
/// Return the timer tick count since boot.
pub const SYS_UPTIME: usize = 14;
/// Read the hardware wall clock into a user buffer.
pub const SYS_DATE: usize = 22;

/// A syscall known to this ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    /// `fork()`
    Fork,
    /// `exit(status)`
    Exit,
    /// `wait(status_out)`
    Wait,
    /// `kill(pid)`
    Kill,
    /// `getpid()`
    Getpid,
    /// `sbrk(increment)`
    Sbrk,
    /// `sleep(ticks)`
    Sleep,
    /// `uptime()`
    Uptime,
    /// `date(buf)`
    Date,
}

impl Syscall {
    /// Looks up a syscall by its ABI number.
    pub const fn from_number(nr: usize) -> Option<Self> {
        match nr {
            SYS_FORK => Some(Self::Fork),
            SYS_EXIT => Some(Self::Exit),
            SYS_WAIT => Some(Self::Wait),
            SYS_KILL => Some(Self::Kill),
            SYS_GETPID => Some(Self::Getpid),
            SYS_SBRK => Some(Self::Sbrk),
            SYS_SLEEP => Some(Self::Sleep),
            SYS_UPTIME => Some(Self::Uptime),
            SYS_DATE => Some(Self::Date),
            _ => None,
        }
    }

    /// Returns the ABI number of this syscall.
    pub const fn number(self) -> usize {
        match self {
            Self::Fork => SYS_FORK,
            Self::Exit => SYS_EXIT,
            Self::Wait => SYS_WAIT,
            Self::Kill => SYS_KILL,
            Self::Getpid => SYS_GETPID,
            Self::Sbrk => SYS_SBRK,
            Self::Sleep => SYS_SLEEP,
            Self::Uptime => SYS_UPTIME,
            Self::Date => SYS_DATE,
        }
    }

    /// Returns the syscall name for diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Fork => "fork",
            Self::Exit => "exit",
            Self::Wait => "wait",
            Self::Kill => "kill",
            Self::Getpid => "getpid",
            Self::Sbrk => "sbrk",
            Self::Sleep => "sleep",
            Self::Uptime => "uptime",
            Self::Date => "date",
        }
    }
}

// ---------------------------------------------------------------------------
// Shared data structures
// ---------------------------------------------------------------------------

/// Calendar time as read from the hardware real-time clock.
///
/// Written to the caller's buffer by the `date` syscall.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RtcDate {
    /// Seconds (`0..=59`).
    pub second: u32,
    /// Minutes (`0..=59`).
    pub minute: u32,
    /// Hours (`0..=23`).
    pub hour: u32,
    /// Day of month (`1..=31`).
    pub day: u32,
    /// Month (`1..=12`).
    pub month: u32,
    /// Full year, e.g. 2026.
    pub year: u32,
}

impl RtcDate {
    /// Size of the wire representation in bytes.
    pub const SIZE: usize = 24;

    /// Serializes the date to its little-endian wire representation.
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        for (slot, field) in bytes.chunks_exact_mut(4).zip([
            self.second,
            self.minute,
            self.hour,
            self.day,
            self.month,
            self.year,
        ]) {
            slot.copy_from_slice(&field.to_le_bytes());
        }
        bytes
    }

    /// Deserializes a date from its little-endian wire representation.
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let field = |i: usize| {
            let mut word = [0u8; 4];
            word.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
            u32::from_le_bytes(word)
        };
        Self {
            second: field(0),
            minute: field(1),
            hour: field(2),
            day: field(3),
            month: field(4),
            year: field(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Handler trait and dispatch
// ---------------------------------------------------------------------------

/// What a syscall handler instructs the trap path to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallReturn {
    /// Completed; place the value in the caller's return register.
    Value(isize),
    /// Cannot complete yet. The caller has been suspended and the call is
    /// re-executed when it next runs.
    Block,
    /// The caller terminated; it never observes a return value.
    Exit,
}

/// Kernel-side syscall handler interface.
///
/// Integer arguments arrive already marshaled from the caller's argument
/// registers; pointer arguments arrive as raw addresses the handler must
/// validate against the caller's address space.
pub trait SyscallHandler {
    /// `fork()` — create a child process; returns the child pid.
    fn sys_fork(&mut self) -> SyscallReturn;
    /// `exit(status)` — terminate with the low byte of `status`.
    fn sys_exit(&mut self, status: i32) -> SyscallReturn;
    /// `wait(status_out)` — reap a terminated child.
    fn sys_wait(&mut self, status_ptr: usize) -> SyscallReturn;
    /// `kill(pid)` — request another process's termination.
    fn sys_kill(&mut self, pid: i32) -> SyscallReturn;
    /// `getpid()` — the caller's pid.
    fn sys_getpid(&mut self) -> SyscallReturn;
    /// `sbrk(increment)` — grow the address space, returning the old size.
    fn sys_sbrk(&mut self, increment: i32) -> SyscallReturn;
    /// `sleep(ticks)` — block for a number of timer ticks.
    fn sys_sleep(&mut self, ticks: i32) -> SyscallReturn;
    /// `uptime()` — timer ticks since boot.
    fn sys_uptime(&mut self) -> SyscallReturn;
    /// `date(buf)` — write an [`RtcDate`] to the caller's buffer.
    fn sys_date(&mut self, buf_ptr: usize) -> SyscallReturn;
}

/// Routes a numbered syscall to the matching handler method.
///
/// Unknown numbers complete immediately with `-ENOSYS`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    reason = "integer syscall arguments are defined as the low 32 bits of the register"
)]
pub fn dispatch<H: SyscallHandler>(handler: &mut H, nr: usize, arg0: usize) -> SyscallReturn {
    match Syscall::from_number(nr) {
        Some(Syscall::Fork) => handler.sys_fork(),
        Some(Syscall::Exit) => handler.sys_exit(arg0 as i32),
        Some(Syscall::Wait) => handler.sys_wait(arg0),
        Some(Syscall::Kill) => handler.sys_kill(arg0 as i32),
        Some(Syscall::Getpid) => handler.sys_getpid(),
        Some(Syscall::Sbrk) => handler.sys_sbrk(arg0 as i32),
        Some(Syscall::Sleep) => handler.sys_sleep(arg0 as i32),
        Some(Syscall::Uptime) => handler.sys_uptime(),
        Some(Syscall::Date) => handler.sys_date(arg0),
        None => SyscallReturn::Value(-ENOSYS),
    }
}
