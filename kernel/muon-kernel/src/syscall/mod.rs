//! Syscall execution.
//!
//! The dispatcher binds the caller's trap frame to a [`CallContext`]
//! (the scoped lease of the trap context) and routes the numbered call
//! through the ABI crate's [`muon_syscall::dispatch`] into the handler
//! modules. Integer arguments are marshaled from the argument register;
//! pointer arguments are validated in [`userptr`].

mod memory;
mod process;
mod time;
pub(crate) mod userptr;

pub use userptr::CopyError;

use muon_core::id::Pid;
use muon_core::{ktrace, kwarn};
use muon_syscall::{Syscall, SyscallHandler, SyscallReturn};

use crate::kernel::Kernel;
use crate::trap::TrapFrame;

/// Executes the syscall described by `tf` on behalf of `pid`.
pub(crate) fn execute(kernel: &Kernel, pid: Pid, tf: &mut TrapFrame) -> SyscallReturn {
    let number = tf.syscall_number;
    match Syscall::from_number(number) {
        Some(call) => ktrace!("pid {pid}: syscall {}", call.name()),
        None => kwarn!(
            "pid {pid}: unknown syscall {number} ip {}",
            tf.instruction_pointer,
        ),
    }

    let arg0 = tf.arg0;
    let mut call = CallContext { kernel, pid, tf };
    muon_syscall::dispatch(&mut call, number, arg0)
}

/// One in-flight syscall: the kernel, the calling process, and the
/// borrowed trap context. Dropped at syscall return, so the trap frame
/// reference can never outlive the dispatcher invocation.
pub(crate) struct CallContext<'a> {
    pub(crate) kernel: &'a Kernel,
    pub(crate) pid: Pid,
    pub(crate) tf: &'a mut TrapFrame,
}

impl SyscallHandler for CallContext<'_> {
    fn sys_fork(&mut self) -> SyscallReturn {
        process::sys_fork(self)
    }

    fn sys_exit(&mut self, status: i32) -> SyscallReturn {
        process::sys_exit(self, status)
    }

    fn sys_wait(&mut self, status_ptr: usize) -> SyscallReturn {
        process::sys_wait(self, status_ptr)
    }

    fn sys_kill(&mut self, pid: i32) -> SyscallReturn {
        process::sys_kill(self, pid)
    }

    fn sys_getpid(&mut self) -> SyscallReturn {
        process::sys_getpid(self)
    }

    fn sys_sbrk(&mut self, increment: i32) -> SyscallReturn {
        memory::sys_sbrk(self, increment)
    }

    fn sys_sleep(&mut self, ticks: i32) -> SyscallReturn {
        time::sys_sleep(self, ticks)
    }

    fn sys_uptime(&mut self) -> SyscallReturn {
        time::sys_uptime(self)
    }

    fn sys_date(&mut self, buf_ptr: usize) -> SyscallReturn {
        time::sys_date(self, buf_ptr)
    }
}
