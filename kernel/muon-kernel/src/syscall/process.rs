//! Process syscall handlers: fork, exit, wait, kill, getpid.

use muon_core::addr::VirtAddr;
use muon_core::id::Pid;
use muon_core::{kdebug, kwarn};
use muon_syscall::{ECHILD, EFAULT, EINTR, ESRCH, ExitStatus, SyscallReturn};

use crate::proc::{Channel, State};
use crate::syscall::{CallContext, userptr};

#[allow(clippy::cast_possible_wrap, reason = "pids are small u32 values")]
fn pid_value(pid: Pid) -> isize {
    pid.as_u32() as isize
}

/// `fork()` — creates a child process record.
///
/// Image duplication, register state, and the child's return path are
/// out-of-scope scheduler work; the trap path only mints the record.
pub(super) fn sys_fork(call: &mut CallContext) -> SyscallReturn {
    let mut table = call.kernel.table.lock();
    let (name, size) = {
        let p = table.get(call.pid).expect("calling process not in the table");
        (p.name(), p.size())
    };
    let child = table.spawn(Some(call.pid), name, size);
    kdebug!("pid {}: fork -> {child}", call.pid);
    SyscallReturn::Value(pid_value(child))
}

/// `exit(status)` — voluntary termination.
///
/// Encodes the caller's status byte, stores it on the record, and hands
/// the record to the zombie state. The teardown never returns to the
/// caller.
#[allow(clippy::cast_possible_truncation, reason = "the exit status is its low byte")]
pub(super) fn sys_exit(call: &mut CallContext, status: i32) -> SyscallReturn {
    let mut table = call.kernel.table.lock();
    table.exit(call.pid, ExitStatus::voluntary(status as i8));
    SyscallReturn::Exit
}

/// `wait(status_out)` — reaps one terminated child.
///
/// Returns `-ECHILD` immediately if the caller has no children at all.
/// With several terminated children the lowest pid is reaped first (the
/// table's deterministic tie-break). The child's raw status is written to
/// `status_out` unless it is null (a null output location skips the
/// write and is not an error). Blocks until a child terminates otherwise.
pub(super) fn sys_wait(call: &mut CallContext, status_ptr: usize) -> SyscallReturn {
    let kernel = call.kernel;
    let pid = call.pid;
    let mut table = kernel.table.lock();

    if !table.has_children(pid) {
        return SyscallReturn::Value(-ECHILD);
    }

    if let Some(child) = table.lowest_zombie_child(pid) {
        let status = table
            .get(child)
            .expect("zombie child present")
            .exit_status()
            .expect("zombie without a recorded status");

        if status_ptr != 0 {
            let dst = VirtAddr::new(status_ptr);
            let bytes = status.to_raw().to_le_bytes();
            let parent = table.get_mut(pid).expect("calling process not in the table");
            // Validate and write before reaping, so a bad pointer never
            // costs the caller the child.
            if let Err(err) = userptr::copy_to_user(parent, kernel.frames(), dst, &bytes) {
                kwarn!(
                    "pid {pid}: wait status pointer {dst} rejected: {err} ip {}",
                    call.tf.instruction_pointer,
                );
                return SyscallReturn::Value(-EFAULT);
            }
        }

        table.reap(child, kernel.frames());
        kdebug!("pid {pid}: reaped child {child}");
        return SyscallReturn::Value(pid_value(child));
    }

    // Children exist but none has terminated yet.
    let p = table.get_mut(pid).expect("calling process not in the table");
    if p.is_killed() {
        return SyscallReturn::Value(-EINTR);
    }
    p.set_state(State::Sleeping(Channel::ChildExit(pid)));
    SyscallReturn::Block
}

/// `kill(pid)` — advisory-asynchronous termination request.
///
/// Sets the target's killed flag and wakes it if it is sleeping; the
/// target actually terminates at its next trap-return or blocking
/// checkpoint.
pub(super) fn sys_kill(call: &mut CallContext, pid: i32) -> SyscallReturn {
    if pid <= 0 {
        return SyscallReturn::Value(-ESRCH);
    }
    #[allow(clippy::cast_sign_loss, reason = "checked positive above")]
    let target = Pid::new(pid as u32);

    let mut table = call.kernel.table.lock();
    if table.kill(target) {
        SyscallReturn::Value(0)
    } else {
        SyscallReturn::Value(-ESRCH)
    }
}

/// `getpid()` — the caller's identifier.
pub(super) fn sys_getpid(call: &mut CallContext) -> SyscallReturn {
    SyscallReturn::Value(pid_value(call.pid))
}
