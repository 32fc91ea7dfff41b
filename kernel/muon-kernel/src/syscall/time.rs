//! Time syscall handlers: sleep, uptime, date.

use muon_core::addr::VirtAddr;
use muon_syscall::{EFAULT, EINTR, EINVAL, SyscallReturn};

use crate::proc::{Channel, State};
use crate::syscall::{CallContext, userptr};

/// `sleep(ticks)` — blocks until `ticks` timer ticks have elapsed.
///
/// The deadline is computed once, on the first execution of the call,
/// and kept on the process record across retries of the blocked call, so
/// a wakeup-and-retry does not restart the interval. Killed while
/// waiting returns `-EINTR`.
pub(super) fn sys_sleep(call: &mut CallContext, ticks: i32) -> SyscallReturn {
    if ticks < 0 {
        return SyscallReturn::Value(-EINVAL);
    }

    let kernel = call.kernel;
    let mut table = kernel.table.lock();
    let p = table.get_mut(call.pid).expect("calling process not in the table");

    if p.is_killed() {
        p.set_sleep_deadline(None);
        return SyscallReturn::Value(-EINTR);
    }

    let now = kernel.ticks().read();
    match p.sleep_deadline() {
        // Retry of a blocked call whose deadline has passed.
        Some(deadline) if now >= deadline => {
            p.set_sleep_deadline(None);
            SyscallReturn::Value(0)
        }
        // Woken early (e.g. a broad wakeup); go back to sleep, the queue
        // entry for the original deadline is still pending.
        Some(_) => {
            p.set_state(State::Sleeping(Channel::Ticks));
            SyscallReturn::Block
        }
        // First execution: register the deadline and block.
        None => {
            if ticks == 0 {
                return SyscallReturn::Value(0);
            }
            #[allow(clippy::cast_sign_loss, reason = "checked non-negative above")]
            let deadline = now + ticks as u64;
            p.set_sleep_deadline(Some(deadline));
            p.set_state(State::Sleeping(Channel::Ticks));
            kernel.ticks().register_sleeper(deadline, call.pid);
            SyscallReturn::Block
        }
    }
}

/// `uptime()` — timer ticks since boot.
#[allow(clippy::cast_possible_wrap, reason = "tick counts stay far below isize::MAX")]
pub(super) fn sys_uptime(call: &mut CallContext) -> SyscallReturn {
    SyscallReturn::Value(call.kernel.ticks().read() as isize)
}

/// `date(buf)` — reads the hardware wall clock into the caller's buffer.
pub(super) fn sys_date(call: &mut CallContext, buf_ptr: usize) -> SyscallReturn {
    if buf_ptr == 0 {
        return SyscallReturn::Value(-EFAULT);
    }

    let date = call.kernel.clock().now();
    let bytes = date.to_bytes();

    let mut table = call.kernel.table.lock();
    let p = table.get_mut(call.pid).expect("calling process not in the table");
    match userptr::copy_to_user(p, call.kernel.frames(), VirtAddr::new(buf_ptr), &bytes) {
        Ok(()) => SyscallReturn::Value(0),
        Err(_) => SyscallReturn::Value(-EFAULT),
    }
}
