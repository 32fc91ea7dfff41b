//! Memory syscall handlers: sbrk.

use muon_core::ktrace;
use muon_syscall::{EINVAL, ENOMEM, SyscallReturn};

use crate::syscall::CallContext;

/// `sbrk(increment)` — grows the address-space size, returning the
/// previous size.
///
/// No page is mapped here: the grown range stays unbacked until the
/// first access faults and the lazy allocator installs a page. Negative
/// increments are rejected: the shrink path would have to unmap pages,
/// which this kernel does not do.
pub(super) fn sys_sbrk(call: &mut CallContext, increment: i32) -> SyscallReturn {
    if increment < 0 {
        return SyscallReturn::Value(-EINVAL);
    }

    let mut table = call.kernel.table.lock();
    let p = table.get_mut(call.pid).expect("calling process not in the table");

    let old_size = p.size();
    #[allow(clippy::cast_sign_loss, reason = "checked non-negative above")]
    let Some(new_size) = old_size.checked_add(increment as usize) else {
        return SyscallReturn::Value(-ENOMEM);
    };
    p.set_size(new_size);

    ktrace!("pid {}: sbrk {increment} -> size {new_size}", call.pid);
    #[allow(clippy::cast_possible_wrap, reason = "model sizes stay far below isize::MAX")]
    let previous = old_size as isize;
    SyscallReturn::Value(previous)
}
