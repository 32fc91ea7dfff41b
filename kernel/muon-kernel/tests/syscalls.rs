//! Syscall surface checks: argument validation, errors, the wall clock.

use muon_core::addr::VirtAddr;
use muon_core::id::{CpuId, Pid};
use muon_kernel::Kernel;
use muon_kernel::mm::PAGE_SIZE;
use muon_kernel::proc::Process;
use muon_kernel::time::FixedClock;
use muon_kernel::trap::{IRQ_TIMER, T_IRQ0, TrapFrame, TrapOutcome};
use muon_syscall::{
    EFAULT, EINVAL, ENOSYS, ESRCH, RtcDate, SYS_DATE, SYS_GETPID, SYS_KILL, SYS_SBRK, SYS_UPTIME,
};

const BOOT: CpuId = CpuId::BOOTSTRAP;

fn syscall(kernel: &Kernel, pid: Pid, number: usize, arg0: usize) -> isize {
    let mut tf = TrapFrame::syscall(number, arg0);
    assert_ne!(
        kernel.trap(BOOT, Some(pid), &mut tf),
        TrapOutcome::Blocked,
        "unexpected blocking syscall"
    );
    tf.retval
}

#[test]
fn getpid_returns_the_caller() {
    let kernel = Kernel::new(8);
    let first = kernel.spawn(None, "a", 0);
    let second = kernel.spawn(None, "b", 0);

    assert_eq!(
        syscall(&kernel, first, SYS_GETPID, 0),
        isize::try_from(first.as_u32()).unwrap()
    );
    assert_eq!(
        syscall(&kernel, second, SYS_GETPID, 0),
        isize::try_from(second.as_u32()).unwrap()
    );
}

#[test]
fn negative_sbrk_is_rejected() {
    let kernel = Kernel::new(8);
    let pid = kernel.spawn(None, "shrinker", 4 * PAGE_SIZE);

    #[allow(clippy::cast_sign_loss)]
    let arg = -4096i32 as u32 as usize;
    assert_eq!(syscall(&kernel, pid, SYS_SBRK, arg), -EINVAL);
    assert_eq!(kernel.with_process(pid, Process::size), Some(4 * PAGE_SIZE));
}

#[test]
fn unknown_syscall_number_is_enosys() {
    let kernel = Kernel::new(8);
    let pid = kernel.spawn(None, "confused", 0);
    assert_eq!(syscall(&kernel, pid, 999, 0), -ENOSYS);
}

#[test]
fn kill_of_a_missing_process_is_esrch() {
    let kernel = Kernel::new(8);
    let pid = kernel.spawn(None, "killer", 0);

    assert_eq!(syscall(&kernel, pid, SYS_KILL, 42), -ESRCH);
    assert_eq!(syscall(&kernel, pid, SYS_KILL, 0), -ESRCH);
}

#[test]
fn date_copies_the_wall_clock_out() {
    let date = RtcDate {
        second: 30,
        minute: 45,
        hour: 13,
        day: 6,
        month: 8,
        year: 2026,
    };
    let mut kernel = Kernel::new(8);
    kernel.set_wall_clock(Box::new(FixedClock(date)));

    let pid = kernel.spawn(None, "clock-reader", PAGE_SIZE);
    let buf_va = 0x100;
    assert_eq!(syscall(&kernel, pid, SYS_DATE, buf_va), 0);

    let mut bytes = [0u8; RtcDate::SIZE];
    kernel
        .read_user(pid, VirtAddr::new(buf_va), &mut bytes)
        .unwrap();
    assert_eq!(RtcDate::from_bytes(&bytes), date);
}

#[test]
fn date_rejects_a_null_buffer() {
    let kernel = Kernel::new(8);
    let pid = kernel.spawn(None, "clock-reader", PAGE_SIZE);
    assert_eq!(syscall(&kernel, pid, SYS_DATE, 0), -EFAULT);
}

#[test]
fn uptime_counts_bootstrap_ticks_only() {
    let kernel = Kernel::new(8);
    let pid = kernel.spawn(None, "counter", 0);

    for cpu in [BOOT, CpuId::new(1), BOOT, CpuId::new(2)] {
        let mut tf = TrapFrame::new(T_IRQ0 + IRQ_TIMER);
        kernel.trap(cpu, None, &mut tf);
    }

    // Two of the four ticks arrived on the bookkeeping CPU.
    assert_eq!(syscall(&kernel, pid, SYS_UPTIME, 0), 2);
    // Every CPU acknowledged its interrupt.
    assert_eq!(kernel.interrupts().acknowledged(IRQ_TIMER), 4);
}
