//! Trap dispatch.
//!
//! [`Kernel::trap`] is the single entry point for every exception,
//! interrupt, and syscall. It routes by trap number:
//!
//! - syscall → the syscall layer, with the killed flag checked on both
//!   sides of the call
//! - timer → tick bookkeeping (bootstrap CPU only) + acknowledgement
//!   (every CPU)
//! - disk/keyboard/serial → the registered out-of-scope driver, then
//!   acknowledgement
//! - page fault → the lazy allocator
//! - anything else → fatal if it came from the kernel, a kill if it came
//!   from user mode
//!
//! After the per-category handling, three invariants are enforced
//! unconditionally: a killed process never returns to user mode, a timer
//! tick is a preemption point, and the killed flag is re-checked after
//! the preemption because termination can be requested while the process
//! is off the CPU.
//!
//! The vector numbers are a fixed contract inherited from the hardware
//! and firmware layers; they are not renegotiable.

use muon_core::addr::VirtAddr;
use muon_core::id::{CpuId, Pid};
use muon_core::kwarn;
use muon_syscall::{ExitStatus, SyscallReturn};

use crate::kernel::Kernel;
use crate::mm::lazy::{self, FaultOutcome};
use crate::proc::{Channel, State};
use crate::syscall;

/// Page fault exception vector.
pub const T_PGFLT: u32 = 14;
/// Syscall trap vector.
pub const T_SYSCALL: u32 = 64;
/// Base vector for external interrupt lines.
pub const T_IRQ0: u32 = 32;

/// Timer interrupt line.
pub const IRQ_TIMER: u32 = 0;
/// Keyboard interrupt line.
pub const IRQ_KBD: u32 = 1;
/// First serial port interrupt line.
pub const IRQ_COM1: u32 = 4;
/// Disk controller interrupt line.
pub const IRQ_IDE: u32 = 14;
/// Spurious interrupt line.
pub const IRQ_SPURIOUS: u32 = 31;

/// Code segment selector for kernel-mode execution (ring 0).
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
/// Code segment selector for user-mode execution (ring 3).
pub const USER_CODE_SELECTOR: u16 = 0x1b;

/// Privilege level a trap arrived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Ring 0.
    Kernel,
    /// Ring 3.
    User,
}

/// Saved hardware context at trap entry.
///
/// The dispatcher borrows this for the duration of one invocation and
/// never retains it past trap return, so there is no stale-context
/// hazard on the process record.
#[derive(Debug, Clone)]
pub struct TrapFrame {
    /// Vector number that fired.
    pub trap_number: u32,
    /// Hardware error code, if the exception pushes one.
    pub error_code: u32,
    /// Saved code segment selector; the low bits carry the privilege
    /// level of the interrupted context.
    pub code_segment: u16,
    /// Saved instruction pointer.
    pub instruction_pointer: VirtAddr,
    /// Saved stack pointer at fault time; the page-fault guard check
    /// reads this.
    pub stack_pointer: VirtAddr,
    /// Faulting address (the fault-address register), valid for page
    /// faults.
    pub fault_address: VirtAddr,
    /// Syscall number, valid for syscall traps.
    pub syscall_number: usize,
    /// First syscall argument register.
    pub arg0: usize,
    /// Syscall return register; written by the dispatcher on completion.
    pub retval: isize,
}

impl TrapFrame {
    /// A user-mode trap frame for vector `trap_number`.
    pub fn new(trap_number: u32) -> Self {
        Self {
            trap_number,
            error_code: 0,
            code_segment: USER_CODE_SELECTOR,
            instruction_pointer: VirtAddr::new(0x0040_1000),
            // The conventional user layout puts the stack page right
            // above the code, below the heap.
            stack_pointer: VirtAddr::new(0x1000),
            fault_address: VirtAddr::NULL,
            syscall_number: 0,
            arg0: 0,
            retval: 0,
        }
    }

    /// A user-mode syscall trap frame.
    pub fn syscall(number: usize, arg0: usize) -> Self {
        let mut tf = Self::new(T_SYSCALL);
        tf.syscall_number = number;
        tf.arg0 = arg0;
        tf
    }

    /// A user-mode page fault at `fault_address` with the stack pointer
    /// saved as `stack_pointer`.
    pub fn page_fault(fault_address: VirtAddr, stack_pointer: VirtAddr) -> Self {
        let mut tf = Self::new(T_PGFLT);
        tf.fault_address = fault_address;
        tf.stack_pointer = stack_pointer;
        tf
    }

    /// Rewrites the frame as having come from kernel-mode execution.
    #[must_use]
    pub fn from_kernel_mode(mut self) -> Self {
        self.code_segment = KERNEL_CODE_SELECTOR;
        self
    }

    /// The privilege level the trap arrived from.
    pub fn privilege(&self) -> Privilege {
        if self.code_segment & 3 == 0 {
            Privilege::Kernel
        } else {
            Privilege::User
        }
    }
}

/// What the dispatcher instructs the embedder to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    /// Return to the interrupted context. For a resolved page fault the
    /// faulting instruction re-executes against the new mapping.
    Resume,
    /// The process suspended inside a blocking syscall; the frame was not
    /// advanced, so the call re-executes when the process next runs.
    Blocked,
    /// The process terminated and never runs again.
    Terminated,
}

impl Kernel {
    /// Dispatches one trap on `cpu`, for the process `current` (if the
    /// interrupted context belonged to one).
    ///
    /// # Panics
    ///
    /// Panics on traps that indicate a kernel defect: an unrecognized
    /// vector from kernel mode or with no current process, or a page
    /// fault with no process context. Kernel-mode integrity cannot be
    /// assumed after such a fault, so no recovery is attempted.
    pub fn trap(&self, cpu: CpuId, current: Option<Pid>, tf: &mut TrapFrame) -> TrapOutcome {
        // The scheduler handed this process the CPU.
        if let Some(pid) = current {
            let mut table = self.table.lock();
            if let Some(p) = table.get_mut(pid) {
                if p.state() == State::Runnable {
                    p.set_state(State::Running);
                }
            }
        }

        let outcome = self.dispatch(cpu, current, tf);
        if outcome == TrapOutcome::Terminated {
            return outcome;
        }

        let Some(pid) = current else {
            return outcome;
        };
        let user_mode = tf.privilege() == Privilege::User;

        // Force the exit if the process has been killed and is in user
        // space. (If it is still executing in the kernel, let it keep
        // running until it gets to the regular syscall return.)
        if user_mode && self.killed_and_live(pid) {
            self.force_exit(pid);
            return TrapOutcome::Terminated;
        }

        // Force the process to give up the CPU on a clock tick.
        if tf.trap_number == T_IRQ0 + IRQ_TIMER && self.is_running(pid) {
            self.yield_now(pid);

            // The process may have been killed while it was descheduled.
            if user_mode && self.killed_and_live(pid) {
                self.force_exit(pid);
                return TrapOutcome::Terminated;
            }
        }

        outcome
    }

    /// Category-specific handling, before the post-dispatch invariants.
    fn dispatch(&self, cpu: CpuId, current: Option<Pid>, tf: &mut TrapFrame) -> TrapOutcome {
        if tf.trap_number == T_SYSCALL {
            return self.handle_syscall(current, tf);
        }

        match tf.trap_number {
            n if n == T_IRQ0 + IRQ_TIMER => {
                if cpu == CpuId::BOOTSTRAP {
                    let woken = self.ticks().advance();
                    let mut table = self.table.lock();
                    for &pid in woken.iter() {
                        if let Some(p) = table.get_mut(pid) {
                            if p.state() == State::Sleeping(Channel::Ticks) {
                                p.set_state(State::Runnable);
                            }
                        }
                    }
                }
                self.interrupts().end_of_interrupt(IRQ_TIMER);
            }
            n if n == T_IRQ0 + IRQ_IDE => {
                self.devices().run_ide();
                self.interrupts().end_of_interrupt(IRQ_IDE);
            }
            n if n == T_IRQ0 + IRQ_IDE + 1 => {
                // Some chipsets generate spurious interrupts on the
                // second disk line; swallow them.
            }
            n if n == T_IRQ0 + IRQ_KBD => {
                self.devices().run_keyboard();
                self.interrupts().end_of_interrupt(IRQ_KBD);
            }
            n if n == T_IRQ0 + IRQ_COM1 => {
                self.devices().run_com1();
                self.interrupts().end_of_interrupt(IRQ_COM1);
            }
            n if n == T_IRQ0 + 7 || n == T_IRQ0 + IRQ_SPURIOUS => {
                kwarn!(
                    "{cpu}: spurious interrupt at {}:{}",
                    tf.code_segment,
                    tf.instruction_pointer,
                );
                self.interrupts().end_of_interrupt(n - T_IRQ0);
            }
            T_PGFLT => return self.handle_page_fault(cpu, current, tf),
            _ => return self.handle_unexpected(cpu, current, tf),
        }

        TrapOutcome::Resume
    }

    /// The syscall leg: check the killed flag, bind the trap context,
    /// execute, re-check.
    fn handle_syscall(&self, current: Option<Pid>, tf: &mut TrapFrame) -> TrapOutcome {
        let Some(pid) = current else {
            panic!("syscall trap without a current process\n{tf:#?}");
        };

        {
            let mut table = self.table.lock();
            let p = table.get_mut(pid).expect("current process not in the table");

            // A syscall may arrive for a process that was killed but has
            // not yet reached a checkpoint: terminate it without
            // executing the call.
            if p.is_killed() {
                drop(table);
                self.force_exit(pid);
                return TrapOutcome::Terminated;
            }

            // A sleeping process is not schedulable; the blocked call is
            // retried once it has been woken.
            if matches!(p.state(), State::Sleeping(_)) {
                return TrapOutcome::Blocked;
            }
        }

        // The trap context is bound to the call for its duration and
        // released at return, never retained on the record.
        match syscall::execute(self, pid, tf) {
            SyscallReturn::Value(value) => {
                tf.retval = value;
                // The call itself may have triggered termination
                // (another process's kill, or our own).
                if self.killed_and_live(pid) {
                    self.force_exit(pid);
                    return TrapOutcome::Terminated;
                }
                TrapOutcome::Resume
            }
            SyscallReturn::Block => TrapOutcome::Blocked,
            SyscallReturn::Exit => TrapOutcome::Terminated,
        }
    }

    /// The page-fault leg: delegate to the lazy allocator; an
    /// already-mapped address is corruption and takes the default path.
    fn handle_page_fault(
        &self,
        cpu: CpuId,
        current: Option<Pid>,
        tf: &mut TrapFrame,
    ) -> TrapOutcome {
        let Some(pid) = current else {
            panic!(
                "page fault at {} with no current process on {cpu}\n{tf:#?}",
                tf.fault_address,
            );
        };

        let outcome = {
            let mut table = self.table.lock();
            let p = table.get_mut(pid).expect("current process not in the table");
            lazy::handle_fault(p, tf, self.frames())
        };

        match outcome {
            FaultOutcome::Mapped => TrapOutcome::Resume,
            // The killed flag is set; the post-dispatch checks force the
            // exit before the process can return to user mode.
            FaultOutcome::Killed => TrapOutcome::Resume,
            FaultOutcome::NotLazy => self.handle_unexpected(cpu, current, tf),
        }
    }

    /// The default leg: a vector the dispatcher does not recognize.
    fn handle_unexpected(
        &self,
        cpu: CpuId,
        current: Option<Pid>,
        tf: &mut TrapFrame,
    ) -> TrapOutcome {
        if current.is_none() || tf.privilege() == Privilege::Kernel {
            // In the kernel, it must be our mistake.
            panic!(
                "unexpected trap {} on {cpu} ip {} (fault address {})\n{tf:#?}",
                tf.trap_number, tf.instruction_pointer, tf.fault_address,
            );
        }

        // In user space, assume the process misbehaved.
        let pid = current.expect("checked above");
        let mut table = self.table.lock();
        let p = table.get_mut(pid).expect("current process not in the table");
        kwarn!(
            "pid {} {}: trap {} err {} on {cpu} ip {} addr {} --kill proc",
            pid,
            p.name(),
            tf.trap_number,
            tf.error_code,
            tf.instruction_pointer,
            tf.fault_address,
        );
        p.kill_with(ExitStatus::fault(tf.trap_number));
        TrapOutcome::Resume
    }

    /// Terminates a killed process at a checkpoint. If no cause was
    /// recorded (a plain `kill`), the conventional "killed" status is
    /// stored; a fault cause recorded earlier wins.
    pub(crate) fn force_exit(&self, pid: Pid) {
        let mut table = self.table.lock();
        table.exit(pid, ExitStatus::voluntary(-1));
    }

    fn killed_and_live(&self, pid: Pid) -> bool {
        let table = self.table.lock();
        table
            .get(pid)
            .is_some_and(|p| p.is_killed() && p.state() != State::Zombie)
    }

    fn is_running(&self, pid: Pid) -> bool {
        let table = self.table.lock();
        table.get(pid).is_some_and(|p| p.state() == State::Running)
    }
}
