//! The kernel instance.
//!
//! [`Kernel`] owns every subsystem the trap path touches: the process
//! table, the frame arena, the tick counter, and the interrupt plumbing.
//! Each subsystem carries its own lock, so mutations to a process record,
//! the tick count, and the arena are serialized independently. One
//! instance models one machine; tests construct their own.

use alloc::boxed::Box;

use muon_core::addr::VirtAddr;
use muon_core::id::Pid;
use muon_core::sync::SpinLock;

use crate::irq::{DeviceHandlers, InterruptController};
use crate::mm::{FrameArena, FrameIndex, PageFlags};
use crate::proc::{Process, ProcessTable, State};
use crate::syscall::userptr::{self, CopyError};
use crate::time::{self, Ticks, WallClock};

/// A closure invoked when the current process yields the CPU at the
/// timer preemption point. Stands in for the out-of-scope scheduler: the
/// process is runnable while the hook runs, and anything can happen to
/// it in the meantime, including being killed.
pub type YieldHook = Box<dyn Fn(&Kernel) + Send + Sync>;

/// The kernel model.
pub struct Kernel {
    pub(crate) table: SpinLock<ProcessTable>,
    frames: FrameArena,
    ticks: Ticks,
    interrupts: InterruptController,
    devices: DeviceHandlers,
    clock: Box<dyn WallClock>,
    yield_hook: SpinLock<Option<YieldHook>>,
}

impl Kernel {
    /// Creates a kernel with `frame_count` frames of physical memory.
    pub fn new(frame_count: usize) -> Self {
        Self {
            table: SpinLock::named("process_table", ProcessTable::new()),
            frames: FrameArena::new(frame_count),
            ticks: Ticks::new(),
            interrupts: InterruptController::new(),
            devices: DeviceHandlers::new(),
            clock: time::default_clock(),
            yield_hook: SpinLock::named("yield_hook", None),
        }
    }

    /// Creates a process record with the given address-space size.
    ///
    /// Process creation proper (image loading, registers) is outside the
    /// model; this is the primitive `fork` and tests both build on.
    pub fn spawn(&self, parent: Option<Pid>, name: &'static str, size: usize) -> Pid {
        self.table.lock().spawn(parent, name, size)
    }

    /// Requests termination of `pid` from outside a syscall context.
    /// Returns `false` if no such process exists.
    pub fn kill(&self, pid: Pid) -> bool {
        self.table.lock().kill(pid)
    }

    /// Runs `f` against the process record for `pid`, if it exists.
    pub fn with_process<R>(&self, pid: Pid, f: impl FnOnce(&Process) -> R) -> Option<R> {
        let table = self.table.lock();
        table.get(pid).map(f)
    }

    /// Looks up the mapping covering `va` in `pid`'s page table.
    pub fn translate(&self, pid: Pid, va: VirtAddr) -> Option<(FrameIndex, PageFlags)> {
        let table = self.table.lock();
        table.get(pid)?.page_table().translate(va)
    }

    /// Copies mapped user memory of `pid` into `buf`.
    ///
    /// Unlike the kernel's own copy-out path this never backfills
    /// mappings: reading an untouched lazy page is an error, which is
    /// exactly what makes the installed-page assertions in tests honest.
    pub fn read_user(&self, pid: Pid, src: VirtAddr, buf: &mut [u8]) -> Result<(), CopyError> {
        let table = self.table.lock();
        let process = table.get(pid).ok_or(CopyError::BadAddress)?;
        userptr::copy_from_user(process, &self.frames, src, buf)
    }

    /// The physical frame arena.
    pub fn frames(&self) -> &FrameArena {
        &self.frames
    }

    /// The tick counter.
    pub fn ticks(&self) -> &Ticks {
        &self.ticks
    }

    /// The interrupt controller.
    pub fn interrupts(&self) -> &InterruptController {
        &self.interrupts
    }

    /// The registered device handlers.
    pub fn devices(&self) -> &DeviceHandlers {
        &self.devices
    }

    /// The wall clock used by the `date` syscall.
    pub(crate) fn clock(&self) -> &dyn WallClock {
        &*self.clock
    }

    /// Replaces the wall clock.
    pub fn set_wall_clock(&mut self, clock: Box<dyn WallClock>) {
        self.clock = clock;
    }

    /// Installs the scheduler seam invoked at the timer preemption point.
    pub fn set_yield_hook(&self, hook: YieldHook) {
        *self.yield_hook.lock() = Some(hook);
    }

    /// Relinquishes the CPU on behalf of `pid`: the process becomes
    /// runnable, the scheduler seam runs, and the process is put back on
    /// the CPU afterwards (unless it terminated in between).
    pub(crate) fn yield_now(&self, pid: Pid) {
        {
            let mut table = self.table.lock();
            if let Some(p) = table.get_mut(pid) {
                debug_assert_eq!(p.state(), State::Running, "yield from a non-running process");
                p.set_state(State::Runnable);
            }
        }

        {
            let hook = self.yield_hook.lock();
            if let Some(hook) = hook.as_ref() {
                hook(self);
            }
        }

        let mut table = self.table.lock();
        if let Some(p) = table.get_mut(pid) {
            if p.state() == State::Runnable {
                p.set_state(State::Running);
            }
        }
    }
}
