//! Process records and the process table.
//!
//! One [`Process`] record exists per live process, owned by the
//! [`ProcessTable`] and referenced, never copied, by the dispatcher and
//! the wait protocol. A terminated process stays in the table as a zombie
//! until its parent reaps it through `wait`; only then are its frames
//! returned and the record destroyed.

use alloc::collections::BTreeMap;

use muon_core::id::Pid;
use muon_core::kdebug;
use muon_syscall::ExitStatus;

use crate::mm::{FrameArena, PageTable};

/// Scheduling state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Ready to run, waiting for a CPU.
    Runnable,
    /// Currently executing on some CPU.
    Running,
    /// Suspended until the named channel is woken.
    Sleeping(Channel),
    /// Terminated; the record survives until the parent reaps it.
    Zombie,
}

/// What a sleeping process is blocked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// The timer tick counter (the `sleep` syscall).
    Ticks,
    /// Termination of any child of the named parent (the `wait` syscall).
    ChildExit(Pid),
}

/// A user process.
#[derive(Debug)]
pub struct Process {
    pid: Pid,
    parent: Option<Pid>,
    name: &'static str,
    /// Size in bytes of the valid virtual address range. Faulting
    /// addresses at or above this bound are invalid; pages below it are
    /// backed lazily on first touch.
    size: usize,
    state: State,
    /// Advisory termination request. Set exactly once; acted on at the
    /// next trap-return or blocking checkpoint.
    killed: bool,
    exit_status: Option<ExitStatus>,
    page_table: PageTable,
    /// Target tick for an in-progress `sleep`, kept across retries of the
    /// blocked call.
    sleep_deadline: Option<u64>,
}

impl Process {
    fn new(pid: Pid, parent: Option<Pid>, name: &'static str, size: usize) -> Self {
        Self {
            pid,
            parent,
            name,
            size,
            state: State::Runnable,
            killed: false,
            exit_status: None,
            page_table: PageTable::new(),
            sleep_deadline: None,
        }
    }

    /// The process identifier.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The parent's identifier, if any.
    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    /// Diagnostic name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current size of the valid virtual address range, in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current scheduling state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Whether termination has been requested.
    pub fn is_killed(&self) -> bool {
        self.killed
    }

    /// The recorded termination status, if the process has one.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Number of pages currently backed by frames.
    pub fn mapped_pages(&self) -> usize {
        self.page_table.mapped_pages()
    }

    pub(crate) fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub(crate) fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.page_table
    }

    pub(crate) fn set_state(&mut self, state: State) {
        self.state = state;
    }

    pub(crate) fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    pub(crate) fn sleep_deadline(&self) -> Option<u64> {
        self.sleep_deadline
    }

    pub(crate) fn set_sleep_deadline(&mut self, deadline: Option<u64>) {
        self.sleep_deadline = deadline;
    }

    /// Records the termination status. The first status wins: every
    /// termination path stores exactly one code, and a later fallback can
    /// never overwrite the original cause.
    pub(crate) fn record_exit_status(&mut self, status: ExitStatus) {
        if self.exit_status.is_none() {
            self.exit_status = Some(status);
        }
    }

    /// Marks the process killed with the given cause. There is no un-kill.
    pub(crate) fn kill_with(&mut self, status: ExitStatus) {
        self.killed = true;
        self.record_exit_status(status);
    }
}

/// The table of all live processes, keyed by pid.
///
/// The `BTreeMap` ordering doubles as the wait protocol's tie-break rule:
/// scanning children in key order finds the lowest-numbered zombie first.
pub struct ProcessTable {
    procs: BTreeMap<Pid, Process>,
    next_pid: u32,
}

impl ProcessTable {
    pub(crate) const fn new() -> Self {
        Self {
            procs: BTreeMap::new(),
            next_pid: 1,
        }
    }

    /// Creates a process record. Process creation proper (image setup,
    /// register state) happens outside this model; the table only mints
    /// the record that the trap path operates on.
    pub(crate) fn spawn(&mut self, parent: Option<Pid>, name: &'static str, size: usize) -> Pid {
        let pid = Pid::new(self.next_pid);
        self.next_pid += 1;
        self.procs.insert(pid, Process::new(pid, parent, name, size));
        pid
    }

    pub(crate) fn get(&self, pid: Pid) -> Option<&Process> {
        self.procs.get(&pid)
    }

    pub(crate) fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.procs.get_mut(&pid)
    }

    /// Whether `parent` has any children at all, zombie or live.
    pub(crate) fn has_children(&self, parent: Pid) -> bool {
        self.procs.values().any(|p| p.parent == Some(parent))
    }

    /// The lowest-pid terminated child of `parent`, if one exists.
    pub(crate) fn lowest_zombie_child(&self, parent: Pid) -> Option<Pid> {
        self.procs
            .values()
            .find(|p| p.parent == Some(parent) && p.state == State::Zombie)
            .map(|p| p.pid)
    }

    /// Requests termination of `pid`. Returns `false` if no such process.
    ///
    /// Sets the killed flag and wakes the target if it is sleeping; the
    /// actual termination happens at the target's next checkpoint.
    pub(crate) fn kill(&mut self, pid: Pid) -> bool {
        let Some(p) = self.procs.get_mut(&pid) else {
            return false;
        };
        p.killed = true;
        if matches!(p.state, State::Sleeping(_)) {
            p.state = State::Runnable;
        }
        true
    }

    /// Wakes every process sleeping on `channel`.
    pub(crate) fn wakeup(&mut self, channel: Channel) {
        for p in self.procs.values_mut() {
            if p.state == State::Sleeping(channel) {
                p.state = State::Runnable;
            }
        }
    }

    /// Terminates `pid`: records `status` (unless a cause is already
    /// recorded), marks the record a zombie, and wakes a parent blocked in
    /// `wait`. The caller never returns control to the process.
    pub(crate) fn exit(&mut self, pid: Pid, status: ExitStatus) {
        let parent = {
            let p = self.procs.get_mut(&pid).expect("exiting process not in the table");
            debug_assert_ne!(p.state, State::Zombie, "process exited twice");
            p.record_exit_status(status);
            p.state = State::Zombie;
            p.parent
        };
        kdebug!("pid {pid}: exited with {:?}", self.procs[&pid].exit_status);
        if let Some(parent) = parent {
            self.wakeup(Channel::ChildExit(parent));
        }
    }

    /// Destroys a zombie's record, returning its frames to the arena.
    /// Only the wait protocol calls this, after the terminal status has
    /// been observed.
    pub(crate) fn reap(&mut self, pid: Pid, arena: &FrameArena) {
        let mut p = self.procs.remove(&pid).expect("reaped process not in the table");
        debug_assert_eq!(p.state, State::Zombie, "reaping a live process");
        p.page_table.unmap_all(arena);
    }
}
