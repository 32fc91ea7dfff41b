//! Lazy page allocation.
//!
//! `sbrk` grows a process's address-space size without backing it; the
//! first touch of a grown page takes a page fault, and this module turns
//! that fault into a freshly zeroed, user-writable mapping, or a
//! controlled kill, never silent corruption.

use muon_core::addr::VirtAddr;
use muon_core::kwarn;
use muon_syscall::ExitStatus;

use crate::mm::{FrameArena, MapError, PAGE_SIZE, PageFlags};
use crate::proc::Process;
use crate::trap::TrapFrame;

/// Result of handling a user page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultOutcome {
    /// A page was installed; the faulting instruction re-executes.
    Mapped,
    /// The process was killed with a fault status.
    Killed,
    /// The faulting address was already mapped; this is corruption, not
    /// lazy growth, and must take the dispatcher's default (fatal) path.
    NotLazy,
}

/// Why a zeroed page could not be installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstallError {
    /// The frame allocator is exhausted.
    OutOfMemory,
    /// The mapping primitive failed (page-table node allocation).
    Map(MapError),
}

/// Resolves a page fault at `tf.fault_address` for `process`.
///
/// The address must lie inside the declared address-space size
/// (exclusive bound) and at or above the page floor of the stack pointer
/// recorded at fault time: anything below the stack's current extent is a
/// stack overflow hitting the guard page, not valid heap growth, even
/// when it is numerically inside the size bound.
pub(crate) fn handle_fault(
    process: &mut Process,
    tf: &TrapFrame,
    arena: &FrameArena,
) -> FaultOutcome {
    let va = tf.fault_address;

    if process.page_table().translate(va).is_some() {
        return FaultOutcome::NotLazy;
    }

    let stack_floor = tf.stack_pointer.align_down(PAGE_SIZE);
    if va.as_usize() >= process.size() || va < stack_floor {
        kwarn!(
            "pid {} {}: segfault, lazy alloc rejected va={} ip={}",
            process.pid(),
            process.name(),
            va,
            tf.instruction_pointer,
        );
        process.kill_with(ExitStatus::fault(tf.trap_number));
        return FaultOutcome::Killed;
    }

    match install_zeroed_page(process, va.align_down(PAGE_SIZE), arena) {
        Ok(()) => FaultOutcome::Mapped,
        Err(InstallError::OutOfMemory) => {
            kwarn!("lazy alloc: out of memory (pid {})", process.pid());
            process.kill_with(ExitStatus::fault(tf.trap_number));
            FaultOutcome::Killed
        }
        Err(InstallError::Map(err)) => {
            kwarn!("lazy alloc: mapping failed: {err} (pid {})", process.pid());
            process.kill_with(ExitStatus::fault(tf.trap_number));
            FaultOutcome::Killed
        }
    }
}

/// Allocates a frame, zeroes it, and maps it user-writable at the
/// page-aligned address `page`.
///
/// Ownership protocol: the guard owns the frame until `map_page`
/// succeeds; on failure the guard's drop returns the frame to the arena.
/// There is no suspension point between zeroing and installation, so the
/// frame cannot be observed or reused half-initialized.
pub(crate) fn install_zeroed_page(
    process: &mut Process,
    page: VirtAddr,
    arena: &FrameArena,
) -> Result<(), InstallError> {
    debug_assert!(
        page.as_usize() < process.size(),
        "installing a page beyond the address-space size"
    );

    let Some(guard) = arena.allocate_guarded() else {
        return Err(InstallError::OutOfMemory);
    };
    arena.zero(guard.index());

    match process
        .page_table_mut()
        .map_page(page, guard.index(), PageFlags::USER_RW, arena)
    {
        Ok(()) => {
            // Ownership transfers to the page table.
            let _ = guard.take();
            Ok(())
        }
        // The guard frees the frame on drop.
        Err(err) => Err(InstallError::Map(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::ProcessTable;

    fn process_with_size(size: usize) -> (ProcessTable, muon_core::id::Pid) {
        let mut table = ProcessTable::new();
        let pid = table.spawn(None, "fault-test", size);
        (table, pid)
    }

    fn fault_at(va: usize, sp: usize) -> TrapFrame {
        TrapFrame::page_fault(VirtAddr::new(va), VirtAddr::new(sp))
    }

    const LOW_STACK: usize = 0x40; // stack floor at page 0

    #[test]
    fn in_bounds_fault_maps_a_zeroed_page() {
        let arena = FrameArena::new(8);
        let (mut table, pid) = process_with_size(4 * PAGE_SIZE);
        let p = table.get_mut(pid).unwrap();

        let outcome = handle_fault(p, &fault_at(PAGE_SIZE + 0x123, LOW_STACK), &arena);
        assert_eq!(outcome, FaultOutcome::Mapped);
        assert!(!p.is_killed());

        let (frame, flags) = p
            .page_table()
            .translate(VirtAddr::new(PAGE_SIZE))
            .expect("page installed at the fault's page boundary");
        assert!(flags.contains(PageFlags::USER | PageFlags::WRITABLE));

        let mut buf = [0xFFu8; 64];
        arena.read(frame, 0, &mut buf);
        assert_eq!(buf, [0u8; 64]);
    }

    #[test]
    fn fault_at_size_bound_is_rejected() {
        let arena = FrameArena::new(8);
        let (mut table, pid) = process_with_size(2 * PAGE_SIZE);
        let p = table.get_mut(pid).unwrap();

        // The bound is exclusive: faulting exactly at `size` is invalid.
        let outcome = handle_fault(p, &fault_at(2 * PAGE_SIZE, LOW_STACK), &arena);
        assert_eq!(outcome, FaultOutcome::Killed);
        assert!(p.is_killed());
        assert_eq!(
            p.exit_status().unwrap().fault_cause(),
            Some(crate::trap::T_PGFLT as u8 + 1)
        );
        assert_eq!(p.mapped_pages(), 0);
    }

    #[test]
    fn fault_below_stack_floor_is_a_guard_violation() {
        let arena = FrameArena::new(8);
        let (mut table, pid) = process_with_size(64 * PAGE_SIZE);
        let p = table.get_mut(pid).unwrap();

        // The address is inside the size bound but below the stack
        // pointer's page floor: stack overflow, not heap growth.
        let sp = 16 * PAGE_SIZE + 0x40;
        let outcome = handle_fault(p, &fault_at(15 * PAGE_SIZE, sp), &arena);
        assert_eq!(outcome, FaultOutcome::Killed);
        assert_eq!(p.mapped_pages(), 0);
    }

    #[test]
    fn fault_at_stack_floor_is_allowed() {
        let arena = FrameArena::new(8);
        let (mut table, pid) = process_with_size(64 * PAGE_SIZE);
        let p = table.get_mut(pid).unwrap();

        let sp = 16 * PAGE_SIZE + 0x40;
        let outcome = handle_fault(p, &fault_at(16 * PAGE_SIZE, sp), &arena);
        assert_eq!(outcome, FaultOutcome::Mapped);
    }

    #[test]
    fn exhausted_arena_kills_without_blocking() {
        let arena = FrameArena::new(1);
        // Consume the only frame.
        let _held = arena.allocate().unwrap();

        let (mut table, pid) = process_with_size(4 * PAGE_SIZE);
        let p = table.get_mut(pid).unwrap();

        let outcome = handle_fault(p, &fault_at(0, LOW_STACK), &arena);
        assert_eq!(outcome, FaultOutcome::Killed);
        assert!(p.is_killed());
    }

    #[test]
    fn map_failure_releases_the_frame() {
        // Two frames: the page frame allocates, then the node frame fails.
        let arena = FrameArena::new(1);
        let (mut table, pid) = process_with_size(4 * PAGE_SIZE);
        let p = table.get_mut(pid).unwrap();

        let outcome = handle_fault(p, &fault_at(0x1000, LOW_STACK), &arena);
        assert_eq!(outcome, FaultOutcome::Killed);

        // The allocated page frame went back to the arena.
        assert_eq!(arena.free_frames(), 1);
    }

    #[test]
    fn already_mapped_fault_is_not_lazy_growth() {
        let arena = FrameArena::new(8);
        let (mut table, pid) = process_with_size(4 * PAGE_SIZE);
        let p = table.get_mut(pid).unwrap();

        assert_eq!(
            handle_fault(p, &fault_at(0x1000, LOW_STACK), &arena),
            FaultOutcome::Mapped
        );
        // A second fault on the same page indicates corruption.
        assert_eq!(
            handle_fault(p, &fault_at(0x1800, LOW_STACK), &arena),
            FaultOutcome::NotLazy
        );
    }

    #[test]
    fn sequential_faults_do_not_disturb_earlier_mappings() {
        let arena = FrameArena::new(8);
        let (mut table, pid) = process_with_size(8 * PAGE_SIZE);
        let p = table.get_mut(pid).unwrap();

        handle_fault(p, &fault_at(0x1000, LOW_STACK), &arena);
        let (first_frame, _) = p.page_table().translate(VirtAddr::new(0x1000)).unwrap();
        arena.write(first_frame, 0, b"persists");

        handle_fault(p, &fault_at(0x3000, LOW_STACK), &arena);

        let (frame_again, _) = p.page_table().translate(VirtAddr::new(0x1000)).unwrap();
        assert_eq!(frame_again, first_frame);
        let mut buf = [0u8; 8];
        arena.read(first_frame, 0, &mut buf);
        assert_eq!(&buf, b"persists");
    }
}
