//! User pointer validation and copying.
//!
//! Pointers arriving through the syscall boundary are untrusted: they are
//! checked against the caller's address-space size, then resolved page by
//! page through its page table. A copy-out into a lazily grown region may
//! hit a page that was never touched; that page is backfilled through
//! the same zero-and-map routine a fault would use, so kernel writes and
//! user faults behave identically.

use core::fmt;

use muon_core::addr::VirtAddr;

use crate::mm::lazy;
use crate::mm::{FrameArena, PAGE_SIZE, PageFlags};
use crate::proc::Process;

/// Why a user-space copy was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyError {
    /// Null, out of bounds, unmapped (for reads), or not user-writable.
    BadAddress,
    /// Backfilling a lazy page failed for lack of frames.
    OutOfMemory,
}

impl fmt::Display for CopyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadAddress => write!(f, "bad user address"),
            Self::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

/// Checks that `[addr, addr + len)` is a plausible user range for
/// `process`: non-null, non-wrapping, and inside the address-space size.
fn check_range(process: &Process, addr: VirtAddr, len: usize) -> Result<(), CopyError> {
    if addr.is_null() {
        return Err(CopyError::BadAddress);
    }
    let end = addr.checked_add(len).ok_or(CopyError::BadAddress)?;
    if end.as_usize() > process.size() {
        return Err(CopyError::BadAddress);
    }
    Ok(())
}

/// Copies `bytes` into `process`'s memory at `dst`.
///
/// Unmapped pages inside the valid range are lazily backfilled; pages
/// that are mapped must be user-writable.
pub(crate) fn copy_to_user(
    process: &mut Process,
    arena: &FrameArena,
    dst: VirtAddr,
    bytes: &[u8],
) -> Result<(), CopyError> {
    check_range(process, dst, bytes.len())?;

    let mut copied = 0;
    while copied < bytes.len() {
        let va = dst + copied;
        let page = va.align_down(PAGE_SIZE);

        let frame = match process.page_table().translate(va) {
            Some((frame, flags)) => {
                if !flags.contains(PageFlags::USER | PageFlags::WRITABLE) {
                    return Err(CopyError::BadAddress);
                }
                frame
            }
            None => {
                // First touch of a lazily grown page.
                lazy::install_zeroed_page(process, page, arena)
                    .map_err(|_| CopyError::OutOfMemory)?;
                process
                    .page_table()
                    .translate(va)
                    .expect("page installed above")
                    .0
            }
        };

        let offset = va.offset_in(PAGE_SIZE);
        let chunk = (PAGE_SIZE - offset).min(bytes.len() - copied);
        arena.write(frame, offset, &bytes[copied..copied + chunk]);
        copied += chunk;
    }
    Ok(())
}

/// Copies `buf.len()` bytes of `process`'s memory at `src` into `buf`.
///
/// Reads never backfill: an untouched lazy page is reported as
/// [`CopyError::BadAddress`] rather than silently materialized.
pub(crate) fn copy_from_user(
    process: &Process,
    arena: &FrameArena,
    src: VirtAddr,
    buf: &mut [u8],
) -> Result<(), CopyError> {
    check_range(process, src, buf.len())?;

    let mut copied = 0;
    while copied < buf.len() {
        let va = src + copied;
        let (frame, flags) = process
            .page_table()
            .translate(va)
            .ok_or(CopyError::BadAddress)?;
        if !flags.contains(PageFlags::USER) {
            return Err(CopyError::BadAddress);
        }

        let offset = va.offset_in(PAGE_SIZE);
        let chunk = (PAGE_SIZE - offset).min(buf.len() - copied);
        arena.read(frame, offset, &mut buf[copied..copied + chunk]);
        copied += chunk;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::ProcessTable;

    fn setup(size: usize, frames: usize) -> (FrameArena, ProcessTable, muon_core::id::Pid) {
        let arena = FrameArena::new(frames);
        let mut table = ProcessTable::new();
        let pid = table.spawn(None, "copy-test", size);
        (arena, table, pid)
    }

    #[test]
    fn roundtrip_through_a_lazy_page() {
        let (arena, mut table, pid) = setup(4 * PAGE_SIZE, 8);
        let p = table.get_mut(pid).unwrap();
        let dst = VirtAddr::new(PAGE_SIZE + 100);

        copy_to_user(p, &arena, dst, b"status").unwrap();

        let mut buf = [0u8; 6];
        copy_from_user(p, &arena, dst, &mut buf).unwrap();
        assert_eq!(&buf, b"status");
    }

    #[test]
    fn copy_spanning_a_page_boundary() {
        let (arena, mut table, pid) = setup(4 * PAGE_SIZE, 8);
        let p = table.get_mut(pid).unwrap();
        let dst = VirtAddr::new(PAGE_SIZE - 3);
        let payload = [0xC3u8; 8];

        copy_to_user(p, &arena, dst, &payload).unwrap();
        assert_eq!(p.mapped_pages(), 2);

        let mut buf = [0u8; 8];
        copy_from_user(p, &arena, dst, &mut buf).unwrap();
        assert_eq!(buf, payload);
    }

    #[test]
    fn null_and_out_of_bounds_are_rejected() {
        let (arena, mut table, pid) = setup(PAGE_SIZE, 8);
        let p = table.get_mut(pid).unwrap();

        assert_eq!(
            copy_to_user(p, &arena, VirtAddr::NULL, &[1]),
            Err(CopyError::BadAddress)
        );
        // The end of the range is one byte past the size bound.
        assert_eq!(
            copy_to_user(p, &arena, VirtAddr::new(PAGE_SIZE - 2), &[1, 2, 3]),
            Err(CopyError::BadAddress)
        );
    }

    #[test]
    fn read_of_untouched_lazy_page_is_an_error() {
        let (arena, mut table, pid) = setup(2 * PAGE_SIZE, 8);
        let p = table.get_mut(pid).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(
            copy_from_user(p, &arena, VirtAddr::new(0x10), &mut buf),
            Err(CopyError::BadAddress)
        );
    }

    #[test]
    fn backfill_failure_reports_out_of_memory() {
        let (arena, mut table, pid) = setup(2 * PAGE_SIZE, 1);
        // Exhaust the arena so the backfill cannot allocate.
        let _held = arena.allocate().unwrap();
        let p = table.get_mut(pid).unwrap();

        assert_eq!(
            copy_to_user(p, &arena, VirtAddr::new(8), &[1, 2]),
            Err(CopyError::OutOfMemory)
        );
    }
}
