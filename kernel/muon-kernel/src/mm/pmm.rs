//! Bitmap-based physical frame arena.
//!
//! Physical memory is modeled as an arena of `PAGE_SIZE`-byte frames
//! addressed by [`FrameIndex`]. A bitmap tracks allocation state, one bit
//! per frame (1 = allocated); word-level scanning with `trailing_zeros()`
//! finds free frames efficiently. The backing storage is owned by the
//! arena, so frame contents (including stale bytes left by a previous
//! owner) are observable, which is what makes the zero-before-map
//! security invariant testable.
//!
//! Frames move through an explicit ownership protocol: [`FrameGuard`]
//! holds a freshly allocated frame and frees it on drop unless
//! [`FrameGuard::take`] transfers ownership (to a page table).

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use muon_core::sync::SpinLock;

use crate::mm::PAGE_SIZE;

const BITS_PER_WORD: usize = 64;

/// Index of a physical frame in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FrameIndex(usize);

impl FrameIndex {
    /// Returns the raw frame number.
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for FrameIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame {}", self.0)
    }
}

struct ArenaInner {
    /// One bit per frame; 1 = allocated.
    bitmap: Vec<u64>,
    /// Owned backing storage, `frame_count * PAGE_SIZE` bytes.
    storage: Vec<u8>,
    /// Total number of frames tracked by the bitmap.
    frame_count: usize,
    /// Number of currently free frames.
    free_count: usize,
    /// Word index hint for the next allocation search (amortized O(1)).
    search_hint: usize,
}

/// A bitmap-based frame arena.
///
/// Uses interior mutability via [`SpinLock`] so all public methods take
/// `&self`; the arena is a global resource shared by the fault path and
/// process teardown.
pub struct FrameArena {
    inner: SpinLock<ArenaInner>,
}

impl FrameArena {
    /// Creates an arena with `frame_count` zero-initialized frames.
    pub fn new(frame_count: usize) -> Self {
        assert!(frame_count > 0, "arena must have at least one frame");

        let words = frame_count.div_ceil(BITS_PER_WORD);
        let mut bitmap = vec![0u64; words];

        // Mark the tail bits past `frame_count` as allocated so the scan
        // never hands them out.
        for excess in frame_count..words * BITS_PER_WORD {
            bitmap[excess / BITS_PER_WORD] |= 1 << (excess % BITS_PER_WORD);
        }

        Self {
            inner: SpinLock::named(
                "frame_arena",
                ArenaInner {
                    bitmap,
                    storage: vec![0u8; frame_count * PAGE_SIZE],
                    frame_count,
                    free_count: frame_count,
                    search_hint: 0,
                },
            ),
        }
    }

    /// Allocates a single frame.
    ///
    /// The frame's previous contents are left in place; callers that hand
    /// the frame to a process must zero it first (see [`FrameArena::zero`]).
    /// Returns `None` when the arena is exhausted; it never blocks or
    /// retries.
    pub fn allocate(&self) -> Option<FrameIndex> {
        let mut inner = self.inner.lock();
        if inner.free_count == 0 {
            return None;
        }

        // Scan from the hint, wrapping around if needed.
        let start = inner.search_hint;
        let words = inner.bitmap.len();

        for offset in 0..words {
            let word_idx = (start + offset) % words;
            let word = inner.bitmap[word_idx];

            // All bits set: no free frames in this word.
            if word == u64::MAX {
                continue;
            }

            // First zero bit: invert, then trailing_zeros gives the position.
            let bit_idx = (!word).trailing_zeros() as usize;
            let frame_idx = word_idx * BITS_PER_WORD + bit_idx;

            inner.bitmap[word_idx] |= 1u64 << bit_idx;
            inner.free_count -= 1;
            inner.search_hint = word_idx;

            return Some(FrameIndex(frame_idx));
        }

        None
    }

    /// Allocates a frame under guard: it is freed again when the guard is
    /// dropped, unless ownership is transferred with [`FrameGuard::take`].
    pub fn allocate_guarded(&self) -> Option<FrameGuard<'_>> {
        self.allocate().map(|frame| FrameGuard {
            arena: self,
            frame: Some(frame),
        })
    }

    /// Returns a frame to the arena.
    ///
    /// The frame must have been allocated from this arena and must no
    /// longer be referenced by any page table.
    pub fn free(&self, frame: FrameIndex) {
        let mut inner = self.inner.lock();
        assert!(frame.0 < inner.frame_count, "freed {frame} out of range");

        let word_idx = frame.0 / BITS_PER_WORD;
        let bit_idx = frame.0 % BITS_PER_WORD;

        debug_assert!(
            inner.bitmap[word_idx] & (1u64 << bit_idx) != 0,
            "double free of {frame}"
        );
        inner.bitmap[word_idx] &= !(1u64 << bit_idx);
        inner.free_count += 1;

        // Update the hint to potentially speed up the next allocation.
        if word_idx < inner.search_hint {
            inner.search_hint = word_idx;
        }
    }

    /// Fills the entire frame with zeros.
    ///
    /// Every frame handed to a process goes through this before being
    /// mapped, so no process can observe another owner's leftover bytes.
    pub fn zero(&self, frame: FrameIndex) {
        let mut inner = self.inner.lock();
        assert!(frame.0 < inner.frame_count, "zeroed {frame} out of range");
        let base = frame.0 * PAGE_SIZE;
        inner.storage[base..base + PAGE_SIZE].fill(0);
    }

    /// Copies `bytes` into the frame at `offset`.
    ///
    /// The range must lie within the frame.
    pub fn write(&self, frame: FrameIndex, offset: usize, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        assert!(frame.0 < inner.frame_count, "wrote {frame} out of range");
        assert!(offset + bytes.len() <= PAGE_SIZE, "write crosses a frame boundary");
        let base = frame.0 * PAGE_SIZE + offset;
        inner.storage[base..base + bytes.len()].copy_from_slice(bytes);
    }

    /// Copies frame contents at `offset` into `buf`.
    ///
    /// The range must lie within the frame.
    pub fn read(&self, frame: FrameIndex, offset: usize, buf: &mut [u8]) {
        let inner = self.inner.lock();
        assert!(frame.0 < inner.frame_count, "read {frame} out of range");
        assert!(offset + buf.len() <= PAGE_SIZE, "read crosses a frame boundary");
        let base = frame.0 * PAGE_SIZE + offset;
        buf.copy_from_slice(&inner.storage[base..base + buf.len()]);
    }

    /// Returns the number of free frames.
    pub fn free_frames(&self) -> usize {
        self.inner.lock().free_count
    }

    /// Returns the total number of frames in the arena.
    pub fn total_frames(&self) -> usize {
        self.inner.lock().frame_count
    }
}

/// RAII ownership of a freshly allocated frame.
///
/// The allocator owns the frame until mapping succeeds; on any failure
/// path the guard's drop returns the frame to the arena, so an aborted
/// installation can never leak.
pub struct FrameGuard<'a> {
    arena: &'a FrameArena,
    frame: Option<FrameIndex>,
}

impl FrameGuard<'_> {
    /// The guarded frame.
    pub fn index(&self) -> FrameIndex {
        self.frame.expect("guard already consumed")
    }

    /// Transfers ownership of the frame to the caller (the page table).
    pub fn take(mut self) -> FrameIndex {
        self.frame.take().expect("guard already consumed")
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.arena.free(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free_roundtrip() {
        let arena = FrameArena::new(8);
        assert_eq!(arena.free_frames(), 8);

        let frame = arena.allocate().unwrap();
        assert_eq!(arena.free_frames(), 7);

        arena.free(frame);
        assert_eq!(arena.free_frames(), 8);
    }

    #[test]
    fn exhaustion_returns_none() {
        let arena = FrameArena::new(3);
        let frames: Vec<_> = (0..3).map(|_| arena.allocate().unwrap()).collect();
        assert_eq!(arena.allocate(), None);

        arena.free(frames[1]);
        assert_eq!(arena.allocate(), Some(frames[1]));
    }

    #[test]
    fn allocations_are_distinct() {
        let arena = FrameArena::new(70); // spans two bitmap words
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..70 {
            assert!(seen.insert(arena.allocate().unwrap()));
        }
        assert_eq!(arena.allocate(), None);
    }

    #[test]
    fn storage_is_per_frame() {
        let arena = FrameArena::new(4);
        let a = arena.allocate().unwrap();
        let b = arena.allocate().unwrap();

        arena.write(a, 0, &[0xAA; 16]);
        arena.write(b, 0, &[0xBB; 16]);

        let mut buf = [0u8; 16];
        arena.read(a, 0, &mut buf);
        assert_eq!(buf, [0xAA; 16]);
        arena.read(b, 0, &mut buf);
        assert_eq!(buf, [0xBB; 16]);
    }

    #[test]
    fn freed_frame_keeps_stale_contents_until_zeroed() {
        let arena = FrameArena::new(1);
        let frame = arena.allocate().unwrap();
        arena.write(frame, 0, &[0x5A; 32]);
        arena.free(frame);

        // Reallocation hands back the same frame, stale bytes included.
        let frame = arena.allocate().unwrap();
        let mut buf = [0u8; 32];
        arena.read(frame, 0, &mut buf);
        assert_eq!(buf, [0x5A; 32]);

        arena.zero(frame);
        arena.read(frame, 0, &mut buf);
        assert_eq!(buf, [0u8; 32]);
    }

    #[test]
    fn guard_frees_on_drop() {
        let arena = FrameArena::new(2);
        {
            let _guard = arena.allocate_guarded().unwrap();
            assert_eq!(arena.free_frames(), 1);
        }
        assert_eq!(arena.free_frames(), 2);
    }

    #[test]
    fn guard_take_transfers_ownership() {
        let arena = FrameArena::new(2);
        let frame = {
            let guard = arena.allocate_guarded().unwrap();
            guard.take()
        };
        // Ownership moved out: the frame stays allocated.
        assert_eq!(arena.free_frames(), 1);
        arena.free(frame);
        assert_eq!(arena.free_frames(), 2);
    }

    #[test]
    fn odd_frame_count_tail_is_never_allocated() {
        let arena = FrameArena::new(65); // one bit into the second word
        for _ in 0..65 {
            assert!(arena.allocate().is_some());
        }
        assert_eq!(arena.allocate(), None);
    }
}
