//! Timer ticks, the sleep queue, and the wall clock seam.
//!
//! The tick counter is the kernel's monotonic time base. It advances only
//! from the timer interrupt on the bookkeeping CPU, under its own lock.
//! Sleeping processes register a deadline here; each tick drains the
//! expired entries into a bounded batch that the dispatcher turns back
//! into runnable processes.

use alloc::boxed::Box;
use alloc::collections::BinaryHeap;
use core::cmp::{Ordering, Reverse};

use muon_core::id::Pid;
use muon_core::sync::SpinLock;
use muon_syscall::RtcDate;
use planck_noalloc::vec::ArrayVec;

/// Maximum sleepers woken per tick. If more are expired, they are
/// deferred to the next tick; this keeps the per-tick work bounded.
pub const WAKE_BATCH_SIZE: usize = 32;

struct SleepEntry {
    deadline: u64,
    pid: Pid,
}

impl PartialEq for SleepEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for SleepEntry {}

impl PartialOrd for SleepEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SleepEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

/// The monotonic tick counter and its sleep queue.
pub struct Ticks {
    counter: SpinLock<u64>,
    sleepers: SpinLock<BinaryHeap<Reverse<SleepEntry>>>,
}

impl Ticks {
    pub(crate) fn new() -> Self {
        Self {
            counter: SpinLock::named("ticks", 0),
            sleepers: SpinLock::named("sleep_queue", BinaryHeap::new()),
        }
    }

    /// Returns the current tick count.
    pub fn read(&self) -> u64 {
        *self.counter.lock()
    }

    /// Advances the counter by one tick and drains sleepers whose
    /// deadline has passed.
    ///
    /// At most [`WAKE_BATCH_SIZE`] pids are returned per tick; the
    /// remainder is picked up on the next tick. Entries may be stale
    /// (the process was killed or already woken); the caller looks each
    /// pid up and ignores the ones no longer sleeping on the tick channel.
    pub(crate) fn advance(&self) -> ArrayVec<Pid, WAKE_BATCH_SIZE> {
        let now = {
            let mut counter = self.counter.lock();
            *counter += 1;
            *counter
        };

        let mut batch = ArrayVec::new();
        let mut queue = self.sleepers.lock();
        while batch.len() < WAKE_BATCH_SIZE {
            match queue.peek() {
                Some(entry) if entry.0.deadline <= now => {
                    let entry = queue.pop().expect("peeked entry present");
                    batch.push(entry.0.pid);
                }
                _ => break,
            }
        }
        batch
    }

    /// Registers `pid` to be woken once the counter reaches `deadline`.
    pub(crate) fn register_sleeper(&self, deadline: u64, pid: Pid) {
        self.sleepers.lock().push(Reverse(SleepEntry { deadline, pid }));
    }
}

/// The hardware real-time clock, as seen by the `date` syscall.
///
/// Reading the actual CMOS device is outside this model; an embedder
/// provides the implementation.
pub trait WallClock: Send + Sync {
    /// Reads the current calendar time.
    fn now(&self) -> RtcDate;
}

/// A wall clock frozen at a fixed date. The model's default.
pub struct FixedClock(pub RtcDate);

impl WallClock for FixedClock {
    fn now(&self) -> RtcDate {
        self.0
    }
}

/// The default wall clock: a fixed, obviously synthetic date.
pub(crate) fn default_clock() -> Box<dyn WallClock> {
    Box::new(FixedClock(RtcDate {
        second: 0,
        minute: 0,
        hour: 0,
        day: 1,
        month: 1,
        year: 2000,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_increments_monotonically() {
        let ticks = Ticks::new();
        assert_eq!(ticks.read(), 0);
        ticks.advance();
        ticks.advance();
        assert_eq!(ticks.read(), 2);
    }

    #[test]
    fn sleeper_wakes_at_deadline_not_before() {
        let ticks = Ticks::new();
        let pid = Pid::new(1);
        ticks.register_sleeper(2, pid);

        assert!(ticks.advance().is_empty()); // tick 1
        let woken = ticks.advance(); // tick 2
        assert_eq!(woken.as_slice(), &[pid]);
    }

    #[test]
    fn sleepers_drain_in_deadline_order() {
        let ticks = Ticks::new();
        ticks.register_sleeper(3, Pid::new(30));
        ticks.register_sleeper(1, Pid::new(10));
        ticks.register_sleeper(2, Pid::new(20));

        // Registration order does not matter; each tick drains exactly
        // the entries that have come due.
        assert_eq!(ticks.advance().as_slice(), &[Pid::new(10)]);
        assert_eq!(ticks.advance().as_slice(), &[Pid::new(20)]);
        assert_eq!(ticks.advance().as_slice(), &[Pid::new(30)]);
        assert!(ticks.advance().is_empty());
    }

    #[test]
    fn wake_batch_is_bounded() {
        let ticks = Ticks::new();
        for i in 0..(WAKE_BATCH_SIZE as u32 + 5) {
            ticks.register_sleeper(1, Pid::new(i + 1));
        }

        let first = ticks.advance();
        assert_eq!(first.len(), WAKE_BATCH_SIZE);
        // The overflow is deferred to the next tick.
        let second = ticks.advance();
        assert_eq!(second.len(), 5);
    }

    #[test]
    fn fixed_clock_returns_its_date() {
        let date = RtcDate {
            second: 30,
            minute: 15,
            hour: 12,
            day: 6,
            month: 8,
            year: 2026,
        };
        assert_eq!(FixedClock(date).now(), date);
    }
}
