//! Lock ordering + debug-only deadlock prevention + contention instrumentation
//! for the small set of process-global locks that bridge the main lane and the
//! DB lane (see the crate-level concurrency notes in `revdb::manager`).
//!
//! Design goals:
//! - **Zero release overhead**: ordering checks compile to no-ops outside
//!   `debug_assertions`.
//! - **Fail fast in debug**: panic *before* attempting an out-of-order lock.
//! - **Contention visibility**: always-on lightweight tracking of acquire
//!   counts, contention events, wait times, and hold durations. Uses
//!   `try_lock()` first so uncontended acquires add only ~2 atomic
//!   increments.
//!
//! Rule (strict): when a thread already holds any lock(s), it may only
//! acquire locks with a strictly higher `LockLevel::rank()`. Main-lane-only
//! state (the identity map, the created/changed object sets) needs no lock
//! at all — per the manager's concurrency model only the main lane ever
//! touches it. These wrappers exist for the handful of structures that are
//! genuinely shared across the lane boundary: the task queue, the `db_info`
//! holder, and the object-change observer list.

#![forbid(unsafe_code)]

#[cfg(debug_assertions)]
use std::cell::RefCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

trait DurationNanosU64 {
    fn as_nanos_u64(&self) -> u64;
}

impl DurationNanosU64 for std::time::Duration {
    #[inline]
    fn as_nanos_u64(&self) -> u64 {
        self.as_nanos().try_into().unwrap_or(u64::MAX)
    }
}

/// Global lock hierarchy for the manager's lane-bridging state.
///
/// Lower rank must be acquired before higher rank when locks are nested.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockLevel {
    /// The background task queue (enqueued from the main lane, drained by
    /// the DB lane worker).
    TaskQueue,
    /// The observable `db_info` holder (written after a completed task hops
    /// back to the main lane, read by `observe_db_info` subscribers).
    DbInfoHolder,
    /// The object-change observer list (`observe_db_object` subscribers).
    ObjectNotifier,
    /// The suspend/resume counter gating task dispatch.
    SuspendCount,
}

impl LockLevel {
    pub const COUNT: usize = 4;

    pub const ALL: [Self; Self::COUNT] = [
        Self::TaskQueue,
        Self::DbInfoHolder,
        Self::ObjectNotifier,
        Self::SuspendCount,
    ];

    #[must_use]
    pub const fn ordinal(self) -> usize {
        match self {
            Self::TaskQueue => 0,
            Self::DbInfoHolder => 1,
            Self::ObjectNotifier => 2,
            Self::SuspendCount => 3,
        }
    }

    #[must_use]
    pub const fn from_ordinal(ord: usize) -> Option<Self> {
        match ord {
            0 => Some(Self::TaskQueue),
            1 => Some(Self::DbInfoHolder),
            2 => Some(Self::ObjectNotifier),
            3 => Some(Self::SuspendCount),
            _ => None,
        }
    }

    /// Total order rank. Must be unique per variant.
    #[must_use]
    pub const fn rank(self) -> u16 {
        match self {
            Self::TaskQueue => 10,
            Self::DbInfoHolder => 20,
            Self::ObjectNotifier => 30,
            Self::SuspendCount => 40,
        }
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}@{}", self.rank())
    }
}

// =============================================================================
// Lock contention tracking
// =============================================================================

struct LockStats {
    acquire_count: AtomicU64,
    contended_count: AtomicU64,
    total_wait_ns: AtomicU64,
    total_hold_ns: AtomicU64,
    max_wait_ns: AtomicU64,
    max_hold_ns: AtomicU64,
}

impl LockStats {
    const fn new() -> Self {
        Self {
            acquire_count: AtomicU64::new(0),
            contended_count: AtomicU64::new(0),
            total_wait_ns: AtomicU64::new(0),
            total_hold_ns: AtomicU64::new(0),
            max_wait_ns: AtomicU64::new(0),
            max_hold_ns: AtomicU64::new(0),
        }
    }

    #[inline]
    fn record_acquire(&self, contended: bool, wait_ns: u64) {
        self.acquire_count.fetch_add(1, Ordering::Relaxed);
        if contended {
            self.contended_count.fetch_add(1, Ordering::Relaxed);
            self.total_wait_ns.fetch_add(wait_ns, Ordering::Relaxed);
            update_max(&self.max_wait_ns, wait_ns);
        }
    }

    #[inline]
    fn record_hold(&self, hold_ns: u64) {
        self.total_hold_ns.fetch_add(hold_ns, Ordering::Relaxed);
        update_max(&self.max_hold_ns, hold_ns);
    }

    fn reset(&self) {
        self.acquire_count.store(0, Ordering::Relaxed);
        self.contended_count.store(0, Ordering::Relaxed);
        self.total_wait_ns.store(0, Ordering::Relaxed);
        self.total_hold_ns.store(0, Ordering::Relaxed);
        self.max_wait_ns.store(0, Ordering::Relaxed);
        self.max_hold_ns.store(0, Ordering::Relaxed);
    }
}

#[inline]
fn update_max(target: &AtomicU64, candidate: u64) {
    let mut current = target.load(Ordering::Relaxed);
    while candidate > current {
        match target.compare_exchange_weak(current, candidate, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

fn global_lock_stats() -> &'static [LockStats] {
    static STATS: std::sync::LazyLock<Vec<LockStats>> =
        std::sync::LazyLock::new(|| (0..LockLevel::COUNT).map(|_| LockStats::new()).collect());
    &STATS
}

/// Snapshot of contention metrics for a single lock level.
#[derive(Debug, Clone)]
pub struct LockContentionEntry {
    pub lock_name: String,
    pub rank: u16,
    pub acquire_count: u64,
    pub contended_count: u64,
    pub total_wait_ns: u64,
    pub total_hold_ns: u64,
    pub max_wait_ns: u64,
    pub max_hold_ns: u64,
    pub contention_ratio: f64,
}

/// Returns a snapshot of contention metrics for all lock levels that have
/// been acquired at least once.
#[must_use]
pub fn lock_contention_snapshot() -> Vec<LockContentionEntry> {
    let stats = global_lock_stats();
    LockLevel::ALL
        .iter()
        .filter_map(|&level| {
            let s = &stats[level.ordinal()];
            let acquires = s.acquire_count.load(Ordering::Relaxed);
            if acquires == 0 {
                return None;
            }
            let contended = s.contended_count.load(Ordering::Relaxed);
            Some(LockContentionEntry {
                lock_name: format!("{level:?}"),
                rank: level.rank(),
                acquire_count: acquires,
                contended_count: contended,
                total_wait_ns: s.total_wait_ns.load(Ordering::Relaxed),
                total_hold_ns: s.total_hold_ns.load(Ordering::Relaxed),
                max_wait_ns: s.max_wait_ns.load(Ordering::Relaxed),
                max_hold_ns: s.max_hold_ns.load(Ordering::Relaxed),
                #[allow(clippy::cast_precision_loss)]
                contention_ratio: contended as f64 / acquires as f64,
            })
        })
        .collect()
}

/// Resets all lock contention counters to zero. Useful for test isolation.
pub fn lock_contention_reset() {
    for s in global_lock_stats() {
        s.reset();
    }
}

// =============================================================================
// Lock ordering enforcement
// =============================================================================

#[cfg(debug_assertions)]
thread_local! {
    static HELD_LOCKS: RefCell<Vec<LockLevel>> = const { RefCell::new(Vec::new()) };
}

#[inline]
#[allow(unused_variables)]
fn check_before_acquire(level: LockLevel) {
    #[cfg(debug_assertions)]
    HELD_LOCKS.with(|held| {
        let held = held.borrow();
        let Some(&last) = held.last() else {
            return;
        };
        assert!(
            level.rank() > last.rank(),
            "lock order violation: attempting to acquire {level} while holding {last}. held={held:?}"
        );
    });
}

#[inline]
#[allow(unused_variables)]
fn did_acquire(level: LockLevel) {
    #[cfg(debug_assertions)]
    HELD_LOCKS.with(|held| held.borrow_mut().push(level));
}

#[inline]
#[allow(unused_variables)]
fn did_release(level: LockLevel) {
    #[cfg(debug_assertions)]
    HELD_LOCKS.with(|held| {
        let mut held = held.borrow_mut();
        let last = held.pop();
        assert!(
            last == Some(level),
            "lock tracking corrupted: expected to release {level}, popped={last:?}, held={held:?}"
        );
    });
}

/// Mutex wrapper that enforces the global lock hierarchy in debug builds.
#[derive(Debug)]
pub struct OrderedMutex<T> {
    level: LockLevel,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    #[must_use]
    pub const fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: Mutex::new(value),
        }
    }

    #[must_use]
    pub const fn level(&self) -> LockLevel {
        self.level
    }

    pub fn lock(&self) -> OrderedMutexGuard<'_, T> {
        check_before_acquire(self.level);
        let stats = &global_lock_stats()[self.level.ordinal()];

        match self.inner.try_lock() {
            Ok(guard) => {
                stats.record_acquire(false, 0);
                did_acquire(self.level);
                OrderedMutexGuard {
                    level: self.level,
                    acquired_at: Instant::now(),
                    guard,
                }
            }
            Err(std::sync::TryLockError::WouldBlock) => {
                let start = Instant::now();
                let guard = self
                    .inner
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let wait_ns = start.elapsed().as_nanos_u64();
                stats.record_acquire(true, wait_ns);
                did_acquire(self.level);
                OrderedMutexGuard {
                    level: self.level,
                    acquired_at: Instant::now(),
                    guard,
                }
            }
            Err(std::sync::TryLockError::Poisoned(e)) => {
                stats.record_acquire(false, 0);
                did_acquire(self.level);
                OrderedMutexGuard {
                    level: self.level,
                    acquired_at: Instant::now(),
                    guard: e.into_inner(),
                }
            }
        }
    }
}

pub struct OrderedMutexGuard<'a, T> {
    level: LockLevel,
    acquired_at: Instant,
    guard: MutexGuard<'a, T>,
}

impl<T> Drop for OrderedMutexGuard<'_, T> {
    fn drop(&mut self) {
        let hold_ns = self.acquired_at.elapsed().as_nanos_u64();
        global_lock_stats()[self.level.ordinal()].record_hold(hold_ns);
        did_release(self.level);
    }
}

impl<T> Deref for OrderedMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for OrderedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

/// `RwLock` wrapper that enforces the global lock hierarchy in debug builds.
#[derive(Debug)]
pub struct OrderedRwLock<T> {
    level: LockLevel,
    inner: RwLock<T>,
}

impl<T> OrderedRwLock<T> {
    #[must_use]
    pub const fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: RwLock::new(value),
        }
    }

    #[must_use]
    pub const fn level(&self) -> LockLevel {
        self.level
    }

    pub fn read(&self) -> OrderedRwLockReadGuard<'_, T> {
        check_before_acquire(self.level);
        let stats = &global_lock_stats()[self.level.ordinal()];

        match self.inner.try_read() {
            Ok(guard) => {
                stats.record_acquire(false, 0);
                did_acquire(self.level);
                OrderedRwLockReadGuard {
                    level: self.level,
                    acquired_at: Instant::now(),
                    guard,
                }
            }
            Err(std::sync::TryLockError::WouldBlock) => {
                let start = Instant::now();
                let guard = self
                    .inner
                    .read()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let wait_ns = start.elapsed().as_nanos_u64();
                stats.record_acquire(true, wait_ns);
                did_acquire(self.level);
                OrderedRwLockReadGuard {
                    level: self.level,
                    acquired_at: Instant::now(),
                    guard,
                }
            }
            Err(std::sync::TryLockError::Poisoned(e)) => {
                stats.record_acquire(false, 0);
                did_acquire(self.level);
                OrderedRwLockReadGuard {
                    level: self.level,
                    acquired_at: Instant::now(),
                    guard: e.into_inner(),
                }
            }
        }
    }

    pub fn write(&self) -> OrderedRwLockWriteGuard<'_, T> {
        check_before_acquire(self.level);
        let stats = &global_lock_stats()[self.level.ordinal()];

        match self.inner.try_write() {
            Ok(guard) => {
                stats.record_acquire(false, 0);
                did_acquire(self.level);
                OrderedRwLockWriteGuard {
                    level: self.level,
                    acquired_at: Instant::now(),
                    guard,
                }
            }
            Err(std::sync::TryLockError::WouldBlock) => {
                let start = Instant::now();
                let guard = self
                    .inner
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let wait_ns = start.elapsed().as_nanos_u64();
                stats.record_acquire(true, wait_ns);
                did_acquire(self.level);
                OrderedRwLockWriteGuard {
                    level: self.level,
                    acquired_at: Instant::now(),
                    guard,
                }
            }
            Err(std::sync::TryLockError::Poisoned(e)) => {
                stats.record_acquire(false, 0);
                did_acquire(self.level);
                OrderedRwLockWriteGuard {
                    level: self.level,
                    acquired_at: Instant::now(),
                    guard: e.into_inner(),
                }
            }
        }
    }
}

pub struct OrderedRwLockReadGuard<'a, T> {
    level: LockLevel,
    acquired_at: Instant,
    guard: RwLockReadGuard<'a, T>,
}

impl<T> Drop for OrderedRwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        let hold_ns = self.acquired_at.elapsed().as_nanos_u64();
        global_lock_stats()[self.level.ordinal()].record_hold(hold_ns);
        did_release(self.level);
    }
}

impl<T> Deref for OrderedRwLockReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

pub struct OrderedRwLockWriteGuard<'a, T> {
    level: LockLevel,
    acquired_at: Instant,
    guard: RwLockWriteGuard<'a, T>,
}

impl<T> Drop for OrderedRwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        let hold_ns = self.acquired_at.elapsed().as_nanos_u64();
        global_lock_stats()[self.level.ordinal()].record_hold(hold_ns);
        did_release(self.level);
    }
}

impl<T> Deref for OrderedRwLockWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for OrderedRwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_mutex_allows_increasing_order() {
        let queue = OrderedMutex::new(LockLevel::TaskQueue, ());
        let suspend = OrderedMutex::new(LockLevel::SuspendCount, ());

        let _q = queue.lock();
        let _s = suspend.lock();
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    #[cfg(debug_assertions)]
    fn ordered_mutex_panics_on_out_of_order() {
        let suspend = OrderedMutex::new(LockLevel::SuspendCount, ());
        let queue = OrderedMutex::new(LockLevel::TaskQueue, ());

        let _s = suspend.lock();
        let _q = queue.lock();
    }

    #[test]
    fn lock_level_all_length_matches_count() {
        assert_eq!(LockLevel::ALL.len(), LockLevel::COUNT);
    }

    #[test]
    fn lock_level_ordinal_roundtrip() {
        for (i, &level) in LockLevel::ALL.iter().enumerate() {
            assert_eq!(level.ordinal(), i, "ordinal mismatch for {level:?}");
            assert_eq!(LockLevel::from_ordinal(i), Some(level));
        }
        assert_eq!(LockLevel::from_ordinal(LockLevel::COUNT), None);
    }

    #[test]
    fn lock_level_all_in_rank_order() {
        for w in LockLevel::ALL.windows(2) {
            assert!(w[0].rank() < w[1].rank());
        }
    }
}
