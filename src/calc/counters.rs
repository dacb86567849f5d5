//! Per-thread metadata counters and size-computation cells.
//!
//! Every cell that more than one thread touches is padded to its own cache
//! line. Counter cells have a single writer (the owning thread), except for
//! the slow path's helper commit, which moves a cell from `c - 1` to `c`
//! along a pre-announced [`UpdateInfo`] by compare-exchange; there is no
//! write contention beyond that single legitimate bump.
//!
//! Counter accesses are sequentially consistent throughout: a scanner must
//! observe a bump no later than it observes the update that announced it.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;

use crate::{
    calc::{OpKind, UpdateInfo, OPS_NUM},
    common::MAX_THREADS,
    registry,
};

pub(crate) const INVALID_COUNTER: u64 = u64::MAX;
pub(crate) const INVALID_SIZE: i64 = i64::MAX;

/// One signed running total per thread. Written only by the owning thread.
pub(crate) struct FastCounters {
    cells: Box<[CachePadded<AtomicI64>]>,
}

impl FastCounters {
    pub(crate) fn new() -> Self {
        let cells = std::iter::repeat_with(|| CachePadded::new(AtomicI64::new(0)))
            .take(MAX_THREADS)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { cells }
    }

    /// Owner-only update; a load/store pair suffices because no other thread
    /// writes this cell.
    pub(crate) fn add(&self, tid: usize, delta: i64) {
        let cell = &self.cells[tid];
        cell.store(cell.load(Ordering::SeqCst) + delta, Ordering::SeqCst);
    }

    pub(crate) fn get(&self, tid: usize) -> i64 {
        self.cells[tid].load(Ordering::SeqCst)
    }
}

/// Per-thread, per-kind non-negative counts. Monotonically non-decreasing.
pub(crate) struct KindCounters {
    rows: Box<[CachePadded<[AtomicU64; OPS_NUM]>]>,
}

impl KindCounters {
    pub(crate) fn new() -> Self {
        let rows = std::iter::repeat_with(|| {
            CachePadded::new([AtomicU64::new(0), AtomicU64::new(0)])
        })
        .take(MAX_THREADS)
        .collect::<Vec<_>>()
        .into_boxed_slice();
        Self { rows }
    }

    pub(crate) fn get(&self, tid: usize, kind: OpKind) -> u64 {
        self.rows[tid][kind.index()].load(Ordering::SeqCst)
    }

    /// Commits a pre-announced bump: `counter - 1` to `counter`, at most
    /// once across any number of racing helpers.
    pub(crate) fn commit(&self, tid: usize, kind: OpKind, counter: u64) {
        let cell = &self.rows[tid][kind.index()];
        if cell.load(Ordering::SeqCst) == counter - 1 {
            let _ = cell.compare_exchange(
                counter - 1,
                counter,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }
}

/// A per-size collection of counter observations.
///
/// Collectors fill cells from the live counters; updaters that commit a bump
/// while the snapshot is collecting forward their new value so it cannot be
/// missed. Deactivation freezes the snapshot and is the linearization point
/// of the size that owns it.
pub(crate) struct CountersSnapshot {
    cells: Box<[CachePadded<[AtomicU64; OPS_NUM]>]>,
    collecting: CachePadded<AtomicBool>,
    size: CachePadded<AtomicI64>,
    fast_size: CachePadded<AtomicI64>,
}

impl CountersSnapshot {
    /// A snapshot in collecting state, every cell unobserved.
    pub(crate) fn new() -> Self {
        let cells = std::iter::repeat_with(|| {
            CachePadded::new([
                AtomicU64::new(INVALID_COUNTER),
                AtomicU64::new(INVALID_COUNTER),
            ])
        })
        .take(MAX_THREADS)
        .collect::<Vec<_>>()
        .into_boxed_slice();

        Self {
            cells,
            collecting: CachePadded::new(AtomicBool::new(true)),
            size: CachePadded::new(AtomicI64::new(INVALID_SIZE)),
            fast_size: CachePadded::new(AtomicI64::new(0)),
        }
    }

    /// The already-retired snapshot a calculator starts from.
    pub(crate) fn deactivated() -> Self {
        let snapshot = Self::new();
        snapshot.deactivate();
        snapshot
    }

    fn cell(&self, tid: usize, kind_index: usize) -> &AtomicU64 {
        &self.cells[tid][kind_index]
    }

    /// Records a collector's observation, unless the cell was already set.
    pub(crate) fn add(&self, tid: usize, kind: OpKind, counter: u64) {
        let cell = self.cell(tid, kind.index());
        if cell.load(Ordering::SeqCst) == INVALID_COUNTER {
            let _ = cell.compare_exchange(
                INVALID_COUNTER,
                counter,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }

    /// Publishes an updater's freshly-committed counter value, superseding
    /// any older observation.
    pub(crate) fn forward(&self, tid: usize, kind: OpKind, counter: u64) {
        let cell = self.cell(tid, kind.index());
        let mut observed = cell.load(Ordering::SeqCst);
        // Runs at most two iterations: counters advance one at a time and
        // forwarded values never regress.
        while observed == INVALID_COUNTER || counter > observed {
            match cell.compare_exchange(observed, counter, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break,
                Err(witnessed) => observed = witnessed,
            }
        }
    }

    pub(crate) fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::SeqCst)
    }

    /// Freezes the snapshot. This is the linearization point of the size
    /// computed from it.
    pub(crate) fn deactivate(&self) {
        self.collecting.store(false, Ordering::SeqCst);
    }

    pub(crate) fn set_fast_size(&self, value: i64) {
        self.fast_size.store(value, Ordering::SeqCst);
    }

    /// Sums the snapshot and publishes the result, racing with other helpers
    /// of the same snapshot; every racer returns the value that won.
    pub(crate) fn publish_total(&self, upper_bound: usize) -> i64 {
        let mut total = 0i64;
        for tid in 0..upper_bound {
            total += cell_value(self.cell(tid, OpKind::Insert.index()).load(Ordering::SeqCst))
                - cell_value(self.cell(tid, OpKind::Remove.index()).load(Ordering::SeqCst));
        }
        total += self.fast_size.load(Ordering::SeqCst);

        let _ = self
            .size
            .compare_exchange(INVALID_SIZE, total, Ordering::SeqCst, Ordering::SeqCst);
        self.published_size()
    }

    /// The published size, or [`INVALID_SIZE`] while the computation is in
    /// flight.
    pub(crate) fn published_size(&self) -> i64 {
        self.size.load(Ordering::SeqCst)
    }
}

/// An unobserved cell contributes nothing: it belongs to a thread that
/// registered after collection and whose only activity, if any, was already
/// forwarded into the other cell.
fn cell_value(counter: u64) -> i64 {
    if counter == INVALID_COUNTER {
        0
    } else {
        counter as i64
    }
}

/// A size-computation cell: either `INVALID_SIZE` or a computed size.
/// Threads racing to compute the same size compare-exchange the first value
/// in; later computations install a fresh cell.
pub(crate) struct SizeInfo {
    size: AtomicI64,
}

impl SizeInfo {
    pub(crate) fn new() -> Self {
        Self {
            size: AtomicI64::new(INVALID_SIZE),
        }
    }

    pub(crate) fn with_size(size: i64) -> Self {
        Self {
            size: AtomicI64::new(size),
        }
    }

    pub(crate) fn get(&self) -> i64 {
        self.size.load(Ordering::SeqCst)
    }

    pub(crate) fn set(&self, size: i64) {
        self.size.store(size, Ordering::SeqCst);
    }

    pub(crate) fn try_set(&self, size: i64) {
        let _ = self
            .size
            .compare_exchange(INVALID_SIZE, size, Ordering::SeqCst, Ordering::SeqCst);
    }
}

/// The slow-path core shared by the wait-free and handshake methodologies:
/// per-kind counters plus the raced snapshot cell.
pub(crate) struct SlowCounters {
    counters: KindCounters,
    snapshot: Atomic<CountersSnapshot>,
}

impl SlowCounters {
    pub(crate) fn new() -> Self {
        Self {
            counters: KindCounters::new(),
            snapshot: Atomic::new(CountersSnapshot::deactivated()),
        }
    }

    pub(crate) fn counter(&self, tid: usize, kind: OpKind) -> u64 {
        self.counters.get(tid, kind)
    }

    pub(crate) fn create_update_info(&self, kind: OpKind) -> UpdateInfo {
        let tid = registry::current_id();
        UpdateInfo::new(tid, self.counters.get(tid, kind) + 1)
    }

    /// Commits a pre-announced bump and forwards it into an active
    /// collection.
    pub(crate) fn update_metadata(&self, kind: OpKind, info: UpdateInfo, guard: &Guard) {
        let tid = info.tid();
        let counter = info.counter();

        self.counters.commit(tid, kind, counter);

        let snapshot = self.load_snapshot(guard);
        let snapshot = unsafe { snapshot.deref() };
        if snapshot.is_collecting() && self.counters.get(tid, kind) == counter {
            snapshot.forward(tid, kind, counter);
        }
    }

    /// Copies every thread's counters into the snapshot, re-scanning while
    /// the registry's upper bound grows.
    pub(crate) fn collect(&self, snapshot: &CountersSnapshot) {
        let mut tid = 0;
        let mut next_id = registry::upper_bound();
        loop {
            for t in tid..next_id {
                snapshot.add(t, OpKind::Insert, self.counters.get(t, OpKind::Insert));
                snapshot.add(t, OpKind::Remove, self.counters.get(t, OpKind::Remove));
            }
            let prev_id = next_id;
            next_id = registry::upper_bound();
            if prev_id == next_id {
                break;
            }
            tid = prev_id;
        }
    }

    pub(crate) fn load_snapshot<'g>(&self, guard: &'g Guard) -> Shared<'g, CountersSnapshot> {
        self.snapshot.load(Ordering::SeqCst, guard)
    }

    /// Races to supersede `current` with a fresh collecting snapshot.
    /// Returns the installed snapshot on success and the witnessed one on
    /// failure. The superseded snapshot is retired by the winner.
    pub(crate) fn install_snapshot<'g>(
        &self,
        current: Shared<'g, CountersSnapshot>,
        guard: &'g Guard,
    ) -> Result<Shared<'g, CountersSnapshot>, Shared<'g, CountersSnapshot>> {
        match self.snapshot.compare_exchange(
            current,
            Owned::new(CountersSnapshot::new()),
            Ordering::SeqCst,
            Ordering::SeqCst,
            guard,
        ) {
            Ok(installed) => {
                unsafe {
                    guard.defer_destroy(current);
                }
                Ok(installed)
            }
            Err(e) => Err(e.current),
        }
    }
}

impl Drop for SlowCounters {
    fn drop(&mut self) {
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let snapshot = self.snapshot.load(Ordering::Relaxed, guard);
        if !snapshot.is_null() {
            drop(unsafe { snapshot.into_owned() });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_bumps_at_most_once() {
        let counters = KindCounters::new();
        assert_eq!(counters.get(0, OpKind::Insert), 0);

        // Any number of helpers committing the same announcement moves the
        // counter exactly once.
        counters.commit(0, OpKind::Insert, 1);
        counters.commit(0, OpKind::Insert, 1);
        counters.commit(0, OpKind::Insert, 1);
        assert_eq!(counters.get(0, OpKind::Insert), 1);

        counters.commit(0, OpKind::Insert, 2);
        assert_eq!(counters.get(0, OpKind::Insert), 2);

        // A stale announcement never regresses the counter.
        counters.commit(0, OpKind::Insert, 1);
        assert_eq!(counters.get(0, OpKind::Insert), 2);
    }

    #[test]
    fn snapshot_add_keeps_first_observation() {
        let snapshot = CountersSnapshot::new();
        snapshot.add(1, OpKind::Insert, 5);
        snapshot.add(1, OpKind::Insert, 9);
        snapshot.add(1, OpKind::Remove, 2);
        assert_eq!(snapshot.publish_total(2), 3);
    }

    #[test]
    fn snapshot_forward_supersedes_older_values() {
        let snapshot = CountersSnapshot::new();
        snapshot.add(0, OpKind::Insert, 4);
        snapshot.forward(0, OpKind::Insert, 5);
        // Forwarding below the observed value is a no-op.
        snapshot.forward(0, OpKind::Insert, 3);
        snapshot.add(0, OpKind::Remove, 0);
        assert_eq!(snapshot.publish_total(1), 5);
    }

    #[test]
    fn snapshot_publishes_once() {
        let snapshot = CountersSnapshot::new();
        snapshot.add(0, OpKind::Insert, 7);
        snapshot.add(0, OpKind::Remove, 3);
        assert_eq!(snapshot.published_size(), INVALID_SIZE);
        assert_eq!(snapshot.publish_total(1), 4);

        // A second helper arriving later computes over the same frozen cells
        // and observes the already-published value.
        assert_eq!(snapshot.publish_total(1), 4);
    }

    #[test]
    fn unobserved_cells_contribute_nothing() {
        let snapshot = CountersSnapshot::new();
        snapshot.add(0, OpKind::Insert, 2);
        snapshot.add(0, OpKind::Remove, 1);
        // Thread 1 registered after collection; only its insert was
        // forwarded.
        snapshot.forward(1, OpKind::Insert, 1);
        assert_eq!(snapshot.publish_total(2), 2);
    }

    #[test]
    fn size_info_keeps_the_first_computed_size() {
        let info = SizeInfo::new();
        assert_eq!(info.get(), INVALID_SIZE);
        info.try_set(42);
        info.try_set(43);
        assert_eq!(info.get(), 42);
    }
}
