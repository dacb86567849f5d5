//! Lock-based size methodology.
//!
//! Updates run on the fast path and hold the shared side of a reader-writer
//! lock across linearization and counter bump. A size acquires the exclusive
//! side, which is a quiescence point: every update either linearizes and
//! bumps entirely before the writer acquires, or entirely after it releases,
//! so a plain sum of the counters under the write lock is linearizable.
//!
//! Threads racing on `compute` install a fresh [`SizeInfo`] by
//! compare-exchange so that only one of them takes the writer; the losers
//! wait for the winner's published result.

use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Owned};
use crossbeam_utils::CachePadded;
use parking_lot::{lock_api::RawRwLock as _, RawRwLock};

use crate::{
    calc::{
        counters::{FastCounters, SizeInfo, INVALID_SIZE},
        OpKind, SizeCalculator,
    },
    registry,
};

pub struct LockSizeCalculator {
    counters: FastCounters,
    lock: CachePadded<RawRwLock>,
    size_info: CachePadded<Atomic<SizeInfo>>,
}

impl Default for LockSizeCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl LockSizeCalculator {
    pub fn new() -> Self {
        Self {
            counters: FastCounters::new(),
            lock: CachePadded::new(RawRwLock::INIT),
            // The initial cell is pre-completed so the first size installs a
            // fresh one.
            size_info: CachePadded::new(Atomic::new(SizeInfo::with_size(0))),
        }
    }

    /// Sums every thread's counter, re-scanning while the registry's upper
    /// bound grows. Must run under the exclusive stamp.
    fn sum_counters(&self) -> i64 {
        let mut total = 0;
        let mut tid = 0;
        let mut next_id = registry::upper_bound();
        loop {
            for t in tid..next_id {
                total += self.counters.get(t);
            }
            let prev_id = next_id;
            next_id = registry::upper_bound();
            if prev_id == next_id {
                return total;
            }
            tid = prev_id;
        }
    }

    fn wait_for_size(info: &SizeInfo) -> i64 {
        loop {
            let size = info.get();
            if size != INVALID_SIZE {
                return size;
            }
            std::hint::spin_loop();
        }
    }
}

impl SizeCalculator for LockSizeCalculator {
    /// Pinned even: every update takes the fast path.
    fn size_phase(&self) -> u64 {
        0
    }

    fn enter_update(&self) {
        self.lock.lock_shared();
    }

    fn exit_update(&self) {
        // Paired with the `lock_shared` in `enter_update` on this thread.
        unsafe { self.lock.unlock_shared() };
    }

    fn fast_update_metadata(&self, kind: OpKind) {
        self.counters.add(registry::current_id(), kind.delta());
    }

    fn compute(&self) -> i64 {
        let guard = &epoch::pin();
        let current = self.size_info.load(Ordering::SeqCst, guard);
        let current_ref = unsafe { current.deref() };

        if current_ref.get() == INVALID_SIZE {
            // Another thread holds the computation; wait for its result.
            return Self::wait_for_size(current_ref);
        }

        match self.size_info.compare_exchange(
            current,
            Owned::new(SizeInfo::new()),
            Ordering::SeqCst,
            Ordering::SeqCst,
            guard,
        ) {
            Ok(installed) => {
                // We own the computation: quiesce updaters and sum.
                self.lock.lock_exclusive();
                let size = self.sum_counters();
                unsafe { installed.deref() }.set(size);
                // Paired with the `lock_exclusive` above.
                unsafe { self.lock.unlock_exclusive() };
                unsafe { guard.defer_destroy(current) };
                size
            }
            Err(e) => Self::wait_for_size(unsafe { e.current.deref() }),
        }
    }
}

impl Drop for LockSizeCalculator {
    fn drop(&mut self) {
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let info = self.size_info.load(Ordering::Relaxed, guard);
        if !info.is_null() {
            drop(unsafe { info.into_owned() });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    #[test]
    fn sequential_updates_are_counted() {
        let _reg = registry::register().unwrap();
        let calc = LockSizeCalculator::new();
        assert_eq!(calc.compute(), 0);

        calc.enter_update();
        calc.fast_update_metadata(OpKind::Insert);
        calc.exit_update();
        calc.enter_update();
        calc.fast_update_metadata(OpKind::Insert);
        calc.exit_update();
        calc.enter_update();
        calc.fast_update_metadata(OpKind::Remove);
        calc.exit_update();

        assert_eq!(calc.compute(), 1);
    }

    #[test]
    fn concurrent_sizes_and_updates_quiesce() {
        const NUM_THREADS: usize = 4;
        const OPS_PER_THREAD: i64 = 2000;

        let calc = Arc::new(LockSizeCalculator::new());
        let start = Arc::new(Barrier::new(NUM_THREADS + 1));

        let threads: Vec<_> = (0..NUM_THREADS)
            .map(|_| {
                let calc = Arc::clone(&calc);
                let start = Arc::clone(&start);
                std::thread::spawn(move || {
                    let _reg = registry::register().unwrap();
                    start.wait();
                    for _ in 0..OPS_PER_THREAD {
                        calc.enter_update();
                        calc.fast_update_metadata(OpKind::Insert);
                        calc.exit_update();
                    }
                })
            })
            .collect();

        let _reg = registry::register().unwrap();
        start.wait();
        let mut last = 0;
        for _ in 0..200 {
            let size = calc.compute();
            assert!(size >= last);
            last = size;
        }

        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(calc.compute(), NUM_THREADS as i64 * OPS_PER_THREAD);
    }
}
