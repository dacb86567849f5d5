//! Optimistic size methodology.
//!
//! Each thread keeps two counters: a **metadata** counter bumped on every
//! update linearization, and an **activity** counter whose parity says
//! whether the thread is inside its bump window: odd between `block_size`
//! and `unblock_size`, even outside, exactly two bumps per update.
//!
//! A size performs an optimistic read: snapshot the activity counters
//! (waiting out any odd ones), sum the metadata counters, and revalidate the
//! activity counters. If any advanced, or a new thread registered, the read
//! retries. After `max_tries` failed attempts the size registers itself in a
//! global `awaiting_sizes` cell; updaters check it after every update and run
//! the same optimistic read on the size's behalf, installing the result into
//! a shared [`SizeInfo`] by compare-exchange.
//!
//! Updates stay wait-free; size is lock-free: either some optimistic read
//! validates, or updates are in flight and one of them will help.

use std::sync::atomic::{AtomicI64, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;

use crate::{
    calc::{
        counters::{FastCounters, SizeInfo, INVALID_SIZE},
        OpKind, SizeCalculator,
    },
    registry,
};

/// Default bound on optimistic attempts before a size asks for help.
pub const DEFAULT_MAX_TRIES: usize = 3;

pub struct OptimisticSizeCalculator {
    max_tries: usize,
    metadata: FastCounters,
    activity: FastCounters,
    awaiting_sizes: CachePadded<AtomicI64>,
    size_info: CachePadded<Atomic<SizeInfo>>,
}

impl Default for OptimisticSizeCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimisticSizeCalculator {
    pub fn new() -> Self {
        Self::with_max_tries(DEFAULT_MAX_TRIES)
    }

    /// `max_tries` trades update-path overhead against size-path latency:
    /// with `0`, every contended size asks updaters for help immediately.
    pub fn with_max_tries(max_tries: usize) -> Self {
        Self {
            max_tries,
            metadata: FastCounters::new(),
            activity: FastCounters::new(),
            awaiting_sizes: CachePadded::new(AtomicI64::new(0)),
            size_info: CachePadded::new(Atomic::new(SizeInfo::with_size(0))),
        }
    }

    /// Number of size operations currently registered for updater help.
    /// Returns to zero once every size completes.
    pub fn awaiting_sizes(&self) -> i64 {
        self.awaiting_sizes.load(Ordering::SeqCst)
    }

    /// Marks the calling thread as inside its bump window.
    fn block_size(&self) {
        self.activity.add(registry::current_id(), 1);
    }

    /// Marks the window closed. The pair leaves the activity counter two
    /// higher and even.
    fn unblock_size(&self) {
        self.activity.add(registry::current_id(), 1);
    }

    /// Runs an optimistic read on behalf of any size that exhausted its
    /// retries. Called by updaters after every update.
    pub fn help_size(&self) {
        if self.awaiting_sizes.load(Ordering::SeqCst) <= 0 {
            return;
        }
        let guard = &epoch::pin();
        let info = unsafe { self.size_info.load(Ordering::SeqCst, guard).deref() };
        if info.get() != INVALID_SIZE {
            return;
        }
        loop {
            if info.get() != INVALID_SIZE {
                return;
            }
            let status = self.observe_activity();
            let sum = self.sum_metadata();
            if self.validate_activity(&status) {
                info.try_set(sum);
                return;
            }
        }
    }

    /// Snapshots every thread's activity counter, waiting out threads that
    /// are mid-bump (odd counter).
    fn observe_activity(&self) -> Vec<i64> {
        let next_id = registry::upper_bound();
        let mut status = Vec::with_capacity(next_id);
        let mut tid = 0;
        while tid < next_id {
            let observed = self.activity.get(tid);
            if observed % 2 == 0 {
                status.push(observed);
                tid += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        status
    }

    /// Revalidates an activity snapshot: fails if any counter advanced or a
    /// new thread registered since it was taken.
    fn validate_activity(&self, status: &[i64]) -> bool {
        let mut tid = 0;
        let mut next_id = registry::upper_bound();
        loop {
            while tid < next_id {
                if tid >= status.len() || self.activity.get(tid) > status[tid] {
                    return false;
                }
                tid += 1;
            }
            let prev_id = next_id;
            next_id = registry::upper_bound();
            if prev_id == next_id {
                return true;
            }
        }
    }

    fn sum_metadata(&self) -> i64 {
        let next_id = registry::upper_bound();
        let mut total = 0;
        for tid in 0..next_id {
            total += self.metadata.get(tid);
        }
        total
    }

    /// Races to supersede a completed cell with a fresh one. Returns the
    /// installed cell on success and the witnessed cell on failure.
    fn install_size_info<'g>(
        &self,
        current: Shared<'g, SizeInfo>,
        guard: &'g Guard,
    ) -> Result<Shared<'g, SizeInfo>, Shared<'g, SizeInfo>> {
        match self.size_info.compare_exchange(
            current,
            Owned::new(SizeInfo::new()),
            Ordering::SeqCst,
            Ordering::SeqCst,
            guard,
        ) {
            Ok(installed) => {
                unsafe { guard.defer_destroy(current) };
                Ok(installed)
            }
            Err(e) => Err(e.current),
        }
    }
}

impl SizeCalculator for OptimisticSizeCalculator {
    /// Pinned even: every update takes the fast path.
    fn size_phase(&self) -> u64 {
        0
    }

    fn exit_update(&self) {
        self.help_size();
    }

    fn fast_update_metadata(&self, kind: OpKind) {
        self.block_size();
        self.metadata.add(registry::current_id(), kind.delta());
        self.unblock_size();
    }

    fn compute(&self) -> i64 {
        let guard = &epoch::pin();
        let mut count = 0;
        let current = self.size_info.load(Ordering::SeqCst, guard);
        let current_ref = unsafe { current.deref() };

        let mut valid_size_info;
        let mut active: &SizeInfo;

        if current_ref.get() == INVALID_SIZE {
            // A computation is in flight; join it.
            valid_size_info = false;
            active = current_ref;
        } else {
            // The previous size completed; race to install a fresh cell.
            valid_size_info = true;
            active = match self.install_size_info(current, guard) {
                Ok(installed) => unsafe { installed.deref() },
                Err(witnessed) => unsafe { witnessed.deref() },
            };
        }

        let size;
        loop {
            let published = active.get();
            if published != INVALID_SIZE {
                if valid_size_info {
                    size = published;
                    break;
                }
                // The cell we joined was completed against an older size
                // call; supersede it so our answer is at least as fresh as
                // our invocation.
                valid_size_info = true;
                match self.install_size_info(current, guard) {
                    Ok(installed) => active = unsafe { installed.deref() },
                    Err(witnessed) => {
                        active = unsafe { witnessed.deref() };
                        let published = active.get();
                        if published != INVALID_SIZE {
                            size = published;
                            break;
                        }
                    }
                }
            }

            if count == self.max_tries {
                self.awaiting_sizes.fetch_add(1, Ordering::SeqCst);
            }
            if count <= self.max_tries {
                count += 1;
            }

            let status = self.observe_activity();
            let sum = self.sum_metadata();
            if self.validate_activity(&status) {
                active.try_set(sum);
                size = sum;
                break;
            }
        }

        if count == self.max_tries + 1 {
            self.awaiting_sizes.fetch_sub(1, Ordering::SeqCst);
        }

        size
    }
}

impl Drop for OptimisticSizeCalculator {
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
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Barrier,
    };

    #[test]
    fn sequential_updates_are_counted() {
        let _reg = registry::register().unwrap();
        let calc = OptimisticSizeCalculator::new();
        assert_eq!(calc.compute(), 0);

        calc.fast_update_metadata(OpKind::Insert);
        calc.fast_update_metadata(OpKind::Insert);
        calc.fast_update_metadata(OpKind::Remove);
        assert_eq!(calc.compute(), 1);
    }

    #[test]
    fn activity_counter_bumps_exactly_twice_per_update() {
        let reg = registry::register().unwrap();
        let calc = OptimisticSizeCalculator::new();

        let before = calc.activity.get(reg.id());
        calc.fast_update_metadata(OpKind::Insert);
        let after = calc.activity.get(reg.id());

        assert_eq!(after - before, 2);
        assert_eq!(after % 2, 0);
    }

    #[test]
    fn validation_fails_when_an_update_intervenes() {
        let _reg = registry::register().unwrap();
        let calc = OptimisticSizeCalculator::new();

        let status = calc.observe_activity();
        assert!(calc.validate_activity(&status));

        calc.fast_update_metadata(OpKind::Insert);
        assert!(!calc.validate_activity(&status));
    }

    #[test]
    fn help_size_is_a_noop_without_waiters() {
        let _reg = registry::register().unwrap();
        let calc = OptimisticSizeCalculator::new();
        calc.help_size();
        assert_eq!(calc.awaiting_sizes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn awaiting_sizes_returns_to_zero_under_contention() {
        const NUM_THREADS: usize = 4;
        const OPS_PER_THREAD: i64 = 2000;

        // A tight retry budget forces sizes through the help protocol.
        let calc = Arc::new(OptimisticSizeCalculator::with_max_tries(2));
        let start = Arc::new(Barrier::new(NUM_THREADS + 2));
        let stop = Arc::new(AtomicBool::new(false));

        let threads: Vec<_> = (0..NUM_THREADS)
            .map(|_| {
                let calc = Arc::clone(&calc);
                let start = Arc::clone(&start);
                std::thread::spawn(move || {
                    let _reg = registry::register().unwrap();
                    start.wait();
                    for _ in 0..OPS_PER_THREAD {
                        calc.fast_update_metadata(OpKind::Insert);
                        calc.exit_update();
                    }
                })
            })
            .collect();

        let sizer = {
            let calc = Arc::clone(&calc);
            let start = Arc::clone(&start);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let _reg = registry::register().unwrap();
                start.wait();
                let mut last = 0;
                while !stop.load(Ordering::Relaxed) {
                    let size = calc.compute();
                    assert!(size >= last);
                    last = size;
                }
            })
        };

        let _reg = registry::register().unwrap();
        start.wait();
        for thread in threads {
            thread.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        sizer.join().unwrap();

        assert_eq!(calc.awaiting_sizes.load(Ordering::SeqCst), 0);
        assert_eq!(calc.compute(), NUM_THREADS as i64 * OPS_PER_THREAD);
    }

    #[test]
    fn zero_max_tries_asks_for_help_immediately() {
        let _reg = registry::register().unwrap();
        let calc = OptimisticSizeCalculator::with_max_tries(0);
        calc.fast_update_metadata(OpKind::Insert);
        assert_eq!(calc.compute(), 1);
        assert_eq!(calc.awaiting_sizes.load(Ordering::SeqCst), 0);
    }
}
