//! Handshake size methodology.
//!
//! Between sizes, updates run on a fast path that bumps a single signed
//! per-thread counter and never allocates an [`UpdateInfo`]. A size
//! coordinator steers the system to the slow path with the idle-time
//! dynamic barrier: it triggers the next (odd)
//! phase and registers, which blocks until every in-flight fast-path update
//! has drained. It then pre-aggregates the fast counters into the snapshot's
//! `fast_size`, collects the slow counters the wait-free way, triggers the
//! next (even) phase to release updaters back to the fast path, waits for
//! the crossing, and deactivates the snapshot, which is the size's
//! linearization point.
//!
//! Updaters consult their barrier phase on entry to every operation: an even
//! phase permits the fast path, an odd phase requires the slow one.

use crossbeam_epoch as epoch;

use crate::{
    barrier::IdleTimeDynamicBarrier,
    calc::{
        counters::{FastCounters, SlowCounters, INVALID_SIZE},
        OpKind, SizeCalculator, UpdateInfo,
    },
    registry,
};

pub struct HandshakeSizeCalculator {
    slow: SlowCounters,
    fast_counters: FastCounters,
    barrier: IdleTimeDynamicBarrier,
}

impl Default for HandshakeSizeCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeSizeCalculator {
    pub fn new() -> Self {
        Self {
            slow: SlowCounters::new(),
            fast_counters: FastCounters::new(),
            barrier: IdleTimeDynamicBarrier::new(),
        }
    }

    /// Runs the two-trigger handshake and publishes the size. Called only by
    /// the thread that won the snapshot installation race.
    fn coordinate(&self, snapshot: &super::counters::CountersSnapshot) -> i64 {
        // Odd phase: move updaters to the slow path. Registering while the
        // barrier is active doubles as the handshake wait: it returns once
        // every previously-active thread has crossed, so no fast-path update
        // can linearize past this point.
        self.barrier.trigger();
        self.barrier.register();

        snapshot.set_fast_size(self.sum_fast_counters());
        self.slow.collect(snapshot);

        // Even phase: release updaters back to the fast path.
        self.barrier.trigger();
        self.barrier.await_phase();
        self.barrier.leave();

        snapshot.deactivate();
        snapshot.publish_total(registry::upper_bound())
    }

    /// Fast counters are quiescent here: every thread is on the slow path.
    fn sum_fast_counters(&self) -> i64 {
        let mut total = 0;
        let mut tid = 0;
        let mut next_id = registry::upper_bound();
        loop {
            for t in tid..next_id {
                total += self.fast_counters.get(t);
            }
            let prev_id = next_id;
            next_id = registry::upper_bound();
            if prev_id == next_id {
                return total;
            }
            tid = prev_id;
        }
    }

    /// Spins until the snapshot's owner publishes its size.
    fn wait_for_size(snapshot: &super::counters::CountersSnapshot) -> i64 {
        loop {
            let size = snapshot.published_size();
            if size != INVALID_SIZE {
                return size;
            }
            std::hint::spin_loop();
        }
    }
}

impl SizeCalculator for HandshakeSizeCalculator {
    fn register_to_barrier(&self) {
        self.barrier.register();
    }

    fn leave_barrier(&self) {
        self.barrier.leave();
    }

    fn size_phase(&self) -> u64 {
        self.barrier.thread_phase()
    }

    fn create_update_info(&self, kind: OpKind) -> UpdateInfo {
        self.slow.create_update_info(kind)
    }

    fn update_metadata(&self, kind: OpKind, info: UpdateInfo) {
        let guard = &epoch::pin();
        self.slow.update_metadata(kind, info, guard);
    }

    fn fast_update_metadata(&self, kind: OpKind) {
        self.fast_counters.add(registry::current_id(), kind.delta());
    }

    fn compute(&self) -> i64 {
        let guard = &epoch::pin();
        let current = self.slow.load_snapshot(guard);

        if unsafe { current.deref() }.is_collecting() {
            // A size is already in flight; its linearization point serves
            // this call too.
            return Self::wait_for_size(unsafe { current.deref() });
        }

        match self.slow.install_snapshot(current, guard) {
            Ok(installed) => self.coordinate(unsafe { installed.deref() }),
            Err(witnessed) => Self::wait_for_size(unsafe { witnessed.deref() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;
    use std::sync::{Arc, Barrier};

    #[test]
    fn phases_start_fast() {
        let _reg = registry::register().unwrap();
        let calc = HandshakeSizeCalculator::new();
        calc.register_to_barrier();
        assert_eq!(calc.size_phase() & 1, 0);
        calc.leave_barrier();
    }

    #[test]
    fn fast_updates_are_counted() {
        let _reg = registry::register().unwrap();
        let calc = HandshakeSizeCalculator::new();

        for _ in 0..3 {
            calc.fast_update_metadata(OpKind::Insert);
        }
        calc.fast_update_metadata(OpKind::Remove);

        assert_eq!(calc.compute(), 2);
    }

    #[test]
    fn fast_and_slow_contributions_combine() {
        let _reg = registry::register().unwrap();
        let calc = HandshakeSizeCalculator::new();

        calc.fast_update_metadata(OpKind::Insert);
        let info = calc.create_update_info(OpKind::Insert);
        calc.update_metadata(OpKind::Insert, info);

        assert_eq!(calc.compute(), 2);
    }

    #[test]
    fn each_size_runs_two_phase_transitions() {
        let _reg = registry::register().unwrap();
        let calc = HandshakeSizeCalculator::new();

        let before = calc.barrier.phase();
        for i in 1..=3 {
            calc.compute();
            assert_eq!(calc.barrier.phase(), before + 2 * i);
        }
    }

    #[test]
    fn concurrent_updaters_and_sizes_agree_at_quiescence() {
        const NUM_THREADS: usize = 4;
        const OPS_PER_THREAD: i64 = 1000;

        let calc = Arc::new(HandshakeSizeCalculator::new());
        let start = Arc::new(Barrier::new(NUM_THREADS + 1));

        let threads: Vec<_> = (0..NUM_THREADS)
            .map(|_| {
                let calc = Arc::clone(&calc);
                let start = Arc::clone(&start);
                std::thread::spawn(move || {
                    let _reg = registry::register().unwrap();
                    start.wait();
                    for _ in 0..OPS_PER_THREAD {
                        calc.register_to_barrier();
                        if calc.size_phase() & 1 == 0 {
                            calc.fast_update_metadata(OpKind::Insert);
                        } else {
                            let info = calc.create_update_info(OpKind::Insert);
                            calc.update_metadata(OpKind::Insert, info);
                        }
                        calc.leave_barrier();
                    }
                })
            })
            .collect();

        let _reg = registry::register().unwrap();
        start.wait();
        let mut last = 0;
        for _ in 0..100 {
            let size = calc.compute();
            // Inserts only, so sizes are monotone.
            assert!(size >= last);
            last = size;
        }

        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(calc.compute(), NUM_THREADS as i64 * OPS_PER_THREAD);
    }
}
