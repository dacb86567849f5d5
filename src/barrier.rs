//! Idle-time dynamic barrier.
//!
//! A two-phase barrier that lets a coordinator switch the system between even
//! and odd phases while threads register and leave dynamically. It is
//! "idle-time" because a latecomer that arrives after a trigger behaves as if
//! it had been present for the end of the prior phase: registration during an
//! active barrier blocks until every previously-registered thread has crossed.
//!
//! The state is two packed 64-bit words:
//!
//! - `sense_phase`: the phase counter in bits `0..63` and a sense bit in bit
//!   63. The barrier is inactive exactly when the sense bit equals the phase
//!   parity.
//! - `parity_size_waiting`: the phase parity in bit 63, the number of active
//!   (registered) threads in bits `31..62`, and the number of threads waiting
//!   on the barrier in bits `0..31`.
//!
//! Bundling parity, active count and waiting count in one word lets a single
//! compare-exchange rotate the parity while reading the exact `(active,
//! waiting)` pair, which is what decides when the barrier deactivates.
//!
//! Per-thread phases are kept in a slot array indexed by the thread's
//! registry identifier rather than in a thread-local, so a coordinator can be
//! any registered thread.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::{common::MAX_THREADS, registry};

const SIZE_SHIFT: u32 = 31;
const PARITY_SHIFT: u32 = 63;
const SENSE_SHIFT: u32 = 63;

const SIZE_INCREMENT: u64 = 1 << SIZE_SHIFT;
const SENSE_MASK: u64 = 1 << SENSE_SHIFT;
const PHASE_MASK: u64 = SENSE_MASK - 1;
const WAITING_MASK: u64 = (1 << SIZE_SHIFT) - 1;

pub(crate) struct IdleTimeDynamicBarrier {
    sense_phase: CachePadded<AtomicU64>,
    parity_size_waiting: CachePadded<AtomicU64>,
    thread_phases: Box<[CachePadded<AtomicU64>]>,
}

impl Default for IdleTimeDynamicBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleTimeDynamicBarrier {
    pub(crate) fn new() -> Self {
        let thread_phases = std::iter::repeat_with(|| CachePadded::new(AtomicU64::new(0)))
            .take(MAX_THREADS)
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            sense_phase: CachePadded::new(AtomicU64::new(0)),
            parity_size_waiting: CachePadded::new(AtomicU64::new(0)),
            thread_phases,
        }
    }

    /// The barrier's current phase. Even phases permit the fast path.
    pub(crate) fn phase(&self) -> u64 {
        extract_phase(self.sense_phase.load(Ordering::SeqCst))
    }

    /// The phase last observed by the calling thread.
    pub(crate) fn thread_phase(&self) -> u64 {
        self.thread_phases[registry::current_id()].load(Ordering::SeqCst)
    }

    /// Joins the barrier's active set. If the barrier is active, blocks until
    /// every active thread has crossed into the current phase.
    pub(crate) fn register(&self) {
        self.increment_size();
        self.set_thread_phase(self.phase());
        if self.is_active() {
            let witnessed = self.increment_waiting();
            if extract_parity(witnessed) != self.thread_phase_lsb() {
                // The waiting increment raced with a phase flip and was
                // counted toward the newer phase.
                self.increment_thread_phase();
            }
            self.waiting_loop();
        }
    }

    /// Leaves the active set.
    pub(crate) fn leave(&self) {
        self.parity_size_waiting
            .fetch_sub(SIZE_INCREMENT, Ordering::SeqCst);
    }

    /// Crosses into the current phase, blocking until the barrier
    /// deactivates. No-op when the calling thread is already in phase.
    pub(crate) fn await_phase(&self) {
        if self.thread_phase() == self.phase() {
            return;
        }
        self.increment_thread_phase();
        self.increment_waiting();
        self.waiting_loop();
    }

    /// Starts the next phase. Returns once the phase counter is advanced;
    /// quiescence of the previous phase is observed by a later `register` or
    /// `await_phase`.
    pub(crate) fn trigger(&self) {
        self.prepare_next_phase();
        self.sense_phase.fetch_add(1, Ordering::SeqCst);
        if self.active_threads() == 0 {
            self.deactivate_from_trigger();
        }
    }

    /// Flips the parity and zeroes the waiting count, keeping the active
    /// count, in one compare-exchange.
    fn prepare_next_phase(&self) {
        let mut expected = self.parity_size_waiting.load(Ordering::SeqCst);
        loop {
            let new = ((1 - extract_parity(expected)) << PARITY_SHIFT)
                + (extract_size(expected) << SIZE_SHIFT);
            match self.parity_size_waiting.compare_exchange(
                expected,
                new,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(witnessed) => expected = witnessed,
            }
        }
    }

    fn waiting_loop(&self) {
        while self.is_active() {
            if self.all_active_threads_blocked() {
                self.deactivate();
            }
            std::hint::spin_loop();
        }
    }

    /// Active while the sense bit disagrees with the calling thread's phase
    /// parity.
    fn is_active(&self) -> bool {
        extract_sense(self.sense_phase.load(Ordering::SeqCst)) != self.thread_phase_lsb()
    }

    fn all_active_threads_blocked(&self) -> bool {
        let word = self.parity_size_waiting.load(Ordering::SeqCst);
        extract_size(word) == extract_waiting(word)
    }

    /// Flips the sense bit to the calling thread's phase parity, provided the
    /// phase has not moved on.
    fn deactivate(&self) {
        let thread_phase = self.thread_phase();
        let lsb = thread_phase & 1;
        let expected = thread_phase + ((1 - lsb) << SENSE_SHIFT);
        let new = thread_phase + (lsb << SENSE_SHIFT);
        let _ = self.sense_phase.compare_exchange(
            expected,
            new,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Deactivation when `trigger` finds no active threads. A plain store is
    /// sufficient: with zero active threads there is no waiter racing to
    /// deactivate the same phase.
    fn deactivate_from_trigger(&self) {
        let phase = self.phase();
        self.sense_phase
            .store(((phase & 1) << SENSE_SHIFT) + phase, Ordering::SeqCst);
    }

    fn active_threads(&self) -> u64 {
        extract_size(self.parity_size_waiting.load(Ordering::SeqCst))
    }

    fn increment_size(&self) {
        self.parity_size_waiting
            .fetch_add(SIZE_INCREMENT, Ordering::SeqCst);
    }

    /// Returns the packed word as it was before the increment.
    fn increment_waiting(&self) -> u64 {
        self.parity_size_waiting.fetch_add(1, Ordering::SeqCst)
    }

    fn thread_phase_lsb(&self) -> u64 {
        self.thread_phase() & 1
    }

    fn set_thread_phase(&self, phase: u64) {
        self.thread_phases[registry::current_id()].store(phase, Ordering::SeqCst);
    }

    fn increment_thread_phase(&self) {
        let slot = &self.thread_phases[registry::current_id()];
        slot.store(slot.load(Ordering::SeqCst) + 1, Ordering::SeqCst);
    }
}

fn extract_parity(word: u64) -> u64 {
    (word >> PARITY_SHIFT) & 1
}

fn extract_sense(word: u64) -> u64 {
    (word >> SENSE_SHIFT) & 1
}

fn extract_waiting(word: u64) -> u64 {
    word & WAITING_MASK
}

fn extract_size(word: u64) -> u64 {
    (word >> SIZE_SHIFT) & WAITING_MASK
}

fn extract_phase(word: u64) -> u64 {
    word & PHASE_MASK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;
    use std::sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Barrier,
    };

    #[test]
    fn trigger_with_no_active_threads_deactivates_synchronously() {
        let _reg = registry::register().unwrap();
        let barrier = IdleTimeDynamicBarrier::new();
        assert_eq!(barrier.phase(), 0);

        barrier.trigger();
        assert_eq!(barrier.phase(), 1);

        // The barrier deactivated eagerly, so registration must not block.
        barrier.register();
        assert_eq!(barrier.thread_phase(), 1);
        barrier.leave();
    }

    #[test]
    fn register_and_leave_track_the_active_count() {
        let _reg = registry::register().unwrap();
        let barrier = IdleTimeDynamicBarrier::new();
        barrier.register();
        assert_eq!(barrier.active_threads(), 1);
        barrier.leave();
        assert_eq!(barrier.active_threads(), 0);
    }

    #[test]
    fn registered_threads_observe_triggered_phase() {
        const NUM_THREADS: usize = 4;

        let barrier = Arc::new(IdleTimeDynamicBarrier::new());
        let start = Arc::new(Barrier::new(NUM_THREADS + 1));
        let stop = Arc::new(AtomicBool::new(false));
        let max_seen = Arc::new(AtomicU64::new(0));

        let threads: Vec<_> = (0..NUM_THREADS)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let start = Arc::clone(&start);
                let stop = Arc::clone(&stop);
                let max_seen = Arc::clone(&max_seen);

                std::thread::spawn(move || {
                    let _reg = registry::register().unwrap();
                    start.wait();
                    let mut last_phase = 0;
                    while !stop.load(Ordering::Relaxed) {
                        barrier.register();
                        let phase = barrier.thread_phase();
                        // Per-thread phase observations are monotone.
                        assert!(phase >= last_phase);
                        last_phase = phase;
                        max_seen.fetch_max(phase, Ordering::Relaxed);
                        barrier.leave();
                    }
                })
            })
            .collect();

        let _reg = registry::register().unwrap();
        start.wait();

        for expected in 1..=10u64 {
            barrier.trigger();
            barrier.register();
            // Our own registration blocked until the previous phase
            // quiesced, so everyone who was active crossed.
            assert_eq!(barrier.thread_phase(), expected);
            barrier.leave();
        }

        stop.store(true, Ordering::Relaxed);
        for thread in threads {
            thread.join().unwrap();
        }

        assert!(max_seen.load(Ordering::Relaxed) <= 10);
    }

    #[test]
    fn await_phase_is_a_noop_in_the_current_phase() {
        let _reg = registry::register().unwrap();
        let barrier = IdleTimeDynamicBarrier::new();
        barrier.register();
        barrier.await_phase();
        assert_eq!(barrier.thread_phase(), 0);
        barrier.leave();
    }
}
