//! Wait-free size methodology.
//!
//! Every update runs on the slow path: it pre-announces its counter bump with
//! an [`UpdateInfo`], links it into the structure, linearizes, and then
//! commits the bump, where any observer may commit on its behalf. A size
//! operation installs a shared [`CountersSnapshot`], collects every thread's
//! counters into it, and deactivates it; deactivation is the size's
//! linearization point. Updaters that commit while the snapshot is
//! collecting forward their new values into it, so no collector ever waits
//! on an updater and no updater ever waits on a collector.
//!
//! Concurrent size callers all help the same active snapshot and return the
//! same value, which makes `compute` wait-free: its work is bounded by the
//! number of registered threads.

use crossbeam_epoch as epoch;

use crate::{
    calc::{counters::SlowCounters, OpKind, SizeCalculator, UpdateInfo},
    registry,
};

pub struct SpSizeCalculator {
    slow: SlowCounters,
}

impl Default for SpSizeCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl SpSizeCalculator {
    pub fn new() -> Self {
        Self {
            slow: SlowCounters::new(),
        }
    }

    fn compute_size(&self) -> i64 {
        let guard = &epoch::pin();
        let current = self.slow.load_snapshot(guard);

        let active = if unsafe { current.deref() }.is_collecting() {
            current
        } else {
            // The previous size completed; race to install a fresh snapshot.
            // Losing the race means another size call just installed one, so
            // help it instead.
            match self.slow.install_snapshot(current, guard) {
                Ok(installed) => installed,
                Err(witnessed) => witnessed,
            }
        };

        let active = unsafe { active.deref() };
        self.slow.collect(active);
        active.deactivate();
        active.publish_total(registry::upper_bound())
    }
}

impl SizeCalculator for SpSizeCalculator {
    /// Pinned odd: every update takes the slow path.
    fn size_phase(&self) -> u64 {
        1
    }

    fn create_update_info(&self, kind: OpKind) -> UpdateInfo {
        self.slow.create_update_info(kind)
    }

    fn update_metadata(&self, kind: OpKind, info: UpdateInfo) {
        let guard = &epoch::pin();
        self.slow.update_metadata(kind, info, guard);
    }

    fn compute(&self) -> i64 {
        self.compute_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;

    #[test]
    fn sequential_updates_are_counted() {
        let reg = registry::register().unwrap();
        let calc = SpSizeCalculator::new();
        assert_eq!(calc.compute(), 0);

        let info = calc.create_update_info(OpKind::Insert);
        assert_eq!(info.tid(), reg.id());
        assert_eq!(info.counter(), 1);
        calc.update_metadata(OpKind::Insert, info);

        let info = calc.create_update_info(OpKind::Insert);
        assert_eq!(info.counter(), 2);
        calc.update_metadata(OpKind::Insert, info);

        let info = calc.create_update_info(OpKind::Remove);
        calc.update_metadata(OpKind::Remove, info);

        assert_eq!(calc.compute(), 1);
    }

    #[test]
    fn helpers_commit_idempotently() {
        let _reg = registry::register().unwrap();
        let calc = SpSizeCalculator::new();

        let info = calc.create_update_info(OpKind::Insert);
        // The responsible thread and two helpers all commit the same
        // announcement.
        calc.update_metadata(OpKind::Insert, info);
        calc.update_metadata(OpKind::Insert, info);
        calc.update_metadata(OpKind::Insert, info);

        assert_eq!(calc.compute(), 1);
    }

    #[test]
    fn consecutive_sizes_reuse_nothing() {
        let _reg = registry::register().unwrap();
        let calc = SpSizeCalculator::new();
        for expected in 1..=5 {
            let info = calc.create_update_info(OpKind::Insert);
            calc.update_metadata(OpKind::Insert, info);
            assert_eq!(calc.compute(), expected);
        }
    }
}
