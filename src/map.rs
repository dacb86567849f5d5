//! A chaining hash table with a linearizable size.
//!
//! [`SizedHashMap`] is a fixed-capacity array of lock-free sorted linked
//! lists, each behind a dummy head. The table itself never resizes; the
//! per-bucket lists grow without bound, so capacity only affects constant
//! factors. Every operation is parameterized over a
//! [`SizeCalculator`] methodology and reports its linearization points
//! through the calculator's hooks, which is what makes
//! [`size`](SizedHashMap::size) return a value the map held at a single
//! instant during the call.
//!
//! Threads must be registered with [`registry`](crate::registry) before
//! operating on the map.

pub(crate) mod list;

use std::{
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hash, Hasher},
    sync::atomic::Ordering,
};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Shared};

use crate::calc::SizeCalculator;

use list::{Node, ValueSlot};

/// Default hasher for [`SizedHashMap`].
pub type DefaultHashBuilder = RandomState;

/// Default number of buckets.
const DEFAULT_CAPACITY: usize = 128;

pub struct SizedHashMap<K, V, C, S = DefaultHashBuilder> {
    pub(crate) buckets: Box<[Atomic<Node<K, V>>]>,
    pub(crate) build_hasher: S,
    pub(crate) calculator: C,
}

impl<K, V, C, S> Default for SizedHashMap<K, V, C, S>
where
    C: SizeCalculator + Default,
    S: Default,
{
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl<K, V, C, S> SizedHashMap<K, V, C, S>
where
    C: SizeCalculator + Default,
    S: Default,
{
    /// Creates an empty map with at least `capacity` buckets.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_calculator_and_hasher(capacity, C::default(), S::default())
    }
}

impl<K, V, C, S> SizedHashMap<K, V, C, S>
where
    C: SizeCalculator + Default,
{
    pub fn with_capacity_and_hasher(capacity: usize, build_hasher: S) -> Self {
        Self::with_capacity_calculator_and_hasher(capacity, C::default(), build_hasher)
    }
}

impl<K, V, C, S> SizedHashMap<K, V, C, S>
where
    C: SizeCalculator,
    S: Default,
{
    /// Creates an empty map around an explicitly configured calculator,
    /// e.g. an optimistic one with a custom retry bound.
    pub fn with_capacity_and_calculator(capacity: usize, calculator: C) -> Self {
        Self::with_capacity_calculator_and_hasher(capacity, calculator, S::default())
    }
}

impl<K, V, C, S> SizedHashMap<K, V, C, S>
where
    C: SizeCalculator,
{
    pub fn with_capacity_calculator_and_hasher(
        capacity: usize,
        calculator: C,
        build_hasher: S,
    ) -> Self {
        assert!(capacity > 0, "capacity must be non-zero");
        let capacity = capacity.next_power_of_two();
        let buckets = std::iter::repeat_with(|| Atomic::new(Node::head()))
            .take(capacity)
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            buckets,
            build_hasher,
            calculator,
        }
    }

    /// The calculator driving this map's size methodology.
    pub fn calculator(&self) -> &C {
        &self.calculator
    }
}

impl<K, V, C, S> SizedHashMap<K, V, C, S>
where
    K: Hash + Ord,
    C: SizeCalculator,
    S: BuildHasher,
{
    fn bucket_head<'g>(&self, key: &K, guard: &'g Guard) -> Shared<'g, Node<K, V>> {
        let index = (hash(&self.build_hasher, key) as usize) & (self.buckets.len() - 1);
        self.buckets[index].load(Ordering::Acquire, guard)
    }

    /// Returns whether the map contains `key`.
    pub fn contains_key(&self, key: &K) -> bool {
        self.get_with(key, |_| ()).is_some()
    }

    /// Applies `with_value` to the value mapped to `key`, if any.
    pub fn get_with<T>(&self, key: &K, with_value: impl FnOnce(&V) -> T) -> Option<T> {
        let guard = &epoch::pin();
        self.calculator.register_to_barrier();
        let head = self.bucket_head(key, guard);
        let result = if fast_path(self.calculator.size_phase()) {
            self.fast_get_with(head, key, with_value, guard)
        } else {
            self.slow_get_with(head, key, with_value, guard)
        };
        self.calculator.leave_barrier();
        result
    }

    /// Inserts `key` mapped to `value` unless present. Returns `true` if the
    /// key was newly inserted.
    pub fn insert(&self, key: K, value: V) -> bool {
        let guard = &epoch::pin();
        self.calculator.register_to_barrier();
        let head = self.bucket_head(&key, guard);
        self.calculator.enter_update();
        let inserted = if fast_path(self.calculator.size_phase()) {
            self.fast_insert(head, key, value, guard)
        } else {
            self.slow_insert(head, key, value, guard)
        };
        self.calculator.exit_update();
        self.calculator.leave_barrier();
        inserted
    }

    /// Removes `key`. Returns `true` if the key was present.
    pub fn remove(&self, key: &K) -> bool {
        self.remove_if(key, |_| true)
    }

    /// Removes `key` if its value satisfies `condition`. Returns `true` if
    /// the key was removed.
    pub fn remove_if(&self, key: &K, condition: impl FnMut(&V) -> bool) -> bool {
        let guard = &epoch::pin();
        self.calculator.register_to_barrier();
        let head = self.bucket_head(key, guard);
        self.calculator.enter_update();
        let removed = if fast_path(self.calculator.size_phase()) {
            self.fast_remove(head, key, condition, guard)
        } else {
            self.slow_remove(head, key, condition, guard)
        };
        self.calculator.exit_update();
        self.calculator.leave_barrier();
        removed
    }

    /// The map's size at some instant between this call's invocation and
    /// return.
    pub fn size(&self) -> i64 {
        self.calculator.compute()
    }

    /// [`size`](Self::size), saturated into `usize`.
    pub fn len(&self) -> usize {
        usize::try_from(self.size()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V, C, S> SizedHashMap<K, V, C, S>
where
    K: Ord,
    C: SizeCalculator,
{
    /// Counts live entries by traversal. Unlike [`size`](Self::size) this is
    /// accurate only at quiescence; it exists to cross-check the calculator.
    pub fn scan_len(&self) -> usize {
        let guard = &epoch::pin();
        let mut count = 0;
        self.walk_entries(guard, |_, _| count += 1);
        count
    }

    /// Commits and clears every pending update annotation in the table, and
    /// finishes every marked removal. Intended for quiescent maintenance.
    pub fn clean_pending_update_info(&self) {
        let guard = &epoch::pin();
        for bucket in self.buckets.iter() {
            let head = bucket.load(Ordering::Acquire, guard);
            let mut b = head;
            loop {
                let n = unsafe { b.deref() }.next.load(Ordering::Acquire, guard);
                let Some(n_ref) = (unsafe { n.as_ref() }) else {
                    break;
                };
                if n_ref.key.is_none() {
                    // b was unlinked under us; start the bucket over.
                    b = head;
                    continue;
                }
                let slot = n_ref.slot.load(Ordering::Acquire, guard);
                match unsafe { slot.as_ref() } {
                    None => {
                        self.physically_remove(b, n, guard);
                        // Reexamine b's successor.
                    }
                    Some(ValueSlot::Removing(_)) => {
                        self.slow_complete_remove(b, n, guard);
                    }
                    Some(ValueSlot::Live(_)) => {
                        self.help_insert_info(n_ref, guard);
                        b = n;
                    }
                }
            }
        }
    }

    /// Visits every live entry. Entries removed or inserted concurrently may
    /// or may not be visited.
    fn walk_entries(&self, guard: &Guard, mut visit: impl FnMut(&K, &V)) {
        for bucket in self.buckets.iter() {
            let mut b = bucket.load(Ordering::Acquire, guard);
            loop {
                let n = unsafe { b.deref() }.next.load(Ordering::Acquire, guard);
                let Some(n_ref) = (unsafe { n.as_ref() }) else {
                    break;
                };
                if let Some(key) = n_ref.key.as_ref() {
                    let slot = n_ref.slot.load(Ordering::Acquire, guard);
                    if let Some(ValueSlot::Live(value)) = unsafe { slot.as_ref() } {
                        visit(key, value);
                    }
                }
                b = n;
            }
        }
    }
}

impl<K, V, C, S> SizedHashMap<K, V, C, S>
where
    K: Ord + Copy + Into<i64>,
    C: SizeCalculator,
{
    /// Sums the keys of live entries, as a debugging checksum. Not accurate
    /// concurrently with removals: a removal's key stops counting at its
    /// mark, not its unlink.
    pub fn sum_of_keys(&self) -> i64 {
        let guard = &epoch::pin();
        let mut sum = 0i64;
        self.walk_entries(guard, |key, _| sum += (*key).into());
        sum
    }
}

impl<K, V, C, S> Drop for SizedHashMap<K, V, C, S> {
    fn drop(&mut self) {
        let guard = unsafe { epoch::unprotected() };
        for bucket in self.buckets.iter() {
            let mut node_ptr = bucket.load(Ordering::Relaxed, guard);
            while !node_ptr.is_null() {
                let node = unsafe { node_ptr.into_owned() };
                node_ptr = node.next.load(Ordering::Relaxed, guard);
            }
        }
    }
}

fn fast_path(size_phase: u64) -> bool {
    size_phase & 1 == 0
}

fn hash<K, S>(build_hasher: &S, key: &K) -> u64
where
    K: Hash + ?Sized,
    S: BuildHasher,
{
    let mut hasher = build_hasher.build_hasher();
    key.hash(&mut hasher);
    hasher.finish()
}
