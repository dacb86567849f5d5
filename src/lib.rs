#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! Linearizable `size` for concurrent maps.
//!
//! A concurrent map usually cannot answer "how many entries do you hold?"
//! without stopping the world or returning a value that was never true at
//! any instant. This crate provides four synchronization methodologies that
//! augment a lock-free chaining hash table with a correct, linearizable
//! `size` while preserving the concurrency of the underlying structure on
//! the common path:
//!
//! - [`SpSizeCalculator`]: wait-free. Updates pre-announce per-thread
//!   counter bumps that any observer can commit; `size` snapshots the
//!   counters while updaters forward concurrent changes into the snapshot.
//! - [`HandshakeSizeCalculator`]: a dynamic idle-time barrier moves
//!   updaters to the announcing slow path only while a size is in flight;
//!   between sizes, updates pay a single unsynchronized counter bump.
//! - [`LockSizeCalculator`]: updates hold the shared side of a
//!   reader-writer lock; `size` sums the counters under the exclusive side.
//! - [`OptimisticSizeCalculator`]: `size` reads the counters optimistically
//!   and revalidates; after a bounded number of retries, updaters finish the
//!   computation on its behalf.
//!
//! Every thread that operates on a map registers first:
//!
//! ```ignore
//! use concurrent_size::{registry, SpHashMap};
//!
//! let map: SpHashMap<i64, String> = SpHashMap::with_capacity(1024);
//! let _reg = registry::register()?;
//!
//! map.insert(1, "one".to_string());
//! assert_eq!(map.size(), 1);
//! ```
//!
//! The returned size is linearizable: it equals the map's cardinality at
//! some instant between the call's invocation and return, for every
//! methodology and any number of concurrent updaters.

pub(crate) mod barrier;
pub mod calc;
pub(crate) mod common;
pub mod map;
pub mod registry;

use std::hash::{BuildHasher, Hash};

pub use calc::{
    handshake::HandshakeSizeCalculator, lock::LockSizeCalculator,
    optimistic::OptimisticSizeCalculator, sp::SpSizeCalculator, OpKind, SizeCalculator,
    UpdateInfo,
};
pub use common::{error::RegistryError, MAX_THREADS};
pub use map::{DefaultHashBuilder, SizedHashMap};

/// A map with the wait-free size methodology.
pub type SpHashMap<K, V, S = DefaultHashBuilder> = SizedHashMap<K, V, SpSizeCalculator, S>;

/// A map with the handshake size methodology.
pub type HandshakeHashMap<K, V, S = DefaultHashBuilder> =
    SizedHashMap<K, V, HandshakeSizeCalculator, S>;

/// A map with the lock-based size methodology.
pub type LockHashMap<K, V, S = DefaultHashBuilder> = SizedHashMap<K, V, LockSizeCalculator, S>;

/// A map with the optimistic size methodology.
pub type OptimisticHashMap<K, V, S = DefaultHashBuilder> =
    SizedHashMap<K, V, OptimisticSizeCalculator, S>;

/// The set surface consumed by benchmarks and harnesses: a map used as a
/// set of keys, with a linearizable cardinality.
pub trait SizeSet<K> {
    fn contains(&self, key: &K) -> bool;

    /// Returns `true` if the key was newly inserted.
    fn insert(&self, key: K) -> bool;

    /// Returns `true` if the key was removed.
    fn remove(&self, key: &K) -> bool;

    /// The set's cardinality at some instant during the call, saturated
    /// into `usize`.
    fn size(&self) -> usize;

    /// Debugging checksum; accurate only at quiescence.
    fn sum_of_keys(&self) -> i64;
}

impl<K, C, S> SizeSet<K> for SizedHashMap<K, K, C, S>
where
    K: Hash + Ord + Copy + Into<i64>,
    C: SizeCalculator,
    S: BuildHasher,
{
    fn contains(&self, key: &K) -> bool {
        self.contains_key(key)
    }

    fn insert(&self, key: K) -> bool {
        SizedHashMap::insert(self, key, key)
    }

    fn remove(&self, key: &K) -> bool {
        SizedHashMap::remove(self, key)
    }

    fn size(&self) -> usize {
        self.len()
    }

    fn sum_of_keys(&self) -> i64 {
        SizedHashMap::sum_of_keys(self)
    }
}
