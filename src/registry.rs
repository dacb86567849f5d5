//! Dense thread identifiers.
//!
//! Every thread that operates on a [`SizedHashMap`][crate::map::SizedHashMap]
//! or computes a size owns a small identifier in `[0, MAX_THREADS)`. The
//! identifiers index the per-thread counter arrays and barrier phase slots, so
//! they are kept densely packed: freed identifiers are pooled and handed out
//! low-id-first, and [`upper_bound`] is a monotone high-water mark that lets a
//! scanner visit every identifier that was ever live.
//!
//! Registration is per-thread and explicit:
//!
//! ```ignore
//! let _reg = registry::register()?;
//! // ... operate on maps, compute sizes ...
//! // the identifier returns to the pool when `_reg` drops
//! ```

use std::{
    cell::Cell,
    cmp::Reverse,
    collections::BinaryHeap,
    marker::PhantomData,
    sync::atomic::{AtomicUsize, Ordering},
};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::common::{error::RegistryError, MAX_THREADS};

/// Identifier allocation state, separated from the thread-local side so it can
/// be exercised directly in tests.
pub(crate) struct ThreadRegistry {
    /// Least upper bound on every identifier ever issued. Grows monotonically.
    next_id: AtomicUsize,
    /// Freed identifiers, smallest first.
    free_ids: Mutex<BinaryHeap<Reverse<usize>>>,
    capacity: usize,
}

impl ThreadRegistry {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            next_id: AtomicUsize::new(0),
            free_ids: Mutex::new(BinaryHeap::new()),
            capacity,
        }
    }

    pub(crate) fn allocate_id(&self) -> Result<usize, RegistryError> {
        if let Some(Reverse(id)) = self.free_ids.lock().pop() {
            return Ok(id);
        }

        self.next_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n < self.capacity {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .map_err(|_| RegistryError::ThreadCapExceeded(self.capacity))
    }

    pub(crate) fn release_id(&self, id: usize) {
        self.free_ids.lock().push(Reverse(id));
    }

    pub(crate) fn upper_bound(&self) -> usize {
        self.next_id.load(Ordering::SeqCst)
    }
}

static REGISTRY: Lazy<ThreadRegistry> = Lazy::new(|| ThreadRegistry::with_capacity(MAX_THREADS));

thread_local! {
    static THREAD_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// A registered thread's handle. Dropping it deregisters the thread and
/// returns the identifier to the free pool.
///
/// Not `Send`: the identifier belongs to the thread that registered.
#[must_use = "the thread is deregistered when this guard is dropped"]
pub struct Registration {
    id: usize,
    _not_send: PhantomData<*const ()>,
}

impl Registration {
    /// The identifier held by this registration.
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        deregister();
    }
}

/// Registers the calling thread and assigns it an identifier.
///
/// Fails with [`RegistryError::ThreadCapExceeded`] when all identifiers are
/// held by live threads, and with [`RegistryError::DoubleRegister`] when the
/// calling thread is already registered.
pub fn register() -> Result<Registration, RegistryError> {
    THREAD_ID.with(|slot| {
        if slot.get().is_some() {
            return Err(RegistryError::DoubleRegister);
        }
        let id = REGISTRY.allocate_id()?;
        slot.set(Some(id));
        Ok(Registration {
            id,
            _not_send: PhantomData,
        })
    })
}

/// Returns the calling thread's identifier to the free pool.
///
/// Idempotent: deregistering an unregistered thread logs a warning and
/// returns. Prefer dropping the [`Registration`] guard over calling this
/// directly.
pub fn deregister() {
    THREAD_ID.with(|slot| match slot.take() {
        Some(id) => REGISTRY.release_id(id),
        None => log::warn!("deregister called on a thread that is not registered"),
    });
}

/// The calling thread's identifier.
///
/// # Panics
///
/// Panics if the thread has not been registered with [`register`].
pub fn current_id() -> usize {
    THREAD_ID.with(|slot| {
        slot.get()
            .expect("thread is not registered with concurrent_size::registry")
    })
}

/// The calling thread's identifier, or `None` if it is not registered.
pub fn try_current_id() -> Option<usize> {
    THREAD_ID.with(Cell::get)
}

/// The least upper bound on every identifier issued so far.
///
/// Scanners iterate `[0, upper_bound())` and re-check the bound afterwards;
/// if it grew, they scan the new tail and repeat.
pub fn upper_bound() -> usize {
    REGISTRY.upper_bound()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_dense_and_prefer_low_ids() {
        let registry = ThreadRegistry::with_capacity(4);
        let a = registry.allocate_id().unwrap();
        let b = registry.allocate_id().unwrap();
        let c = registry.allocate_id().unwrap();
        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(registry.upper_bound(), 3);

        registry.release_id(b);
        registry.release_id(a);

        // Freed identifiers come back smallest first; the high-water mark
        // never shrinks.
        assert_eq!(registry.allocate_id().unwrap(), 0);
        assert_eq!(registry.allocate_id().unwrap(), 1);
        assert_eq!(registry.upper_bound(), 3);
    }

    #[test]
    fn allocation_fails_at_capacity() {
        let registry = ThreadRegistry::with_capacity(2);
        registry.allocate_id().unwrap();
        let id = registry.allocate_id().unwrap();
        assert_eq!(
            registry.allocate_id(),
            Err(RegistryError::ThreadCapExceeded(2))
        );

        registry.release_id(id);
        assert_eq!(registry.allocate_id().unwrap(), id);
    }

    #[test]
    fn register_is_per_thread() {
        let reg = register().unwrap();
        assert_eq!(current_id(), reg.id());
        assert!(matches!(register(), Err(RegistryError::DoubleRegister)));

        let other = std::thread::spawn(|| {
            let reg = register().unwrap();
            reg.id()
        })
        .join()
        .unwrap();
        assert_ne!(other, reg.id());

        drop(reg);
        assert_eq!(try_current_id(), None);
    }

    #[test]
    fn deregister_without_register_is_harmless() {
        std::thread::spawn(deregister).join().unwrap();
    }

    #[test]
    fn register_work_deregister_restores_pool() {
        let before = upper_bound();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                std::thread::spawn(|| {
                    let reg = register().unwrap();
                    let id = reg.id();
                    assert_eq!(current_id(), id);
                    id
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap() < MAX_THREADS);
        }
        // All ids returned to the pool; the bound only ever grows.
        assert!(upper_bound() >= before);
    }
}
