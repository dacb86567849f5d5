//! Lock-free sorted linked lists, one per hash bucket.
//!
//! The list is the base-level linked list of a concurrent skip list: nodes
//! are singly linked in key order behind a dummy head, removal marks the
//! value slot before splicing in a marker node and unlinking, and every
//! mutation is a single compare-exchange on a `next` pointer or a value
//! slot.
//!
//! Each operation exists in two forms. The **fast** form performs the plain
//! algorithm and reports linearizations through the calculator's
//! unconditional counter bump. The **slow** form pre-announces every bump
//! with an [`UpdateInfo`]: inserts carry it on the new node, removes install
//! it in the value slot in place of the value, and any thread that observes
//! a pending announcement commits it before relying on the node. That
//! helping is what makes the wait-free methodology's counters meet its
//! snapshot.

use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

use crate::calc::{OpKind, SizeCalculator, UpdateInfo};

use super::SizedHashMap;

/// A value slot's occupied states. The null pointer is the third state: the
/// node was removed on the fast path (or is a head/marker sentinel).
pub(crate) enum ValueSlot<V> {
    /// A live value.
    Live(V),
    /// A removal that has linearized but whose counter bump may still be
    /// pending.
    Removing(UpdateInfo),
}

/// List node. Head and marker sentinels have no key and a null slot.
pub(crate) struct Node<K, V> {
    pub(crate) key: Option<K>,
    pub(crate) slot: Atomic<ValueSlot<V>>,
    pub(crate) next: Atomic<Node<K, V>>,
    /// Pending insert announcement; null once the bump is committed.
    pub(crate) insert_info: Atomic<UpdateInfo>,
}

impl<K, V> Node<K, V> {
    /// A bucket's dummy head.
    pub(crate) fn head() -> Self {
        Self {
            key: None,
            slot: Atomic::null(),
            next: Atomic::null(),
            insert_info: Atomic::null(),
        }
    }

    /// A marker spliced in after a removed node, pointing at its successor.
    fn marker(next: Shared<'_, Node<K, V>>) -> Self {
        Self {
            key: None,
            slot: Atomic::null(),
            next: Atomic::from(next),
            insert_info: Atomic::null(),
        }
    }

    fn data(key: K, value: V, insert_info: Option<UpdateInfo>) -> Self {
        Self {
            key: Some(key),
            slot: Atomic::new(ValueSlot::Live(value)),
            next: Atomic::null(),
            insert_info: match insert_info {
                Some(info) => Atomic::new(info),
                None => Atomic::null(),
            },
        }
    }
}

impl<K, V> Drop for Node<K, V> {
    fn drop(&mut self) {
        // By the time a node is destroyed (deferred past the grace period,
        // or torn down with the map) nothing else can reach its cells.
        let guard = unsafe { epoch::unprotected() };
        let slot = self.slot.load(Ordering::Relaxed, guard);
        if !slot.is_null() {
            drop(unsafe { slot.into_owned() });
        }
        let info = self.insert_info.load(Ordering::Relaxed, guard);
        if !info.is_null() {
            drop(unsafe { info.into_owned() });
        }
    }
}

impl<K, V, C, S> SizedHashMap<K, V, C, S>
where
    K: Ord,
    C: SizeCalculator,
{
    /* ---------------- Traversal ---------------- */

    pub(crate) fn slow_get_with<'g, T>(
        &self,
        head: Shared<'g, Node<K, V>>,
        key: &K,
        with_value: impl FnOnce(&V) -> T,
        guard: &'g Guard,
    ) -> Option<T> {
        let mut b = head;
        loop {
            let n = unsafe { b.deref() }.next.load(Ordering::Acquire, guard);
            let n_ref = unsafe { n.as_ref() }?;
            let Some(n_key) = n_ref.key.as_ref() else {
                // Marker; skip.
                b = n;
                continue;
            };
            let slot = n_ref.slot.load(Ordering::Acquire, guard);
            let Some(slot_ref) = (unsafe { slot.as_ref() }) else {
                // Removed on the fast path; its bump is not ours to commit.
                b = n;
                continue;
            };
            match key.cmp(n_key) {
                std::cmp::Ordering::Greater => b = n,
                std::cmp::Ordering::Less => return None,
                std::cmp::Ordering::Equal => {
                    return match slot_ref {
                        ValueSlot::Removing(info) => {
                            // The removal linearized; commit its bump before
                            // reporting the key absent.
                            self.calculator.update_metadata(OpKind::Remove, *info);
                            None
                        }
                        ValueSlot::Live(value) => {
                            self.help_insert_info(n_ref, guard);
                            Some(with_value(value))
                        }
                    };
                }
            }
        }
    }

    pub(crate) fn fast_get_with<'g, T>(
        &self,
        head: Shared<'g, Node<K, V>>,
        key: &K,
        with_value: impl FnOnce(&V) -> T,
        guard: &'g Guard,
    ) -> Option<T> {
        let mut b = head;
        loop {
            let n = unsafe { b.deref() }.next.load(Ordering::Acquire, guard);
            let n_ref = unsafe { n.as_ref() }?;
            let Some(n_key) = n_ref.key.as_ref() else {
                b = n;
                continue;
            };
            let slot = n_ref.slot.load(Ordering::Acquire, guard);
            let Some(slot_ref) = (unsafe { slot.as_ref() }) else {
                b = n;
                continue;
            };
            match key.cmp(n_key) {
                std::cmp::Ordering::Greater => b = n,
                std::cmp::Ordering::Less => return None,
                std::cmp::Ordering::Equal => {
                    return match slot_ref {
                        ValueSlot::Removing(_) => None,
                        ValueSlot::Live(value) => Some(with_value(value)),
                    };
                }
            }
        }
    }

    /* ---------------- Insertion ---------------- */

    pub(crate) fn slow_insert<'g>(
        &self,
        head: Shared<'g, Node<K, V>>,
        key: K,
        value: V,
        guard: &'g Guard,
    ) -> bool {
        // The announcement is stable across retries: no announcement of ours
        // is outstanding, so our counter cannot move under us.
        let info = self.calculator.create_update_info(OpKind::Insert);
        let mut new_node = Owned::new(Node::data(key, value, Some(info)));

        'restart: loop {
            let mut b = head;
            loop {
                let n = unsafe { b.deref() }.next.load(Ordering::Acquire, guard);
                if let Some(n_ref) = unsafe { n.as_ref() } {
                    let Some(n_key) = n_ref.key.as_ref() else {
                        // Marker: b itself is being unlinked.
                        continue 'restart;
                    };
                    let slot = n_ref.slot.load(Ordering::Acquire, guard);
                    match unsafe { slot.as_ref() } {
                        None => {
                            self.physically_remove(b, n, guard);
                            continue;
                        }
                        Some(ValueSlot::Removing(_)) => {
                            self.slow_complete_remove(b, n, guard);
                            continue;
                        }
                        Some(ValueSlot::Live(_)) => {
                            let key = new_node.key.as_ref().expect("data node has a key");
                            match key.cmp(n_key) {
                                std::cmp::Ordering::Greater => {
                                    b = n;
                                    continue;
                                }
                                std::cmp::Ordering::Equal => {
                                    // Present. If its insert is not yet
                                    // committed, ours linearizes right after
                                    // it; commit it on the way out.
                                    self.help_insert_info(n_ref, guard);
                                    return false;
                                }
                                // Our key sorts before n; link here.
                                std::cmp::Ordering::Less => {}
                            }
                        }
                    }
                }

                new_node.next.store(n, Ordering::Relaxed);
                match unsafe { b.deref() }.next.compare_exchange(
                    n,
                    new_node,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                ) {
                    Ok(linked) => {
                        self.help_insert_info(unsafe { linked.deref() }, guard);
                        return true;
                    }
                    Err(e) => {
                        new_node = e.new;
                    }
                }
            }
        }
    }

    pub(crate) fn fast_insert<'g>(
        &self,
        head: Shared<'g, Node<K, V>>,
        key: K,
        value: V,
        guard: &'g Guard,
    ) -> bool {
        let mut new_node = Owned::new(Node::data(key, value, None));

        'restart: loop {
            let mut b = head;
            loop {
                let n = unsafe { b.deref() }.next.load(Ordering::Acquire, guard);
                if let Some(n_ref) = unsafe { n.as_ref() } {
                    let Some(n_key) = n_ref.key.as_ref() else {
                        continue 'restart;
                    };
                    let slot = n_ref.slot.load(Ordering::Acquire, guard);
                    match unsafe { slot.as_ref() } {
                        None => {
                            self.physically_remove(b, n, guard);
                            continue;
                        }
                        Some(ValueSlot::Removing(_)) => {
                            // A slow-path removal left its announcement
                            // behind; finish it the helping way.
                            self.slow_complete_remove(b, n, guard);
                            continue;
                        }
                        Some(ValueSlot::Live(_)) => {
                            let key = new_node.key.as_ref().expect("data node has a key");
                            match key.cmp(n_key) {
                                std::cmp::Ordering::Greater => {
                                    b = n;
                                    continue;
                                }
                                std::cmp::Ordering::Equal => return false,
                                std::cmp::Ordering::Less => {}
                            }
                        }
                    }
                }

                new_node.next.store(n, Ordering::Relaxed);
                match unsafe { b.deref() }.next.compare_exchange(
                    n,
                    new_node,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                ) {
                    Ok(_) => {
                        self.calculator.fast_update_metadata(OpKind::Insert);
                        return true;
                    }
                    Err(e) => {
                        new_node = e.new;
                    }
                }
            }
        }
    }

    /* ---------------- Removal ---------------- */

    pub(crate) fn slow_remove<'g>(
        &self,
        head: Shared<'g, Node<K, V>>,
        key: &K,
        mut condition: impl FnMut(&V) -> bool,
        guard: &'g Guard,
    ) -> bool {
        'restart: loop {
            let mut b = head;
            loop {
                let n = unsafe { b.deref() }.next.load(Ordering::Acquire, guard);
                let Some(n_ref) = (unsafe { n.as_ref() }) else {
                    return false;
                };
                let Some(n_key) = n_ref.key.as_ref() else {
                    continue 'restart;
                };
                let slot = n_ref.slot.load(Ordering::Acquire, guard);
                match unsafe { slot.as_ref() } {
                    None => {
                        self.physically_remove(b, n, guard);
                        continue;
                    }
                    Some(ValueSlot::Removing(_)) => {
                        self.slow_complete_remove(b, n, guard);
                        continue;
                    }
                    Some(ValueSlot::Live(value)) => match key.cmp(n_key) {
                        std::cmp::Ordering::Greater => b = n,
                        std::cmp::Ordering::Less => return false,
                        std::cmp::Ordering::Equal => {
                            if !condition(value) {
                                // Whether or not the insert is committed,
                                // a failed conditional removal needs no
                                // helping.
                                return false;
                            }
                            self.help_insert_info(n_ref, guard);
                            let info = self.calculator.create_update_info(OpKind::Remove);
                            match n_ref.slot.compare_exchange(
                                slot,
                                Owned::new(ValueSlot::Removing(info)),
                                Ordering::AcqRel,
                                Ordering::Acquire,
                                guard,
                            ) {
                                Ok(_) => {
                                    unsafe { guard.defer_destroy(slot) };
                                    self.slow_complete_remove(b, n, guard);
                                    return true;
                                }
                                // The slot moved under us; reexamine it.
                                Err(_) => continue,
                            }
                        }
                    },
                }
            }
        }
    }

    pub(crate) fn fast_remove<'g>(
        &self,
        head: Shared<'g, Node<K, V>>,
        key: &K,
        mut condition: impl FnMut(&V) -> bool,
        guard: &'g Guard,
    ) -> bool {
        'restart: loop {
            let mut b = head;
            loop {
                let n = unsafe { b.deref() }.next.load(Ordering::Acquire, guard);
                let Some(n_ref) = (unsafe { n.as_ref() }) else {
                    return false;
                };
                let Some(n_key) = n_ref.key.as_ref() else {
                    continue 'restart;
                };
                let slot = n_ref.slot.load(Ordering::Acquire, guard);
                match unsafe { slot.as_ref() } {
                    None => {
                        self.physically_remove(b, n, guard);
                        continue;
                    }
                    Some(ValueSlot::Removing(_)) => {
                        self.slow_complete_remove(b, n, guard);
                        continue;
                    }
                    Some(ValueSlot::Live(value)) => match key.cmp(n_key) {
                        std::cmp::Ordering::Greater => b = n,
                        std::cmp::Ordering::Less => return false,
                        std::cmp::Ordering::Equal => {
                            if !condition(value) {
                                return false;
                            }
                            match n_ref.slot.compare_exchange(
                                slot,
                                Shared::null(),
                                Ordering::AcqRel,
                                Ordering::Acquire,
                                guard,
                            ) {
                                Ok(_) => {
                                    unsafe { guard.defer_destroy(slot) };
                                    self.calculator.fast_update_metadata(OpKind::Remove);
                                    self.physically_remove(b, n, guard);
                                    return true;
                                }
                                Err(_) => continue,
                            }
                        }
                    },
                }
            }
        }
    }

    /* ---------------- Unlinking ---------------- */

    /// Commits a pending removal's bump, then unlinks the node.
    pub(crate) fn slow_complete_remove<'g>(
        &self,
        b: Shared<'g, Node<K, V>>,
        n: Shared<'g, Node<K, V>>,
        guard: &'g Guard,
    ) {
        let slot = unsafe { n.deref() }.slot.load(Ordering::Acquire, guard);
        if let Some(ValueSlot::Removing(info)) = unsafe { slot.as_ref() } {
            self.calculator.update_metadata(OpKind::Remove, *info);
        }
        self.physically_remove(b, n, guard);
    }

    /// Unlinks deleted node `n` from predecessor `b` by first splicing in a
    /// marker if not already present. Upon return `n` is sure to be
    /// unlinked, possibly by another thread.
    pub(crate) fn physically_remove<'g>(
        &self,
        b: Shared<'g, Node<K, V>>,
        n: Shared<'g, Node<K, V>>,
        guard: &'g Guard,
    ) {
        let n_ref = unsafe { n.deref() };
        let marker;
        let p;
        loop {
            let f = n_ref.next.load(Ordering::Acquire, guard);
            if let Some(f_ref) = unsafe { f.as_ref() } {
                if f_ref.key.is_none() {
                    // Already marked.
                    marker = f;
                    p = f_ref.next.load(Ordering::Acquire, guard);
                    break;
                }
            }
            match n_ref.next.compare_exchange(
                f,
                Owned::new(Node::marker(f)),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(m) => {
                    marker = m;
                    p = f;
                    break;
                }
                Err(_) => continue,
            }
        }

        // Unlink both n and its marker. Whichever thread's exchange succeeds
        // owns their reclamation.
        if unsafe { b.deref() }
            .next
            .compare_exchange(n, p, Ordering::AcqRel, Ordering::Acquire, guard)
            .is_ok()
        {
            unsafe {
                guard.defer_destroy(marker);
                guard.defer_destroy(n);
            }
        }
    }

    /// Commits a node's pending insert announcement and clears it.
    /// Helper-safe: the bump happens at most once, and only the clearing
    /// winner retires the announcement cell.
    pub(crate) fn help_insert_info<'g>(&self, n_ref: &Node<K, V>, guard: &'g Guard) {
        let info_ptr = n_ref.insert_info.load(Ordering::Acquire, guard);
        if let Some(info) = unsafe { info_ptr.as_ref() } {
            self.calculator.update_metadata(OpKind::Insert, *info);
            if n_ref
                .insert_info
                .compare_exchange(
                    info_ptr,
                    Shared::null(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                )
                .is_ok()
            {
                unsafe { guard.defer_destroy(info_ptr) };
            }
        }
    }
}
