//! Pre-allocated, lock-free hash table with BPF hash map semantics.
//!
//! All slots are allocated up front; inserts past capacity fail instead of
//! growing. Each slot carries a tag word that doubles as state and hash
//! fingerprint:
//!
//! * `EMPTY` / `TOMBSTONE`: free, claimable by an insert;
//! * `fp | PENDING`: claimed, key and value being written;
//! * `fp | READY`: published.
//!
//! Two concurrent first inserts of the same key meet on the same free slot
//! (they share a probe sequence), so the loser sees the winner's pending
//! fingerprint and waits a bounded number of spins for it to publish instead
//! of creating a duplicate.

use std::cell::UnsafeCell;
use std::hash::{BuildHasher, Hash, RandomState};
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use conscope_common::KeyedTable;

const EMPTY: u64 = 0;
const TOMBSTONE: u64 = 1;
const PENDING: u64 = 0b10;
const READY: u64 = 0b11;
const STATE_MASK: u64 = 0b11;

/// Upper bound on spins spent waiting for a concurrent insert to publish.
const PUBLISH_SPINS: usize = 256;

struct Slot<K, V> {
    tag: AtomicU64,
    key: UnsafeCell<MaybeUninit<K>>,
    value: UnsafeCell<MaybeUninit<V>>,
}

impl<K, V> Slot<K, V> {
    fn empty() -> Self {
        Self {
            tag: AtomicU64::new(EMPTY),
            key: UnsafeCell::new(MaybeUninit::uninit()),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

enum Claim {
    Slot(usize),
    /// The key is already present, or a concurrent insert of a key with the
    /// same fingerprint did not publish in time.
    Taken,
    Full,
}

enum KeyMatch {
    Same,
    Different,
    Unpublished,
}

pub struct FixedTable<K, V> {
    slots: Box<[Slot<K, V>]>,
    len: AtomicUsize,
    hasher: RandomState,
}

// SAFETY: shared access to keys and values is coordinated through the slot
// tags; records themselves are only mutated atomically by the engine.
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for FixedTable<K, V> {}

impl<K, V> FixedTable<K, V>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| Slot::empty()).collect(),
            len: AtomicUsize::new(0),
            hasher: RandomState::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Published keys at the time of the call.
    pub fn keys(&self) -> Vec<K> {
        self.slots
            .iter()
            .filter_map(|slot| {
                let tag = slot.tag.load(Ordering::Acquire);
                if tag & STATE_MASK != READY {
                    return None;
                }
                let key = unsafe { read_key(slot) };
                (slot.tag.load(Ordering::Acquire) == tag).then_some(key)
            })
            .collect()
    }

    fn hash(&self, key: &K) -> u64 {
        self.hasher.hash_one(key)
    }

    fn probe(&self, hash: u64) -> impl Iterator<Item = usize> {
        let n = self.slots.len();
        let start = (hash % n as u64) as usize;
        (0..n).map(move |i| (start + i) % n)
    }

    fn find(&self, key: &K, hash: u64) -> Option<usize> {
        let ready = (hash & !STATE_MASK) | READY;
        for idx in self.probe(hash) {
            let slot = &self.slots[idx];
            match slot.tag.load(Ordering::Acquire) {
                EMPTY => return None,
                tag if tag == ready => {
                    let candidate = unsafe { read_key(slot) };
                    // A slot recycled under us reads as a miss.
                    if candidate == *key && slot.tag.load(Ordering::Acquire) == tag {
                        return Some(idx);
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn reserve(&self) -> bool {
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                (len < self.slots.len()).then_some(len + 1)
            })
            .is_ok()
    }

    fn claim(&self, key: &K, hash: u64) -> Claim {
        let fingerprint = hash & !STATE_MASK;
        for idx in self.probe(hash) {
            let slot = &self.slots[idx];
            let mut tag = slot.tag.load(Ordering::Acquire);
            loop {
                if tag == EMPTY || tag == TOMBSTONE {
                    match slot.tag.compare_exchange(
                        tag,
                        fingerprint | PENDING,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return Claim::Slot(idx),
                        Err(actual) => {
                            tag = actual;
                            continue;
                        }
                    }
                }
                if tag & !STATE_MASK == fingerprint {
                    match self.holds_key(slot, key) {
                        KeyMatch::Same | KeyMatch::Unpublished => return Claim::Taken,
                        KeyMatch::Different => {}
                    }
                }
                break;
            }
        }
        Claim::Full
    }

    /// Waits for a slot with a matching fingerprint to publish, then compares
    /// keys. Gives up after [`PUBLISH_SPINS`]; the caller then drops its
    /// insert rather than risk a duplicate key.
    fn holds_key(&self, slot: &Slot<K, V>, key: &K) -> KeyMatch {
        for _ in 0..PUBLISH_SPINS {
            let tag = slot.tag.load(Ordering::Acquire);
            match tag & STATE_MASK {
                READY => {
                    let candidate = unsafe { read_key(slot) };
                    if candidate == *key && slot.tag.load(Ordering::Acquire) == tag {
                        return KeyMatch::Same;
                    }
                    return KeyMatch::Different;
                }
                PENDING => std::hint::spin_loop(),
                _ => return KeyMatch::Different,
            }
        }
        KeyMatch::Unpublished
    }

    fn write_value(ptr: *mut V, value: &V) {
        unsafe { ptr.write_volatile(*value) }
    }
}

// SAFETY: slots are never freed or moved while the table lives, and `V` is
// stored in its own `UnsafeCell` at its natural alignment.
unsafe impl<K, V> KeyedTable<K, V> for FixedTable<K, V>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    fn get_ptr_mut(&self, key: &K) -> Option<*mut V> {
        let idx = self.find(key, self.hash(key))?;
        Some(self.slots[idx].value.get().cast::<V>())
    }

    fn insert_absent(&self, key: &K, value: &V) -> bool {
        let hash = self.hash(key);
        if self.find(key, hash).is_some() || !self.reserve() {
            return false;
        }
        match self.claim(key, hash) {
            Claim::Slot(idx) => {
                let slot = &self.slots[idx];
                unsafe {
                    (*slot.key.get()).write(*key);
                    (*slot.value.get()).write(*value);
                }
                slot.tag
                    .store((hash & !STATE_MASK) | READY, Ordering::Release);
                true
            }
            Claim::Taken | Claim::Full => {
                self.len.fetch_sub(1, Ordering::AcqRel);
                false
            }
        }
    }

    fn upsert(&self, key: &K, value: &V) -> bool {
        if let Some(ptr) = self.get_ptr_mut(key) {
            Self::write_value(ptr, value);
            return true;
        }
        if self.insert_absent(key, value) {
            return true;
        }
        match self.get_ptr_mut(key) {
            Some(ptr) => {
                Self::write_value(ptr, value);
                true
            }
            None => false,
        }
    }

    fn remove(&self, key: &K) -> bool {
        let hash = self.hash(key);
        let Some(idx) = self.find(key, hash) else {
            return false;
        };
        let ready = (hash & !STATE_MASK) | READY;
        if self.slots[idx]
            .tag
            .compare_exchange(ready, TOMBSTONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.len.fetch_sub(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }
}

/// Seqlock-style key read: callers re-check the tag afterwards and discard
/// the copy if the slot changed.
unsafe fn read_key<K: Copy, V>(slot: &Slot<K, V>) -> K {
    unsafe { slot.key.get().cast::<K>().read_volatile() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_insert_absent_and_lookup() {
        let table: FixedTable<u32, u64> = FixedTable::with_capacity(8);
        assert!(table.is_empty());
        assert!(table.insert_absent(&7, &70));
        assert!(!table.insert_absent(&7, &71));

        let ptr = table.get_ptr_mut(&7).expect("key 7 should exist");
        assert_eq!(unsafe { *ptr }, 70);
        assert_eq!(table.len(), 1);
        assert!(table.get_ptr_mut(&8).is_none());
    }

    #[test]
    fn test_upsert_overwrites() {
        let table: FixedTable<u32, u64> = FixedTable::with_capacity(4);
        assert!(table.upsert(&1, &10));
        assert!(table.upsert(&1, &20));
        assert_eq!(unsafe { *table.get_ptr_mut(&1).unwrap() }, 20);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_full_table_rejects_new_keys() {
        let table: FixedTable<u32, u64> = FixedTable::with_capacity(3);
        for key in 0..3 {
            assert!(table.insert_absent(&key, &0));
        }
        assert!(!table.insert_absent(&3, &0));
        assert!(!table.upsert(&4, &0));
        assert_eq!(table.len(), 3);
        assert!(table.get_ptr_mut(&3).is_none());

        // Existing keys still update in place.
        assert!(table.upsert(&2, &9));
        assert_eq!(unsafe { *table.get_ptr_mut(&2).unwrap() }, 9);
    }

    #[test]
    fn test_remove_frees_capacity() {
        let table: FixedTable<u32, u64> = FixedTable::with_capacity(2);
        assert!(table.insert_absent(&1, &1));
        assert!(table.insert_absent(&2, &2));
        assert!(!table.insert_absent(&3, &3));

        assert!(table.remove(&1));
        assert!(!table.remove(&1));
        assert!(table.get_ptr_mut(&1).is_none());
        assert!(table.get_ptr_mut(&2).is_some());

        assert!(table.insert_absent(&3, &3));
        assert_eq!(table.len(), 2);
        let mut keys = table.keys();
        keys.sort_unstable();
        assert_eq!(keys, vec![2, 3]);
    }

    #[test]
    fn test_churn_reuses_tombstones() {
        let table: FixedTable<u32, u64> = FixedTable::with_capacity(4);
        for round in 0..1_000u32 {
            assert!(table.upsert(&(round % 16), &u64::from(round)));
            assert!(table.remove(&(round % 16)));
        }
        assert!(table.is_empty());
        for key in 100..104 {
            assert!(table.insert_absent(&key, &0));
        }
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_concurrent_first_insert_has_single_winner() {
        for _ in 0..50 {
            let table: FixedTable<u32, u64> = FixedTable::with_capacity(16);
            let winners: usize = thread::scope(|s| {
                let handles: Vec<_> = (0..8)
                    .map(|_| s.spawn(|| table.insert_absent(&42, &0) as usize))
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).sum()
            });
            assert_eq!(winners, 1);
            assert_eq!(table.len(), 1);
            assert_eq!(table.keys(), vec![42]);
        }
    }
}
