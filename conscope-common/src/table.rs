/// Fixed-capacity keyed storage updated from concurrent producer contexts.
///
/// The contract follows the BPF hash map helpers: lookups hand out a raw
/// pointer into the table, inserts fail instead of growing, and nothing ever
/// blocks.
///
/// # Safety
///
/// Pointers returned by [`KeyedTable::get_ptr_mut`] must be aligned for `V`
/// and stay dereferenceable for as long as the table lives, even if the entry
/// is removed or its slot is reused afterwards.
pub unsafe trait KeyedTable<K, V> {
    fn get_ptr_mut(&self, key: &K) -> Option<*mut V>;

    /// Inserts `value` only if `key` is absent. Returns `false` when the key
    /// already exists or the table is full.
    fn insert_absent(&self, key: &K, value: &V) -> bool;

    /// Inserts or overwrites. Returns `false` only when the table is full.
    fn upsert(&self, key: &K, value: &V) -> bool;

    fn remove(&self, key: &K) -> bool;

    /// Looks `key` up, creating a zeroed record on first use.
    ///
    /// Two producers may race on the first insert; the loser's insert fails
    /// and it picks up the winner's record on the second lookup. `None` means
    /// the table is full.
    #[inline(always)]
    fn get_or_insert_default(&self, key: &K) -> Option<*mut V>
    where
        V: Default,
    {
        if let Some(ptr) = self.get_ptr_mut(key) {
            return Some(ptr);
        }
        let _ = self.insert_absent(key, &V::default());
        self.get_ptr_mut(key)
    }
}

/// Bounded outbound channel for discrete events.
///
/// `emit` must never block; a full channel drops the event and returns
/// `false`.
pub trait EventSink<E> {
    fn emit(&self, event: &E) -> bool;
}
