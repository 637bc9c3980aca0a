use crate::{CounterRecord, KeyedTable, ScopeFilter};

/// Cumulative per-key occurrence counter.
pub struct CounterAggregator<'a, T> {
    table: &'a T,
    scope: ScopeFilter,
}

impl<'a, T> CounterAggregator<'a, T> {
    pub const fn new(table: &'a T, scope: ScopeFilter) -> Self {
        Self { table, scope }
    }

    /// Counts one occurrence of `byte_len` bytes under `key`.
    ///
    /// Silently does nothing when `current_scope` is filtered out or the table
    /// has no room for a new key.
    #[inline(always)]
    pub fn record_occurrence<K>(&self, current_scope: u64, key: &K, byte_len: u64)
    where
        T: KeyedTable<K, CounterRecord>,
    {
        if !self.scope.matches(current_scope) {
            return;
        }
        let Some(record) = self.table.get_or_insert_default(key) else {
            return;
        };
        // SAFETY: KeyedTable guarantees the pointer outlives this call.
        unsafe { CounterRecord::accumulate(record, byte_len) }
    }

    pub fn snapshot<K>(&self, key: &K) -> Option<CounterRecord>
    where
        T: KeyedTable<K, CounterRecord>,
    {
        let record = self.table.get_ptr_mut(key)?;
        // SAFETY: KeyedTable guarantees the pointer outlives this call.
        Some(unsafe { CounterRecord::load(record) })
    }
}
