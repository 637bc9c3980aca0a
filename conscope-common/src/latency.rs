use core::sync::atomic::Ordering;

use crate::{KeyedTable, LatencyKey, LatencyRecord, ScopeFilter, field};

/// Pairs enter/exit of the same `(actor, operation)` and accumulates elapsed
/// time.
///
/// One actor is assumed never to run two overlapping operations under the
/// same key. A second `enter` before the matching `exit` overwrites the start
/// marker.
pub struct LatencyCorrelator<'a, T> {
    table: &'a T,
    scope: ScopeFilter,
}

impl<'a, T> LatencyCorrelator<'a, T>
where
    T: KeyedTable<LatencyKey, LatencyRecord>,
{
    pub const fn new(table: &'a T, scope: ScopeFilter) -> Self {
        Self { table, scope }
    }

    #[inline(always)]
    pub fn enter(&self, current_scope: u64, actor: u32, operation: u64, now: u64) {
        if !self.scope.matches(current_scope) {
            return;
        }
        let key = LatencyKey::new(actor, operation);
        let Some(record) = self.table.get_or_insert_default(&key) else {
            return;
        };
        // SAFETY: KeyedTable guarantees the pointer outlives this call.
        unsafe {
            field(&raw mut (*record).count).fetch_add(1, Ordering::Relaxed);
            field(&raw mut (*record).enter_ns).store(now, Ordering::Relaxed);
        }
    }

    /// Closes the pending operation for `(actor, operation)`.
    ///
    /// An exit without a pending enter (no record, or `enter_ns == 0`) leaves
    /// the table untouched.
    #[inline(always)]
    pub fn exit(&self, current_scope: u64, actor: u32, operation: u64, now: u64) {
        if !self.scope.matches(current_scope) {
            return;
        }
        let key = LatencyKey::new(actor, operation);
        let Some(record) = self.table.get_ptr_mut(&key) else {
            return;
        };
        // SAFETY: KeyedTable guarantees the pointer outlives this call.
        unsafe {
            let enter_ns = field(&raw mut (*record).enter_ns);
            let started = enter_ns.load(Ordering::Relaxed);
            if started == 0 {
                return;
            }
            field(&raw mut (*record).elapsed_ns)
                .fetch_add(now.wrapping_sub(started), Ordering::Relaxed);
            enter_ns.store(0, Ordering::Relaxed);
        }
    }

    /// Point-in-time copy of the record for `(actor, operation)`.
    pub fn snapshot(&self, actor: u32, operation: u64) -> Option<LatencyRecord> {
        let record = self.table.get_ptr_mut(&LatencyKey::new(actor, operation))?;
        // SAFETY: KeyedTable guarantees the pointer outlives this call.
        Some(unsafe { LatencyRecord::load(record) })
    }
}
