use crate::{EventSink, KeyedTable, OutcomeFilter, ScopeFilter};

/// Captures call arguments at entry and emits one event per qualifying exit.
///
/// At most one captured entry exists per actor; it is removed at exit whether
/// or not an event is produced.
pub struct EventEmitter<'a, T, S> {
    pending: &'a T,
    sink: &'a S,
    scope: ScopeFilter,
    outcomes: OutcomeFilter,
}

impl<'a, T, S> EventEmitter<'a, T, S> {
    pub const fn new(
        pending: &'a T,
        sink: &'a S,
        scope: ScopeFilter,
        outcomes: OutcomeFilter,
    ) -> Self {
        Self {
            pending,
            sink,
            scope,
            outcomes,
        }
    }

    #[inline(always)]
    pub fn on_entry<K, A>(&self, current_scope: u64, actor: &K, args: &A)
    where
        T: KeyedTable<K, A>,
    {
        if !self.scope.matches(current_scope) {
            return;
        }
        let _ = self.pending.upsert(actor, args);
    }

    /// Consumes the captured entry for `actor` and, if `outcome` passes the
    /// filter, emits `build(actor, args, outcome)`.
    #[inline(always)]
    pub fn on_exit<K, A, E, F>(&self, current_scope: u64, actor: &K, outcome: i64, build: F)
    where
        T: KeyedTable<K, A>,
        S: EventSink<E>,
        A: Copy,
        F: FnOnce(&K, A, i64) -> E,
    {
        if !self.scope.matches(current_scope) {
            return;
        }
        let Some(ptr) = self.pending.get_ptr_mut(actor) else {
            return;
        };
        // SAFETY: KeyedTable guarantees the pointer outlives this call.
        let args = unsafe { ptr.read_volatile() };
        let _ = self.pending.remove(actor);

        if !self.outcomes.admits(outcome) {
            return;
        }
        let event = build(actor, args, outcome);
        let _ = self.sink.emit(&event);
    }
}
