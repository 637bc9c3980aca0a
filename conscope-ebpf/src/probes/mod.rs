use aya_ebpf::{
    helpers::{bpf_get_current_cgroup_id, bpf_get_current_pid_tgid, bpf_ktime_get_ns},
    maps::{HashMap, PerCpuArray, RingBuf},
};
use conscope_common::{EventSink, KeyedTable};

pub mod builtin;

const BPF_ANY: u64 = 0;
const BPF_NOEXIST: u64 = 1;

/// Borrowed view of a BPF hash map as an engine table.
pub struct BpfTable<'a, K, V>(pub &'a HashMap<K, V>);

// SAFETY: element pointers handed out by bpf_map_lookup_elem stay valid for
// the rest of the program invocation.
unsafe impl<K, V> KeyedTable<K, V> for BpfTable<'_, K, V> {
    #[inline(always)]
    fn get_ptr_mut(&self, key: &K) -> Option<*mut V> {
        self.0.get_ptr_mut(key)
    }

    #[inline(always)]
    fn insert_absent(&self, key: &K, value: &V) -> bool {
        self.0.insert(key, value, BPF_NOEXIST).is_ok()
    }

    #[inline(always)]
    fn upsert(&self, key: &K, value: &V) -> bool {
        self.0.insert(key, value, BPF_ANY).is_ok()
    }

    #[inline(always)]
    fn remove(&self, key: &K) -> bool {
        self.0.remove(key).is_ok()
    }
}

/// Ring buffer output. A full buffer drops the record and bumps `lost`.
pub struct RingSink<'a> {
    pub ring: &'a RingBuf,
    pub lost: &'a PerCpuArray<u64>,
}

impl<E> EventSink<E> for RingSink<'_> {
    #[inline(always)]
    fn emit(&self, event: &E) -> bool {
        if self.ring.output(event, 0).is_ok() {
            return true;
        }
        bump(self.lost);
        false
    }
}

/// Increments slot 0 of a single-entry per-CPU counter and returns this
/// CPU's new value, or 0 if the slot is missing.
#[inline(always)]
pub fn bump(counter: &PerCpuArray<u64>) -> u64 {
    match counter.get_ptr_mut(0) {
        Some(slot) => unsafe {
            *slot += 1;
            *slot
        },
        None => 0,
    }
}

#[inline(always)]
pub fn current_tid() -> u32 {
    bpf_get_current_pid_tgid() as u32
}

#[inline(always)]
pub fn current_cgroup() -> u64 {
    unsafe { bpf_get_current_cgroup_id() }
}

#[inline(always)]
pub fn now_ns() -> u64 {
    unsafe { bpf_ktime_get_ns() }
}
