//! Per-thread, per-syscall latency.
//!
//! `raw_syscalls/sys_enter` opens a record keyed by (tid, syscall id) and
//! `raw_syscalls/sys_exit` closes it, so only cumulative counts and elapsed
//! time ever leave the kernel.

use core::mem::offset_of;

use aya_ebpf::{
    macros::{map, tracepoint},
    maps::HashMap,
    programs::TracePointContext,
};
use conscope_common::{LatencyCorrelator, LatencyKey, LatencyRecord, SYSCALL_LATENCY_MAX_ENTRIES};

use super::syscall_types::{RawSysEnter, RawSysExit};
use crate::probes::{BpfTable, current_cgroup, current_tid, now_ns};

#[map]
pub static SYSCALL_LATENCY: HashMap<LatencyKey, LatencyRecord> =
    HashMap::with_max_entries(SYSCALL_LATENCY_MAX_ENTRIES, 0);

#[tracepoint]
pub fn sys_enter(ctx: TracePointContext) -> u32 {
    let Ok(id) = (unsafe { ctx.read_at::<i64>(offset_of!(RawSysEnter, id)) }) else {
        return 0;
    };
    let table = BpfTable(&SYSCALL_LATENCY);
    LatencyCorrelator::new(&table, crate::config().scope()).enter(
        current_cgroup(),
        current_tid(),
        id as u64,
        now_ns(),
    );
    0
}

#[tracepoint]
pub fn sys_exit(ctx: TracePointContext) -> u32 {
    let Ok(id) = (unsafe { ctx.read_at::<i64>(offset_of!(RawSysExit, id)) }) else {
        return 0;
    };
    let table = BpfTable(&SYSCALL_LATENCY);
    LatencyCorrelator::new(&table, crate::config().scope()).exit(
        current_cgroup(),
        current_tid(),
        id as u64,
        now_ns(),
    );
    0
}
