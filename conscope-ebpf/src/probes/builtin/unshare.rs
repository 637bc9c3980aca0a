//! `unshare(2)` snoop.
//!
//! Flags are captured at syscall entry and emitted together with the return
//! value and task name once the call returns.

use core::mem::offset_of;

use aya_ebpf::{
    helpers::bpf_get_current_comm,
    macros::{map, tracepoint},
    maps::{HashMap, PerCpuArray, RingBuf},
    programs::TracePointContext,
};
use conscope_common::{
    EventEmitter, UNSHARE_ARGS_MAX_ENTRIES, UNSHARE_EVENTS_BYTES, UnshareArgs, UnshareEvent,
};

use super::syscall_types::{SysEnterUnshare, SysExitUnshare};
use crate::probes::{BpfTable, RingSink, current_cgroup, current_tid};

#[map]
pub static UNSHARE_ARGS: HashMap<u32, UnshareArgs> =
    HashMap::with_max_entries(UNSHARE_ARGS_MAX_ENTRIES, 0);

#[map]
pub static UNSHARE_EVENTS: RingBuf = RingBuf::with_byte_size(UNSHARE_EVENTS_BYTES, 0);

/// Events dropped because `UNSHARE_EVENTS` was full.
#[map]
pub static UNSHARE_EVENTS_LOST: PerCpuArray<u64> = PerCpuArray::with_max_entries(1, 0);

#[inline(always)]
fn event_sink() -> RingSink<'static> {
    RingSink {
        ring: &UNSHARE_EVENTS,
        lost: &UNSHARE_EVENTS_LOST,
    }
}

#[tracepoint]
pub fn sys_enter_unshare(ctx: TracePointContext) -> u32 {
    let Ok(flags) = (unsafe { ctx.read_at::<u64>(offset_of!(SysEnterUnshare, unshare_flags)) })
    else {
        return 0;
    };
    let config = crate::config();
    let table = BpfTable(&UNSHARE_ARGS);
    let sink = event_sink();
    EventEmitter::new(&table, &sink, config.scope(), config.outcomes()).on_entry(
        current_cgroup(),
        &current_tid(),
        &UnshareArgs { flags },
    );
    0
}

#[tracepoint]
pub fn sys_exit_unshare(ctx: TracePointContext) -> u32 {
    let Ok(ret) = (unsafe { ctx.read_at::<i64>(offset_of!(SysExitUnshare, ret)) }) else {
        return 0;
    };
    let config = crate::config();
    let table = BpfTable(&UNSHARE_ARGS);
    let sink = event_sink();
    EventEmitter::new(&table, &sink, config.scope(), config.outcomes()).on_exit(
        current_cgroup(),
        &current_tid(),
        ret,
        |tid: &u32, args: UnshareArgs, ret| {
            let mut event = UnshareEvent::new(*tid, args, ret);
            if let Ok(comm) = bpf_get_current_comm() {
                event.comm = comm;
            }
            event
        },
    );
    0
}
