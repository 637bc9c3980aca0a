//! Tracepoint record layouts, from `/sys/kernel/tracing/events/*/*/format`.

/// Fields every trace event starts with.
#[repr(C)]
#[allow(dead_code)]
pub struct TraceEntry {
    pub common_type: u16,
    pub common_flags: u8,
    pub common_preempt_count: u8,
    pub common_pid: i32,
}

/// Header of the per-syscall events (sys_enter_*, sys_exit_*).
#[repr(C)]
#[allow(dead_code)]
pub struct SyscallTraceHeader {
    pub ent: TraceEntry,
    pub __syscall_nr: i32,
    pub _pad: i32,
}

// ============================================================
// raw_syscalls/sys_enter, raw_syscalls/sys_exit
// ============================================================

#[repr(C)]
#[allow(dead_code)]
pub struct RawSysEnter {
    pub ent: TraceEntry,
    pub id: i64,
    pub args: [u64; 6],
}

#[repr(C)]
#[allow(dead_code)]
pub struct RawSysExit {
    pub ent: TraceEntry,
    pub id: i64,
    pub ret: i64,
}

// ============================================================
// syscalls/sys_enter_unshare, syscalls/sys_exit_unshare
// ============================================================

#[repr(C)]
#[allow(dead_code)]
pub struct SysEnterUnshare {
    pub header: SyscallTraceHeader,
    pub unshare_flags: u64,
}

#[repr(C)]
#[allow(dead_code)]
pub struct SysExitUnshare {
    pub header: SyscallTraceHeader,
    pub ret: i64,
}
