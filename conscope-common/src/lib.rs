//! Types and aggregation logic shared between the kernel programs and userspace.
//!
//! Every record that crosses the kernel/userspace boundary is `#[repr(C)]` and
//! `Copy`; with the `user` feature they also implement `aya::Pod` so the agent
//! can read them straight out of the BPF maps.
//!
//! The aggregation engine itself ([`CounterAggregator`], [`LatencyCorrelator`],
//! [`EventEmitter`]) is written against the [`KeyedTable`] and [`EventSink`]
//! seams. The eBPF object drives it over BPF hash maps and a ring buffer; the
//! agent runs the very same code over its in-process tables.

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicU64, Ordering};

mod config;
mod counter;
mod emitter;
mod latency;
mod scope;
mod table;

pub use config::{
    AbiVariant, CommonConfig, RQ_DATA_LEN_OFFSET, RQ_DATA_LEN_OFFSET_LEGACY,
    rq_data_len_offset_for_kernel,
};
pub use counter::CounterAggregator;
pub use emitter::EventEmitter;
pub use latency::LatencyCorrelator;
pub use scope::{OutcomeFilter, ScopeFilter};
pub use table::{EventSink, KeyedTable};

pub const TASK_COMM_LEN: usize = 16;

/// Single key used by the block I/O counter table.
pub const BLOCK_IO_KEY: u32 = 1;

pub const BLOCK_IO_STATS_MAX_ENTRIES: u32 = 4;
pub const SYSCALL_LATENCY_MAX_ENTRIES: u32 = 30_000;
pub const UNSHARE_ARGS_MAX_ENTRIES: u32 = 10_240;
pub const UNSHARE_EVENTS_BYTES: u32 = 256 * 1024;

/// Cumulative occurrence statistics for one counter key.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterRecord {
    pub count: u64,
    pub processed_bytes: u64,
}

impl CounterRecord {
    /// Adds one occurrence of `bytes` to the record in place.
    ///
    /// # Safety
    ///
    /// `record` must point to a live, 8-byte aligned `CounterRecord` that is
    /// only ever accessed atomically while shared.
    #[inline(always)]
    pub unsafe fn accumulate(record: *mut Self, bytes: u64) {
        unsafe {
            field(&raw mut (*record).count).fetch_add(1, Ordering::Relaxed);
            field(&raw mut (*record).processed_bytes).fetch_add(bytes, Ordering::Relaxed);
        }
    }

    /// Point-in-time copy; the two fields may come from different updates.
    ///
    /// # Safety
    ///
    /// Same requirements as [`CounterRecord::accumulate`].
    #[inline(always)]
    pub unsafe fn load(record: *mut Self) -> Self {
        unsafe {
            Self {
                count: field(&raw mut (*record).count).load(Ordering::Relaxed),
                processed_bytes: field(&raw mut (*record).processed_bytes)
                    .load(Ordering::Relaxed),
            }
        }
    }
}

/// Correlation identity: which thread ran which syscall.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct LatencyKey {
    pub tid: u32,
    pub _pad: u32,
    pub syscall_nr: u64,
}

impl LatencyKey {
    pub const fn new(tid: u32, syscall_nr: u64) -> Self {
        Self {
            tid,
            _pad: 0,
            syscall_nr,
        }
    }
}

/// Cumulative latency for one [`LatencyKey`].
///
/// `enter_ns` is a transient marker: non-zero only while an operation is in
/// flight.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LatencyRecord {
    pub count: u64,
    pub elapsed_ns: u64,
    pub enter_ns: u64,
}

impl LatencyRecord {
    pub const fn is_pending(&self) -> bool {
        self.enter_ns != 0
    }

    /// # Safety
    ///
    /// `record` must point to a live, 8-byte aligned `LatencyRecord` that is
    /// only ever accessed atomically while shared.
    #[inline(always)]
    pub unsafe fn load(record: *mut Self) -> Self {
        unsafe {
            Self {
                count: field(&raw mut (*record).count).load(Ordering::Relaxed),
                elapsed_ns: field(&raw mut (*record).elapsed_ns).load(Ordering::Relaxed),
                enter_ns: field(&raw mut (*record).enter_ns).load(Ordering::Relaxed),
            }
        }
    }
}

/// Arguments captured at `unshare(2)` entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UnshareArgs {
    pub flags: u64,
}

/// One completed `unshare(2)` call.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnshareEvent {
    pub pid: u32,
    pub ret: i32,
    pub flags: u64,
    pub comm: [u8; TASK_COMM_LEN],
}

impl UnshareEvent {
    pub const fn new(pid: u32, args: UnshareArgs, ret: i64) -> Self {
        Self {
            pid,
            ret: ret as i32,
            flags: args.flags,
            comm: [0; TASK_COMM_LEN],
        }
    }

    /// Negative return values are errno-style failures.
    pub const fn is_failure(&self) -> bool {
        self.ret < 0
    }
}

#[inline(always)]
unsafe fn field<'a>(ptr: *mut u64) -> &'a AtomicU64 {
    unsafe { AtomicU64::from_ptr(ptr) }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for CounterRecord {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for LatencyKey {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for LatencyRecord {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for UnshareArgs {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for UnshareEvent {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for CommonConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_record_accumulate() {
        let mut record = CounterRecord::default();
        unsafe {
            CounterRecord::accumulate(&mut record, 512);
            CounterRecord::accumulate(&mut record, 4096);
        }
        assert_eq!(
            record,
            CounterRecord {
                count: 2,
                processed_bytes: 4608
            }
        );
    }

    #[test]
    fn test_counter_record_wraps() {
        let mut record = CounterRecord {
            count: u64::MAX,
            processed_bytes: u64::MAX - 1,
        };
        unsafe { CounterRecord::accumulate(&mut record, 3) };
        assert_eq!(record.count, 0);
        assert_eq!(record.processed_bytes, 1);
    }

    #[test]
    fn test_unshare_event_failure() {
        let ok = UnshareEvent::new(5, UnshareArgs { flags: 0x4000 }, 0);
        let failed = UnshareEvent::new(5, UnshareArgs { flags: 0x1 }, -1);
        assert!(!ok.is_failure());
        assert!(failed.is_failure());
        assert_eq!(failed.flags, 0x1);
    }

    #[test]
    fn test_latency_key_layout() {
        assert_eq!(core::mem::size_of::<LatencyKey>(), 16);
        assert_eq!(core::mem::size_of::<LatencyRecord>(), 24);
        assert_eq!(core::mem::size_of::<UnshareEvent>(), 32);
    }
}
