//! Block request issue counter.
//!
//! Counts every request handed to a block device driver, together with its
//! payload size, under a single system-wide key.

use aya_ebpf::{
    EbpfContext,
    helpers::bpf_probe_read_kernel,
    macros::{map, raw_tracepoint},
    maps::{HashMap, PerCpuArray},
    programs::RawTracePointContext,
};
use aya_log_ebpf::warn;
use conscope_common::{
    AbiVariant, BLOCK_IO_KEY, BLOCK_IO_STATS_MAX_ENTRIES, CounterAggregator, CounterRecord,
};

use crate::probes::{BpfTable, bump, current_cgroup};

#[map]
pub static BLOCK_IO_STATS: HashMap<u32, CounterRecord> =
    HashMap::with_max_entries(BLOCK_IO_STATS_MAX_ENTRIES, 0);

/// Requests skipped because their length could not be read.
#[map]
pub static BLOCK_IO_READ_ERRORS: PerCpuArray<u64> = PerCpuArray::with_max_entries(1, 0);

#[raw_tracepoint(tracepoint = "block_rq_issue")]
pub fn block_rq_issue(ctx: RawTracePointContext) -> i32 {
    // Log only the first failure on each CPU; the rest are counted.
    if try_block_rq_issue(&ctx).is_err() && bump(&BLOCK_IO_READ_ERRORS) == 1 {
        warn!(
            &ctx,
            "[eBPF] block_rq_issue: failed to read request length at offset {}",
            crate::config().rq_data_len_offset
        );
    }
    0
}

#[inline(always)]
fn try_block_rq_issue(ctx: &RawTracePointContext) -> Result<(), i64> {
    let config = crate::config();
    let scope = config.scope();
    let cgroup = current_cgroup();
    if !scope.matches(cgroup) {
        return Ok(());
    }

    let args = ctx.as_ptr() as *const u64;
    // Constant offsets only: the verifier rejects variable-offset ctx reads.
    let rq = unsafe {
        match config.abi_variant() {
            AbiVariant::QueueAndRequest => *args.add(1),
            AbiVariant::RequestOnly => *args.add(0),
        }
    };
    if rq == 0 {
        return Ok(());
    }

    let data_len: u32 = unsafe {
        bpf_probe_read_kernel((rq + config.rq_data_len_offset as u64) as *const u32)?
    };

    let table = BpfTable(&BLOCK_IO_STATS);
    let aggregator = CounterAggregator::new(&table, scope);
    aggregator.record_occurrence(cgroup, &BLOCK_IO_KEY, data_len as u64);
    Ok(())
}
