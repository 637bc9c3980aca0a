use std::time::Duration;

use anyhow::{Context, Result};
use aya::{
    Ebpf,
    maps::{HashMap, MapError},
};
use conscope_common::{BLOCK_IO_KEY, CounterRecord};
use log::{info, warn};

use crate::probes::{
    LossTracker, Probe, TracepointConfig, attach_raw_tracepoint, percpu_total, spawn_poller,
    take_percpu_counter,
};
use crate::telemetry;

/// Counts block requests issued to device drivers and reports the per-interval
/// rate.
pub struct BlockIoProbe {
    pub interval: Duration,
}

impl Probe for BlockIoProbe {
    fn attach(&self, bpf: &mut Ebpf) -> Result<()> {
        info!("Attaching block I/O probe...");
        let attached = attach_raw_tracepoint(
            bpf,
            TracepointConfig {
                program_name: "block_rq_issue",
                category: "block",
                name: "block_rq_issue",
            },
        )?;
        if !attached {
            return Ok(());
        }

        let stats: HashMap<_, u32, CounterRecord> = HashMap::try_from(
            bpf.take_map("BLOCK_IO_STATS")
                .context("Failed to find BLOCK_IO_STATS map")?,
        )
        .context("BLOCK_IO_STATS is not a HashMap")?;
        let read_errors = take_percpu_counter(bpf, "BLOCK_IO_READ_ERRORS")?;

        let mut previous = CounterRecord::default();
        let mut skipped = LossTracker::default();
        let interval = self.interval;
        spawn_poller("block_io", interval, move || {
            if let Some(count) = skipped.advance(percpu_total(&read_errors)?) {
                warn!(
                    "BLOCK_IO skipped {count} requests with an unreadable length; check ABI__RQ_DATA_LEN_OFFSET"
                );
            }
            let current = match stats.get(&BLOCK_IO_KEY, 0) {
                Ok(record) => record,
                // Nothing issued yet.
                Err(MapError::KeyNotFound) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            let delta = counter_delta(&previous, &current);
            previous = current;

            info!(
                "BLOCK_IO requests={} bytes={} rate={:.1}/s total_requests={} total_bytes={}",
                delta.count,
                delta.processed_bytes,
                delta.count as f64 / interval.as_secs_f64(),
                current.count,
                current.processed_bytes,
            );
            telemetry::record_block_io(delta.count, delta.processed_bytes);
            Ok(())
        });

        telemetry::record_active_probe("block_io", 1);
        info!("BlockIoProbe attached (interval={}s)", interval.as_secs());
        Ok(())
    }
}

/// Growth between two snapshots of the same cumulative record. The kernel
/// counters wrap, so the difference does too.
pub fn counter_delta(previous: &CounterRecord, current: &CounterRecord) -> CounterRecord {
    CounterRecord {
        count: current.count.wrapping_sub(previous.count),
        processed_bytes: current
            .processed_bytes
            .wrapping_sub(previous.processed_bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_delta() {
        let previous = CounterRecord {
            count: 10,
            processed_bytes: 40_960,
        };
        let current = CounterRecord {
            count: 13,
            processed_bytes: 53_248,
        };
        assert_eq!(
            counter_delta(&previous, &current),
            CounterRecord {
                count: 3,
                processed_bytes: 12_288
            }
        );
    }

    #[test]
    fn test_counter_delta_from_zero() {
        let current = CounterRecord {
            count: 2,
            processed_bytes: 1024,
        };
        assert_eq!(counter_delta(&CounterRecord::default(), &current), current);
    }

    #[test]
    fn test_counter_delta_wraps() {
        let previous = CounterRecord {
            count: u64::MAX,
            processed_bytes: u64::MAX - 511,
        };
        let current = CounterRecord {
            count: 1,
            processed_bytes: 512,
        };
        assert_eq!(
            counter_delta(&previous, &current),
            CounterRecord {
                count: 2,
                processed_bytes: 1024
            }
        );
    }
}
