use std::collections::HashMap as StdHashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use aya::{Ebpf, maps::HashMap};
use conscope_common::{LatencyKey, LatencyRecord};
use log::info;

use crate::probes::{
    Probe, TracepointConfig, attach_tracepoint, format_duration, spawn_poller,
};
use crate::telemetry;

/// Per-(thread, syscall) latency. Every interval the whole table is read and
/// the busiest keys since the previous read are logged.
pub struct SyscallLatencyProbe {
    pub interval: Duration,
    pub top: usize,
}

impl Probe for SyscallLatencyProbe {
    fn attach(&self, bpf: &mut Ebpf) -> Result<()> {
        info!("Attaching syscall latency probes...");
        for name in ["sys_enter", "sys_exit"] {
            let attached = attach_tracepoint(
                bpf,
                TracepointConfig {
                    program_name: name,
                    category: "raw_syscalls",
                    name,
                },
            )?;
            if !attached {
                return Ok(());
            }
        }

        let table: HashMap<_, LatencyKey, LatencyRecord> = HashMap::try_from(
            bpf.take_map("SYSCALL_LATENCY")
                .context("Failed to find SYSCALL_LATENCY map")?,
        )
        .context("SYSCALL_LATENCY is not a HashMap")?;

        let mut tracker = LatencyTracker::default();
        let top = self.top;
        spawn_poller("syscall_latency", self.interval, move || {
            let snapshot = table
                .iter()
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to read SYSCALL_LATENCY")?;
            let deltas = tracker.advance(snapshot);

            for delta in &deltas {
                telemetry::record_syscall_latency(
                    delta.key.syscall_nr,
                    delta.count,
                    delta.elapsed_ns,
                );
            }
            for delta in deltas.iter().take(top) {
                info!(
                    "SYSCALL tid={} nr={} calls={} total={} avg={}",
                    delta.key.tid,
                    delta.key.syscall_nr,
                    delta.count,
                    format_duration(delta.elapsed_ns),
                    format_duration(delta.mean_ns()),
                );
            }
            Ok(())
        });

        telemetry::record_active_probe("syscall_latency", 1);
        info!(
            "SyscallLatencyProbe attached (interval={}s, top={})",
            self.interval.as_secs(),
            top
        );
        Ok(())
    }
}

/// Completed calls for one key between two reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LatencyDelta {
    pub key: LatencyKey,
    pub count: u64,
    pub elapsed_ns: u64,
}

impl LatencyDelta {
    pub fn mean_ns(&self) -> u64 {
        self.elapsed_ns.checked_div(self.count).unwrap_or(0)
    }
}

/// Turns cumulative table snapshots into per-interval deltas.
///
/// The kernel table is never reset, so the previous snapshot is kept here.
#[derive(Default)]
pub struct LatencyTracker {
    previous: StdHashMap<LatencyKey, LatencyRecord>,
}

impl LatencyTracker {
    /// Returns keys that moved since the last call, largest elapsed time
    /// first.
    pub fn advance<I>(&mut self, snapshot: I) -> Vec<LatencyDelta>
    where
        I: IntoIterator<Item = (LatencyKey, LatencyRecord)>,
    {
        let current: StdHashMap<_, _> = snapshot.into_iter().collect();
        let mut deltas: Vec<LatencyDelta> = current
            .iter()
            .filter_map(|(key, record)| {
                let base = self.previous.get(key).copied().unwrap_or_default();
                let count = record.count.wrapping_sub(base.count);
                let elapsed_ns = record.elapsed_ns.wrapping_sub(base.elapsed_ns);
                (count != 0 || elapsed_ns != 0).then_some(LatencyDelta {
                    key: *key,
                    count,
                    elapsed_ns,
                })
            })
            .collect();
        deltas.sort_unstable_by(|a, b| {
            b.elapsed_ns
                .cmp(&a.elapsed_ns)
                .then_with(|| b.count.cmp(&a.count))
                .then_with(|| a.key.tid.cmp(&b.key.tid))
                .then_with(|| a.key.syscall_nr.cmp(&b.key.syscall_nr))
        });
        self.previous = current;
        deltas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(count: u64, elapsed_ns: u64) -> LatencyRecord {
        LatencyRecord {
            count,
            elapsed_ns,
            enter_ns: 0,
        }
    }

    #[test]
    fn test_first_snapshot_is_full_delta() {
        let mut tracker = LatencyTracker::default();
        let deltas = tracker.advance([
            (LatencyKey::new(1, 0), record(3, 300)),
            (LatencyKey::new(2, 1), record(1, 900)),
        ]);

        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].key, LatencyKey::new(2, 1));
        assert_eq!(deltas[0].elapsed_ns, 900);
        assert_eq!(deltas[1].count, 3);
        assert_eq!(deltas[1].mean_ns(), 100);
    }

    #[test]
    fn test_unchanged_keys_are_skipped() {
        let mut tracker = LatencyTracker::default();
        tracker.advance([
            (LatencyKey::new(1, 0), record(3, 300)),
            (LatencyKey::new(2, 1), record(1, 900)),
        ]);
        let deltas = tracker.advance([
            (LatencyKey::new(1, 0), record(5, 340)),
            (LatencyKey::new(2, 1), record(1, 900)),
        ]);

        assert_eq!(
            deltas,
            vec![LatencyDelta {
                key: LatencyKey::new(1, 0),
                count: 2,
                elapsed_ns: 40,
            }]
        );
    }

    #[test]
    fn test_entered_call_counts_before_exit() {
        let mut tracker = LatencyTracker::default();
        tracker.advance([(LatencyKey::new(7, 61), record(1, 50))]);

        // Counted at enter; its time lands once it exits.
        let pending = LatencyRecord {
            count: 2,
            elapsed_ns: 50,
            enter_ns: 123_456,
        };
        let deltas = tracker.advance([(LatencyKey::new(7, 61), pending)]);
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].count, 1);
        assert_eq!(deltas[0].elapsed_ns, 0);
    }

    #[test]
    fn test_mean_of_empty_delta() {
        let delta = LatencyDelta {
            key: LatencyKey::new(1, 1),
            count: 0,
            elapsed_ns: 10,
        };
        assert_eq!(delta.mean_ns(), 0);
    }
}
