use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use aya::{
    Ebpf,
    maps::{MapData, PerCpuArray},
};
use chrono::{Local, SecondsFormat};
use conscope_common::{EventSink, UnshareEvent};
use log::{info, warn};
use tokio::sync::mpsc::Receiver;

use crate::engine::ChannelSink;
use crate::probes::{
    LossTracker, Probe, TracepointConfig, attach_tracepoint, comm_str, is_shutdown, percpu_total,
    spawn_ringbuf_handler, take_percpu_counter,
};
use crate::telemetry;

/// Events buffered between the ring-buffer reader and the printer.
const RELAY_CAPACITY: usize = 4096;

/// How often the printer checks for lost events and shutdown.
const LOST_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Namespace flags accepted by `unshare(2)`, in the order they are printed.
const CLONE_NEW_FLAGS: [(u64, &str); 8] = [
    (0x0000_0080, "CLONE_NEWTIME"),
    (0x0002_0000, "CLONE_NEWNS"),
    (0x0200_0000, "CLONE_NEWCGROUP"),
    (0x0400_0000, "CLONE_NEWUTS"),
    (0x0800_0000, "CLONE_NEWIPC"),
    (0x1000_0000, "CLONE_NEWUSER"),
    (0x2000_0000, "CLONE_NEWPID"),
    (0x4000_0000, "CLONE_NEWNET"),
];

/// Reports every `unshare(2)` call with its namespace flags.
pub struct UnshareProbe;

impl Probe for UnshareProbe {
    fn attach(&self, bpf: &mut Ebpf) -> Result<()> {
        info!("Attaching unshare probes...");
        for name in ["sys_enter_unshare", "sys_exit_unshare"] {
            let attached = attach_tracepoint(
                bpf,
                TracepointConfig {
                    program_name: name,
                    category: "syscalls",
                    name,
                },
            )?;
            if !attached {
                return Ok(());
            }
        }

        let kernel_lost = take_percpu_counter(bpf, "UNSHARE_EVENTS_LOST")?;
        let (sink, rx) = ChannelSink::bounded(RELAY_CAPACITY);
        let sink = Arc::new(sink);
        let relay = Arc::clone(&sink);
        spawn_ringbuf_handler(bpf, "UNSHARE_EVENTS", move |event: UnshareEvent| {
            relay.emit(&event);
        })?;
        tokio::spawn(print_events(rx, sink, kernel_lost));

        telemetry::record_active_probe("unshare", 1);
        info!("UnshareProbe attached");
        Ok(())
    }
}

/// Events dropped so far, in the kernel ring buffer or the userspace relay.
fn total_lost(kernel_lost: &PerCpuArray<MapData, u64>, sink: &ChannelSink<UnshareEvent>) -> u64 {
    let kernel = percpu_total(kernel_lost).unwrap_or_else(|e| {
        warn!("Failed to read UNSHARE_EVENTS_LOST: {e:#}");
        0
    });
    kernel.wrapping_add(sink.dropped())
}

async fn print_events(
    mut rx: Receiver<UnshareEvent>,
    sink: Arc<ChannelSink<UnshareEvent>>,
    kernel_lost: PerCpuArray<MapData, u64>,
) {
    println!(
        "{:20} {:6} {:18} {:3} {:10} {}",
        "TIME", "TID", "COMM", "RET", "FLAGS", "FLAGS(human)"
    );

    let mut lost = LossTracker::default();
    let mut ticker = tokio::time::interval(LOST_CHECK_INTERVAL);
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let timestamp = Local::now().to_rfc3339_opts(SecondsFormat::Secs, true);
                println!("{}", format_event(&timestamp, &event));
                telemetry::record_unshare_event(comm_str(&event.comm), event.is_failure());
            }
            _ = ticker.tick() => {
                if let Some(count) = lost.advance(total_lost(&kernel_lost, &sink)) {
                    warn!("Lost {count} unshare events");
                    telemetry::record_unshare_dropped(count);
                }
                if is_shutdown() {
                    break;
                }
            }
        }
    }
}

pub fn format_event(timestamp: &str, event: &UnshareEvent) -> String {
    format!(
        "{:20} {:6} {:<18} {:3} {:#010x} {}",
        timestamp,
        event.pid,
        comm_str(&event.comm),
        event.ret,
        event.flags,
        describe_flags(event.flags),
    )
}

/// Symbolic names of the namespace bits in `flags`; other bits are ignored.
pub fn describe_flags(flags: u64) -> String {
    let names: Vec<&str> = CLONE_NEW_FLAGS
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|&(_, name)| name)
        .collect();
    if names.is_empty() {
        "(none)".to_string()
    } else {
        names.join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conscope_common::{TASK_COMM_LEN, UnshareArgs};

    fn event(flags: u64, ret: i64, comm: &str) -> UnshareEvent {
        let mut event = UnshareEvent::new(4321, UnshareArgs { flags }, ret);
        let mut buf = [0u8; TASK_COMM_LEN];
        buf[..comm.len()].copy_from_slice(comm.as_bytes());
        event.comm = buf;
        event
    }

    #[test]
    fn test_describe_flags() {
        assert_eq!(describe_flags(0x0002_0000), "CLONE_NEWNS");
        assert_eq!(
            describe_flags(0x1000_0000 | 0x4000_0000),
            "CLONE_NEWUSER | CLONE_NEWNET"
        );
        assert_eq!(describe_flags(0x200), "(none)");
        assert_eq!(describe_flags(0x0000_0080 | 0x200), "CLONE_NEWTIME");
    }

    #[test]
    fn test_format_event() {
        let line = format_event("2026-10-18T09:30:00Z", &event(0x5000_0000, 0, "unshare"));
        assert_eq!(
            line,
            "2026-10-18T09:30:00Z   4321 unshare              0 0x50000000 \
             CLONE_NEWUSER | CLONE_NEWNET"
        );
    }

    #[test]
    fn test_format_failed_event() {
        let line = format_event("2026-10-18T09:30:00Z", &event(0x1, -1, "sh"));
        assert!(line.contains(" -1 0x00000001 (none)"));
        assert!(line.contains(" sh "));
    }
}
