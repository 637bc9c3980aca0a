use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use aya::{
    Ebpf,
    maps::{MapData, PerCpuArray, RingBuf},
    programs::{RawTracePoint, TracePoint},
};
use log::{info, warn};

static SHUTDOWN: once_cell::sync::Lazy<Arc<AtomicBool>> =
    once_cell::sync::Lazy::new(|| Arc::new(AtomicBool::new(false)));

pub fn shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN.clone()
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

pub fn is_shutdown() -> bool {
    SHUTDOWN.load(Ordering::Relaxed)
}

pub mod builtin;

pub trait Probe {
    fn attach(&self, bpf: &mut Ebpf) -> Result<()>;
}

pub struct TracepointConfig<'a> {
    pub program_name: &'a str,
    pub category: &'a str,
    pub name: &'a str,
}

pub const POLL_INTERVAL_MS: u64 = 10;

fn tracepoint_exists(category: &str, name: &str) -> bool {
    const TRACEFS_MOUNT_POINTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

    TRACEFS_MOUNT_POINTS.iter().any(|base| {
        Path::new(base)
            .join("events")
            .join(category)
            .join(name)
            .exists()
    })
}

pub fn attach_tracepoint(bpf: &mut Ebpf, config: TracepointConfig) -> Result<bool> {
    if !tracepoint_exists(config.category, config.name) {
        warn!(
            "Tracepoint {}:{} not available; skipping {}",
            config.category, config.name, config.program_name
        );
        return Ok(false);
    }

    info!("Loading program {}", config.program_name);
    let program: &mut TracePoint = bpf
        .program_mut(config.program_name)
        .with_context(|| format!("Failed to find {} program", config.program_name))?
        .try_into()?;
    program.load()?;
    program
        .attach(config.category, config.name)
        .with_context(|| format!("Failed to attach {}", config.name))?;
    Ok(true)
}

/// Raw tracepoints are attached by event name alone; `category` is only used
/// to check that the event exists on this kernel.
pub fn attach_raw_tracepoint(bpf: &mut Ebpf, config: TracepointConfig) -> Result<bool> {
    if !tracepoint_exists(config.category, config.name) {
        warn!(
            "Raw tracepoint {}:{} not available; skipping {}",
            config.category, config.name, config.program_name
        );
        return Ok(false);
    }

    info!("Loading program {}", config.program_name);
    let program: &mut RawTracePoint = bpf
        .program_mut(config.program_name)
        .with_context(|| format!("Failed to find {} program", config.program_name))?
        .try_into()?;
    program.load()?;
    program
        .attach(config.name)
        .with_context(|| format!("Failed to attach raw tracepoint {}", config.name))?;
    Ok(true)
}

/// Drains a ring buffer on a blocking thread until shutdown, handing each
/// record to `handler`. Short records are skipped.
pub fn spawn_ringbuf_handler<T, F>(bpf: &mut Ebpf, map_name: &str, handler: F) -> Result<()>
where
    T: Copy + Send + 'static,
    F: Fn(T) + Send + 'static,
{
    let mut ring_buf = RingBuf::try_from(
        bpf.take_map(map_name)
            .with_context(|| format!("Failed to get {map_name} map"))?,
    )?;
    let shutdown = shutdown_flag();

    tokio::task::spawn_blocking(move || {
        while !shutdown.load(Ordering::Relaxed) {
            let mut has_work = false;
            while let Some(item) = ring_buf.next() {
                has_work = true;
                if item.len() >= std::mem::size_of::<T>() {
                    let event = unsafe { (item.as_ptr() as *const T).read_unaligned() };
                    handler(event);
                }
            }
            if !has_work {
                std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
            }
        }
    });
    Ok(())
}

/// Runs `poll` every `interval` on the tokio runtime until shutdown.
pub fn spawn_poller<F>(name: &'static str, interval: Duration, mut poll: F)
where
    F: FnMut() -> Result<()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so the first poll covers a
        // full interval.
        ticker.tick().await;
        while !is_shutdown() {
            ticker.tick().await;
            if let Err(e) = poll() {
                warn!("{name}: poll failed: {e:#}");
            }
        }
    });
}

/// Takes the single-entry per-CPU counter `map_name` out of `bpf`.
pub fn take_percpu_counter(bpf: &mut Ebpf, map_name: &str) -> Result<PerCpuArray<MapData, u64>> {
    PerCpuArray::try_from(
        bpf.take_map(map_name)
            .with_context(|| format!("Failed to find {map_name} map"))?,
    )
    .with_context(|| format!("{map_name} is not a PerCpuArray"))
}

/// Sum of slot 0 across all CPUs.
pub fn percpu_total(counter: &PerCpuArray<MapData, u64>) -> Result<u64> {
    let values = counter.get(&0, 0)?;
    Ok(values.iter().fold(0u64, |acc, v| acc.wrapping_add(*v)))
}

/// Turns a monotonically growing total into increments worth reporting.
#[derive(Debug, Default)]
pub struct LossTracker {
    reported: u64,
}

impl LossTracker {
    /// Returns how much `total` grew since the last reported value, if at all.
    pub fn advance(&mut self, total: u64) -> Option<u64> {
        if total <= self.reported {
            return None;
        }
        let delta = total - self.reported;
        self.reported = total;
        Some(delta)
    }
}

pub fn format_duration(ns: u64) -> String {
    if ns >= 1_000_000_000 {
        format!("{:.2}s", ns as f64 / 1_000_000_000.0)
    } else if ns >= 1_000_000 {
        format!("{:.2}ms", ns as f64 / 1_000_000.0)
    } else if ns >= 1_000 {
        format!("{:.2}us", ns as f64 / 1_000.0)
    } else {
        format!("{}ns", ns)
    }
}

/// NUL-terminated kernel task name.
pub fn comm_str(comm: &[u8]) -> &str {
    let end = comm.iter().position(|&b| b == 0).unwrap_or(comm.len());
    std::str::from_utf8(&comm[..end]).unwrap_or("<invalid>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(999), "999ns");
        assert_eq!(format_duration(1_500), "1.50us");
        assert_eq!(format_duration(2_000_000), "2.00ms");
        assert_eq!(format_duration(3_250_000_000), "3.25s");
    }

    #[test]
    fn test_comm_str() {
        assert_eq!(comm_str(b"unshare\0\0\0\0\0\0\0\0\0"), "unshare");
        assert_eq!(comm_str(b"exactly16bytes!!"), "exactly16bytes!!");
        assert_eq!(comm_str(&[0xff, 0xfe, 0]), "<invalid>");
        assert_eq!(comm_str(&[]), "");
    }

    #[test]
    fn test_loss_tracker_reports_growth_once() {
        let mut lost = LossTracker::default();
        assert_eq!(lost.advance(0), None);
        assert_eq!(lost.advance(3), Some(3));
        assert_eq!(lost.advance(3), None);
        assert_eq!(lost.advance(10), Some(7));
        // A total that goes backwards is ignored rather than underflowing.
        assert_eq!(lost.advance(4), None);
        assert_eq!(lost.advance(11), Some(1));
    }

    #[test]
    fn test_missing_tracepoint_does_not_exist() {
        assert!(!tracepoint_exists("conscope_nonexistent", "nothing_here"));
    }
}
