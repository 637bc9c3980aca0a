//! OpenTelemetry metrics export module
//!
//! Mirrors what the probes log into OTLP metrics. Export is only enabled when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set; otherwise every `record_*` helper is
//! a no-op.

use anyhow::{Context, Result};
use log::info;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};
use std::time::Duration;

/// Metric export interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

static METRICS: OnceLock<ConscopeMetrics> = OnceLock::new();

/// Kept for graceful shutdown.
static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// Read by the `active_probes` gauge callback.
static ACTIVE_PROBES: OnceLock<RwLock<HashMap<String, u64>>> = OnceLock::new();

fn active_probes_map() -> &'static RwLock<HashMap<String, u64>> {
    ACTIVE_PROBES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
pub struct ConscopeMetrics {
    pub block_io_events: Counter<u64>,
    pub block_io_bytes: Counter<u64>,

    pub syscall_events: Counter<u64>,
    pub syscall_latency_ns: Histogram<u64>,

    pub unshare_events: Counter<u64>,
    pub unshare_events_dropped: Counter<u64>,
}

impl ConscopeMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            block_io_events: meter
                .u64_counter("block_io_events")
                .with_description("Number of block I/O requests issued")
                .with_unit("events")
                .build(),
            block_io_bytes: meter
                .u64_counter("block_io_bytes")
                .with_description("Total bytes of issued block I/O requests")
                .with_unit("bytes")
                .build(),

            syscall_events: meter
                .u64_counter("syscall_events")
                .with_description("Number of completed system calls")
                .with_unit("events")
                .build(),
            syscall_latency_ns: meter
                .u64_histogram("syscall_latency_ns")
                .with_description("Mean system call latency per poll interval")
                .with_unit("ns")
                .build(),

            unshare_events: meter
                .u64_counter("unshare_events")
                .with_description("Number of unshare(2) calls reported")
                .with_unit("events")
                .build(),
            unshare_events_dropped: meter
                .u64_counter("unshare_events_dropped")
                .with_description("unshare(2) events lost in the userspace relay")
                .with_unit("events")
                .build(),
        }
    }
}

/// `OTEL_EXPORTER_OTLP_ENDPOINT`, with an `http://` scheme added when
/// missing. Unset or empty disables metrics.
fn get_otlp_endpoint() -> Option<String> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint)
    }
}

/// Initialize OpenTelemetry metrics provider
///
/// Configures metrics export to OTLP Collector via gRPC.
/// Skips initialization if OTEL_EXPORTER_OTLP_ENDPOINT is not set.
pub fn init_metrics() -> Result<()> {
    let endpoint = match get_otlp_endpoint() {
        Some(ep) => ep,
        None => {
            info!("OTEL_EXPORTER_OTLP_ENDPOINT not set. Metrics export disabled.");
            return Ok(());
        }
    };

    info!("Initializing OpenTelemetry metrics exporter");
    info!("OTLP endpoint: {}", endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
        .build();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", "conscope"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("conscope");

    let _active_probes_gauge = meter
        .u64_observable_gauge("active_probes")
        .with_description("Number of currently active eBPF probes")
        .with_unit("probes")
        .with_callback(|observer| {
            if let Ok(probes) = active_probes_map().read() {
                for (probe_name, count) in probes.iter() {
                    observer.observe(*count, &[KeyValue::new("probe", probe_name.clone())]);
                }
            }
        })
        .build();

    let _ = METRICS.set(ConscopeMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized successfully");
    Ok(())
}

pub fn metrics() -> Option<&'static ConscopeMetrics> {
    METRICS.get()
}

pub fn record_block_io(events: u64, bytes: u64) {
    if let Some(m) = metrics() {
        m.block_io_events.add(events, &[]);
        m.block_io_bytes.add(bytes, &[]);
    }
}

pub fn record_syscall_latency(syscall_nr: u64, events: u64, elapsed_ns: u64) {
    if let Some(m) = metrics() {
        let attrs = [KeyValue::new("syscall", syscall_nr as i64)];
        m.syscall_events.add(events, &attrs);
        if events > 0 {
            m.syscall_latency_ns.record(elapsed_ns / events, &attrs);
        }
    }
}

pub fn record_unshare_event(comm: &str, failed: bool) {
    if let Some(m) = metrics() {
        let attrs = [
            KeyValue::new("process", comm.to_string()),
            KeyValue::new("failed", failed),
        ];
        m.unshare_events.add(1, &attrs);
    }
}

pub fn record_unshare_dropped(count: u64) {
    if let Some(m) = metrics() {
        m.unshare_events_dropped.add(count, &[]);
    }
}

/// Updates the global active probes map read by the gauge callback.
pub fn record_active_probe(probe_name: &str, count: u64) {
    if let Ok(mut probes) = active_probes_map().write() {
        probes.insert(probe_name.to_string(), count);
        info!("Active probe registered: {} = {}", probe_name, count);
    }
}

/// Flushes pending metrics and shuts down the MeterProvider
pub fn shutdown_metrics() {
    info!("Shutting down OpenTelemetry metrics...");
    if let Some(provider) = METER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            log::warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}
