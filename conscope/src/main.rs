use anyhow::{Context, Result};
use aya::include_bytes_aligned;
use clap::Parser;
use conscope::{
    ConscopeEngine,
    settings::{Settings, running_kernel},
    telemetry,
};
use log::{info, warn};

#[derive(Debug, Parser)]
#[command(about = "Container-scoped kernel activity statistics")]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// Also report failed unshare(2) calls
    #[clap(short, long)]
    all: bool,

    /// Only count activity from this cgroup v2 id (0 traces everything)
    #[clap(short, long, env = "SCOPE__TARGET_CGROUP")]
    cgroup: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "info" } else { "warn" }),
    )
    .init();

    let mut settings = Settings::new().context("Failed to load settings")?;
    if opt.all {
        settings.builtin_probes.unshare_include_failed = Some(true);
    }
    if let Some(cgroup) = opt.cgroup {
        settings.scope.target_cgroup = Some(cgroup);
    }

    let kernel = match running_kernel() {
        Ok((major, minor)) => {
            info!("Running on kernel {major}.{minor}");
            (major, minor)
        }
        Err(e) => {
            warn!("Failed to detect kernel version ({e}); assuming a 5.16+ block request layout");
            (5, 16)
        }
    };
    let config = settings.to_common_config(kernel)?;

    if let Err(e) = telemetry::init_metrics() {
        warn!("Failed to initialize metrics: {e:#}");
    }

    let engine = ConscopeEngine::new(
        settings,
        config,
        include_bytes_aligned!(concat!(env!("OUT_DIR"), "/conscope")),
    )?;
    let result = engine.run().await;

    telemetry::shutdown_metrics();
    result
}
