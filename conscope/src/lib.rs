pub mod engine;
pub mod probes;
pub mod settings;
pub mod telemetry;

use std::time::Duration;

use anyhow::{Context, Result, bail};
use aya::{Ebpf, EbpfLoader};
use aya_log::EbpfLogger;
use conscope_common::CommonConfig;
use log::{info, warn};
use tokio::signal;

use crate::probes::{
    Probe,
    builtin::{BlockIoProbe, SyscallLatencyProbe, UnshareProbe},
};
use crate::settings::Settings;

pub struct ConscopeEngine {
    pub settings: Settings,
    bpf: Ebpf,
}

impl ConscopeEngine {
    /// Loads `bytecode` with `config` written into its `CONFIG` global.
    pub fn new(settings: Settings, config: CommonConfig, bytecode: &[u8]) -> Result<Self> {
        if bytecode.is_empty() {
            bail!(
                "embedded eBPF object is empty; rebuild with the nightly toolchain and bpf-linker installed"
            );
        }

        bump_memlock_rlimit()?;
        info!(
            "Loading eBPF object (target_cgroup={}, abi={:?}, rq_data_len_offset={}, include_failed={})",
            config.target_cgroup,
            config.abi_variant(),
            config.rq_data_len_offset,
            config.include_failed != 0,
        );
        let mut bpf = EbpfLoader::new()
            .set_global("CONFIG", &config, true)
            .load(bytecode)
            .context("Failed to load eBPF object")?;
        if let Err(e) = EbpfLogger::init(&mut bpf) {
            warn!("Failed to initialize eBPF logger: {}", e);
        }
        Ok(Self { settings, bpf })
    }

    pub async fn run(mut self) -> Result<()> {
        self.attach_probes()?;

        info!("Monitoring active. Press Ctrl-C to exit.");
        signal::ctrl_c().await?;
        info!("Exiting...");
        probes::request_shutdown();

        Ok(())
    }

    fn attach_probes(&mut self) -> Result<()> {
        let probes = &self.settings.builtin_probes;
        let interval = Duration::from_secs(probes.interval_secs());
        let mut attached = 0;

        if probes.block_io.unwrap_or(false) {
            BlockIoProbe { interval }.attach(&mut self.bpf)?;
            attached += 1;
        }

        if probes.syscall_latency.unwrap_or(false) {
            SyscallLatencyProbe {
                interval,
                top: probes.syscall_latency_top(),
            }
            .attach(&mut self.bpf)?;
            attached += 1;
        }

        if probes.unshare.unwrap_or(false) {
            UnshareProbe.attach(&mut self.bpf)?;
            attached += 1;
        }

        if attached == 0 {
            warn!(
                "No probes enabled; set BUILTIN_PROBES__BLOCK_IO, BUILTIN_PROBES__SYSCALL_LATENCY or BUILTIN_PROBES__UNSHARE"
            );
        }
        Ok(())
    }
}

fn bump_memlock_rlimit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to increase rlimit");
    }
    Ok(())
}
