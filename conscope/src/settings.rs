use anyhow::{Context, Result, bail};
use config::{Config, ConfigError, Environment};
use conscope_common::{AbiVariant, CommonConfig, rq_data_len_offset_for_kernel};
use serde::Deserialize;

const DEFAULT_PROBE_INTERVAL_SECONDS: u32 = 1;
const DEFAULT_SYSCALL_LATENCY_TOP: usize = 10;

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Scope {
    /// cgroup v2 id to restrict aggregation to; unset or 0 traces everything.
    pub target_cgroup: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct BuiltinProbes {
    pub block_io: Option<bool>,
    pub syscall_latency: Option<bool>,
    pub syscall_latency_top: Option<usize>,
    pub unshare: Option<bool>,
    pub unshare_include_failed: Option<bool>,
    pub interval: Option<u32>,
}

impl BuiltinProbes {
    pub fn interval_secs(&self) -> u64 {
        u64::from(
            self.interval
                .unwrap_or(DEFAULT_PROBE_INTERVAL_SECONDS)
                .max(1),
        )
    }

    pub fn syscall_latency_top(&self) -> usize {
        self.syscall_latency_top
            .unwrap_or(DEFAULT_SYSCALL_LATENCY_TOP)
    }
}

/// Kernel ABI overrides for the block request tracepoint.
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Abi {
    /// `auto` (default), `legacy` (<= 5.10) or `modern` (>= 5.11).
    pub variant: Option<String>,
    /// Overrides the `struct request::__data_len` offset derived from the
    /// kernel version.
    pub rq_data_len_offset: Option<u32>,
}

impl Abi {
    pub fn resolve(&self, kernel: (u8, u8)) -> Result<AbiVariant> {
        let (major, minor) = kernel;
        match self.variant.as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("auto") => Ok(AbiVariant::for_kernel(major, minor)),
            Some("legacy") => Ok(AbiVariant::QueueAndRequest),
            Some("modern") => Ok(AbiVariant::RequestOnly),
            Some(other) => bail!("unknown abi variant {other:?} (expected auto, legacy or modern)"),
        }
    }

    pub fn rq_data_len_offset(&self, kernel: (u8, u8)) -> u32 {
        let (major, minor) = kernel;
        self.rq_data_len_offset
            .unwrap_or_else(|| rq_data_len_offset_for_kernel(major, minor))
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Settings {
    pub otel_exporter_otlp_endpoint: Option<String>,
    pub otel_exporter_otlp_protocol: Option<String>,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub builtin_probes: BuiltinProbes,
    #[serde(default)]
    pub abi: Abi,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let s = Config::builder()
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        log::debug!("Parsed settings: {:?}", settings);
        Ok(settings)
    }

    pub fn to_common_config(&self, kernel: (u8, u8)) -> Result<CommonConfig> {
        let variant = self.abi.resolve(kernel)?;
        let include_failed = self
            .builtin_probes
            .unshare_include_failed
            .unwrap_or(false);

        Ok(CommonConfig {
            target_cgroup: self.scope.target_cgroup.unwrap_or(0),
            rq_data_len_offset: self.abi.rq_data_len_offset(kernel),
            rq_arg_index: variant.request_arg_index(),
            include_failed: include_failed as u8,
            _pad: [0; 2],
        })
    }
}

const OSRELEASE_PATH: &str = "/proc/sys/kernel/osrelease";

/// `(major, minor)` of the running kernel.
pub fn running_kernel() -> Result<(u8, u8)> {
    let release = std::fs::read_to_string(OSRELEASE_PATH)
        .with_context(|| format!("Failed to read {OSRELEASE_PATH}"))?;
    parse_kernel_release(&release)
        .with_context(|| format!("Unrecognized kernel release {:?}", release.trim()))
}

/// Parses the leading `major.minor` of a release string such as
/// `6.8.0-45-generic`.
pub fn parse_kernel_release(release: &str) -> Option<(u8, u8)> {
    let mut parts = release.trim().split(|c: char| !c.is_ascii_digit());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conscope_common::{RQ_DATA_LEN_OFFSET, RQ_DATA_LEN_OFFSET_LEGACY};
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_load_settings() {
        unsafe {
            std::env::set_var("BUILTIN_PROBES__SYSCALL_LATENCY", "true");
            std::env::set_var("BUILTIN_PROBES__INTERVAL", "5");
            std::env::set_var("SCOPE__TARGET_CGROUP", "4242");
            std::env::set_var("ABI__VARIANT", "legacy");
        }

        let settings = Settings::new().expect("Failed to load settings");

        assert_eq!(settings.builtin_probes.syscall_latency, Some(true));
        assert_eq!(settings.builtin_probes.interval, Some(5));
        assert_eq!(settings.scope.target_cgroup, Some(4242));
        assert_eq!(settings.abi.variant.as_deref(), Some("legacy"));

        unsafe {
            std::env::remove_var("BUILTIN_PROBES__SYSCALL_LATENCY");
            std::env::remove_var("BUILTIN_PROBES__INTERVAL");
            std::env::remove_var("SCOPE__TARGET_CGROUP");
            std::env::remove_var("ABI__VARIANT");
        }
    }

    #[test]
    fn test_to_common_config_defaults() {
        let common = Settings::default().to_common_config((6, 8)).unwrap();

        assert_eq!(common.target_cgroup, 0);
        assert_eq!(common.rq_data_len_offset, RQ_DATA_LEN_OFFSET);
        assert_eq!(common.abi_variant(), AbiVariant::RequestOnly);
        assert_eq!(common.include_failed, 0);
    }

    #[test]
    fn test_to_common_config_overrides() {
        let settings = Settings {
            scope: Scope {
                target_cgroup: Some(77),
            },
            builtin_probes: BuiltinProbes {
                unshare_include_failed: Some(true),
                ..Default::default()
            },
            abi: Abi {
                variant: Some("auto".to_string()),
                rq_data_len_offset: Some(44),
            },
            ..Default::default()
        };

        let common = settings.to_common_config((5, 4)).unwrap();
        assert_eq!(common.target_cgroup, 77);
        assert_eq!(common.rq_data_len_offset, 44);
        assert_eq!(common.abi_variant(), AbiVariant::QueueAndRequest);
        assert_eq!(common.rq_arg_index, 1);
        assert!(common.outcomes().admits(-1));
    }

    #[test]
    fn test_rq_data_len_offset_follows_kernel() {
        let settings = Settings::default();
        assert_eq!(
            settings.to_common_config((6, 8)).unwrap().rq_data_len_offset,
            44
        );
        assert_eq!(
            settings.to_common_config((5, 15)).unwrap().rq_data_len_offset,
            RQ_DATA_LEN_OFFSET_LEGACY
        );
        // Layout and offset move independently: 5.11..5.15 is request-only
        // with the old offset.
        let common = settings.to_common_config((5, 11)).unwrap();
        assert_eq!(common.abi_variant(), AbiVariant::RequestOnly);
        assert_eq!(common.rq_data_len_offset, 40);
    }

    #[test]
    fn test_rq_data_len_offset_override() {
        let settings = Settings {
            abi: Abi {
                variant: None,
                rq_data_len_offset: Some(48),
            },
            ..Default::default()
        };
        assert_eq!(
            settings.to_common_config((6, 8)).unwrap().rq_data_len_offset,
            48
        );
    }

    #[test]
    fn test_abi_variant_forced() {
        let abi = Abi {
            variant: Some("Modern".to_string()),
            rq_data_len_offset: None,
        };
        assert_eq!(abi.resolve((4, 19)).unwrap(), AbiVariant::RequestOnly);

        let abi = Abi {
            variant: Some("newest".to_string()),
            rq_data_len_offset: None,
        };
        assert!(abi.resolve((6, 1)).is_err());
    }

    #[test]
    fn test_parse_kernel_release() {
        assert_eq!(parse_kernel_release("6.8.0-45-generic\n"), Some((6, 8)));
        assert_eq!(parse_kernel_release("5.10.209"), Some((5, 10)));
        assert_eq!(parse_kernel_release("5.15.0+"), Some((5, 15)));
        assert_eq!(parse_kernel_release("4.19-rc1"), Some((4, 19)));
        assert_eq!(parse_kernel_release("garbage"), None);
        assert_eq!(parse_kernel_release(""), None);
    }

    #[test]
    fn test_probe_defaults() {
        let probes = BuiltinProbes::default();
        assert_eq!(probes.interval_secs(), 1);
        assert_eq!(probes.syscall_latency_top(), 10);

        let probes = BuiltinProbes {
            interval: Some(0),
            ..Default::default()
        };
        assert_eq!(probes.interval_secs(), 1);
    }
}
