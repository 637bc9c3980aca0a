use crate::scope::{OutcomeFilter, ScopeFilter};

/// Offset of `struct request::__data_len` up to 5.15.
pub const RQ_DATA_LEN_OFFSET_LEGACY: u32 = 40;

/// Offset of `struct request::__data_len` from 5.16, where `unsigned int
/// timeout` sits between `internal_tag` and `__data_len`.
pub const RQ_DATA_LEN_OFFSET: u32 = 44;

/// Offset of `struct request::__data_len` on common 64-bit builds of the
/// given kernel.
pub const fn rq_data_len_offset_for_kernel(major: u8, minor: u8) -> u32 {
    if major > 5 || (major == 5 && minor >= 16) {
        RQ_DATA_LEN_OFFSET
    } else {
        RQ_DATA_LEN_OFFSET_LEGACY
    }
}

/// Argument layout of the `block_rq_issue` raw tracepoint.
///
/// Linux 5.11 (commit a54895fa) dropped the leading `struct request_queue *`
/// from the tracepoint prototype, moving the request pointer from argument 1
/// to argument 0.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbiVariant {
    /// `TP_PROTO(struct request_queue *q, struct request *rq)`, up to 5.10.
    QueueAndRequest = 0,
    /// `TP_PROTO(struct request *rq)`, 5.11 onwards.
    RequestOnly = 1,
}

impl AbiVariant {
    pub const fn for_kernel(major: u8, minor: u8) -> Self {
        if major > 5 || (major == 5 && minor >= 11) {
            Self::RequestOnly
        } else {
            Self::QueueAndRequest
        }
    }

    pub const fn request_arg_index(self) -> u8 {
        match self {
            Self::QueueAndRequest => 1,
            Self::RequestOnly => 0,
        }
    }

    pub const fn from_request_arg_index(index: u8) -> Self {
        match index {
            1 => Self::QueueAndRequest,
            _ => Self::RequestOnly,
        }
    }
}

/// Load-time configuration written into the eBPF object before it is loaded.
///
/// Never changes once the programs are attached.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommonConfig {
    pub target_cgroup: u64,
    pub rq_data_len_offset: u32,
    pub rq_arg_index: u8,
    pub include_failed: u8,
    pub _pad: [u8; 2],
}

impl CommonConfig {
    pub const DEFAULT: Self = Self {
        target_cgroup: 0,
        rq_data_len_offset: RQ_DATA_LEN_OFFSET,
        rq_arg_index: AbiVariant::RequestOnly.request_arg_index(),
        include_failed: 0,
        _pad: [0; 2],
    };

    pub const fn scope(&self) -> ScopeFilter {
        ScopeFilter::new(self.target_cgroup)
    }

    pub const fn outcomes(&self) -> OutcomeFilter {
        OutcomeFilter::new(self.include_failed != 0)
    }

    pub const fn abi_variant(&self) -> AbiVariant {
        AbiVariant::from_request_arg_index(self.rq_arg_index)
    }
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
