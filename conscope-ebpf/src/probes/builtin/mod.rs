pub mod block_io;
pub mod syscall_latency;
pub mod syscall_types;
pub mod unshare;
