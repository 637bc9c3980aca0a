pub mod block_io;
pub mod syscall_latency;
pub mod unshare;

pub use block_io::BlockIoProbe;
pub use syscall_latency::SyscallLatencyProbe;
pub use unshare::UnshareProbe;
