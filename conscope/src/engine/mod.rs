//! In-process backend for the shared aggregation engine.
//!
//! The kernel programs drive `conscope_common`'s counter, correlator and
//! emitter over BPF maps. The same engine runs here over [`FixedTable`] and
//! [`ChannelSink`], which is what the agent uses to relay ring-buffer events
//! and what the engine tests exercise.

mod channel;
mod table;

pub use channel::ChannelSink;
pub use table::FixedTable;
