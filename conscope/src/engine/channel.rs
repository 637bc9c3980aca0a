use std::sync::atomic::{AtomicU64, Ordering};

use conscope_common::EventSink;
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};

/// Bounded event relay from producer threads to an async consumer.
///
/// Producers never wait: when the consumer falls behind, events are dropped
/// and counted.
pub struct ChannelSink<E> {
    tx: Sender<E>,
    dropped: AtomicU64,
}

impl<E> ChannelSink<E> {
    pub fn bounded(capacity: usize) -> (Self, Receiver<E>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events discarded since creation because the channel was full or the
    /// consumer had gone away.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<E: Copy> EventSink<E> for ChannelSink<E> {
    fn emit(&self, event: &E) -> bool {
        match self.tx.try_send(*event) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_channel_drops_and_counts() {
        let (sink, mut rx) = ChannelSink::<u32>::bounded(2);
        assert!(sink.emit(&1));
        assert!(sink.emit(&2));
        assert!(!sink.emit(&3));
        assert_eq!(sink.dropped(), 1);

        assert_eq!(rx.try_recv().ok(), Some(1));
        assert_eq!(rx.try_recv().ok(), Some(2));
        assert!(rx.try_recv().is_err());

        // Room again once the consumer catches up.
        assert!(sink.emit(&4));
        assert_eq!(rx.try_recv().ok(), Some(4));
    }

    #[test]
    fn test_closed_channel_counts_drops() {
        let (sink, rx) = ChannelSink::<u32>::bounded(4);
        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.emit(&1));
        assert_eq!(sink.dropped(), 1);
    }
}
